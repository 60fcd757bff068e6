//! Block record framing inside volumes.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! kind:u8  count:u16  (len:u16 component)*count  block:u64  len:u32 data
//! ```
//!
//! A volume is a run of records closed by an `End` record.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Literal file contents
    Snapshot,
    /// fast_rsync delta against the previous version
    Delta,
    Deleted,
    Dir,
    End,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            RecordKind::Snapshot => 1,
            RecordKind::Delta => 2,
            RecordKind::Deleted => 3,
            RecordKind::Dir => 4,
            RecordKind::End => 0xFF,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordKind::Snapshot),
            2 => Some(RecordKind::Delta),
            3 => Some(RecordKind::Deleted),
            4 => Some(RecordKind::Dir),
            0xFF => Some(RecordKind::End),
            _ => None,
        }
    }
}

/// Position in the archive stream: path index, then block within the path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub index: Vec<String>,
    pub block: u64,
}

impl Position {
    pub fn new(index: Vec<String>, block: u64) -> Self {
        Self { index, block }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: RecordKind,
    pub index: Vec<String>,
    pub block: u64,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(kind: RecordKind, index: Vec<String>, block: u64, data: Vec<u8>) -> Self {
        Self {
            kind,
            index,
            block,
            data,
        }
    }

    /// Closing record of a volume.
    pub fn end() -> Self {
        Self::new(RecordKind::End, Vec::new(), 0, Vec::new())
    }

    /// Bytes a record for `index` spends before its data.
    pub fn header_len(index: &[String]) -> usize {
        1 + 2 + index.iter().map(|c| 2 + c.len()).sum::<usize>() + 8 + 4
    }

    pub fn encoded_len(&self) -> usize {
        Self::header_len(&self.index) + self.data.len()
    }

    pub fn position(&self) -> Position {
        Position::new(self.index.clone(), self.block)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let count = u16::try_from(self.index.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path too deep"))?;
        let data_len = u32::try_from(self.data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;

        w.write_all(&[self.kind.to_byte()])?;
        w.write_all(&count.to_be_bytes())?;
        for component in &self.index {
            let len = u16::try_from(component.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "path component too long")
            })?;
            w.write_all(&len.to_be_bytes())?;
            w.write_all(component.as_bytes())?;
        }
        w.write_all(&self.block.to_be_bytes())?;
        w.write_all(&data_len.to_be_bytes())?;
        w.write_all(&self.data)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        // writing into a Vec only fails on the length checks
        if let Err(e) = self.write_to(&mut buf) {
            tracing::error!("Unencodable block for {:?}: {}", self.index, e);
            buf.clear();
        }
        buf
    }
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Read one record. `None` means the stream ended cleanly between records.
pub fn read_block<R: Read>(r: &mut R) -> Result<Option<Block>> {
    let mut kind_byte = [0u8; 1];
    if !read_exact_or_eof(r, &mut kind_byte)? {
        return Ok(None);
    }
    let kind = RecordKind::from_byte(kind_byte[0])
        .ok_or_else(|| EngineError::Format(format!("unknown record kind {:#x}", kind_byte[0])))?;

    let count = read_u16(r)?;
    let mut index = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = read_u16(r)?;
        let mut component = vec![0u8; usize::from(len)];
        r.read_exact(&mut component)?;
        let component = String::from_utf8(component)
            .map_err(|_| EngineError::Format("path component is not UTF-8".into()))?;
        index.push(component);
    }

    let mut block = [0u8; 8];
    r.read_exact(&mut block)?;
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;

    let mut data = Vec::new();
    r.take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(EngineError::Format(format!(
            "record for {:?} truncated: {} of {} bytes",
            index,
            data.len(),
            len
        )));
    }

    Ok(Some(Block::new(kind, index, u64::from_be_bytes(block), data)))
}
