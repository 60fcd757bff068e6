//! File signature generation using fast_rsync, and the signature files
//! that carry them between backups.
//!
//! A signature file is JSON lines, one [`SigEntry`] per path, in index
//! order. A full signature file lists the whole tree; a new-signature file
//! lists only what changed plus deletion markers. Combining a chain of them
//! in order yields the tree as of the chain's end.

use fast_rsync::{Signature, SignatureOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

/// Default block size for signature generation (16KB)
const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Blocks hashed per call while building a signature incrementally.
const SEGMENT_BLOCKS: usize = 64;

fn signature_options(block_size: Option<u32>) -> SignatureOptions {
    SignatureOptions {
        block_size: block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        crypto_hash_size: 8, // Strong hash (8 bytes = 64 bits)
    }
}

/// Generate a signature from a byte buffer.
pub fn generate_signature_from_bytes(data: &[u8], block_size: Option<u32>) -> Signature {
    Signature::calculate(data, signature_options(block_size))
}

/// Builds the signature of data that arrives in pieces.
///
/// Each rsync block is hashed on its own, so signatures of segments cut on
/// block boundaries, header dropped, concatenate into the signature of the
/// whole. At most one segment is buffered.
pub struct SignatureBuilder {
    options: SignatureOptions,
    header_len: usize,
    buffered: Vec<u8>,
    serialized: Vec<u8>,
}

impl SignatureBuilder {
    pub fn new(block_size: Option<u32>) -> Self {
        let options = signature_options(block_size);
        let serialized = Signature::calculate(&[], options).serialized().to_vec();
        Self {
            options,
            header_len: serialized.len(),
            buffered: Vec::new(),
            serialized,
        }
    }

    fn segment_len(&self) -> usize {
        self.options.block_size as usize * SEGMENT_BLOCKS
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buffered.extend_from_slice(data);
        let segment = self.segment_len();
        if self.buffered.len() < segment {
            return;
        }
        let whole = self.buffered.len() / segment * segment;
        let part = Signature::calculate(&self.buffered[..whole], self.options);
        self.serialized
            .extend_from_slice(&part.serialized()[self.header_len..]);
        self.buffered.drain(..whole);
    }

    pub fn finish(mut self) -> io::Result<Signature> {
        if !self.buffered.is_empty() {
            let part = Signature::calculate(&self.buffered, self.options);
            self.serialized
                .extend_from_slice(&part.serialized()[self.header_len..]);
        }
        deserialize_signature(self.serialized)
    }
}

/// Serialize a signature to bytes for storage.
pub fn serialize_signature(signature: &Signature) -> Vec<u8> {
    signature.serialized().to_vec()
}

pub fn deserialize_signature(bytes: Vec<u8>) -> io::Result<Signature> {
    Signature::deserialize(bytes).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("invalid signature: {:?}", e))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Signature information for a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigEntry {
    /// Relative path components
    pub path: Vec<String>,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ns: i64,
    /// Hex-encoded serialized signature; empty for directories
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    /// Marks a path removed since the previous signature file
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl SigEntry {
    pub fn deletion(path: Vec<String>) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            size: 0,
            mtime_ns: 0,
            signature: String::new(),
            deleted: true,
        }
    }

    /// Decode the stored rsync signature.
    pub fn rsync_signature(&self) -> io::Result<Signature> {
        let bytes =
            hex::decode(&self.signature).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        deserialize_signature(bytes)
    }

    /// Whether a file with `size` and `mtime_ns` looks unchanged.
    pub fn unchanged(&self, kind: EntryKind, size: u64, mtime_ns: i64) -> bool {
        !self.deleted && self.kind == kind && self.size == size && self.mtime_ns == mtime_ns
    }
}

/// Tree state keyed by path index.
pub type SignatureMap = BTreeMap<Vec<String>, SigEntry>;

/// Writes JSON-lines signature entries.
pub struct SignatureWriter<W: Write> {
    inner: W,
    entries: u64,
}

impl<W: Write> SignatureWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, entries: 0 }
    }

    pub fn write_entry(&mut self, entry: &SigEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, entry)?;
        self.inner.write_all(b"\n")?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read every entry of one signature file.
pub fn read_signature_entries<R: BufRead>(reader: R) -> io::Result<Vec<SigEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Apply one signature file's entries on top of `map`.
pub fn merge_signature_entries(map: &mut SignatureMap, entries: Vec<SigEntry>) {
    for entry in entries {
        if entry.deleted {
            map.remove(&entry.path);
        } else {
            map.insert(entry.path.clone(), entry);
        }
    }
}
