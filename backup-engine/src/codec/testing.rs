//! Codec doubles shared by unit tests across the crate.

use std::io::{self, Read, Write};

use super::{VolumeCodec, VolumeEncoder};
use crate::naming::Encoding;

/// Stand-in for an encrypting codec: XOR with a one-byte key.
pub(crate) struct XorCodec(pub u8);

struct XorWriter {
    key: u8,
    out: Box<dyn Write + Send>,
}

impl Write for XorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mixed: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
        self.out.write_all(&mixed)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl VolumeEncoder for XorWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.out.flush()
    }
}

struct XorReader {
    key: u8,
    input: Box<dyn Read + Send>,
}

impl Read for XorReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.input.read(buf)?;
        buf[..n].iter_mut().for_each(|b| *b ^= self.key);
        Ok(n)
    }
}

impl VolumeCodec for XorCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Encrypted
    }
    fn encoder(&self, out: Box<dyn Write + Send>) -> io::Result<Box<dyn VolumeEncoder>> {
        Ok(Box::new(XorWriter { key: self.0, out }))
    }
    fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(XorReader { key: self.0, input }))
    }
}
