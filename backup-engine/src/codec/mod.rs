//! Streaming transforms applied to everything stored remotely.
//!
//! Volumes, manifests and signature files all pass through one
//! [`VolumeCodec`]. The crate ships a plain codec and a zstd codec; an
//! encrypting codec plugs in through the same trait.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::VolumeConfig;
use crate::naming::Encoding;
use crate::storage::Backend;
use crate::utils::errors::{EngineError, Result};

/// Streaming encoder for one output object.
pub trait VolumeEncoder: Write + Send {
    /// Write any trailer and flush everything to the underlying writer.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub trait VolumeCodec: Send + Sync {
    /// Suffix family of names written through this codec.
    fn encoding(&self) -> Encoding;

    fn encoder(&self, out: Box<dyn Write + Send>) -> io::Result<Box<dyn VolumeEncoder>>;

    fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;

    /// Bytes added on top of `len` bytes of incompressible input.
    fn overhead(&self, _len: u64) -> u64 {
        0
    }

    fn encrypted(&self) -> bool {
        self.encoding() == Encoding::Encrypted
    }
}

/// Counts bytes that reach the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> (Self, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                count: Arc::clone(&count),
            },
            count,
        )
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct PlainCodec;

struct PlainEncoder {
    out: Box<dyn Write + Send>,
}

impl Write for PlainEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl VolumeEncoder for PlainEncoder {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.out.flush()
    }
}

impl VolumeCodec for PlainCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Plain
    }

    fn encoder(&self, out: Box<dyn Write + Send>) -> io::Result<Box<dyn VolumeEncoder>> {
        Ok(Box::new(PlainEncoder { out }))
    }

    fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(input)
    }
}

/// zstd with a bounded window, so data re-read from early in a volume is
/// not matched again when it is used as padding.
pub struct ZstdCodec {
    level: i32,
}

const ZSTD_WINDOW_LOG: u32 = 20;
const ZSTD_BLOCK: u64 = 128 * 1024;

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

struct ZstdEncoder {
    inner: zstd::stream::write::Encoder<'static, Box<dyn Write + Send>>,
}

impl Write for ZstdEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl VolumeEncoder for ZstdEncoder {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut out = self.inner.finish()?;
        out.flush()
    }
}

impl VolumeCodec for ZstdCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Compressed
    }

    fn encoder(&self, out: Box<dyn Write + Send>) -> io::Result<Box<dyn VolumeEncoder>> {
        let mut inner = zstd::stream::write::Encoder::new(out, self.level)?;
        inner.window_log(ZSTD_WINDOW_LOG)?;
        inner.include_checksum(true)?;
        Ok(Box::new(ZstdEncoder { inner }))
    }

    fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(input)?))
    }

    fn overhead(&self, len: u64) -> u64 {
        // raw block headers plus frame checksum
        3 * (len / ZSTD_BLOCK + 1) + 8
    }
}

/// Pick the codec the configuration names.
pub fn codec_from_config(config: &VolumeConfig) -> Result<Arc<dyn VolumeCodec>> {
    if config.encryption {
        return Err(EngineError::Config(
            "encryption requires an encrypting codec supplied by the caller".into(),
        ));
    }
    match config.compression.as_str() {
        "zstd" => Ok(Arc::new(ZstdCodec::new(config.compression_level))),
        "none" => Ok(Arc::new(PlainCodec)),
        other => Err(EngineError::Config(format!(
            "unsupported compression: {}",
            other
        ))),
    }
}

/// Encode `src` into `dst`, returning the encoded size.
pub fn encode_file(codec: &dyn VolumeCodec, src: &Path, dst: &Path) -> io::Result<u64> {
    let (out, count) = CountingWriter::new(BufWriter::new(File::create(dst)?));
    let mut encoder = codec.encoder(Box::new(out))?;
    let mut input = BufReader::new(File::open(src)?);
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(count.load(Ordering::Relaxed))
}

/// Decode `src` into `dst`, returning the decoded size.
pub fn decode_file(codec: &dyn VolumeCodec, src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = codec.decoder(Box::new(BufReader::new(File::open(src)?)))?;
    let mut out = BufWriter::new(File::create(dst)?);
    let n = io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(n)
}

/// Download `remote_name` and return its decoded contents.
pub fn fetch_decoded(
    backend: &dyn Backend,
    codec: &dyn VolumeCodec,
    temp_dir: &Path,
    remote_name: &str,
) -> Result<Vec<u8>> {
    let local = tempfile::Builder::new().prefix("tmp.").tempfile_in(temp_dir)?;
    backend.get(remote_name, local.path())?;
    let mut decoder = codec.decoder(Box::new(BufReader::new(local.reopen()?)))?;
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod testing;
