//! rsync deltas: produced against a recorded signature at backup time,
//! applied to the restored baseline at restore time.

use fast_rsync::{apply, diff, Signature};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Delta turning the contents `baseline` was computed from into `data`.
pub fn compute_delta(baseline: &Signature, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut delta = Vec::new();
    diff(&baseline.index(), data, &mut delta)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("rsync diff: {}", e)))?;
    Ok(delta)
}

/// Rebuild new contents from `baseline` and a delta against it.
pub fn patch(baseline: &[u8], delta: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(baseline.len());
    apply(baseline, delta, &mut out)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("rsync apply: {}", e)))?;
    Ok(out)
}

/// Patch the file at `path`. The file is replaced only once the whole
/// delta applied cleanly. Returns the new length.
pub fn patch_file(path: &Path, delta: &[u8]) -> io::Result<u64> {
    let patched = patch(&fs::read(path)?, delta)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&patched)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(patched.len() as u64)
}
