//! Remote storage backends and the local archive cache.
//!
//! Backends are synchronous: the executor runs them on the blocking pool.

pub mod archive_dir;
pub mod local;
pub mod lock;
pub mod retry;

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::Config;
pub use crate::utils::errors::BackendError;
use crate::utils::errors::{EngineError, ErrorCode, Result};

pub use archive_dir::ArchiveDir;
pub use local::LocalBackend;
pub use lock::ArchiveLock;
pub use retry::RetryingBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// What a backend can tell about a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub size: Option<u64>,
    /// Hex SHA256, when the backend can compute it cheaply
    pub sha256: Option<String>,
}

pub trait Backend: Send + Sync {
    /// Store the local file under `remote_name`. The local file is left in place.
    fn put(&self, local: &Path, remote_name: &str) -> BackendResult<()>;

    fn get(&self, remote_name: &str, local: &Path) -> BackendResult<()>;

    fn list(&self) -> BackendResult<Vec<String>>;

    /// Missing names are not an error.
    fn delete(&self, remote_names: &[String]) -> BackendResult<()>;

    fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo>;

    /// Announce a batch of upcoming downloads.
    fn pre_process_download_batch(&self, _remote_names: &[String]) -> BackendResult<()> {
        Ok(())
    }

    fn label(&self) -> String;

    /// Compare the stored object with the local file it was uploaded from.
    fn validate(&self, remote_name: &str, local: &Path) -> Result<()> {
        let local_size = std::fs::metadata(local)?.len();
        let info = self.query(remote_name)?;

        match info.size {
            Some(size) if size != local_size => {
                return Err(EngineError::corruption(
                    ErrorCode::BackendValidationFailed,
                    format!(
                        "{} was corrupted during upload: remote size {} does not match local size {}",
                        remote_name, size, local_size
                    ),
                ));
            }
            Some(_) => {}
            None => warn!("{}: backend reported no size for {}", self.label(), remote_name),
        }

        if let Some(remote_digest) = info.sha256 {
            let local_digest = sha256_file(local)?;
            if remote_digest != local_digest {
                return Err(EngineError::corruption(
                    ErrorCode::BackendValidationFailed,
                    format!(
                        "{} was corrupted during upload: remote digest {} does not match local digest {}",
                        remote_name, remote_digest, local_digest
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Upload and validate in one step, as the worker pool does.
pub fn put_validated(backend: &dyn Backend, local: &Path, remote_name: &str) -> Result<u64> {
    let size = std::fs::metadata(local)?.len();
    backend.put(local, remote_name)?;
    backend.validate(remote_name, local)?;
    Ok(size)
}

/// Hex SHA256 of a file, streamed.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Select the backend for `url` once, by scheme.
pub fn backend_from_url(url: &str, config: &Config) -> Result<Arc<dyn Backend>> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(EngineError::Config(format!("not a URL: {}", url)));
    };
    let inner: Arc<dyn Backend> = match scheme {
        "file" => Arc::new(LocalBackend::new(Path::new(rest))?),
        other => {
            return Err(EngineError::Config(format!(
                "unsupported backend scheme: {}",
                other
            )))
        }
    };
    Ok(Arc::new(RetryingBackend::new(
        inner,
        config.upload.num_retries,
        config.upload.retry_delay_ms,
    )))
}
