//! Retry wrapper for transient backend failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{Backend, BackendResult, RemoteInfo};

/// Retries `Transient` failures with exponential backoff. `NotFound` and
/// `Fatal` pass straight through.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    max_retries: u32,
    retry_delay_ms: u64,
}

const MAX_DELAY_MS: u64 = 30_000;

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            retry_delay_ms,
        }
    }

    fn retry<T>(&self, op_name: &str, f: impl Fn() -> BackendResult<T>) -> BackendResult<T> {
        let mut delay_ms = self.retry_delay_ms;
        let mut attempt = 0;
        loop {
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} {}: transient error (attempt {}/{}), retrying: {}",
                        self.inner.label(),
                        op_name,
                        attempt,
                        self.max_retries,
                        e
                    );
                    std::thread::sleep(Duration::from_millis(delay_ms));
                    delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Backend for RetryingBackend {
    fn put(&self, local: &Path, remote_name: &str) -> BackendResult<()> {
        self.retry("put", || self.inner.put(local, remote_name))
    }

    fn get(&self, remote_name: &str, local: &Path) -> BackendResult<()> {
        self.retry("get", || self.inner.get(remote_name, local))
    }

    fn list(&self) -> BackendResult<Vec<String>> {
        self.retry("list", || self.inner.list())
    }

    fn delete(&self, remote_names: &[String]) -> BackendResult<()> {
        self.retry("delete", || self.inner.delete(remote_names))
    }

    fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo> {
        self.retry("query", || self.inner.query(remote_name))
    }

    fn pre_process_download_batch(&self, remote_names: &[String]) -> BackendResult<()> {
        self.retry("pre_process_download_batch", || {
            self.inner.pre_process_download_batch(remote_names)
        })
    }

    fn label(&self) -> String {
        self.inner.label()
    }
}

/// Fails the next `failures_left` calls, then delegates.
#[cfg(test)]
pub(crate) struct FlakyBackend {
    pub inner: Arc<dyn Backend>,
    pub failures_left: std::sync::atomic::AtomicU32,
    pub fatal: bool,
}

#[cfg(test)]
impl FlakyBackend {
    fn check(&self) -> BackendResult<()> {
        use std::sync::atomic::Ordering;
        let left = self.failures_left.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        self.failures_left.store(left - 1, Ordering::SeqCst);
        if self.fatal {
            Err(crate::utils::errors::BackendError::Fatal("injected".into()))
        } else {
            Err(crate::utils::errors::BackendError::Transient("injected".into()))
        }
    }
}

#[cfg(test)]
impl Backend for FlakyBackend {
    fn put(&self, local: &Path, remote_name: &str) -> BackendResult<()> {
        self.check()?;
        self.inner.put(local, remote_name)
    }

    fn get(&self, remote_name: &str, local: &Path) -> BackendResult<()> {
        self.check()?;
        self.inner.get(remote_name, local)
    }

    fn list(&self) -> BackendResult<Vec<String>> {
        self.check()?;
        self.inner.list()
    }

    fn delete(&self, remote_names: &[String]) -> BackendResult<()> {
        self.check()?;
        self.inner.delete(remote_names)
    }

    fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo> {
        self.check()?;
        self.inner.query(remote_name)
    }

    fn label(&self) -> String {
        "flaky".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;
    use crate::utils::errors::BackendError;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn flaky(dir: &TempDir, failures: u32, fatal: bool) -> Arc<dyn Backend> {
        Arc::new(FlakyBackend {
            inner: Arc::new(LocalBackend::new(dir.path()).unwrap()),
            failures_left: AtomicU32::new(failures),
            fatal,
        })
    }

    #[test]
    fn test_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        let backend = RetryingBackend::new(flaky(&dir, 2, false), 3, 1);
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let backend = RetryingBackend::new(flaky(&dir, 5, false), 2, 1);
        assert!(matches!(backend.list(), Err(BackendError::Transient(_))));
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let inner = flaky(&dir, 1, true);
        let backend = RetryingBackend::new(inner, 3, 1);
        assert!(matches!(backend.list(), Err(BackendError::Fatal(_))));
        // the single injected failure was consumed, so the next call succeeds
        assert!(backend.list().is_ok());
    }
}
