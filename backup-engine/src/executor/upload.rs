//! Volume uploads: a bounded worker pool and in-order manifest commits.
//!
//! Transfers may finish in any order. [`ManifestSequencer`] holds back a
//! volume's [`VolumeInfo`] until every lower-numbered volume has landed, so
//! the committed manifest never has a gap.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manifest::VolumeInfo;
use crate::storage::{put_validated, Backend};
use crate::utils::errors::{EngineError, Result};

/// One sealed volume waiting for transfer.
#[derive(Debug)]
pub struct UploadJob {
    pub local: PathBuf,
    pub remote_name: String,
    pub info: VolumeInfo,
    /// Leave the volume unsent (fault injection)
    pub skip: bool,
}

/// Result of one finished transfer.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub volume_number: u32,
    pub remote_name: String,
    pub bytes: u64,
    pub elapsed: Duration,
    pub skipped: bool,
}

/// Put, validate, then drop the local copy, also when the put fails.
/// Blocking.
pub fn upload_volume(backend: &dyn Backend, job: &UploadJob) -> Result<UploadOutcome> {
    let started = Instant::now();
    let volume_number = job.info.volume_number;
    let sent = if job.skip {
        warn!(volume = volume_number, "Skipping upload of {}", job.remote_name);
        Ok(0)
    } else {
        put_validated(backend, &job.local, &job.remote_name)
    };
    // the sealed volume is gone either way; a restart rewrites it
    if let Err(e) = std::fs::remove_file(&job.local) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", job.local.display(), e);
        }
    }
    let bytes = sent?;
    debug!(volume = volume_number, "Uploaded {} ({} bytes)", job.remote_name, bytes);
    Ok(UploadOutcome {
        volume_number,
        remote_name: job.remote_name.clone(),
        bytes,
        elapsed: started.elapsed(),
        skipped: job.skip,
    })
}

/// Run blocking work on the blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Releases volume infos in volume-number order.
#[derive(Debug)]
pub struct ManifestSequencer {
    next: u32,
    pending: BTreeMap<u32, VolumeInfo>,
}

impl ManifestSequencer {
    /// `next` is the first volume number not yet committed.
    pub fn new(next: u32) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    /// Accept a confirmed volume and return every info now committable.
    pub fn complete(&mut self, info: VolumeInfo) -> Vec<VolumeInfo> {
        self.pending.insert(info.volume_number, info);
        let mut ready = Vec::new();
        while let Some(info) = self.pending.remove(&self.next) {
            ready.push(info);
            self.next += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> u32 {
        self.next
    }

    /// Confirmed volumes still waiting on a predecessor.
    pub fn waiting(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded set of upload workers.
pub struct UploadPool {
    backend: Arc<dyn Backend>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(UploadOutcome, VolumeInfo)>>,
    cancel: CancellationToken,
}

impl UploadPool {
    pub fn new(backend: Arc<dyn Backend>, concurrency: usize, cancel: CancellationToken) -> Self {
        info!("Upload pool with {} workers", concurrency.max(1));
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Queue a job, waiting while every worker is busy.
    pub async fn submit(&mut self, job: UploadJob) -> Result<()> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map_err(|_| EngineError::Cancelled)?,
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        let backend = Arc::clone(&self.backend);
        self.tasks.spawn_blocking(move || {
            let _permit = permit;
            let outcome = upload_volume(backend.as_ref(), &job)?;
            Ok((outcome, job.info))
        });
        Ok(())
    }

    /// Completions that are already available, without waiting.
    pub fn try_completed(&mut self) -> Vec<Result<(UploadOutcome, VolumeInfo)>> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            done.push(Self::unwrap_joined(joined));
        }
        done
    }

    /// Wait for the next completion; `None` once nothing is in flight.
    pub async fn next_completed(&mut self) -> Option<Result<(UploadOutcome, VolumeInfo)>> {
        let joined = self.tasks.join_next().await?;
        Some(Self::unwrap_joined(joined))
    }

    /// Wait for every transfer in flight.
    pub async fn drain(&mut self) -> Vec<Result<(UploadOutcome, VolumeInfo)>> {
        let mut done = Vec::new();
        while let Some(result) = self.next_completed().await {
            done.push(result);
        }
        done
    }

    /// Stop accepting work and wait for running workers to wind down.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.semaphore.close();
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!("Upload finished with error during shutdown: {}", e);
            }
        }
    }

    fn unwrap_joined(
        joined: std::result::Result<Result<(UploadOutcome, VolumeInfo)>, tokio::task::JoinError>,
    ) -> Result<(UploadOutcome, VolumeInfo)> {
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Upload worker failed: {}", e);
                Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Position;
    use crate::storage::{BackendError, BackendResult, LocalBackend, RemoteInfo};
    use crate::utils::errors::ErrorCode;
    use std::path::Path;
    use tempfile::TempDir;

    fn info(n: u32) -> VolumeInfo {
        VolumeInfo::new(n, &Position::default(), &Position::default(), String::new())
    }

    #[test]
    fn test_sequencer_releases_in_order() {
        let mut seq = ManifestSequencer::new(1);
        assert!(seq.complete(info(3)).is_empty());
        assert!(seq.complete(info(2)).is_empty());
        assert_eq!(seq.waiting(), 2);

        let ready: Vec<u32> = seq.complete(info(1)).iter().map(|v| v.volume_number).collect();
        assert_eq!(ready, vec![1, 2, 3]);
        assert_eq!(seq.next_expected(), 4);
        assert_eq!(seq.waiting(), 0);
    }

    #[test]
    fn test_sequencer_resumes_mid_set() {
        let mut seq = ManifestSequencer::new(5);
        assert_eq!(seq.complete(info(5)).len(), 1);
        assert!(seq.complete(info(7)).is_empty());
    }

    fn job(dir: &TempDir, n: u32, contents: &[u8]) -> std::io::Result<UploadJob> {
        let local = dir.path().join(format!("vol{}", n));
        std::fs::write(&local, contents)?;
        Ok(UploadJob {
            local,
            remote_name: format!("remote.vol{}", n),
            info: info(n),
            skip: false,
        })
    }

    #[tokio::test]
    async fn test_pool_uploads_and_removes_local_copies() -> Result<()> {
        let scratch = TempDir::new()?;
        let target = TempDir::new()?;
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(target.path())?);
        let mut pool = UploadPool::new(Arc::clone(&backend), 2, CancellationToken::new());

        for n in 1..=4 {
            pool.submit(job(&scratch, n, &vec![n as u8; 100 * n as usize])?).await?;
        }

        let mut seq = ManifestSequencer::new(1);
        let mut committed = Vec::new();
        while let Some(done) = pool.next_completed().await {
            let (outcome, vi) = done?;
            assert_eq!(outcome.bytes, 100 * u64::from(outcome.volume_number));
            committed.extend(seq.complete(vi).into_iter().map(|v| v.volume_number));
        }

        assert_eq!(committed, vec![1, 2, 3, 4]);
        assert_eq!(backend.list()?.len(), 4);
        assert!(!scratch.path().join("vol1").exists());
        Ok(())
    }

    #[test]
    fn test_skipped_volume_is_not_sent() -> Result<()> {
        let scratch = TempDir::new()?;
        let target = TempDir::new()?;
        let backend = LocalBackend::new(target.path())?;
        let mut job = job(&scratch, 1, b"data")?;
        job.skip = true;

        let outcome = upload_volume(&backend, &job)?;
        assert!(outcome.skipped);
        assert!(backend.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_local_file_fails() -> Result<()> {
        let scratch = TempDir::new()?;
        let target = TempDir::new()?;
        let backend = LocalBackend::new(target.path())?;
        let job = UploadJob {
            local: scratch.path().join("absent"),
            remote_name: "remote".into(),
            info: info(1),
            skip: false,
        };
        let err = upload_volume(&backend, &job).unwrap_err();
        assert_ne!(err.code(), Some(ErrorCode::BackendValidationFailed));
        Ok(())
    }

    struct Refusing;

    impl Backend for Refusing {
        fn put(&self, _local: &Path, remote_name: &str) -> BackendResult<()> {
            Err(BackendError::Fatal(format!("refused {}", remote_name)))
        }
        fn get(&self, remote_name: &str, _local: &Path) -> BackendResult<()> {
            Err(BackendError::NotFound(remote_name.to_string()))
        }
        fn list(&self) -> BackendResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn delete(&self, _names: &[String]) -> BackendResult<()> {
            Ok(())
        }
        fn query(&self, remote_name: &str) -> BackendResult<RemoteInfo> {
            Err(BackendError::NotFound(remote_name.to_string()))
        }
        fn label(&self) -> String {
            "refusing".into()
        }
    }

    #[test]
    fn test_failed_put_removes_local_volume() -> Result<()> {
        let scratch = TempDir::new()?;
        let local = scratch.path().join("vol1");
        std::fs::write(&local, b"sealed")?;
        let job = UploadJob {
            local: local.clone(),
            remote_name: "remote".into(),
            info: info(1),
            skip: false,
        };
        assert!(upload_volume(&Refusing, &job).is_err());
        assert!(!local.exists());
        Ok(())
    }
}
