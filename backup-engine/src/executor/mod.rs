//! Backup driver: decides what kind of set to write and runs it.
//!
//! Each run takes the archive lock, rebuilds the collection status, resumes
//! or discards a partial set left by an earlier run, then streams the source
//! through the volume writer and finalizes manifest and signatures.

pub mod checkpoint;
pub mod manifest;
pub mod restart;
pub mod upload;
pub mod volume;

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{BlockIter, DirSource, SourceStats};
use crate::codec::{fetch_decoded, VolumeCodec};
use crate::collections::{BackupSet, CollectionsStatus, Location, SetKind, SignatureChain};
use crate::config::Config;
use crate::fs::WalkOptions;
use crate::naming::{time_to_string, Component, Encoding, Naming};
use crate::storage::{ArchiveDir, ArchiveLock, Backend};
use crate::sync::signature::{merge_signature_entries, read_signature_entries};
use crate::sync::SignatureMap;
use crate::transfer::TransferStats;
use crate::utils::errors::{EngineError, ErrorCode, Result};
use checkpoint::{ship, Checkpoint};
use manifest::{check_manifests, DirInfo, Manifest};
use restart::{RestartCoordinator, RestartPlan};
use upload::run_blocking;
use volume::{VolumeWriter, WriteOutcome};

/// Pause before re-reading the clock when it has not passed the last backup.
const CLOCK_WAIT: Duration = Duration::from_millis(1100);

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Incremental,
    /// Incremental when a chain exists, full otherwise
    Auto,
}

/// Backup execution result
#[derive(Debug)]
pub struct BackupResult {
    pub backup_type: String,
    pub set: SetKind,
    pub volumes: u32,
    pub skipped: bool,
    /// Continued a partial set instead of starting one
    pub restarted: bool,
    pub source: SourceStats,
    pub transfer: TransferStats,
    pub duration_secs: u64,
}

#[derive(Serialize)]
struct JsonStat<'a> {
    backup_type: &'a str,
    start_time: String,
    end_time: String,
    volumes: u32,
    files_changed: usize,
    source: &'a SourceStats,
    transfer: &'a TransferStats,
}

/// Main backup executor
#[derive(Clone)]
pub struct BackupEngine {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    codec: Arc<dyn VolumeCodec>,
    archive: ArchiveDir,
    naming: Naming,
    cancel_token: CancellationToken,
}

impl BackupEngine {
    /// Create an engine without cancellation support.
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        codec: Arc<dyn VolumeCodec>,
    ) -> Result<Self> {
        config.validate()?;
        let archive = ArchiveDir::open(&config.archive.archive_dir)?;
        let naming = Naming::from_config(&config);
        Ok(Self {
            config,
            backend,
            codec,
            archive,
            naming,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Stop between volumes once `cancel_token` fires.
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn codec(&self) -> &Arc<dyn VolumeCodec> {
        &self.codec
    }

    pub fn archive(&self) -> &ArchiveDir {
        &self.archive
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// List both stores and rebuild the collection status.
    pub async fn collection_status(&self) -> Result<CollectionsStatus> {
        let this = self.clone();
        run_blocking(move || {
            CollectionsStatus::scan(this.backend.as_ref(), &this.archive, &this.config)
        })
        .await
    }

    /// Run one backup.
    pub async fn execute(&self, mode: BackupMode) -> Result<BackupResult> {
        let started = Instant::now();
        let _lock = ArchiveLock::acquire(self.archive.root())?;
        std::fs::create_dir_all(&self.config.archive.temp_dir)?;
        let cleared = self.archive.clear_scratch()?;
        if cleared > 0 {
            debug!("Removed {} scratch files from the archive dir", cleared);
        }

        let mut attempts = 0;
        let mut result = loop {
            let status = self.collection_status().await?;
            let Some(partial) = status.partial_set().cloned() else {
                break self.start_new(&status, mode).await?;
            };

            let coordinator = self.restart_coordinator();
            let set = partial.clone();
            let plan = run_blocking(move || coordinator.plan(&set)).await?;
            match plan {
                RestartPlan::Resume {
                    kind,
                    manifest,
                    last_volume,
                    last_position,
                } => {
                    if mode == BackupMode::Full && !kind.is_full() {
                        info!("Last incremental was interrupted; completing it before any full");
                    }
                    let checkpoint = Checkpoint::resume(&self.archive, &self.naming, kind, manifest)?;
                    let source = self.restart_source(&status, &checkpoint).await?;
                    let mut iter = BlockIter::new(source);
                    iter.skip_through(&last_position)?;
                    break self.write_set(iter, checkpoint, last_volume + 1, true).await?;
                }
                RestartPlan::FromScratch { reason } => {
                    attempts += 1;
                    if attempts > self.config.backup.max_restart_attempts {
                        return Err(EngineError::consistency(
                            ErrorCode::RestartAttemptsExhausted,
                            format!("gave up after {} attempts: {}", attempts - 1, reason),
                        ));
                    }
                    let coordinator = self.restart_coordinator();
                    run_blocking(move || coordinator.discard(&partial)).await?;
                }
            }
        };

        result.duration_secs = started.elapsed().as_secs();
        info!(
            "Backup complete: {} set {}, {}",
            result.backup_type,
            if result.skipped { "skipped" } else { "written" },
            result.transfer.summary(started.elapsed())
        );

        let status = self.collection_status().await?;
        if let Some(chain) = status.last_backup_chain() {
            info!("Last chain now: {}", chain.short_desc());
        }
        Ok(result)
    }

    fn restart_coordinator(&self) -> RestartCoordinator {
        RestartCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.backend),
            Arc::clone(&self.codec),
            self.archive.clone(),
        )
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            follow_links: false,
            exclude_patterns: self.config.backup.exclude.clone(),
        }
    }

    /// Pick full or incremental and write the new set.
    async fn start_new(&self, status: &CollectionsStatus, mode: BackupMode) -> Result<BackupResult> {
        let now = Utc::now().timestamp();
        let matched = status.matched_chain_pair();

        let full = match (mode, matched) {
            (BackupMode::Full, _) => true,
            (BackupMode::Incremental, None) => {
                return Err(EngineError::consistency(
                    ErrorCode::IncWithoutSigs,
                    "incremental requested but no signature chain was found",
                ));
            }
            (BackupMode::Auto, None) => {
                warn!("No signatures found, switching to full backup");
                true
            }
            (_, Some(_)) => match (self.config.backup.full_if_older_than, status.last_full_backup_time()) {
                (Some(age), Some(last_full)) if last_full < now - age => {
                    info!(
                        "Last full backup at {} is older than {}s, starting a new chain",
                        time_to_string(last_full),
                        age
                    );
                    true
                }
                _ => false,
            },
        };

        let manifest = Manifest::new(DirInfo::current(&self.config.backup.source_dir));
        let max_block = self.config.volume.max_block_size;

        let (kind, source, checkpoint) = match matched {
            Some((sig_chain, chain)) if !full => {
                self.verify_last_manifest(chain.last()).await?;
                let start_time = chain.end_time;
                let end_time = self.advance_clock(start_time).await?;
                let kind = SetKind::Incremental {
                    start_time,
                    end_time,
                };
                let base = self.load_signatures(sig_chain, None).await?;
                let checkpoint = Checkpoint::begin(&self.archive, &self.naming, kind, manifest)?;
                let source = DirSource::delta(
                    &self.config.backup.source_dir,
                    &self.walk_options(),
                    base,
                    checkpoint.sigs(),
                    max_block,
                )?;
                (kind, source, checkpoint)
            }
            _ => {
                let latest = status.all_backup_chains.iter().map(|c| c.end_time).max();
                let time = match latest {
                    Some(end) => self.advance_clock(end).await?,
                    None => now,
                };
                let kind = SetKind::Full { time };
                let checkpoint = Checkpoint::begin(&self.archive, &self.naming, kind, manifest)?;
                let source = DirSource::full(
                    &self.config.backup.source_dir,
                    &self.walk_options(),
                    checkpoint.sigs(),
                    max_block,
                )?;
                (kind, source, checkpoint)
            }
        };

        info!(
            "Starting {} backup of {} to {}",
            kind.label(),
            self.config.backup.source_dir.display(),
            self.backend.label()
        );
        self.write_set(BlockIter::new(source), checkpoint, 1, false)
            .await
    }

    /// Source for a resumed set, regenerating signatures from the start.
    async fn restart_source(
        &self,
        status: &CollectionsStatus,
        checkpoint: &Checkpoint,
    ) -> Result<DirSource> {
        let kind = checkpoint.kind();
        let root = &self.config.backup.source_dir;
        let max_block = self.config.volume.max_block_size;
        if kind.is_full() {
            return Ok(DirSource::full(root, &self.walk_options(), checkpoint.sigs(), max_block)?);
        }

        let Some((sig_chain, _)) = status.matched_chain_pair() else {
            return Err(EngineError::consistency(
                ErrorCode::RestartImpossible,
                "partial incremental has no signature chain to build on",
            ));
        };
        let base = self.load_signatures(sig_chain, Some(kind.start_time())).await?;
        Ok(DirSource::delta(root, &self.walk_options(), base, checkpoint.sigs(), max_block)?)
    }

    /// Stream `iter` into volumes and finalize the set.
    async fn write_set(
        &self,
        mut iter: BlockIter<DirSource>,
        mut checkpoint: Checkpoint,
        first_volume: u32,
        restarted: bool,
    ) -> Result<BackupResult> {
        let kind = checkpoint.kind();
        let mut writer = VolumeWriter::new(
            Arc::clone(&self.config),
            Arc::clone(&self.backend),
            Arc::clone(&self.codec),
            self.cancel_token.clone(),
        );
        let outcome = match writer.run(&mut iter, &mut checkpoint, first_volume).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_restartable() {
                    warn!("Backup interrupted ({}); the next run resumes the partial {} set", e, kind.label());
                }
                return Err(e);
            }
        };
        let source = iter.into_source();
        let mut transfer = writer.stats().clone();

        let last_volume = match outcome {
            WriteOutcome::Skipped => {
                checkpoint.discard()?;
                return Ok(BackupResult {
                    backup_type: kind.label().to_string(),
                    set: kind,
                    volumes: 0,
                    skipped: true,
                    restarted,
                    source: source.stats().clone(),
                    transfer,
                    duration_secs: 0,
                });
            }
            WriteOutcome::Completed { last_volume } => last_volume,
        };

        let files_changed = source.changes().to_vec();
        let changed_count = files_changed.len();
        let this = self.clone();
        let uploaded = run_blocking(move || {
            checkpoint.finalize(
                this.backend.as_ref(),
                this.codec.as_ref(),
                &this.config.archive.temp_dir,
                files_changed,
            )
        })
        .await?;
        transfer.record_file(uploaded);

        if self.config.backup.jsonstat {
            let stat = JsonStat {
                backup_type: kind.label(),
                start_time: time_to_string(kind.start_time()),
                end_time: time_to_string(kind.end_time()),
                volumes: last_volume,
                files_changed: changed_count,
                source: source.stats(),
                transfer: &transfer,
            };
            let bytes = serde_json::to_vec_pretty(&stat)?;
            let uploaded = self.write_jsonstat(kind, bytes).await?;
            transfer.record_file(uploaded);
        }

        Ok(BackupResult {
            backup_type: kind.label().to_string(),
            set: kind,
            volumes: last_volume,
            skipped: false,
            restarted,
            source: source.stats().clone(),
            transfer,
            duration_secs: 0,
        })
    }

    async fn write_jsonstat(&self, kind: SetKind, bytes: Vec<u8>) -> Result<u64> {
        let this = self.clone();
        run_blocking(move || {
            let local = this.naming.get(&kind, Component::Stat, false, Encoding::Plain);
            let remote = this
                .naming
                .get(&kind, Component::Stat, false, this.codec.encoding());
            this.archive.write_atomic(&local, &bytes)?;
            ship(
                this.backend.as_ref(),
                this.codec.as_ref(),
                &this.config.archive.temp_dir,
                &this.archive.path(&local),
                &remote,
            )
        })
        .await
    }

    /// Merge the signature files of `chain`, optionally only those ending
    /// by `upto`, into one map of the tree they describe.
    async fn load_signatures(&self, chain: &SignatureChain, upto: Option<i64>) -> Result<SignatureMap> {
        let names = chain.filenames(upto);
        let location = chain.location;
        let this = self.clone();
        run_blocking(move || {
            if location == Location::Remote {
                this.backend.pre_process_download_batch(&names)?;
            }
            let mut map = SignatureMap::new();
            for name in &names {
                let bytes = match location {
                    Location::Local => this.archive.read(name)?,
                    Location::Remote => fetch_decoded(
                        this.backend.as_ref(),
                        this.codec.as_ref(),
                        &this.config.archive.temp_dir,
                        name,
                    )?,
                };
                let entries = read_signature_entries(Cursor::new(bytes))?;
                debug!("Loaded {} signature entries from {}", entries.len(), name);
                merge_signature_entries(&mut map, entries);
            }
            Ok(map)
        })
        .await
    }

    /// Compare the cached manifest of the set an incremental builds on with
    /// the copy on the target.
    async fn verify_last_manifest(&self, set: &BackupSet) -> Result<()> {
        let (Some(local), Some(remote)) = (set.local_manifest.clone(), set.remote_manifest.clone())
        else {
            return Ok(());
        };
        if set.manifest_partial {
            return Ok(());
        }
        let this = self.clone();
        run_blocking(move || {
            let unreadable = |name: &str, e: EngineError| {
                EngineError::corruption(
                    ErrorCode::UnreadableManifests,
                    format!("cannot read manifest {}: {}", name, e),
                )
            };
            let local_manifest = this
                .archive
                .read(&local)
                .map_err(EngineError::from)
                .and_then(|b| Manifest::from_bytes(&b))
                .map_err(|e| unreadable(&local, e))?;
            let remote_manifest = fetch_decoded(
                this.backend.as_ref(),
                this.codec.as_ref(),
                &this.config.archive.temp_dir,
                &remote,
            )
            .and_then(|b| Manifest::from_bytes(&b))
            .map_err(|e| unreadable(&remote, e))?;
            check_manifests(
                &local_manifest,
                &remote_manifest,
                this.config.backup.check_remote_manifest,
            )
        })
        .await
    }

    /// Current time, which must be past `after`. Waits once.
    async fn advance_clock(&self, after: i64) -> Result<i64> {
        let now = Utc::now().timestamp();
        if now > after {
            return Ok(now);
        }
        info!("Clock has not passed {}, waiting", time_to_string(after));
        tokio::time::sleep(CLOCK_WAIT).await;
        let now = Utc::now().timestamp();
        if now > after {
            return Ok(now);
        }
        Err(EngineError::consistency(
            ErrorCode::ClockNotAdvancing,
            format!(
                "current time {} is not after the last backup at {}",
                time_to_string(now),
                time_to_string(after)
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::codec::testing::XorCodec;
    use crate::storage::LocalBackend;
    use std::fs;
    use tempfile::TempDir;

    struct Env {
        dir: TempDir,
        config: Config,
    }

    impl Env {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            let mut config = Config::default();
            config.backup.source_dir = dir.path().join("src");
            config.archive.archive_dir = dir.path().join("cache");
            config.archive.temp_dir = dir.path().join("tmp");
            config.volume.volsize = 1024 * 1024;
            config.volume.compression = "none".into();
            fs::create_dir_all(&config.backup.source_dir)?;
            fs::write(config.backup.source_dir.join("a.txt"), b"alpha")?;
            Ok(Self { dir, config })
        }

        fn engine_with(&self, codec: Arc<dyn VolumeCodec>) -> Result<BackupEngine> {
            let backend: Arc<dyn Backend> =
                Arc::new(LocalBackend::new(&self.dir.path().join("remote"))?);
            BackupEngine::new(Arc::new(self.config.clone()), backend, codec)
        }

        fn engine(&self) -> Result<BackupEngine> {
            self.engine_with(Arc::new(PlainCodec))
        }

        fn write(&self, name: &str, contents: &[u8]) -> Result<()> {
            fs::write(self.config.backup.source_dir.join(name), contents)?;
            Ok(())
        }
    }

    fn remote_names(engine: &BackupEngine) -> Result<Vec<String>> {
        Ok(engine.backend().list()?)
    }

    fn count_with(names: &[String], needle: &str) -> usize {
        names.iter().filter(|n| n.contains(needle)).count()
    }

    #[tokio::test]
    async fn test_auto_without_chain_runs_full() -> Result<()> {
        let env = Env::new()?;
        let engine = env.engine()?;
        let result = engine.execute(BackupMode::Auto).await?;
        assert_eq!(result.backup_type, "full");
        assert_eq!(result.volumes, 1);
        assert!(!result.restarted);

        let names = remote_names(&engine)?;
        assert_eq!(count_with(&names, ".manifest"), 1);
        assert_eq!(count_with(&names, "full-signatures"), 1);
        assert_eq!(count_with(&names, ".vol1."), 1);
        assert!(!engine.archive().root().join("lockfile").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_incremental_without_signatures_fails() -> Result<()> {
        let env = Env::new()?;
        let err = env.engine()?.execute(BackupMode::Incremental).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::IncWithoutSigs));
        Ok(())
    }

    #[tokio::test]
    async fn test_incremental_after_full_extends_chain() -> Result<()> {
        let env = Env::new()?;
        let engine = env.engine()?;
        engine.execute(BackupMode::Full).await?;
        env.write("b.txt", b"bravo")?;

        let result = engine.execute(BackupMode::Incremental).await?;
        assert_eq!(result.backup_type, "inc");
        assert_eq!(result.source.new_files, 1);

        let status = engine.collection_status().await?;
        let (_, chain) = status.matched_chain_pair().unwrap();
        assert_eq!(chain.set_count(), 2);
        assert!(chain.last().files_changed.iter().any(|c| c.path == "b.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_if_no_change_leaves_no_set() -> Result<()> {
        let mut env = Env::new()?;
        env.config.backup.skip_if_no_change = true;
        let engine = env.engine()?;
        engine.execute(BackupMode::Full).await?;
        let before = remote_names(&engine)?;

        let result = engine.execute(BackupMode::Auto).await?;
        assert!(result.skipped);
        assert_eq!(remote_names(&engine)?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_if_older_than_starts_new_chain() -> Result<()> {
        let mut env = Env::new()?;
        env.config.backup.full_if_older_than = Some(0);
        let engine = env.engine()?;
        engine.execute(BackupMode::Full).await?;
        tokio::time::sleep(CLOCK_WAIT).await;

        let result = engine.execute(BackupMode::Auto).await?;
        assert_eq!(result.backup_type, "full");
        assert_eq!(engine.collection_status().await?.all_backup_chains.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_full_is_resumed() -> Result<()> {
        let mut env = Env::new()?;
        for i in 0..3 {
            env.write(&format!("big{}", i), &volume::tests::noise(i, 900 * 1024))?;
        }
        env.config.testing.fail_on_volume = Some(2);
        let err = env.engine()?.execute(BackupMode::Full).await.unwrap_err();
        assert!(matches!(err, EngineError::FaultInjected(2)));

        env.config.testing.fail_on_volume = None;
        let engine = env.engine()?;
        let result = engine.execute(BackupMode::Auto).await?;
        assert!(result.restarted);
        assert_eq!(result.backup_type, "full");
        assert!(result.volumes >= 3);

        let status = engine.collection_status().await?;
        assert!(status.partial_set().is_none());
        assert_eq!(status.all_backup_chains.len(), 1);
        assert!(status.all_backup_chains[0].fullset.volumes_contiguous());
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_with_other_codec_is_refused() -> Result<()> {
        let mut env = Env::new()?;
        for i in 0..3 {
            env.write(&format!("big{}", i), &volume::tests::noise(i, 900 * 1024))?;
        }
        env.config.testing.fail_on_volume = Some(3);
        env.engine_with(Arc::new(XorCodec(0x5A)))?
            .execute(BackupMode::Full)
            .await
            .unwrap_err();

        env.config.testing.fail_on_volume = None;
        let err = env.engine()?.execute(BackupMode::Full).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::EncryptionMismatch));
        Ok(())
    }

    #[tokio::test]
    async fn test_locked_archive_is_refused() -> Result<()> {
        let env = Env::new()?;
        let engine = env.engine()?;
        let _held = ArchiveLock::acquire(engine.archive().root())?;
        let err = engine.execute(BackupMode::Full).await.unwrap_err();
        assert!(matches!(err, EngineError::Locked(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_jsonstat_is_shipped() -> Result<()> {
        let mut env = Env::new()?;
        env.config.backup.jsonstat = true;
        let engine = env.engine()?;
        engine.execute(BackupMode::Full).await?;
        let names = remote_names(&engine)?;
        let stat = names.iter().find(|n| n.contains("jsonstat")).unwrap();
        let body = fs::read(env.dir.path().join("remote").join(stat))?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["backup_type"], "full");
        assert_eq!(value["source"]["source_files"], 1);
        Ok(())
    }
}
