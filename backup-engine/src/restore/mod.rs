//! Restore of a point in time from a backup chain.
//!
//! Sets are replayed oldest first: the full set lays down snapshots, each
//! incremental then patches, deletes and adds on top. Every volume is
//! checked against the hash its manifest recorded before it is decoded.

use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{read_block, Block, RecordKind};
use crate::codec::{fetch_decoded, VolumeCodec};
use crate::collections::{BackupSet, CollectionsStatus};
use crate::config::Config;
use crate::executor::manifest::Manifest;
use crate::executor::upload::run_blocking;
use crate::fs::walker::index_path;
use crate::naming::time_to_pretty;
use crate::storage::{sha256_file, ArchiveDir, ArchiveLock, Backend};
use crate::sync::delta::patch_file;
use crate::utils::errors::{EngineError, ErrorCode, Result};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Restore the state as of this time; latest when unset
    pub time: Option<i64>,
    pub target: PathBuf,
    /// Allow restoring into a non-empty directory
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreStats {
    pub sets: usize,
    pub volumes: u32,
    pub volume_bytes: u64,
    pub files_written: u64,
    pub deltas_applied: u64,
    pub deleted: u64,
    pub dirs: u64,
}

#[derive(Clone)]
pub struct Restorer {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    codec: Arc<dyn VolumeCodec>,
    archive: ArchiveDir,
}

impl Restorer {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        codec: Arc<dyn VolumeCodec>,
    ) -> Result<Self> {
        let archive = ArchiveDir::open(&config.archive.archive_dir)?;
        Ok(Self {
            config,
            backend,
            codec,
            archive,
        })
    }

    pub async fn restore(&self, options: RestoreOptions) -> Result<RestoreStats> {
        let this = self.clone();
        run_blocking(move || this.restore_blocking(&options)).await
    }

    fn restore_blocking(&self, options: &RestoreOptions) -> Result<RestoreStats> {
        let _lock = ArchiveLock::acquire(self.archive.root())?;
        check_target(&options.target, options.force)?;
        fs::create_dir_all(&self.config.archive.temp_dir)?;

        let status = CollectionsStatus::scan(self.backend.as_ref(), &self.archive, &self.config)?;
        let time = options.time.unwrap_or(i64::MAX);
        let chain = status.backup_chain_at_time(time)?;
        let sets: Vec<&BackupSet> = chain
            .sets_at_time(time)
            .into_iter()
            .filter(|set| {
                if set.manifest_partial {
                    warn!("Skipping unfinished {} set at {}", set.kind.label(), time_to_pretty(set.time()));
                }
                !set.manifest_partial
            })
            .collect();
        info!(
            "Restoring {} sets of chain {} into {}",
            sets.len(),
            chain.short_desc(),
            options.target.display()
        );

        fs::create_dir_all(&options.target)?;
        let mut replay = Replay::new(&options.target);
        for set in sets {
            self.restore_set(set, &mut replay)?;
            replay.stats.sets += 1;
        }
        replay.finish()?;
        info!(
            "Restore complete: {} files, {} deltas, {} deletions",
            replay.stats.files_written, replay.stats.deltas_applied, replay.stats.deleted
        );
        Ok(replay.stats)
    }

    /// The set's manifest, preferring the cached copy.
    fn load_manifest(&self, set: &BackupSet) -> Result<Manifest> {
        if let Some(name) = &set.local_manifest {
            match self
                .archive
                .read(name)
                .map_err(EngineError::from)
                .and_then(|b| Manifest::from_bytes(&b))
            {
                Ok(manifest) => return Ok(manifest),
                Err(e) => warn!("Cached manifest {} unusable: {}", name, e),
            }
        }
        let Some(remote) = set.remote_manifest.as_ref().filter(|_| !set.manifest_partial) else {
            return Err(EngineError::consistency(
                ErrorCode::NoManifests,
                format!("no manifest for {} set at {}", set.kind.label(), time_to_pretty(set.time())),
            ));
        };
        fetch_decoded(
            self.backend.as_ref(),
            self.codec.as_ref(),
            &self.config.archive.temp_dir,
            remote,
        )
        .and_then(|b| Manifest::from_bytes(&b))
        .map_err(|e| {
            EngineError::corruption(
                ErrorCode::UnreadableManifests,
                format!("cannot read manifest {}: {}", remote, e),
            )
        })
    }

    fn restore_set(&self, set: &BackupSet, replay: &mut Replay) -> Result<()> {
        let manifest = self.load_manifest(set)?;
        manifest.check_contiguous()?;

        let names = manifest
            .volumes
            .keys()
            .map(|n| {
                set.volumes.get(n).cloned().ok_or_else(|| {
                    EngineError::consistency(
                        ErrorCode::VolumesNotTransferred,
                        format!("volume {} of the {} set is missing from the target", n, set.kind.label()),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.backend.pre_process_download_batch(&names)?;

        for (info, name) in manifest.volumes.values().zip(&names) {
            let local = tempfile::Builder::new()
                .prefix("tmp.")
                .tempfile_in(&self.config.archive.temp_dir)?;
            self.backend.get(name, local.path())?;

            let digest = sha256_file(local.path())?;
            if digest != info.hash {
                return Err(EngineError::corruption(
                    ErrorCode::MismatchedHash,
                    format!("{} hash {} does not match manifest {}", name, digest, info.hash),
                ));
            }
            replay.stats.volume_bytes += fs::metadata(local.path())?.len();

            let mut reader = self
                .codec
                .decoder(Box::new(BufReader::new(local.reopen()?)))?;
            loop {
                match read_block(&mut reader)? {
                    Some(block) if block.kind == RecordKind::End => break,
                    Some(block) => replay.apply(block)?,
                    None => {
                        return Err(EngineError::Format(format!("{} has no end record", name)));
                    }
                }
            }
            replay.stats.volumes += 1;
            debug!(volume = info.volume_number, "Replayed {}", name);
        }
        Ok(())
    }
}

fn check_target(target: &Path, force: bool) -> Result<()> {
    let mut entries = match fs::read_dir(target) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if entries.next().is_some() && !force {
        return Err(EngineError::Config(format!(
            "restore target {} is not empty",
            target.display()
        )));
    }
    Ok(())
}

/// Applies block records to the restore target.
struct Replay {
    root: PathBuf,
    /// Delta chunks of one path, applied once the path changes
    delta: Option<(Vec<String>, Vec<u8>)>,
    stats: RestoreStats,
}

impl Replay {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            delta: None,
            stats: RestoreStats::default(),
        }
    }

    fn apply(&mut self, block: Block) -> Result<()> {
        let continues_delta = block.kind == RecordKind::Delta
            && self.delta.as_ref().is_some_and(|(index, _)| *index == block.index);
        if !continues_delta {
            self.flush_delta()?;
        }

        let path = index_path(&self.root, &block.index);
        match block.kind {
            RecordKind::Snapshot => {
                if block.block == 0 {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, &block.data)?;
                    self.stats.files_written += 1;
                } else {
                    let mut file = OpenOptions::new().append(true).open(&path)?;
                    file.write_all(&block.data)?;
                }
            }
            RecordKind::Delta => match &mut self.delta {
                Some((_, data)) if continues_delta => data.extend_from_slice(&block.data),
                _ => self.delta = Some((block.index, block.data)),
            },
            RecordKind::Deleted => {
                let removed = match fs::symlink_metadata(&path) {
                    Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
                    Ok(_) => fs::remove_file(&path),
                    Err(e) => Err(e),
                };
                match removed {
                    Ok(()) => self.stats.deleted += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("Deleted path {} was never restored", path.display());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            RecordKind::Dir => {
                fs::create_dir_all(&path)?;
                self.stats.dirs += 1;
            }
            RecordKind::End => {}
        }
        Ok(())
    }

    fn flush_delta(&mut self) -> Result<()> {
        let Some((index, data)) = self.delta.take() else {
            return Ok(());
        };
        let path = index_path(&self.root, &index);
        patch_file(&path, &data).map_err(|e| {
            EngineError::Format(format!("cannot patch {}: {}", path.display(), e))
        })?;
        self.stats.deltas_applied += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_delta()
    }
}
