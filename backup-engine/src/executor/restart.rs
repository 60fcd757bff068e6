//! Deciding how to continue a partial backup set.
//!
//! The last volume a crashed run recorded is redone rather than trusted:
//! the resume point is one less than the number of volumes found on the
//! target. From there the decision is either to reuse the partial manifest
//! trimmed to that point, or to throw the set away and start over.

use std::io::BufReader;
use std::sync::Arc;

use tracing::{info, warn};

use super::manifest::{DirInfo, Manifest};
use crate::archive::{read_block, Position, RecordKind};
use crate::codec::VolumeCodec;
use crate::collections::set::{BackupSet, SetKind};
use crate::config::Config;
use crate::naming::{Component, Naming};
use crate::storage::{sha256_file, ArchiveDir, Backend};
use crate::utils::errors::{EngineError, ErrorCode, Result};

#[derive(Debug)]
pub enum RestartPlan {
    /// Delete the partial set and write a new one from volume 1
    FromScratch { reason: String },
    /// Continue the set after `last_volume`, skipping the source through
    /// `last_position`
    Resume {
        kind: SetKind,
        manifest: Manifest,
        last_volume: u32,
        last_position: Position,
    },
}

pub struct RestartCoordinator {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    codec: Arc<dyn VolumeCodec>,
    archive: ArchiveDir,
    naming: Naming,
}

impl RestartCoordinator {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        codec: Arc<dyn VolumeCodec>,
        archive: ArchiveDir,
    ) -> Self {
        let naming = Naming::from_config(&config);
        Self {
            config,
            backend,
            codec,
            archive,
            naming,
        }
    }

    /// Inspect `set` and decide. Blocking: may download volume 1.
    ///
    /// Changed encryption settings and a volume 1 that fails to decode are errors;
    /// every other inconsistency falls back to a fresh start.
    pub fn plan(&self, set: &BackupSet) -> Result<RestartPlan> {
        let scratch = |reason: String| -> Result<RestartPlan> {
            warn!("Restarting {} set from scratch: {}", set.kind.label(), reason);
            Ok(RestartPlan::FromScratch { reason })
        };

        let Some(name) = &set.local_manifest else {
            return scratch("no local manifest".into());
        };
        let mut manifest = match self
            .archive
            .read(name)
            .map_err(EngineError::from)
            .and_then(|bytes| Manifest::from_bytes(&bytes))
        {
            Ok(manifest) => manifest,
            Err(e) => return scratch(format!("{}: {}", name, e)),
        };
        manifest.check_dirinfo(&DirInfo::current(&self.config.backup.source_dir));

        let on_target = set
            .volumes
            .keys()
            .zip(1u32..)
            .take_while(|(found, expected)| *found == expected)
            .count() as u32;
        let resume = on_target.saturating_sub(1);
        let recorded = manifest.volume_count();

        if resume == 0 {
            return scratch("first volume never completed".into());
        }
        if !manifest.is_contiguous() {
            return scratch(format!("manifest records a gap in {} volumes", recorded));
        }
        if recorded < resume {
            return scratch(format!(
                "manifest records {} volumes but {} are on the target",
                recorded, on_target
            ));
        }

        self.check_encryption(set)?;
        if self.codec.encrypted() && self.config.backup.validate_restart {
            self.check_first_volume(set, &manifest)?;
        }

        for n in resume + 1..=recorded {
            manifest.del_volume_info(n);
            info!(volume = n, "Dropping volume {} from the partial manifest", n);
        }
        let last_position = manifest
            .last_volume()
            .map(|v| v.end())
            .unwrap_or_default();

        info!(
            "Resuming {} set at volume {} (after {})",
            set.kind.label(),
            resume + 1,
            last_position.index.join("/")
        );
        Ok(RestartPlan::Resume {
            kind: set.kind,
            manifest,
            last_volume: resume,
            last_position,
        })
    }

    /// Volume 1 must carry the name this run's codec would give it.
    fn check_encryption(&self, set: &BackupSet) -> Result<()> {
        let expected = self
            .naming
            .get(&set.kind, Component::Volume(1), false, self.codec.encoding());
        match set.volumes.get(&1) {
            Some(found) if *found == expected => Ok(()),
            Some(found) => Err(EngineError::consistency(
                ErrorCode::EncryptionMismatch,
                format!(
                    "restart would write {} but the set holds {}; encryption settings changed",
                    expected, found
                ),
            )),
            None => Ok(()),
        }
    }

    /// Download volume 1 and decode it with the current codec.
    fn check_first_volume(&self, set: &BackupSet, manifest: &Manifest) -> Result<()> {
        let Some(remote) = set.volumes.get(&1) else {
            return Ok(());
        };
        let local = tempfile::Builder::new()
            .prefix("tmp.")
            .tempfile_in(&self.config.archive.temp_dir)?;
        self.backend.get(remote, local.path())?;

        if let Some(info) = manifest.volumes.get(&1) {
            let digest = sha256_file(local.path())?;
            if digest != info.hash {
                return Err(EngineError::corruption(
                    ErrorCode::MismatchedHash,
                    format!("{} hash {} does not match manifest {}", remote, digest, info.hash),
                ));
            }
        }

        let wrong = |e: String| {
            EngineError::corruption(
                ErrorCode::WrongPassphrase,
                format!("cannot decode {} with the current settings: {}", remote, e),
            )
        };
        let file = local.reopen()?;
        let mut reader = self
            .codec
            .decoder(Box::new(BufReader::new(file)))
            .map_err(|e| wrong(e.to_string()))?;
        loop {
            match read_block(&mut reader) {
                Ok(Some(block)) if block.kind == RecordKind::End => return Ok(()),
                Ok(Some(_)) => {}
                Ok(None) => return Err(wrong("volume has no end record".into())),
                Err(e) => return Err(wrong(e.to_string())),
            }
        }
    }

    /// Delete every trace of `set` on both sides.
    pub fn discard(&self, set: &BackupSet) -> Result<()> {
        let remote = set.remote_filenames();
        if !remote.is_empty() {
            self.backend.delete(&remote)?;
        }
        for name in &set.local_files {
            self.archive.delete(name)?;
        }
        info!(
            "Deleted partial {} set ({} remote, {} local files)",
            set.kind.label(),
            remote.len(),
            set.local_files.len()
        );
        Ok(())
    }
}
