//! Manifest types: the authoritative map from volumes to archive positions.
//!
//! The local copy in the archive dir is plain JSON; the remote copy is the
//! same bytes passed through the volume codec.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::archive::Position;
use crate::collections::set::FileChange;
use crate::utils::errors::{EngineError, ErrorCode, Result};

/// Where a backup was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirInfo {
    pub hostname: String,
    pub source_dir: String,
}

impl DirInfo {
    pub fn current(source_dir: &Path) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            hostname,
            source_dir: source_dir.display().to_string(),
        }
    }
}

/// Metadata for a single volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_number: u32,
    pub start_index: Vec<String>,
    pub start_block: u64,
    pub end_index: Vec<String>,
    pub end_block: u64,
    pub hash_alg: String,
    pub hash: String,
}

impl VolumeInfo {
    pub fn new(volume_number: u32, start: &Position, end: &Position, sha256: String) -> Self {
        Self {
            volume_number,
            start_index: start.index.clone(),
            start_block: start.block,
            end_index: end.index.clone(),
            end_block: end.block,
            hash_alg: "SHA256".to_string(),
            hash: sha256,
        }
    }

    pub fn start(&self) -> Position {
        Position::new(self.start_index.clone(), self.start_block)
    }

    pub fn end(&self) -> Position {
        Position::new(self.end_index.clone(), self.end_block)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub dirinfo: Option<DirInfo>,
    pub volumes: BTreeMap<u32, VolumeInfo>,
    #[serde(default)]
    pub files_changed: Vec<FileChange>,
}

impl Manifest {
    pub fn new(dirinfo: DirInfo) -> Self {
        Self {
            dirinfo: Some(dirinfo),
            volumes: BTreeMap::new(),
            files_changed: Vec::new(),
        }
    }

    pub fn add_volume_info(&mut self, vi: VolumeInfo) {
        self.volumes.insert(vi.volume_number, vi);
    }

    pub fn del_volume_info(&mut self, volume_number: u32) -> Option<VolumeInfo> {
        self.volumes.remove(&volume_number)
    }

    pub fn volume_count(&self) -> u32 {
        self.volumes.len() as u32
    }

    pub fn last_volume(&self) -> Option<&VolumeInfo> {
        self.volumes.values().next_back()
    }

    /// Recorded volume numbers are exactly `1..=n`.
    pub fn is_contiguous(&self) -> bool {
        self.volumes
            .keys()
            .zip(1u32..)
            .all(|(recorded, expected)| *recorded == expected)
    }

    pub fn check_contiguous(&self) -> Result<()> {
        if self.is_contiguous() {
            return Ok(());
        }
        let numbers: Vec<String> = self.volumes.keys().map(u32::to_string).collect();
        Err(EngineError::consistency(
            ErrorCode::ManifestGap,
            format!("manifest volumes are not contiguous: [{}]", numbers.join(", ")),
        ))
    }

    /// Warn when the recorded origin differs from the current run.
    pub fn check_dirinfo(&self, current: &DirInfo) -> bool {
        match &self.dirinfo {
            Some(recorded) if recorded != current => {
                warn!(
                    "Backup source mismatch: manifest records {}:{}, current run is {}:{}",
                    recorded.hostname, recorded.source_dir, current.hostname, current.source_dir
                );
                false
            }
            _ => true,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            EngineError::corruption(
                ErrorCode::UnreadableManifests,
                format!("manifest does not parse: {}", e),
            )
        })
    }
}

/// Compare the cached and remote manifests of the same set.
pub fn check_manifests(local: &Manifest, remote: &Manifest, fatal: bool) -> Result<()> {
    if local.volumes == remote.volumes {
        return Ok(());
    }
    let message = format!(
        "local manifest records {} volumes, remote manifest {}",
        local.volume_count(),
        remote.volume_count()
    );
    if fatal {
        return Err(EngineError::consistency(ErrorCode::MismatchedManifests, message));
    }
    warn!("Manifests differ: {}", message);
    Ok(())
}
