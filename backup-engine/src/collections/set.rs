//! Backup sets: the files one backup session produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::naming::{FileType, ParseResults};
use crate::utils::errors::{EngineError, ErrorCode, Result};

/// Time coverage of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetKind {
    Full { time: i64 },
    Incremental { start_time: i64, end_time: i64 },
}

impl SetKind {
    pub fn is_full(&self) -> bool {
        matches!(self, SetKind::Full { .. })
    }

    pub fn start_time(&self) -> i64 {
        match *self {
            SetKind::Full { time } => time,
            SetKind::Incremental { start_time, .. } => start_time,
        }
    }

    /// Full time for a full set, interval end for an incremental.
    pub fn end_time(&self) -> i64 {
        match *self {
            SetKind::Full { time } => time,
            SetKind::Incremental { end_time, .. } => end_time,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.is_full() {
            "full"
        } else {
            "inc"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    New,
    Changed,
    Deleted,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeAction::New => "new",
            ChangeAction::Changed => "changed",
            ChangeAction::Deleted => "deleted",
        })
    }
}

/// One entry of a set's "files changed" summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub action: ChangeAction,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct BackupSet {
    pub kind: SetKind,
    /// Volume number to remote filename
    pub volumes: BTreeMap<u32, String>,
    pub remote_manifest: Option<String>,
    /// Set when `remote_manifest` is really a local partial manifest
    pub manifest_partial: bool,
    pub local_manifest: Option<String>,
    pub remote_jsonstat: Option<String>,
    pub local_jsonstat: Option<String>,
    /// Every cache file that belongs to this set's interval
    pub local_files: Vec<String>,
    pub partial: bool,
    pub encrypted: bool,
    pub files_changed: Vec<FileChange>,
}

impl BackupSet {
    /// Start a set from the first name that belongs to it.
    pub fn from_parse(pr: &ParseResults) -> Option<Self> {
        pr.file_type.archive_kind()?;
        let kind = pr.set_kind()?;
        Some(Self {
            kind,
            volumes: BTreeMap::new(),
            remote_manifest: None,
            manifest_partial: false,
            local_manifest: None,
            remote_jsonstat: None,
            local_jsonstat: None,
            local_files: Vec::new(),
            partial: pr.partial,
            encrypted: pr.encrypted,
            files_changed: Vec::new(),
        })
    }

    /// Add `filename` if it belongs here. Returns `Ok(false)` when it does not.
    ///
    /// A volume number already present is rejected as a consistency error.
    pub fn add_filename(&mut self, filename: &str, pr: &ParseResults) -> Result<bool> {
        let Some(archive_kind) = pr.file_type.archive_kind() else {
            return Ok(false);
        };
        let own_kind = if self.kind.is_full() {
            FileType::Full
        } else {
            FileType::Inc
        };
        if archive_kind != own_kind || pr.set_kind() != Some(self.kind) {
            return Ok(false);
        }

        if pr.encrypted != self.encrypted && self.partial && pr.encrypted {
            self.encrypted = true;
        }

        if pr.file_type.is_stat() {
            if self.remote_jsonstat.is_none() {
                self.remote_jsonstat = Some(filename.to_string());
            }
        } else if pr.manifest {
            if let Some(existing) = &self.remote_manifest {
                // A final remote manifest wins over a leftover partial one.
                if !(self.manifest_partial && !pr.partial) {
                    tracing::debug!("Ignoring second manifest {} (have {})", filename, existing);
                    return Ok(true);
                }
            }
            self.remote_manifest = Some(filename.to_string());
            self.manifest_partial = pr.partial;
            self.partial = pr.partial;
        } else if let Some(n) = pr.volume_number {
            if let Some(existing) = self.volumes.get(&n) {
                return Err(EngineError::consistency(
                    ErrorCode::DuplicateVolume,
                    format!(
                        "volume {} is already in the set as {}; {} has the same number",
                        n, existing, filename
                    ),
                ));
            }
            self.volumes.insert(n, filename.to_string());
        }
        Ok(true)
    }

    /// Record a cache file whose interval matches this set.
    pub fn attach_local(&mut self, filename: &str, pr: &ParseResults) {
        if pr.set_kind() != Some(self.kind) {
            return;
        }
        if pr.manifest {
            let replace = match &self.local_manifest {
                None => true,
                // Prefer the partial copy while the set is still being written.
                Some(_) => pr.partial == self.partial,
            };
            if replace {
                self.local_manifest = Some(filename.to_string());
            }
        } else if pr.file_type.is_stat() && self.local_jsonstat.is_none() {
            self.local_jsonstat = Some(filename.to_string());
        }
        if !self.local_files.iter().any(|f| f == filename) {
            self.local_files.push(filename.to_string());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remote_manifest.is_some()
    }

    pub fn time(&self) -> i64 {
        self.kind.end_time()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Remote objects of this set, volumes first.
    ///
    /// A local partial manifest standing in for the remote one is never listed.
    pub fn remote_filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.values().cloned().collect();
        if let Some(manifest) = &self.remote_manifest {
            if !self.manifest_partial {
                names.push(manifest.clone());
            }
        }
        if let Some(stat) = &self.remote_jsonstat {
            names.push(stat.clone());
        }
        names
    }

    /// Volume numbers recorded remotely form `1..=n`.
    pub fn volumes_contiguous(&self) -> bool {
        self.volumes
            .keys()
            .enumerate()
            .all(|(i, n)| *n as usize == i + 1)
    }
}

impl fmt::Display for BackupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if let Some(m) = &self.remote_manifest {
            names.push(m.as_str());
        }
        names.extend(self.volumes.values().map(String::as_str));
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{Component, Encoding, Naming};

    fn full() -> SetKind {
        SetKind::Full { time: 1_700_000_000 }
    }

    #[test]
    fn test_groups_volumes_and_manifest() -> Result<()> {
        let naming = Naming::new("", false);
        let v1 = naming.get(&full(), Component::Volume(1), false, Encoding::Encrypted);
        let v2 = naming.get(&full(), Component::Volume(2), false, Encoding::Encrypted);
        let m = naming.get(&full(), Component::Manifest, false, Encoding::Encrypted);

        let pr = naming.parse(&v1).unwrap();
        let mut set = BackupSet::from_parse(&pr).unwrap();
        assert!(set.add_filename(&v1, &pr)?);
        assert!(set.add_filename(&v2, &naming.parse(&v2).unwrap())?);
        assert!(!set.is_complete());
        assert!(set.add_filename(&m, &naming.parse(&m).unwrap())?);

        assert!(set.is_complete());
        assert_eq!(set.len(), 2);
        assert!(set.encrypted);
        assert_eq!(set.remote_filenames(), vec![v1, v2, m]);
        Ok(())
    }

    #[test]
    fn test_rejects_other_interval() -> Result<()> {
        let naming = Naming::new("", false);
        let v1 = naming.get(&full(), Component::Volume(1), false, Encoding::Plain);
        let other = naming.get(
            &SetKind::Full { time: 1_700_000_001 },
            Component::Volume(2),
            false,
            Encoding::Plain,
        );
        let pr = naming.parse(&v1).unwrap();
        let mut set = BackupSet::from_parse(&pr).unwrap();
        set.add_filename(&v1, &pr)?;
        assert!(!set.add_filename(&other, &naming.parse(&other).unwrap())?);
        Ok(())
    }

    #[test]
    fn test_duplicate_volume_is_consistency_error() {
        let naming = Naming::new("", false);
        let plain = naming.get(&full(), Component::Volume(1), false, Encoding::Plain);
        let gpg = naming.get(&full(), Component::Volume(1), false, Encoding::Encrypted);
        let pr = naming.parse(&plain).unwrap();
        let mut set = BackupSet::from_parse(&pr).unwrap();
        set.add_filename(&plain, &pr).unwrap();

        let err = set
            .add_filename(&gpg, &naming.parse(&gpg).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DuplicateVolume));
    }

    #[test]
    fn test_partial_manifest_not_listed_remotely() -> Result<()> {
        let naming = Naming::new("", false);
        let part = naming.get(&full(), Component::Manifest, true, Encoding::Plain);
        let v1 = naming.get(&full(), Component::Volume(1), false, Encoding::Encrypted);

        let pr = naming.parse(&part).unwrap();
        let mut set = BackupSet::from_parse(&pr).unwrap();
        set.add_filename(&part, &pr)?;
        set.add_filename(&v1, &naming.parse(&v1).unwrap())?;

        assert!(set.partial);
        assert!(set.is_complete());
        // partial set adopts encryption from its volumes
        assert!(set.encrypted);
        assert_eq!(set.remote_filenames(), vec![v1]);
        Ok(())
    }

    #[test]
    fn test_volumes_contiguous() -> Result<()> {
        let naming = Naming::new("", false);
        let v1 = naming.get(&full(), Component::Volume(1), false, Encoding::Plain);
        let v3 = naming.get(&full(), Component::Volume(3), false, Encoding::Plain);
        let pr = naming.parse(&v1).unwrap();
        let mut set = BackupSet::from_parse(&pr).unwrap();
        set.add_filename(&v1, &pr)?;
        assert!(set.volumes_contiguous());
        set.add_filename(&v3, &naming.parse(&v3).unwrap())?;
        assert!(!set.volumes_contiguous());
        Ok(())
    }
}
