//! Checkpointed manifest and signature output of one backup set.
//!
//! Both streams start in progress (the signature file under a scratch name,
//! the manifest only in memory). Committing volume 1 moves them to partial:
//! the signature file is renamed to its `.part` name and the manifest is
//! written next to it. Every later commit flushes both again, so after a
//! crash the partial manifest lists exactly the committed volumes.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::manifest::{Manifest, VolumeInfo};
use crate::archive::SharedSigWriter;
use crate::codec::{encode_file, VolumeCodec};
use crate::collections::set::{FileChange, SetKind};
use crate::naming::{Component, Encoding, Naming};
use crate::storage::{put_validated, ArchiveDir, Backend};
use crate::sync::SignatureWriter;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    InProgress,
    Partial,
    Final,
}

pub struct Checkpoint {
    archive: ArchiveDir,
    naming: Naming,
    kind: SetKind,
    state: StreamState,
    /// Current cache name of the signature file
    sig_name: String,
    sig_file: File,
    sigs: SharedSigWriter,
    manifest: Manifest,
}

impl Checkpoint {
    /// Start fresh output for a new set.
    pub fn begin(
        archive: &ArchiveDir,
        naming: &Naming,
        kind: SetKind,
        manifest: Manifest,
    ) -> Result<Self> {
        let sig_name = archive.scratch_name();
        Self::open(archive, naming, kind, manifest, sig_name, StreamState::InProgress)
    }

    /// Reopen a partial set. Signatures are regenerated from the start of
    /// the source, so the partial signature file is truncated.
    pub fn resume(
        archive: &ArchiveDir,
        naming: &Naming,
        kind: SetKind,
        manifest: Manifest,
    ) -> Result<Self> {
        let sig_name = naming.get(&kind, Component::Signature, true, Encoding::Plain);
        Self::open(archive, naming, kind, manifest, sig_name, StreamState::Partial)
    }

    fn open(
        archive: &ArchiveDir,
        naming: &Naming,
        kind: SetKind,
        manifest: Manifest,
        sig_name: String,
        state: StreamState,
    ) -> Result<Self> {
        let file = File::create(archive.path(&sig_name))?;
        let sig_file = file.try_clone()?;
        let writer: Box<dyn std::io::Write + Send> = Box::new(BufWriter::new(file));
        Ok(Self {
            archive: archive.clone(),
            naming: naming.clone(),
            kind,
            state,
            sig_name,
            sig_file,
            sigs: Arc::new(Mutex::new(SignatureWriter::new(writer))),
            manifest,
        })
    }

    pub fn kind(&self) -> SetKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Writer the block source emits signature entries into.
    pub fn sigs(&self) -> SharedSigWriter {
        Arc::clone(&self.sigs)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn sig_name(&self) -> &str {
        &self.sig_name
    }

    fn local_name(&self, component: Component, partial: bool) -> String {
        self.naming
            .get(&self.kind, component, partial, Encoding::Plain)
    }

    /// Record a confirmed volume and make the checkpoint durable.
    pub fn commit_volume(&mut self, info: VolumeInfo) -> Result<()> {
        let n = info.volume_number;
        self.manifest.add_volume_info(info);
        if self.state == StreamState::InProgress {
            self.promote()?;
        }
        self.sync()?;
        debug!(volume = n, "Checkpointed {} volumes", self.manifest.volume_count());
        Ok(())
    }

    fn promote(&mut self) -> Result<()> {
        let partial = self.local_name(Component::Signature, true);
        self.archive.rename(&self.sig_name, &partial)?;
        self.sig_name = partial;
        self.state = StreamState::Partial;
        Ok(())
    }

    fn flush_sigs(&self) -> Result<()> {
        self.sigs
            .lock()
            .map_err(|_| EngineError::Format("signature writer poisoned".into()))?
            .flush()?;
        self.sig_file.sync_all()?;
        Ok(())
    }

    /// Flush the signature stream and rewrite the partial manifest.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_sigs()?;
        if self.state == StreamState::Partial {
            let name = self.local_name(Component::Manifest, true);
            self.archive.write_atomic(&name, &self.manifest.to_bytes()?)?;
        }
        Ok(())
    }

    /// Close both streams, upload them and move the cache copies to their
    /// final names. Returns the bytes uploaded.
    pub fn finalize(
        mut self,
        backend: &dyn Backend,
        codec: &dyn VolumeCodec,
        temp_dir: &Path,
        files_changed: Vec<FileChange>,
    ) -> Result<u64> {
        self.manifest.files_changed = files_changed;
        self.flush_sigs()?;
        if self.state == StreamState::InProgress {
            self.promote()?;
        }

        let encoding = codec.encoding();
        let remote_sig = self
            .naming
            .get(&self.kind, Component::Signature, false, encoding);
        let remote_manifest = self
            .naming
            .get(&self.kind, Component::Manifest, false, encoding);

        let mut uploaded = ship(
            backend,
            codec,
            temp_dir,
            &self.archive.path(&self.sig_name),
            &remote_sig,
        )?;

        let final_manifest = self.local_name(Component::Manifest, false);
        self.archive
            .write_atomic(&final_manifest, &self.manifest.to_bytes()?)?;
        uploaded += ship(
            backend,
            codec,
            temp_dir,
            &self.archive.path(&final_manifest),
            &remote_manifest,
        )?;

        let final_sig = self.local_name(Component::Signature, false);
        self.archive.rename(&self.sig_name, &final_sig)?;
        self.archive
            .delete(&self.local_name(Component::Manifest, true))?;
        self.sig_name = final_sig;
        self.state = StreamState::Final;

        info!(
            "Finalized {} set: {} and {}",
            self.kind.label(),
            remote_sig,
            remote_manifest
        );
        Ok(uploaded)
    }

    /// Drop both streams without uploading anything.
    pub fn discard(self) -> Result<()> {
        self.archive.delete(&self.sig_name)?;
        self.archive
            .delete(&self.local_name(Component::Manifest, true))?;
        debug!("Discarded output of {} set", self.kind.label());
        Ok(())
    }
}

/// Encode a cache file through the codec and store it under `remote_name`.
pub fn ship(
    backend: &dyn Backend,
    codec: &dyn VolumeCodec,
    temp_dir: &Path,
    local: &Path,
    remote_name: &str,
) -> Result<u64> {
    let encoded = tempfile::Builder::new()
        .prefix("tmp.")
        .tempfile_in(temp_dir)?;
    encode_file(codec, local, encoded.path())?;
    put_validated(backend, encoded.path(), remote_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Position;
    use crate::codec::PlainCodec;
    use crate::executor::manifest::DirInfo;
    use crate::storage::LocalBackend;
    use crate::sync::SigEntry;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000;

    fn vi(n: u32) -> VolumeInfo {
        VolumeInfo::new(n, &Position::default(), &Position::default(), "00".into())
    }

    fn setup() -> Result<(TempDir, ArchiveDir, Naming, Checkpoint)> {
        let dir = TempDir::new()?;
        let archive = ArchiveDir::open(&dir.path().join("cache"))?;
        let naming = Naming::new("", false);
        let manifest = Manifest::new(DirInfo::current(dir.path()));
        let cp = Checkpoint::begin(&archive, &naming, SetKind::Full { time: T0 }, manifest)?;
        Ok((dir, archive, naming, cp))
    }

    #[test]
    fn test_first_commit_moves_to_partial() -> Result<()> {
        let (_dir, archive, _naming, mut cp) = setup()?;
        assert_eq!(cp.state(), StreamState::InProgress);
        assert!(archive.list()?.is_empty());

        cp.sigs()
            .lock()
            .map_err(|_| EngineError::Cancelled)?
            .write_entry(&SigEntry::deletion(vec!["x".into()]))?;
        cp.commit_volume(vi(1))?;
        assert_eq!(cp.state(), StreamState::Partial);
        assert_eq!(
            archive.list()?,
            vec![
                "backup-full-signatures.20231114T221320Z.sigtar.part".to_string(),
                "backup-full.20231114T221320Z.manifest.part".to_string(),
            ]
        );
        assert!(!archive.read(cp.sig_name())?.is_empty());

        cp.commit_volume(vi(2))?;
        let on_disk =
            Manifest::from_bytes(&archive.read("backup-full.20231114T221320Z.manifest.part")?)?;
        assert_eq!(on_disk.volume_count(), 2);
        Ok(())
    }

    #[test]
    fn test_finalize_uploads_and_renames() -> Result<()> {
        let (dir, archive, _naming, mut cp) = setup()?;
        let remote = LocalBackend::new(&dir.path().join("remote"))?;
        cp.commit_volume(vi(1))?;

        cp.finalize(&remote, &PlainCodec, dir.path(), Vec::new())?;
        assert_eq!(
            archive.list()?,
            vec![
                "backup-full-signatures.20231114T221320Z.sigtar".to_string(),
                "backup-full.20231114T221320Z.manifest".to_string(),
            ]
        );
        assert_eq!(remote.list()?, archive.list()?);
        Ok(())
    }

    #[test]
    fn test_discard_leaves_nothing() -> Result<()> {
        let (_dir, archive, _naming, mut cp) = setup()?;
        cp.commit_volume(vi(1))?;
        cp.discard()?;
        assert!(archive.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_resume_reuses_manifest() -> Result<()> {
        let (_dir, archive, naming, mut cp) = setup()?;
        cp.commit_volume(vi(1))?;
        cp.commit_volume(vi(2))?;
        let mut manifest = cp.manifest().clone();
        drop(cp);

        manifest.del_volume_info(2);
        let mut cp = Checkpoint::resume(&archive, &naming, SetKind::Full { time: T0 }, manifest)?;
        assert_eq!(cp.state(), StreamState::Partial);
        cp.commit_volume(vi(2))?;
        assert_eq!(cp.manifest().volume_count(), 2);
        Ok(())
    }
}
