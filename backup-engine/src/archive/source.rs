//! Block source over a directory tree.
//!
//! Full mode emits every file as snapshot chunks. Delta mode merges the
//! sorted walk with the tree recorded by a signature chain and emits only
//! what changed: snapshots for new files, rsync deltas for modified ones and
//! deletion records for paths that vanished. Either way a signature entry is
//! written for every path the stream mentions.
//!
//! Snapshots are read one block at a time, so memory stays bounded by the
//! block size whatever the file size. Deltas need the whole new contents.

use std::collections::{btree_map, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::iter::Peekable;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use super::record::{Block, RecordKind};
use super::BlockSource;
use crate::collections::set::{ChangeAction, FileChange};
use crate::fs::walker::{FileInfo, Selection, WalkOptions};
use crate::sync::delta::compute_delta;
use crate::sync::signature::{
    generate_signature_from_bytes, serialize_signature, EntryKind, SigEntry, SignatureBuilder,
    SignatureMap, SignatureWriter,
};
use crate::utils::errors::Result;

/// Signature output shared between the source and the checkpoint that owns
/// the underlying file.
pub type SharedSigWriter = Arc<Mutex<SignatureWriter<Box<dyn Write + Send>>>>;

/// Counters reported in the jsonstat file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source_files: u64,
    pub source_file_size: u64,
    pub new_files: u64,
    pub changed_files: u64,
    pub deleted_files: u64,
    pub unchanged_files: u64,
    /// Bytes of snapshot data and deltas put into the stream
    pub raw_delta_size: u64,
}

/// A file whose snapshot is being read block by block.
struct OpenFile {
    reader: BufReader<File>,
    entry: SigEntry,
    signature: SignatureBuilder,
    had_prior: bool,
    chunk: u64,
}

pub struct DirSource {
    selection: Selection,
    lookahead: Option<FileInfo>,
    base: Option<Peekable<btree_map::IntoIter<Vec<String>, SigEntry>>>,
    sigs: SharedSigWriter,
    pending: VecDeque<Block>,
    open: Option<OpenFile>,
    max_block_size: usize,
    changes: Vec<FileChange>,
    stats: SourceStats,
}

impl DirSource {
    /// Stream the whole tree.
    pub fn full(
        root: &Path,
        options: &WalkOptions,
        sigs: SharedSigWriter,
        max_block_size: usize,
    ) -> io::Result<Self> {
        Self::build(root, options, None, sigs, max_block_size)
    }

    /// Stream the differences against `base`.
    pub fn delta(
        root: &Path,
        options: &WalkOptions,
        base: SignatureMap,
        sigs: SharedSigWriter,
        max_block_size: usize,
    ) -> io::Result<Self> {
        Self::build(root, options, Some(base), sigs, max_block_size)
    }

    fn build(
        root: &Path,
        options: &WalkOptions,
        base: Option<SignatureMap>,
        sigs: SharedSigWriter,
        max_block_size: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            selection: Selection::new(root, options)?,
            lookahead: None,
            base: base.map(|b| b.into_iter().peekable()),
            sigs,
            pending: VecDeque::new(),
            open: None,
            max_block_size,
            changes: Vec::new(),
            stats: SourceStats::default(),
        })
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    fn is_delta(&self) -> bool {
        self.base.is_some()
    }

    fn write_sig(&self, entry: &SigEntry) -> io::Result<()> {
        let mut sigs = self
            .sigs
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "signature writer poisoned"))?;
        sigs.write_entry(entry)
    }

    /// Process one path. Returns `false` once walk and base are both drained.
    fn step(&mut self) -> Result<bool> {
        if self.lookahead.is_none() {
            self.lookahead = self.selection.next().transpose()?;
        }
        let base_key = self
            .base
            .as_mut()
            .and_then(|b| b.peek().map(|(k, _)| k.clone()));

        let deleted_first = match (&self.lookahead, &base_key) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(info), Some(key)) => *key < info.index,
        };
        if deleted_first {
            if let Some((path, _)) = self.base.as_mut().and_then(|b| b.next()) {
                self.emit_deleted(path)?;
            }
            return Ok(true);
        }

        let Some(info) = self.lookahead.take() else {
            return Ok(false);
        };
        let prior = if base_key.as_ref() == Some(&info.index) {
            self.base.as_mut().and_then(|b| b.next()).map(|(_, e)| e)
        } else {
            None
        };
        self.emit_entry(info, prior)?;
        Ok(true)
    }

    fn emit_entry(&mut self, info: FileInfo, prior: Option<SigEntry>) -> Result<()> {
        let kind = if info.is_dir {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        if let Some(prior) = &prior {
            if prior.unchanged(kind, info.size, info.mtime_ns) {
                self.stats.source_files += 1;
                self.stats.source_file_size += info.size;
                self.stats.unchanged_files += 1;
                return Ok(());
            }
        }

        let mut entry = SigEntry {
            path: info.index.clone(),
            kind,
            size: info.size,
            mtime_ns: info.mtime_ns,
            signature: String::new(),
            deleted: false,
        };

        if info.is_dir {
            self.pending
                .push_back(Block::new(RecordKind::Dir, info.index.clone(), 0, Vec::new()));
            return self.finish_entry(entry, prior.is_some());
        }

        let base_sig = prior
            .as_ref()
            .filter(|p| p.kind == EntryKind::File && !p.signature.is_empty())
            .map(|p| p.rsync_signature())
            .transpose()?;

        let Some(base_sig) = base_sig else {
            let reader = match File::open(&info.path) {
                Ok(file) => BufReader::new(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return self.vanished(&info, prior.is_some());
                }
                Err(e) => return Err(e.into()),
            };
            self.open = Some(OpenFile {
                reader,
                entry,
                signature: SignatureBuilder::new(None),
                had_prior: prior.is_some(),
                chunk: 0,
            });
            return Ok(());
        };

        let data = match fs::read(&info.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return self.vanished(&info, true);
            }
            Err(e) => return Err(e.into()),
        };
        entry.signature = hex::encode(serialize_signature(&generate_signature_from_bytes(&data, None)));

        let delta = compute_delta(&base_sig, &data)?;
        debug!(
            "Delta for {}: {} bytes for {} byte file",
            info.path.display(),
            delta.len(),
            data.len()
        );
        self.stats.raw_delta_size += delta.len() as u64;
        self.push_chunks(RecordKind::Delta, &info.index, &delta);
        self.finish_entry(entry, true)
    }

    fn vanished(&mut self, info: &FileInfo, had_prior: bool) -> Result<()> {
        warn!("File vanished during backup: {}", info.path.display());
        if had_prior {
            self.emit_deleted(info.index.clone())?;
        }
        Ok(())
    }

    /// Record a path the stream now carries.
    fn finish_entry(&mut self, entry: SigEntry, had_prior: bool) -> Result<()> {
        self.write_sig(&entry)?;
        self.stats.source_files += 1;
        self.stats.source_file_size += entry.size;

        let action = if self.is_delta() && had_prior {
            self.stats.changed_files += 1;
            ChangeAction::Changed
        } else {
            self.stats.new_files += 1;
            ChangeAction::New
        };
        self.changes.push(FileChange {
            action,
            path: entry.path.join("/"),
        });
        Ok(())
    }

    fn chunk_size(&self, index: &[String]) -> usize {
        self.max_block_size
            .saturating_sub(Block::header_len(index))
            .max(1)
    }

    /// Next snapshot block of the open file. An empty file still yields one
    /// empty block. `None` once the file is done.
    fn next_chunk(&mut self) -> Result<Option<Block>> {
        let Some(open) = self.open.as_ref() else {
            return Ok(None);
        };
        let chunk_size = self.chunk_size(&open.entry.path);
        let Some(open) = self.open.as_mut() else {
            return Ok(None);
        };

        let mut data = Vec::with_capacity(chunk_size);
        open.reader
            .by_ref()
            .take(chunk_size as u64)
            .read_to_end(&mut data)?;
        if data.is_empty() && open.chunk > 0 {
            if let Some(done) = self.open.take() {
                let mut entry = done.entry;
                entry.signature = hex::encode(serialize_signature(&done.signature.finish()?));
                self.finish_entry(entry, done.had_prior)?;
            }
            return Ok(None);
        }

        open.signature.update(&data);
        let block = Block::new(RecordKind::Snapshot, open.entry.path.clone(), open.chunk, data);
        open.chunk += 1;
        self.stats.raw_delta_size += block.data.len() as u64;
        Ok(Some(block))
    }

    fn emit_deleted(&mut self, path: Vec<String>) -> Result<()> {
        self.write_sig(&SigEntry::deletion(path.clone()))?;
        self.stats.deleted_files += 1;
        self.changes.push(FileChange {
            action: ChangeAction::Deleted,
            path: path.join("/"),
        });
        self.pending
            .push_back(Block::new(RecordKind::Deleted, path, 0, Vec::new()));
        Ok(())
    }

    fn push_chunks(&mut self, kind: RecordKind, index: &[String], data: &[u8]) {
        let chunk_size = self.chunk_size(index);
        if data.is_empty() {
            self.pending
                .push_back(Block::new(kind, index.to_vec(), 0, Vec::new()));
            return;
        }
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            self.pending
                .push_back(Block::new(kind, index.to_vec(), i as u64, chunk.to_vec()));
        }
    }
}

impl BlockSource for DirSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        loop {
            if let Some(block) = self.pending.pop_front() {
                return Ok(Some(block));
            }
            if self.open.is_some() {
                if let Some(block) = self.next_chunk()? {
                    return Ok(Some(block));
                }
                continue;
            }
            if !self.step()? {
                return Ok(None);
            }
        }
    }

    fn read_size(&self) -> usize {
        self.max_block_size
    }

    fn has_changes(&self) -> bool {
        !self.is_delta() || !self.changes.is_empty()
    }
}

/// A signature sink writing into memory, for tests.
#[cfg(test)]
pub(crate) fn memory_sigs() -> (SharedSigWriter, Arc<Mutex<Vec<u8>>>) {
    struct Shared(Arc<Mutex<Vec<u8>>>);
    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    let buf = Arc::new(Mutex::new(Vec::new()));
    let writer: Box<dyn Write + Send> = Box::new(Shared(Arc::clone(&buf)));
    (Arc::new(Mutex::new(SignatureWriter::new(writer))), buf)
}
