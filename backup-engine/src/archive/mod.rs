//! The archive stream: blocks produced from the source tree.
//!
//! A [`BlockSource`] yields records lazily. [`BlockIter`] adds the position
//! tracking the volume writer needs: where the current volume started,
//! the last block handed out, and a one-block push back for restarts.

pub mod record;
pub mod source;

pub use record::{read_block, Block, Position, RecordKind};
pub use source::{DirSource, SharedSigWriter, SourceStats};

use tracing::warn;

use crate::utils::errors::{ErrorCode, Result};

/// Upper bound on the encoded footer.
pub const MAX_FOOTER_SIZE: u64 = 16 * 1024;

pub trait BlockSource {
    /// Next record, or `None` once the source is drained.
    fn next_block(&mut self) -> Result<Option<Block>>;

    /// Largest encoded block this source yields.
    fn read_size(&self) -> usize;

    /// Record written at the end of every volume.
    fn footer(&self) -> Block {
        Block::end()
    }

    /// Whether anything differs from the base this stream was computed
    /// against. Full streams always count as changed.
    fn has_changes(&self) -> bool {
        true
    }
}

/// Position-tracking wrapper over a [`BlockSource`].
pub struct BlockIter<S> {
    source: S,
    pushed_back: Option<Block>,
    previous: Option<Position>,
    remembered: Option<Position>,
    remember_next: bool,
}

impl<S: BlockSource> BlockIter<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pushed_back: None,
            previous: None,
            remembered: None,
            remember_next: false,
        }
    }

    pub fn next(&mut self) -> Result<Option<Block>> {
        let block = match self.pushed_back.take() {
            Some(block) => Some(block),
            None => self.source.next_block()?,
        };
        if let Some(block) = &block {
            let pos = block.position();
            if self.remember_next {
                self.remembered = Some(pos.clone());
                self.remember_next = false;
            }
            self.previous = Some(pos);
        }
        Ok(block)
    }

    /// Return `block` so the next call yields it again.
    pub fn push_back(&mut self, block: Block) {
        self.pushed_back = Some(block);
    }

    /// Note the position of the next block handed out.
    pub fn remember_next_index(&mut self) {
        self.remember_next = true;
        self.remembered = None;
    }

    /// Position noted by [`remember_next_index`](Self::remember_next_index),
    /// if a block has been handed out since.
    pub fn recall_index(&self) -> Option<&Position> {
        self.remembered.as_ref()
    }

    /// Position of the last block handed out.
    pub fn previous_index(&self) -> Option<&Position> {
        self.previous.as_ref()
    }

    pub fn read_size(&self) -> usize {
        self.source.read_size()
    }

    pub fn footer(&self) -> Block {
        self.source.footer()
    }

    pub fn has_changes(&self) -> bool {
        self.source.has_changes()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Skip every block at or before `last`, pushing back the first one
    /// beyond it. Returns whether a block at `last.index` was seen.
    pub fn skip_through(&mut self, last: &Position) -> Result<bool> {
        let mut found = false;
        while let Some(block) = self.next()? {
            if block.index == last.index {
                found = true;
            }
            if block.position() > *last {
                self.push_back(block);
                break;
            }
        }
        if !found && !last.index.is_empty() {
            warn!(
                code = %ErrorCode::RestartFileNotFound,
                "File {} from the last trusted volume no longer exists; resuming at the next file",
                last.index.join("/")
            );
        }
        Ok(found)
    }
}

/// Source over an in-memory block list, for tests.
#[cfg(test)]
pub(crate) struct VecSource {
    pub blocks: std::collections::VecDeque<Block>,
    pub read_size: usize,
    pub changed: bool,
}

#[cfg(test)]
impl VecSource {
    pub fn new(blocks: Vec<Block>, read_size: usize) -> Self {
        Self {
            blocks: blocks.into(),
            read_size,
            changed: true,
        }
    }
}

#[cfg(test)]
impl BlockSource for VecSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.pop_front())
    }

    fn read_size(&self) -> usize {
        self.read_size
    }

    fn has_changes(&self) -> bool {
        self.changed
    }
}
