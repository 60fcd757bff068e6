//! Rolling-checksum signatures and deltas (fast_rsync).

pub mod delta;
pub mod signature;

pub use delta::{compute_delta, patch, patch_file};
pub use signature::{EntryKind, SigEntry, SignatureMap, SignatureWriter};
