//! Filesystem selection for backup sources.

pub mod walker;

pub use walker::{walk_directory, FileInfo, Selection, WalkOptions};
