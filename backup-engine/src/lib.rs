//! Backup Engine Library
//!
//! Incremental, multi-volume backups to a storage backend: chain discovery,
//! volume writing with checkpointed manifests, resumable restarts, restore
//! and retention.

pub mod archive;
pub mod codec;
pub mod collections;
pub mod config;
pub mod executor;
pub mod fs;
pub mod maintenance;
pub mod naming;
pub mod restore;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupEngine, BackupMode, BackupResult};
pub use utils::errors::{EngineError, ErrorCode, Result};
