//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod shutdown;

pub use errors::{EngineError, Result};
