//! Transfer accounting.

pub mod stats;

pub use stats::{format_bytes, format_duration, format_speed, TransferStats};
