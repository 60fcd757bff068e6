//! Transfer statistics aggregated from upload outcomes.
//!
//! Workers never touch shared counters; each put returns an outcome and the
//! driver folds it in here.

use serde::Serialize;
use std::time::Duration;

use crate::executor::upload::UploadOutcome;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferStats {
    pub volumes: u32,
    pub bytes: u64,
    /// Summed worker time, not wall clock
    pub put_time_ms: u64,
    pub skipped_volumes: u32,
}

impl TransferStats {
    pub fn record(&mut self, outcome: &UploadOutcome) {
        if outcome.skipped {
            self.skipped_volumes += 1;
            return;
        }
        self.volumes += 1;
        self.bytes += outcome.bytes;
        self.put_time_ms += outcome.elapsed.as_millis() as u64;
    }

    /// Count a metadata upload (manifest, signatures, jsonstat).
    pub fn record_file(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub fn average_speed(&self) -> u64 {
        if self.put_time_ms == 0 {
            return 0;
        }
        self.bytes * 1000 / self.put_time_ms
    }

    pub fn summary(&self, wall: Duration) -> String {
        format!(
            "{} volumes, {} in {} ({})",
            self.volumes,
            format_bytes(self.bytes),
            format_duration(wall.as_secs()),
            format_speed(self.average_speed())
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
