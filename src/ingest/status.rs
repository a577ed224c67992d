//! Live ingest telemetry published to the HTTP layer.

use serde::Serialize;

/// Counters for one mount run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub scanned: usize,
    pub copied: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Snapshot of the manager's state. All mutating pipeline steps publish into
/// this; readers always get a consistent copy by value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStatus {
    /// idle, scanning, ingesting, or error.
    pub state: String,
    pub mount: String,
    /// scan or ingest while a run is active.
    pub phase: String,
    pub started_at: String,
    pub updated_at: String,
    pub total_files: usize,
    pub processed_files: usize,
    pub copied_files: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub total_bytes: i64,
    pub copied_bytes: i64,
    pub percent: f64,
    pub files_per_sec: f64,
    pub mbps: f64,
    pub current_path: String,
    pub message: String,
    pub last_result: IngestResult,
}

impl IngestStatus {
    pub fn idle() -> Self {
        Self {
            state: "idle".to_string(),
            ..Default::default()
        }
    }
}
