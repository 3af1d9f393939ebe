//! Progress snapshots published while an upload is in flight.

use serde::Serialize;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    InFlight,
    Completed,
    Failed,
    Cancelled,
}

/// Latest known state of one upload.
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct UploadProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub state: UploadState,
}

impl UploadProgress {
    pub fn started(total_bytes: u64) -> Self {
        Self {
            bytes_transferred: 0,
            total_bytes,
            state: UploadState::InFlight,
        }
    }

    /// Fraction of the declared size transferred so far, clamped to `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.state != UploadState::InFlight
    }
}
