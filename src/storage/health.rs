use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Healthy,
    Degraded,
    Corrupted,
}

/// Table health snapshot returned by `Table::health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHealth {
    pub record_count: u64,
    pub file_size_bytes: u64,
    /// `1 − live_records / records_ever_written`, clamped to `[0, 1]`.
    pub fragmentation_ratio: f64,
    pub status: TableStatus,
}

pub fn fragmentation_ratio(live: u64, ever_written: u64) -> f64 {
    if ever_written == 0 {
        return 0.0;
    }
    (1.0 - (live as f64 / ever_written as f64)).clamp(0.0, 1.0)
}
