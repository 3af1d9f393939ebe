//! A user's file as recorded in the ledger, plus the storage locator it points at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Durable reference to an object in the object store.
///
/// Locators are the storage key of the payload (`users/{owner}/...`). They are
/// opaque to everything except the object store that issued them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single file entry owned by one principal.
///
/// `owner_id` never changes after insertion and `locator` references a live
/// object for as long as the record exists.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Ledger-assigned identifier.
    pub id: Uuid,

    /// Principal that uploaded the file.
    pub owner_id: Uuid,

    /// Human readable file name as supplied at upload time.
    pub name: String,

    /// Payload size in bytes (never negative).
    pub size_bytes: i64,

    /// Where the payload lives in the object store.
    pub locator: Locator,

    /// MD5 hex digest computed while the payload was streamed.
    pub checksum: String,

    /// Wall-clock time of the ledger insert.
    pub created_at: DateTime<Utc>,
}

/// Everything the ledger needs to create a [`FileRecord`]; the id is assigned on insert.
#[derive(Clone, Debug)]
pub struct NewFileRecord {
    pub owner_id: Uuid,
    pub name: String,
    pub size_bytes: i64,
    pub locator: Locator,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate usage for one owner.
#[derive(Serialize, Clone, Copy, FromRow, Debug, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub file_count: i64,
    pub total_bytes: i64,
}

const SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// Render a byte count with base-1024 units and at most two decimals.
pub fn format_size(bytes: i64) -> String {
    if bytes <= 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, SIZE_UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes_like_the_dashboard() {
        assert_eq!(format_size(0), "0 Bytes");
        assert_eq!(format_size(512), "512 Bytes");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_048_576), "1 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5 GB");
    }

    #[test]
    fn caps_units_at_gigabytes() {
        assert_eq!(format_size(2 * 1024 * 1024 * 1024 * 1024), "2048 GB");
    }
}
