use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Sync run history (one row per orchestrator invocation)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Initial,
    Incremental,
    Manual,
}

impl SyncType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INITIAL" => Some(SyncType::Initial),
            "INCREMENTAL" => Some(SyncType::Incremental),
            "MANUAL" => Some(SyncType::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::Initial => "INITIAL",
            SyncType::Incremental => "INCREMENTAL",
            SyncType::Manual => "MANUAL",
        }
    }
}

impl TryFrom<String> for SyncType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid sync type: {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    Import,
    Export,
    Bidirectional,
}

impl SyncDirection {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "IMPORT" => Some(SyncDirection::Import),
            "EXPORT" => Some(SyncDirection::Export),
            "BIDIRECTIONAL" => Some(SyncDirection::Bidirectional),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Import => "IMPORT",
            SyncDirection::Export => "EXPORT",
            SyncDirection::Bidirectional => "BIDIRECTIONAL",
        }
    }
}

impl TryFrom<String> for SyncDirection {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid sync direction: {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Failed,
    Partial,
}

impl SyncStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Some(SyncStatus::Success),
            "FAILED" => Some(SyncStatus::Failed),
            "PARTIAL" => Some(SyncStatus::Partial),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Partial => "PARTIAL",
        }
    }
}

impl TryFrom<String> for SyncStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid sync status: {}", value))
    }
}

/// Counters accumulated while a run is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub events_imported: i64,
    pub events_exported: i64,
    pub events_updated: i64,
    pub events_deleted: i64,
    pub conflicts_resolved: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CalendarSyncLog {
    pub id: String,
    pub connection_id: String,
    #[sqlx(try_from = "String")]
    pub sync_type: SyncType,
    #[sqlx(try_from = "String")]
    pub direction: SyncDirection,
    #[sqlx(try_from = "String")]
    pub status: SyncStatus,
    pub events_imported: i64,
    pub events_exported: i64,
    pub events_updated: i64,
    pub events_deleted: i64,
    pub conflicts_resolved: i64,
    pub error_message: Option<String>,
    pub started_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct CreateSyncLog {
    pub connection_id: String,
    pub sync_type: SyncType,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    pub started_at: NaiveDateTime,
}

/// Aggregate run statistics for one connection.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStatistics {
    pub total_syncs: i64,
    pub successful_syncs: i64,
    pub failed_syncs: i64,
}

impl SyncStatistics {
    /// Percentage of successful runs, rounded to two decimals.
    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            return 0.0;
        }
        let rate = self.successful_syncs as f64 / self.total_syncs as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}
