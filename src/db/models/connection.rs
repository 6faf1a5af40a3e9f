use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// External calendar connections (one per user + remote calendar)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    IcloudCaldav,
}

impl ProviderKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ICLOUD_CALDAV" => Some(ProviderKind::IcloudCaldav),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::IcloudCaldav => "ICLOUD_CALDAV",
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid calendar provider kind: {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(ConnectionStatus::Active),
            "DISCONNECTED" => Some(ConnectionStatus::Disconnected),
            "ERROR" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Error => "ERROR",
        }
    }
}

impl TryFrom<String> for ConnectionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid connection status: {}", value))
    }
}

/// A configured link between a platform user and one remote calendar.
///
/// `encrypted_username` / `encrypted_password` always hold cipher blobs and are
/// never serialized into API responses.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExternalCalendarConnection {
    pub id: String,
    pub user_id: String,
    #[sqlx(try_from = "String")]
    pub provider: ProviderKind,
    pub calendar_url: String,
    pub calendar_name: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    #[sqlx(try_from = "String")]
    pub sync_status: ConnectionStatus,
    /// Seconds between scheduled runs.
    pub sync_interval: i64,
    pub bidirectional_sync: bool,
    pub auto_export: bool,
    pub last_sync_at: Option<NaiveDateTime>,
    pub last_sync_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ExternalCalendarConnection {
    pub fn is_disconnected(&self) -> bool {
        self.sync_status == ConnectionStatus::Disconnected
    }

    /// Whether a scheduled run is due at `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        if self.sync_status != ConnectionStatus::Active {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(last) => last + chrono::Duration::seconds(self.sync_interval) <= now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateConnection {
    pub user_id: String,
    pub provider: ProviderKind,
    pub calendar_url: String,
    pub calendar_name: Option<String>,
    pub encrypted_username: String,
    pub encrypted_password: String,
    pub sync_interval: i64,
    pub bidirectional_sync: bool,
    pub auto_export: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConnectionSettings {
    pub sync_interval: Option<i64>,
    pub bidirectional_sync: Option<bool>,
    pub auto_export: Option<bool>,
    pub calendar_name: Option<String>,
}
