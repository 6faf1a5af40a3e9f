use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Appointment (owned by the platform; this service only touches sync fields)
// ============================================================================

/// Which side last changed an appointment that is linked to a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModificationSource {
    External,
    Local,
}

impl ModificationSource {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EXTERNAL" => Some(ModificationSource::External),
            "LOCAL" => Some(ModificationSource::Local),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModificationSource::External => "EXTERNAL",
            ModificationSource::Local => "LOCAL",
        }
    }
}

impl TryFrom<String> for ModificationSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid modification source: {}", value))
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Appointment {
    pub id: String,
    pub user_id: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub notes: Option<String>,

    // External sync fields. (external_connection_id, external_event_uid) is unique.
    pub external_connection_id: Option<String>,
    pub external_event_uid: Option<String>,
    pub external_event_url: Option<String>,
    pub external_etag: Option<String>,
    #[sqlx(try_from = "String")]
    pub last_modified_source: ModificationSource,
    pub sync_enabled: bool,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Appointment {
    /// True when the appointment was edited locally after the connection's last sync.
    pub fn has_local_changes_since(&self, last_sync_at: Option<NaiveDateTime>) -> bool {
        if self.last_modified_source != ModificationSource::Local {
            return false;
        }
        match last_sync_at {
            Some(last) => self.updated_at > last,
            None => true,
        }
    }
}

/// Appointment joined with the names the iCalendar export needs.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AppointmentExport {
    pub id: String,
    pub user_id: String,
    pub service_name: String,
    pub client_first_name: String,
    pub client_last_name: String,
    pub branch_name: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub notes: Option<String>,
    pub external_connection_id: Option<String>,
    pub external_event_uid: Option<String>,
    pub external_event_url: Option<String>,
    pub external_etag: Option<String>,
}

/// Values written onto an appointment when a remote event wins.
#[derive(Debug, Clone)]
pub struct RemoteAppointmentUpdate {
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub notes: String,
    pub etag: Option<String>,
}

/// Values written onto an appointment after a successful export.
#[derive(Debug, Clone)]
pub struct ExportLink {
    pub connection_id: String,
    pub event_uid: String,
    pub event_url: String,
    pub etag: Option<String>,
}
