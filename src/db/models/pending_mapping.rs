use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::FromRow;

/// A remote event with no matching appointment, kept until an operator maps it.
///
/// Remote calendars do not carry client or service assignments, so these events
/// cannot become appointments automatically.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PendingEventMapping {
    pub id: String,
    pub connection_id: String,
    pub event_uid: String,
    pub summary: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub description: String,
    pub location: String,
    pub etag: Option<String>,
    pub event_url: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct UpsertPendingMapping {
    pub connection_id: String,
    pub event_uid: String,
    pub summary: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub description: String,
    pub location: String,
    pub etag: Option<String>,
    pub event_url: String,
}
