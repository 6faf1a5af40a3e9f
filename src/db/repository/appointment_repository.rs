use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const APPOINTMENT_COLUMNS: &str = r#"
    id, user_id, start_time, end_time, notes,
    external_connection_id, external_event_uid, external_event_url, external_etag,
    last_modified_source, sync_enabled,
    created_at, updated_at
"#;

// ============================================================================
// Appointment Repository (sync fields only)
// ============================================================================

/// Read/write access to the platform's `appointments` table, limited to what
/// the sync engine needs: lookups by the external join key and updates of the
/// sync-owned columns.
pub struct AppointmentRepository;

impl AppointmentRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Appointment>> {
        let sql = format!("SELECT {} FROM appointments WHERE id = ?", APPOINTMENT_COLUMNS);
        sqlx::query_as::<_, Appointment>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Look up the appointment linked to a remote event by the (connection, UID) join key.
    pub async fn find_by_external_uid(
        pool: &SqlitePool,
        connection_id: &str,
        event_uid: &str,
    ) -> AppResult<Option<Appointment>> {
        let sql = format!(
            r#"
            SELECT {} FROM appointments
            WHERE external_connection_id = ? AND external_event_uid = ?
            "#,
            APPOINTMENT_COLUMNS
        );
        sqlx::query_as::<_, Appointment>(&sql)
            .bind(connection_id)
            .bind(event_uid)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Appointment joined with service, client and branch names for iCalendar export.
    pub async fn find_export_view(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<AppointmentExport>> {
        sqlx::query_as::<_, AppointmentExport>(
            r#"
            SELECT
                a.id AS id,
                a.user_id AS user_id,
                s.name AS service_name,
                c.first_name AS client_first_name,
                c.last_name AS client_last_name,
                b.name AS branch_name,
                a.start_time AS start_time,
                a.end_time AS end_time,
                a.notes AS notes,
                a.external_connection_id AS external_connection_id,
                a.external_event_uid AS external_event_uid,
                a.external_event_url AS external_event_url,
                a.external_etag AS external_etag
            FROM appointments a
            JOIN services s ON s.id = a.service_id
            JOIN clients c ON c.id = a.client_id
            LEFT JOIN branches b ON b.id = a.branch_id
            WHERE a.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Overwrite the appointment with values from the remote calendar.
    pub async fn apply_remote_update(
        pool: &SqlitePool,
        id: &str,
        update: &RemoteAppointmentUpdate,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE appointments
            SET start_time = ?,
                end_time = ?,
                notes = ?,
                external_etag = ?,
                last_modified_source = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.start_time)
        .bind(update.end_time)
        .bind(&update.notes)
        .bind(&update.etag)
        .bind(ModificationSource::External.as_str())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Store the remote reference returned by an export.
    ///
    /// `updated_at` is left alone: writing sync bookkeeping is not a local edit.
    pub async fn apply_export_link(pool: &SqlitePool, id: &str, link: &ExportLink) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE appointments
            SET external_connection_id = ?,
                external_event_uid = ?,
                external_event_url = ?,
                external_etag = ?,
                last_modified_source = ?,
                sync_enabled = 1
            WHERE id = ?
            "#,
        )
        .bind(&link.connection_id)
        .bind(&link.event_uid)
        .bind(&link.event_url)
        .bind(&link.etag)
        .bind(ModificationSource::Local.as_str())
        .bind(id)
        .execute(pool)
        .await
        .map_err(map_link_conflict)?;

        Ok(())
    }

    /// Link an appointment to an existing remote event and take over its values.
    pub async fn link_to_remote_event(
        pool: &SqlitePool,
        id: &str,
        pending: &PendingEventMapping,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE appointments
            SET external_connection_id = ?,
                external_event_uid = ?,
                external_event_url = ?,
                external_etag = ?,
                start_time = ?,
                end_time = ?,
                notes = ?,
                last_modified_source = ?,
                sync_enabled = 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&pending.connection_id)
        .bind(&pending.event_uid)
        .bind(&pending.event_url)
        .bind(&pending.etag)
        .bind(pending.start_time)
        .bind(pending.end_time)
        .bind(&pending.description)
        .bind(ModificationSource::External.as_str())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(map_link_conflict)?;

        Ok(())
    }

    /// Linked appointments edited locally since `since` (all of them when `None`).
    pub async fn list_local_changes(
        pool: &SqlitePool,
        connection_id: &str,
        since: Option<NaiveDateTime>,
    ) -> AppResult<Vec<Appointment>> {
        let sql = format!(
            r#"
            SELECT {} FROM appointments
            WHERE external_connection_id = ?
              AND sync_enabled = 1
              AND last_modified_source = ?
              AND (? IS NULL OR updated_at > ?)
            ORDER BY updated_at
            "#,
            APPOINTMENT_COLUMNS
        );
        sqlx::query_as::<_, Appointment>(&sql)
            .bind(connection_id)
            .bind(ModificationSource::Local.as_str())
            .bind(since)
            .bind(since)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }
}

/// The unique (connection, UID) index turns a second link into a conflict.
fn map_link_conflict(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict(
            "Another appointment is already linked to this remote event".to_string(),
        ),
        _ => AppError::Database(err),
    }
}
