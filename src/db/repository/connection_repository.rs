use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const CONNECTION_COLUMNS: &str = r#"
    id, user_id, provider, calendar_url, calendar_name,
    encrypted_username, encrypted_password,
    sync_status, sync_interval, bidirectional_sync, auto_export,
    last_sync_at, last_sync_error,
    created_at, updated_at
"#;

// ============================================================================
// External Calendar Connection Repository
// ============================================================================

/// Repository for `external_calendar_connections`.
///
/// Rows are never deleted; disconnecting only flips `sync_status` so that the
/// sync log history keeps a valid parent.
pub struct ConnectionRepository;

impl ConnectionRepository {
    pub async fn create(
        pool: &SqlitePool,
        create: CreateConnection,
    ) -> AppResult<ExternalCalendarConnection> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let sql = format!(
            r#"
            INSERT INTO external_calendar_connections (
                id, user_id, provider, calendar_url, calendar_name,
                encrypted_username, encrypted_password,
                sync_status, sync_interval, bidirectional_sync, auto_export,
                last_sync_at, last_sync_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        );

        sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(&id)
            .bind(&create.user_id)
            .bind(create.provider.as_str())
            .bind(&create.calendar_url)
            .bind(&create.calendar_name)
            .bind(&create.encrypted_username)
            .bind(&create.encrypted_password)
            .bind(ConnectionStatus::Active.as_str())
            .bind(create.sync_interval)
            .bind(create.bidirectional_sync)
            .bind(create.auto_export)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<ExternalCalendarConnection>> {
        let sql = format!(
            "SELECT {} FROM external_calendar_connections WHERE id = ?",
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Find a connection only if it belongs to `user_id`.
    pub async fn find_for_user(
        pool: &SqlitePool,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<ExternalCalendarConnection>> {
        let sql = format!(
            "SELECT {} FROM external_calendar_connections WHERE id = ? AND user_id = ?",
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_by_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<ExternalCalendarConnection>> {
        let sql = format!(
            "SELECT {} FROM external_calendar_connections WHERE user_id = ? ORDER BY created_at",
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Active connections of a user that push local appointments automatically.
    pub async fn list_auto_export_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<ExternalCalendarConnection>> {
        let sql = format!(
            r#"
            SELECT {} FROM external_calendar_connections
            WHERE user_id = ? AND sync_status = ? AND auto_export = 1
            ORDER BY created_at
            "#,
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(user_id)
            .bind(ConnectionStatus::Active.as_str())
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Active connections whose interval has elapsed since their last sync.
    pub async fn list_due(
        pool: &SqlitePool,
        now: NaiveDateTime,
    ) -> AppResult<Vec<ExternalCalendarConnection>> {
        let sql = format!(
            "SELECT {} FROM external_calendar_connections WHERE sync_status = ?",
            CONNECTION_COLUMNS
        );
        let active = sqlx::query_as::<_, ExternalCalendarConnection>(&sql)
            .bind(ConnectionStatus::Active.as_str())
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(active.into_iter().filter(|c| c.is_due(now)).collect())
    }

    /// Current status only; used to notice a disconnect while a run is in flight.
    pub async fn current_status(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<ConnectionStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT sync_status FROM external_calendar_connections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(status.and_then(|s| ConnectionStatus::from_str(&s)))
    }

    pub async fn update_settings(
        pool: &SqlitePool,
        id: &str,
        settings: &UpdateConnectionSettings,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE external_calendar_connections
            SET sync_interval = COALESCE(?, sync_interval),
                bidirectional_sync = COALESCE(?, bidirectional_sync),
                auto_export = COALESCE(?, auto_export),
                calendar_name = COALESCE(?, calendar_name),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(settings.sync_interval)
        .bind(settings.bidirectional_sync)
        .bind(settings.auto_export)
        .bind(&settings.calendar_name)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Store freshly encrypted credentials and re-enable the connection.
    pub async fn reauthorize(
        pool: &SqlitePool,
        id: &str,
        encrypted_username: &str,
        encrypted_password: &str,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE external_calendar_connections
            SET encrypted_username = ?,
                encrypted_password = ?,
                sync_status = ?,
                last_sync_error = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encrypted_username)
        .bind(encrypted_password)
        .bind(ConnectionStatus::Active.as_str())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn disconnect(pool: &SqlitePool, id: &str) -> AppResult<()> {
        Self::set_status(pool, id, ConnectionStatus::Disconnected, None).await
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE external_calendar_connections
            SET sync_status = ?,
                last_sync_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Record a completed run: bump `last_sync_at` and store the error summary.
    ///
    /// A connection that was disconnected while the run was in flight keeps its
    /// `DISCONNECTED` status.
    pub async fn record_sync_completed(
        pool: &SqlitePool,
        id: &str,
        synced_at: NaiveDateTime,
        error: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE external_calendar_connections
            SET last_sync_at = ?,
                last_sync_error = ?,
                sync_status = CASE WHEN sync_status = ? THEN sync_status ELSE ? END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(synced_at)
        .bind(error)
        .bind(ConnectionStatus::Disconnected.as_str())
        .bind(ConnectionStatus::Active.as_str())
        .bind(synced_at)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Record a failed run. `status` is applied unless the connection was
    /// disconnected in the meantime; `None` leaves the status untouched.
    pub async fn record_sync_failure(
        pool: &SqlitePool,
        id: &str,
        error: &str,
        status: Option<ConnectionStatus>,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE external_calendar_connections
            SET last_sync_error = ?,
                sync_status = CASE WHEN sync_status = ? THEN sync_status
                                   ELSE COALESCE(?, sync_status) END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(ConnectionStatus::Disconnected.as_str())
        .bind(status.map(|s| s.as_str()))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
