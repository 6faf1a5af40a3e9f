use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const LOG_COLUMNS: &str = r#"
    id, connection_id, sync_type, direction, status,
    events_imported, events_exported, events_updated, events_deleted, conflicts_resolved,
    error_message, started_at, created_at
"#;

// ============================================================================
// Calendar Sync Log Repository
// ============================================================================

/// Append-only store for `calendar_sync_logs`. There is deliberately no update method.
pub struct SyncLogRepository;

impl SyncLogRepository {
    pub async fn create(pool: &SqlitePool, log: CreateSyncLog) -> AppResult<CalendarSyncLog> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let sql = format!(
            r#"
            INSERT INTO calendar_sync_logs (
                id, connection_id, sync_type, direction, status,
                events_imported, events_exported, events_updated, events_deleted,
                conflicts_resolved, error_message, started_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            LOG_COLUMNS
        );

        sqlx::query_as::<_, CalendarSyncLog>(&sql)
            .bind(&id)
            .bind(&log.connection_id)
            .bind(log.sync_type.as_str())
            .bind(log.direction.as_str())
            .bind(log.status.as_str())
            .bind(log.counts.events_imported)
            .bind(log.counts.events_exported)
            .bind(log.counts.events_updated)
            .bind(log.counts.events_deleted)
            .bind(log.counts.conflicts_resolved)
            .bind(&log.error_message)
            .bind(log.started_at)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Most recent logs for a connection, newest first.
    pub async fn recent_for_connection(
        pool: &SqlitePool,
        connection_id: &str,
        limit: i64,
    ) -> AppResult<Vec<CalendarSyncLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM calendar_sync_logs
            WHERE connection_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
            LOG_COLUMNS
        );
        sqlx::query_as::<_, CalendarSyncLog>(&sql)
            .bind(connection_id)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn statistics(pool: &SqlitePool, connection_id: &str) -> AppResult<SyncStatistics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
            FROM calendar_sync_logs
            WHERE connection_id = ?
            "#,
        )
        .bind(connection_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(SyncStatistics {
            total_syncs: row.get("total"),
            successful_syncs: row.get("successful"),
            failed_syncs: row.get("failed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{create_connection, test_pool};

    fn log_for(connection_id: &str, status: SyncStatus) -> CreateSyncLog {
        CreateSyncLog {
            connection_id: connection_id.to_string(),
            sync_type: SyncType::Incremental,
            direction: SyncDirection::Import,
            status,
            counts: SyncCounts {
                events_updated: 2,
                ..Default::default()
            },
            error_message: None,
            started_at: Utc::now().naive_utc(),
        }
    }

    #[tokio::test]
    async fn recent_logs_are_newest_first_and_limited() {
        let pool = test_pool().await;
        let conn = create_connection(&pool, "u").await;

        let first = SyncLogRepository::create(&pool, log_for(&conn.id, SyncStatus::Failed))
            .await
            .unwrap();
        let second = SyncLogRepository::create(&pool, log_for(&conn.id, SyncStatus::Success))
            .await
            .unwrap();
        SyncLogRepository::create(&pool, log_for(&conn.id, SyncStatus::Partial))
            .await
            .unwrap();

        let recent = SyncLogRepository::recent_for_connection(&pool, &conn.id, 2)
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, SyncStatus::Partial);
        assert_eq!(recent[1].id, second.id);
        assert_ne!(recent[1].id, first.id);
        assert_eq!(recent[0].events_updated, 2);
    }

    #[tokio::test]
    async fn statistics_count_by_status() {
        let pool = test_pool().await;
        let conn = create_connection(&pool, "u").await;

        for status in [SyncStatus::Success, SyncStatus::Success, SyncStatus::Failed, SyncStatus::Partial] {
            SyncLogRepository::create(&pool, log_for(&conn.id, status)).await.unwrap();
        }

        let stats = SyncLogRepository::statistics(&pool, &conn.id).await.unwrap();
        assert_eq!(stats.total_syncs, 4);
        assert_eq!(stats.successful_syncs, 2);
        assert_eq!(stats.failed_syncs, 1);
        assert_eq!(stats.success_rate(), 50.0);
    }

    #[tokio::test]
    async fn statistics_for_unknown_connection_are_zero() {
        let pool = test_pool().await;
        let stats = SyncLogRepository::statistics(&pool, "missing").await.unwrap();
        assert_eq!(stats.total_syncs, 0);
        assert_eq!(stats.success_rate(), 0.0);
    }
}
