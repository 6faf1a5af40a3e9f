use std::collections::HashSet;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const PENDING_COLUMNS: &str = r#"
    id, connection_id, event_uid, summary, start_time, end_time,
    description, location, etag, event_url, created_at, updated_at
"#;

pub struct PendingMappingRepository;

impl PendingMappingRepository {
    /// Insert or refresh the pending row for a (connection, UID) pair.
    pub async fn upsert(
        pool: &SqlitePool,
        mapping: UpsertPendingMapping,
    ) -> AppResult<PendingEventMapping> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let sql = format!(
            r#"
            INSERT INTO pending_event_mappings (
                id, connection_id, event_uid, summary, start_time, end_time,
                description, location, etag, event_url, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, event_uid) DO UPDATE SET
                summary = excluded.summary,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                description = excluded.description,
                location = excluded.location,
                etag = excluded.etag,
                event_url = excluded.event_url,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            PENDING_COLUMNS
        );

        sqlx::query_as::<_, PendingEventMapping>(&sql)
            .bind(&id)
            .bind(&mapping.connection_id)
            .bind(&mapping.event_uid)
            .bind(&mapping.summary)
            .bind(mapping.start_time)
            .bind(mapping.end_time)
            .bind(&mapping.description)
            .bind(&mapping.location)
            .bind(&mapping.etag)
            .bind(&mapping.event_url)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<PendingEventMapping>> {
        let sql = format!(
            "SELECT {} FROM pending_event_mappings WHERE id = ?",
            PENDING_COLUMNS
        );
        sqlx::query_as::<_, PendingEventMapping>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_by_connection(
        pool: &SqlitePool,
        connection_id: &str,
    ) -> AppResult<Vec<PendingEventMapping>> {
        let sql = format!(
            r#"
            SELECT {} FROM pending_event_mappings
            WHERE connection_id = ?
            ORDER BY start_time
            "#,
            PENDING_COLUMNS
        );
        sqlx::query_as::<_, PendingEventMapping>(&sql)
            .bind(connection_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM pending_event_mappings WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Drop pending rows whose UID was not seen in the latest complete listing.
    pub async fn delete_missing(
        pool: &SqlitePool,
        connection_id: &str,
        seen_uids: &HashSet<String>,
    ) -> AppResult<u64> {
        let pending = Self::list_by_connection(pool, connection_id).await?;

        let mut removed = 0;
        for row in pending.iter().filter(|p| !seen_uids.contains(&p.event_uid)) {
            Self::delete(pool, &row.id).await?;
            removed += 1;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{create_connection, test_pool};
    use chrono::NaiveDate;

    fn pending(connection_id: &str, uid: &str, summary: &str) -> UpsertPendingMapping {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        UpsertPendingMapping {
            connection_id: connection_id.to_string(),
            event_uid: uid.to_string(),
            summary: summary.to_string(),
            start_time: start,
            end_time: start + chrono::Duration::hours(1),
            description: String::new(),
            location: String::new(),
            etag: Some("\"1\"".to_string()),
            event_url: format!("https://cal.example.com/{}.ics", uid),
        }
    }

    #[tokio::test]
    async fn upsert_refreshes_existing_row() {
        let pool = test_pool().await;
        let conn = create_connection(&pool, "u").await;

        let first = PendingMappingRepository::upsert(&pool, pending(&conn.id, "uid-1", "Lunch"))
            .await
            .unwrap();
        let second =
            PendingMappingRepository::upsert(&pool, pending(&conn.id, "uid-1", "Team lunch"))
                .await
                .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.summary, "Team lunch");

        let rows = PendingMappingRepository::list_by_connection(&pool, &conn.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn delete_missing_keeps_seen_uids() {
        let pool = test_pool().await;
        let conn = create_connection(&pool, "u").await;

        for uid in ["keep", "gone"] {
            PendingMappingRepository::upsert(&pool, pending(&conn.id, uid, uid))
                .await
                .unwrap();
        }

        let seen: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = PendingMappingRepository::delete_missing(&pool, &conn.id, &seen)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let rows = PendingMappingRepository::list_by_connection(&pool, &conn.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_uid, "keep");
    }
}
