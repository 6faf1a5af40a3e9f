pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

/// Shared fixtures for database-backed tests.
#[cfg(test)]
pub mod test_support {
    use chrono::{NaiveDateTime, Utc};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::SqlitePool;
    use uuid::Uuid;

    use super::models::*;
    use super::repository::ConnectionRepository;

    /// In-memory database with migrations applied.
    ///
    /// A single connection that never expires, otherwise each new connection
    /// would open its own empty in-memory database.
    pub async fn test_pool() -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    pub fn new_connection(user_id: &str, username: &str, password: &str) -> CreateConnection {
        CreateConnection {
            user_id: user_id.to_string(),
            provider: ProviderKind::IcloudCaldav,
            calendar_url: "https://caldav.example.com/123/calendars/work/".to_string(),
            calendar_name: Some("Work".to_string()),
            encrypted_username: username.to_string(),
            encrypted_password: password.to_string(),
            sync_interval: 300,
            bidirectional_sync: true,
            auto_export: true,
        }
    }

    /// Connection with placeholder credential blobs, for tests that never decrypt them.
    pub async fn create_connection(pool: &SqlitePool, user_id: &str) -> ExternalCalendarConnection {
        ConnectionRepository::create(pool, new_connection(user_id, "enc-user", "enc-pass"))
            .await
            .unwrap()
    }

    /// Insert an unlinked appointment for "Haircut" with client "Jane Doe".
    pub async fn insert_appointment(pool: &SqlitePool, user_id: &str, branch: Option<&str>) -> String {
        let start = NaiveDateTime::parse_from_str("2024-03-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        insert_appointment_at(pool, user_id, branch, start, start + chrono::Duration::hours(1)).await
    }

    pub async fn insert_appointment_at(
        pool: &SqlitePool,
        user_id: &str,
        branch: Option<&str>,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    ) -> String {
        let service_id = Uuid::new_v4().to_string();
        let client_id = Uuid::new_v4().to_string();
        let appointment_id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query("INSERT INTO services (id, name) VALUES (?, 'Haircut')")
            .bind(&service_id)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO clients (id, first_name, last_name) VALUES (?, 'Jane', 'Doe')")
            .bind(&client_id)
            .execute(pool)
            .await
            .unwrap();

        let branch_id = match branch {
            Some(name) => {
                let id = Uuid::new_v4().to_string();
                sqlx::query("INSERT INTO branches (id, name) VALUES (?, ?)")
                    .bind(&id)
                    .bind(name)
                    .execute(pool)
                    .await
                    .unwrap();
                Some(id)
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO appointments (
                id, user_id, service_id, client_id, branch_id,
                start_time, end_time, notes, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&appointment_id)
        .bind(user_id)
        .bind(&service_id)
        .bind(&client_id)
        .bind(&branch_id)
        .bind(start_time)
        .bind(end_time)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();

        appointment_id
    }

    /// Simulate an edit made through the appointment CRUD layer.
    pub async fn touch_locally(pool: &SqlitePool, appointment_id: &str, at: NaiveDateTime) {
        sqlx::query(
            "UPDATE appointments SET last_modified_source = 'LOCAL', updated_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(appointment_id)
        .execute(pool)
        .await
        .unwrap();
    }
}
