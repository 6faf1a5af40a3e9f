use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::models::{
    CalendarSyncLog, CreateConnection, ExternalCalendarConnection, ProviderKind, SyncStatus,
    SyncType, UpdateConnectionSettings,
};
use crate::db::repository::{
    AppointmentRepository, ConnectionRepository, PendingMappingRepository, SyncLogRepository,
};
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::caldav::Credentials;
use crate::services::sync::{ExportResult, SyncOutcome};
use crate::AppState;

const SUMMARY_LOG_LIMIT: i64 = 5;
const DETAIL_LOG_LIMIT: i64 = 10;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connect", post(connect))
        .route("/connections", get(list_connections))
        .route(
            "/connections/:id",
            get(get_connection)
                .patch(update_connection)
                .delete(disconnect_connection),
        )
        .route("/connections/:id/credentials", put(update_credentials))
        .route("/connections/:id/sync", post(sync_connection))
        .route("/connections/:id/pending", get(list_pending))
        .route("/pending/:id/map", post(map_pending))
        .route("/appointments/:id/export", post(export_appointment))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub username: String,
    pub password: String,
    pub calendar_url: Option<String>,
    pub calendar_name: Option<String>,
    pub sync_interval: Option<i64>,
    pub bidirectional_sync: Option<bool>,
    pub auto_export: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct MapPendingRequest {
    pub appointment_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    pub connection_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    #[serde(flatten)]
    pub connection: ExternalCalendarConnection,
    pub recent_logs: Vec<CalendarSyncLog>,
}

// ============================================================================
// Helpers
// ============================================================================

fn credentials_from(username: &str, password: &str) -> AppResult<Credentials> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::BadRequest(
            "username and password are required".to_string(),
        ));
    }
    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

fn validate_interval(state: &AppState, interval: i64) -> AppResult<()> {
    let min = state.config.sync.min_interval_seconds;
    if interval < min {
        return Err(AppError::Validation(format!(
            "sync_interval must be at least {} seconds",
            min
        )));
    }
    Ok(())
}

async fn owned_connection(
    state: &AppState,
    connection_id: &str,
    user_id: &str,
) -> AppResult<ExternalCalendarConnection> {
    ConnectionRepository::find_for_user(&state.db, connection_id, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Connection not found".to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Validate remote credentials. Without `calendar_url` the available calendars are
/// returned so the user can pick one; with it the connection is stored.
async fn connect(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<ConnectRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let credentials = credentials_from(&request.username, &request.password)?;
    let session = state.provider.connect(&credentials).await?;

    let Some(calendar_url) = request.calendar_url.filter(|u| !u.trim().is_empty()) else {
        let calendars = session.list_calendars().await?;
        return Ok((StatusCode::OK, Json(json!({ "calendars": calendars }))));
    };

    let sync_interval = request
        .sync_interval
        .unwrap_or(state.config.sync.default_interval_seconds);
    validate_interval(&state, sync_interval)?;

    let connection = ConnectionRepository::create(
        &state.db,
        CreateConnection {
            user_id: user_id.clone(),
            provider: ProviderKind::IcloudCaldav,
            calendar_url: calendar_url.trim().to_string(),
            calendar_name: request.calendar_name,
            encrypted_username: state.cipher.encrypt(&credentials.username)?,
            encrypted_password: state.cipher.encrypt(&credentials.password)?,
            sync_interval,
            bidirectional_sync: request.bidirectional_sync.unwrap_or(true),
            auto_export: request.auto_export.unwrap_or(true),
        },
    )
    .await?;

    tracing::info!(
        "User {} connected calendar {} as {}",
        user_id,
        connection.calendar_url,
        connection.id
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "connection_id": connection.id,
            "message": "Calendar connected"
        })),
    ))
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<Vec<ConnectionSummary>>> {
    let connections = ConnectionRepository::list_by_user(&state.db, &user_id).await?;

    let mut summaries = Vec::with_capacity(connections.len());
    for connection in connections {
        let recent_logs =
            SyncLogRepository::recent_for_connection(&state.db, &connection.id, SUMMARY_LOG_LIMIT)
                .await?;
        summaries.push(ConnectionSummary {
            connection,
            recent_logs,
        });
    }

    Ok(Json(summaries))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let connection = owned_connection(&state, &id, &user_id).await?;
    let stats = SyncLogRepository::statistics(&state.db, &connection.id).await?;
    let recent_logs =
        SyncLogRepository::recent_for_connection(&state.db, &connection.id, DETAIL_LOG_LIMIT)
            .await?;

    Ok(Json(json!({
        "connection": connection,
        "statistics": {
            "total_syncs": stats.total_syncs,
            "successful_syncs": stats.successful_syncs,
            "failed_syncs": stats.failed_syncs,
            "success_rate": stats.success_rate(),
        },
        "recent_logs": recent_logs,
    })))
}

async fn update_connection(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Json(settings): Json<UpdateConnectionSettings>,
) -> AppResult<Json<ExternalCalendarConnection>> {
    let connection = owned_connection(&state, &id, &user_id).await?;
    if let Some(interval) = settings.sync_interval {
        validate_interval(&state, interval)?;
    }

    ConnectionRepository::update_settings(&state.db, &connection.id, &settings).await?;

    let updated = owned_connection(&state, &id, &user_id).await?;
    Ok(Json(updated))
}

/// Replace stored credentials after re-validating them against the server.
async fn update_credentials(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<CredentialsRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let connection = owned_connection(&state, &id, &user_id).await?;
    let credentials = credentials_from(&request.username, &request.password)?;
    state.provider.connect(&credentials).await?;

    ConnectionRepository::reauthorize(
        &state.db,
        &connection.id,
        &state.cipher.encrypt(&credentials.username)?,
        &state.cipher.encrypt(&credentials.password)?,
    )
    .await?;

    tracing::info!("Connection {} re-authorized", connection.id);
    Ok(Json(json!({ "message": "Credentials updated" })))
}

async fn disconnect_connection(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let connection = owned_connection(&state, &id, &user_id).await?;
    ConnectionRepository::disconnect(&state.db, &connection.id).await?;

    tracing::info!("Connection {} disconnected by user {}", connection.id, user_id);
    Ok(Json(json!({ "message": "Calendar disconnected" })))
}

async fn sync_connection(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let connection = owned_connection(&state, &id, &user_id).await?;

    match state.sync.run_sync(&connection.id, SyncType::Manual).await? {
        SyncOutcome::Skipped => Err(AppError::SyncInProgress(connection.id)),
        SyncOutcome::Completed(report) => Ok(Json(json!({
            "success": report.status != SyncStatus::Failed,
            "result": report,
        }))),
    }
}

async fn list_pending(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let connection = owned_connection(&state, &id, &user_id).await?;
    let pending = PendingMappingRepository::list_by_connection(&state.db, &connection.id).await?;

    Ok(Json(json!({ "pending": pending })))
}

async fn map_pending(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<MapPendingRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let appointment = state
        .sync
        .map_pending_event(&user_id, &id, &request.appointment_id)
        .await?;

    Ok(Json(json!({ "appointment": appointment })))
}

async fn export_appointment(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    request: Option<Json<ExportRequest>>,
) -> AppResult<Json<serde_json::Value>> {
    let appointment = AppointmentRepository::find_by_id(&state.db, &id)
        .await?
        .filter(|a| a.user_id == user_id)
        .ok_or_else(|| AppError::NotFound("Appointment not found".to_string()))?;

    let request = request.map(|Json(r)| r).unwrap_or_default();

    let results = match request.connection_id {
        Some(connection_id) => {
            let connection = owned_connection(&state, &connection_id, &user_id).await?;
            let success = state
                .sync
                .export_appointment(&appointment.id, &connection.id)
                .await?;
            vec![ExportResult {
                connection_id: connection.id,
                success,
            }]
        }
        None => state.sync.auto_export(&appointment.id).await?,
    };

    Ok(Json(json!({
        "success": results.iter().all(|r| r.success),
        "results": results,
    })))
}
