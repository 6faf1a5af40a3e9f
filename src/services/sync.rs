//! Sync orchestrator: one import (and optional export) pass per connection run.
//!
//! Every run writes exactly one `calendar_sync_logs` row. Runs for the same
//! connection never interleave: scheduled and manual runs are skipped while
//! another run holds the connection lock, exports wait for it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{
    Appointment, ConnectionStatus, CreateSyncLog, ExportLink, ExternalCalendarConnection,
    RemoteAppointmentUpdate, SyncCounts, SyncDirection, SyncStatus, SyncType,
    UpsertPendingMapping,
};
use crate::db::repository::{
    AppointmentRepository, ConnectionRepository, PendingMappingRepository, SyncLogRepository,
};
use crate::error::{AppError, AppResult, SyncError};
use crate::services::caldav::{CalendarProvider, CalendarSession, Credentials, RemoteObject};
use crate::services::crypto::CredentialCipher;
use crate::services::ical;

const DISCONNECTED_MESSAGE: &str = "connection is disconnected";
const CANCELLED_MESSAGE: &str = "run cancelled";

/// Result of a run that actually happened.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub log_id: String,
    pub sync_type: SyncType,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub counts: SyncCounts,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run held the connection lock; nothing was done or logged.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub connection_id: String,
    pub success: bool,
}

/// Mutable state accumulated while a run is in flight.
#[derive(Debug, Default)]
struct RunState {
    counts: SyncCounts,
    errors: Vec<String>,
    succeeded: usize,
    cancelled: bool,
    /// Set when a local change could not be pushed, so it stays "newer than
    /// last sync" and is retried next run.
    export_watermark: Option<NaiveDateTime>,
}

impl RunState {
    fn status(&self) -> SyncStatus {
        if self.errors.is_empty() {
            SyncStatus::Success
        } else if self.succeeded > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }
}

pub struct SyncOrchestrator {
    db: SqlitePool,
    cipher: Arc<CredentialCipher>,
    provider: Arc<dyn CalendarProvider>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncOrchestrator {
    pub fn new(
        db: SqlitePool,
        cipher: Arc<CredentialCipher>,
        provider: Arc<dyn CalendarProvider>,
    ) -> Self {
        Self {
            db,
            cipher,
            provider,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lock_for(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries only the map references are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn run_initial_sync(&self, connection_id: &str) -> AppResult<SyncOutcome> {
        self.run_sync(connection_id, SyncType::Initial).await
    }

    /// Run every connection that is due, concurrently. Returns how many runs completed.
    pub async fn run_due_connections(&self) -> AppResult<usize> {
        let due = ConnectionRepository::list_due(&self.db, Utc::now().naive_utc()).await?;
        if due.is_empty() {
            return Ok(0);
        }

        tracing::info!("{} calendar connection(s) due for sync", due.len());

        let runs = due.iter().map(|connection| async move {
            if connection.last_sync_at.is_none() {
                self.run_initial_sync(&connection.id).await
            } else {
                self.run_sync(&connection.id, SyncType::Incremental).await
            }
        });

        let mut completed = 0;
        for (connection, result) in due.iter().zip(futures::future::join_all(runs).await) {
            match result {
                Ok(SyncOutcome::Completed(_)) => completed += 1,
                Ok(SyncOutcome::Skipped) => {}
                Err(e) => tracing::warn!("Scheduled sync for {} failed: {:?}", connection.id, e),
            }
        }
        Ok(completed)
    }

    /// Synchronize one connection. Skips (without logging) if a run is in progress.
    pub async fn run_sync(&self, connection_id: &str, sync_type: SyncType) -> AppResult<SyncOutcome> {
        let lock = self.lock_for(connection_id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(
                    "Sync for connection {} already in progress, skipping",
                    connection_id
                );
                return Ok(SyncOutcome::Skipped);
            }
        };

        let connection = ConnectionRepository::find_by_id(&self.db, connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", connection_id)))?;

        let started_at = Utc::now().naive_utc();
        let direction = if connection.bidirectional_sync {
            SyncDirection::Bidirectional
        } else {
            SyncDirection::Import
        };

        let mut run = RunState::default();

        if connection.is_disconnected() {
            run.errors.push(DISCONNECTED_MESSAGE.to_string());
            let report = self
                .finish_log(&connection.id, sync_type, direction, &run, started_at)
                .await?;
            return Ok(SyncOutcome::Completed(report));
        }

        tracing::info!(
            "Starting {} sync for connection {}",
            sync_type.as_str(),
            connection.id
        );

        match self.execute_run(&connection, &mut run).await {
            Ok(()) => {
                if run.cancelled {
                    run.errors.push(CANCELLED_MESSAGE.to_string());
                }
                let summary = error_summary(&run.errors);
                if run.status() == SyncStatus::Failed {
                    ConnectionRepository::record_sync_failure(
                        &self.db,
                        &connection.id,
                        summary.as_deref().unwrap_or(CANCELLED_MESSAGE),
                        None,
                    )
                    .await?;
                } else {
                    let synced_at = run
                        .export_watermark
                        .map_or(started_at, |w| w.min(started_at));
                    ConnectionRepository::record_sync_completed(
                        &self.db,
                        &connection.id,
                        synced_at,
                        summary.as_deref(),
                    )
                    .await?;
                }
            }
            Err(AppError::Sync(e)) => {
                tracing::warn!("Sync for connection {} aborted: {}", connection.id, e);
                run.errors.push(e.to_string());
                run.succeeded = 0;
                self.record_run_failure(&connection.id, &e).await?;
            }
            Err(other) => {
                run.errors.push(other.to_string());
                if let Err(log_err) = self
                    .finish_log(&connection.id, sync_type, direction, &run, started_at)
                    .await
                {
                    tracing::error!("Failed to write sync log: {:?}", log_err);
                }
                return Err(other);
            }
        }

        let report = self
            .finish_log(&connection.id, sync_type, direction, &run, started_at)
            .await?;

        tracing::info!(
            "Sync for connection {} finished with {}: imported={} exported={} updated={} conflicts={}",
            connection.id,
            report.status.as_str(),
            report.counts.events_imported,
            report.counts.events_exported,
            report.counts.events_updated,
            report.counts.conflicts_resolved
        );

        Ok(SyncOutcome::Completed(report))
    }

    /// Fetch, reconcile and (for bidirectional connections) push local changes.
    ///
    /// Run-level failures are returned; per-object failures land in `run.errors`.
    async fn execute_run(
        &self,
        connection: &ExternalCalendarConnection,
        run: &mut RunState,
    ) -> AppResult<()> {
        let session = self.open_session(connection).await?;
        let objects = session.list_events(&connection.calendar_url).await?;

        tracing::debug!(
            "Fetched {} remote object(s) for connection {}",
            objects.len(),
            connection.id
        );

        let mut seen_uids = HashSet::new();
        for object in &objects {
            if self.is_cancelled(&connection.id).await? {
                run.cancelled = true;
                return Ok(());
            }

            match self.import_object(connection, object, &mut seen_uids, run).await {
                Ok(()) => run.succeeded += 1,
                Err(AppError::Sync(e)) => {
                    tracing::warn!("Skipping remote object {}: {}", object.url, e);
                    run.errors.push(format!("{}: {}", object.url, e));
                }
                Err(other) => return Err(other),
            }
        }

        // A parse failure hides that object's UID, so only prune after a clean pass.
        if run.errors.is_empty() {
            let removed =
                PendingMappingRepository::delete_missing(&self.db, &connection.id, &seen_uids)
                    .await?;
            if removed > 0 {
                tracing::debug!("Removed {} stale pending mapping(s)", removed);
            }
        }

        if !connection.bidirectional_sync {
            return Ok(());
        }

        if self.is_cancelled(&connection.id).await? {
            run.cancelled = true;
            return Ok(());
        }

        let local_changes = AppointmentRepository::list_local_changes(
            &self.db,
            &connection.id,
            connection.last_sync_at,
        )
        .await?;

        for appointment in local_changes {
            if self.is_cancelled(&connection.id).await? {
                run.cancelled = true;
                return Ok(());
            }

            match self
                .push_appointment(session.as_ref(), connection, &appointment.id)
                .await
            {
                Ok(conflict) => {
                    run.succeeded += 1;
                    run.counts.events_exported += 1;
                    if conflict {
                        run.counts.conflicts_resolved += 1;
                    }
                }
                Err(AppError::Database(e)) => return Err(AppError::Database(e)),
                Err(e) => {
                    tracing::warn!("Failed to export appointment {}: {}", appointment.id, e);
                    run.errors.push(format!("appointment {}: {}", appointment.id, e));
                    let mark = appointment.updated_at - chrono::Duration::microseconds(1);
                    run.export_watermark = Some(run.export_watermark.map_or(mark, |w| w.min(mark)));
                }
            }
        }

        Ok(())
    }

    async fn import_object(
        &self,
        connection: &ExternalCalendarConnection,
        object: &RemoteObject,
        seen_uids: &mut HashSet<String>,
        run: &mut RunState,
    ) -> AppResult<()> {
        let event = ical::from_remote_event(&object.data)?;
        seen_uids.insert(event.uid.clone());

        if event.invalid_range {
            return Err(SyncError::Protocol(format!(
                "event {} ends before it starts",
                event.uid
            ))
            .into());
        }

        let appointment =
            AppointmentRepository::find_by_external_uid(&self.db, &connection.id, &event.uid)
                .await?;

        let Some(appointment) = appointment else {
            PendingMappingRepository::upsert(
                &self.db,
                UpsertPendingMapping {
                    connection_id: connection.id.clone(),
                    event_uid: event.uid.clone(),
                    summary: event.summary.clone(),
                    start_time: event.start,
                    end_time: event.end,
                    description: event.description.clone(),
                    location: event.location.clone(),
                    etag: object.etag.clone(),
                    event_url: object.url.clone(),
                },
            )
            .await?;
            tracing::debug!(
                "Remote event {} has no appointment, queued for manual mapping",
                event.uid
            );
            return Ok(());
        };

        let update = RemoteAppointmentUpdate {
            start_time: event.start,
            end_time: event.end,
            notes: event.description.clone(),
            etag: object.etag.clone(),
        };
        let local_newer = appointment.has_local_changes_since(connection.last_sync_at);

        if appointment.external_etag == object.etag {
            if local_newer {
                tracing::debug!(
                    "Appointment {} has a pending local edit, remote unchanged",
                    appointment.id
                );
                return Ok(());
            }
            if differs_from(&appointment, &update) {
                AppointmentRepository::apply_remote_update(&self.db, &appointment.id, &update)
                    .await?;
                run.counts.events_updated += 1;
            }
            return Ok(());
        }

        if local_newer {
            tracing::warn!(
                appointment_id = %appointment.id,
                event_uid = %event.uid,
                local_start = %appointment.start_time,
                local_end = %appointment.end_time,
                local_notes = appointment.notes.as_deref().unwrap_or(""),
                remote_start = %update.start_time,
                remote_end = %update.end_time,
                remote_notes = %update.notes,
                "Conflicting edits on both sides, remote wins"
            );
            run.counts.conflicts_resolved += 1;
        }

        AppointmentRepository::apply_remote_update(&self.db, &appointment.id, &update).await?;
        run.counts.events_updated += 1;
        Ok(())
    }

    /// Export one appointment to one connection. Always writes one log row.
    pub async fn export_appointment(
        &self,
        appointment_id: &str,
        connection_id: &str,
    ) -> AppResult<bool> {
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        let connection = ConnectionRepository::find_by_id(&self.db, connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {} not found", connection_id)))?;

        let started_at = Utc::now().naive_utc();
        let mut run = RunState::default();

        let result = if connection.is_disconnected() {
            Err(AppError::BadRequest(DISCONNECTED_MESSAGE.to_string()))
        } else {
            match self.open_session(&connection).await {
                Ok(session) => {
                    self.push_appointment(session.as_ref(), &connection, appointment_id)
                        .await
                }
                Err(e) => Err(e),
            }
        };

        let outcome = match result {
            Ok(conflict) => {
                run.succeeded = 1;
                run.counts.events_exported = 1;
                if conflict {
                    run.counts.conflicts_resolved = 1;
                }
                Ok(true)
            }
            Err(AppError::Sync(e)) => {
                tracing::warn!(
                    "Export of appointment {} to {} failed: {}",
                    appointment_id,
                    connection.id,
                    e
                );
                run.errors.push(e.to_string());
                self.record_run_failure(&connection.id, &e).await?;
                Ok(false)
            }
            Err(AppError::Database(e)) => {
                run.errors.push("database error".to_string());
                Err(AppError::Database(e))
            }
            Err(other) => {
                tracing::warn!(
                    "Export of appointment {} to {} failed: {}",
                    appointment_id,
                    connection.id,
                    other
                );
                run.errors.push(other.to_string());
                Ok(false)
            }
        };

        self.finish_log(
            &connection.id,
            SyncType::Manual,
            SyncDirection::Export,
            &run,
            started_at,
        )
        .await?;

        outcome
    }

    /// Export to every active auto-export connection of the appointment's owner.
    pub async fn auto_export(&self, appointment_id: &str) -> AppResult<Vec<ExportResult>> {
        let appointment = AppointmentRepository::find_by_id(&self.db, appointment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Appointment {} not found", appointment_id)))?;

        let connections =
            ConnectionRepository::list_auto_export_for_user(&self.db, &appointment.user_id)
                .await?;

        let mut results = Vec::with_capacity(connections.len());
        for connection in connections {
            let success = self.export_appointment(appointment_id, &connection.id).await?;
            results.push(ExportResult {
                connection_id: connection.id,
                success,
            });
        }
        Ok(results)
    }

    /// Link a pending remote event to an existing appointment of the same user.
    pub async fn map_pending_event(
        &self,
        user_id: &str,
        pending_id: &str,
        appointment_id: &str,
    ) -> AppResult<Appointment> {
        let pending = PendingMappingRepository::find_by_id(&self.db, pending_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Pending event not found".to_string()))?;

        let connection =
            ConnectionRepository::find_for_user(&self.db, &pending.connection_id, user_id)
                .await?
                .ok_or_else(|| AppError::NotFound("Pending event not found".to_string()))?;

        let appointment = AppointmentRepository::find_by_id(&self.db, appointment_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Appointment not found".to_string()))?;

        if let Some(uid) = appointment.external_event_uid.as_deref() {
            let same_event = appointment.external_connection_id.as_deref()
                == Some(connection.id.as_str())
                && uid == pending.event_uid;
            if !same_event {
                return Err(AppError::Conflict(
                    "Appointment is already linked to a different remote event".to_string(),
                ));
            }
        }

        let lock = self.lock_for(&connection.id);
        let _guard = lock.lock().await;

        let started_at = Utc::now().naive_utc();
        AppointmentRepository::link_to_remote_event(&self.db, &appointment.id, &pending).await?;
        PendingMappingRepository::delete(&self.db, &pending.id).await?;

        let run = RunState {
            counts: SyncCounts {
                events_imported: 1,
                ..Default::default()
            },
            succeeded: 1,
            ..Default::default()
        };
        self.finish_log(
            &connection.id,
            SyncType::Manual,
            SyncDirection::Import,
            &run,
            started_at,
        )
        .await?;

        tracing::info!(
            "Mapped remote event {} onto appointment {}",
            pending.event_uid,
            appointment.id
        );

        AppointmentRepository::find_by_id(&self.db, &appointment.id)
            .await?
            .ok_or_else(|| AppError::NotFound("Appointment not found".to_string()))
    }

    /// Push one appointment through an open session. Returns whether a
    /// conflicting remote edit was overwritten.
    async fn push_appointment(
        &self,
        session: &dyn CalendarSession,
        connection: &ExternalCalendarConnection,
        appointment_id: &str,
    ) -> AppResult<bool> {
        let view = AppointmentRepository::find_export_view(&self.db, appointment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Appointment {} not found", appointment_id)))?;

        let linked_here = view.external_connection_id.as_deref() == Some(connection.id.as_str());

        let mut conflict = false;
        if linked_here {
            if let (Some(url), Some(stored)) = (&view.external_event_url, &view.external_etag) {
                if let Some(remote) = session.event_etag(url).await? {
                    if &remote != stored {
                        tracing::warn!(
                            appointment_id = %view.id,
                            stored_etag = %stored,
                            remote_etag = %remote,
                            local_start = %view.start_time,
                            local_end = %view.end_time,
                            "Remote event changed since last sync, local wins"
                        );
                        conflict = true;
                    }
                }
            }
        }

        // Mapped appointments keep the remote event's UID and resource.
        let (event_uid, stored) = match (linked_here, &view.external_event_uid, &view.external_event_url) {
            (true, Some(uid), Some(url)) => {
                let ics = ical::to_remote_event(&view, uid);
                (uid.clone(), session.replace_event(url, &ics).await?)
            }
            _ => {
                let ics = ical::to_remote_event(&view, &view.id);
                let filename = ical::event_filename(&view.id);
                let stored = session
                    .put_event(&connection.calendar_url, &filename, &ics)
                    .await?;
                (view.id.clone(), stored)
            }
        };

        AppointmentRepository::apply_export_link(
            &self.db,
            &view.id,
            &ExportLink {
                connection_id: connection.id.clone(),
                event_uid,
                event_url: stored.url,
                etag: stored.etag,
            },
        )
        .await?;

        Ok(conflict)
    }

    async fn open_session(
        &self,
        connection: &ExternalCalendarConnection,
    ) -> AppResult<Box<dyn CalendarSession>> {
        let credentials = Credentials {
            username: self.cipher.decrypt(&connection.encrypted_username)?,
            password: self.cipher.decrypt(&connection.encrypted_password)?,
        };
        Ok(self.provider.connect(&credentials).await?)
    }

    async fn is_cancelled(&self, connection_id: &str) -> AppResult<bool> {
        let status = ConnectionRepository::current_status(&self.db, connection_id).await?;
        Ok(matches!(status, None | Some(ConnectionStatus::Disconnected)))
    }

    async fn record_run_failure(&self, connection_id: &str, error: &SyncError) -> AppResult<()> {
        let status = error
            .requires_reauthorization()
            .then_some(ConnectionStatus::Error);
        ConnectionRepository::record_sync_failure(&self.db, connection_id, &error.to_string(), status)
            .await
    }

    async fn finish_log(
        &self,
        connection_id: &str,
        sync_type: SyncType,
        direction: SyncDirection,
        run: &RunState,
        started_at: NaiveDateTime,
    ) -> AppResult<SyncReport> {
        let status = run.status();
        let log = SyncLogRepository::create(
            &self.db,
            CreateSyncLog {
                connection_id: connection_id.to_string(),
                sync_type,
                direction,
                status,
                counts: run.counts,
                error_message: error_summary(&run.errors),
                started_at,
            },
        )
        .await?;

        Ok(SyncReport {
            log_id: log.id,
            sync_type,
            direction,
            status,
            counts: run.counts,
            errors: run.errors.clone(),
        })
    }
}

fn error_summary(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

fn differs_from(appointment: &Appointment, update: &RemoteAppointmentUpdate) -> bool {
    appointment.start_time != update.start_time
        || appointment.end_time != update.end_time
        || appointment.notes.as_deref().unwrap_or("") != update.notes
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::db::test_support::{insert_appointment, new_connection, test_pool, touch_locally};
    use crate::error::SyncResult;
    use crate::services::caldav::{RemoteCalendar, StoredEvent};
    use crate::services::crypto::test_cipher;

    const CALENDAR_URL: &str = "https://caldav.example.com/123/calendars/work/";

    /// In-memory remote calendar shared between the fake provider and the test.
    #[derive(Default)]
    struct FakeCalendar {
        objects: Mutex<Vec<RemoteObject>>,
        etags: Mutex<HashMap<String, String>>,
        puts: Mutex<Vec<String>>,
        reject_credentials: AtomicBool,
        list_error: Mutex<Option<SyncError>>,
        disconnect_on_list: Mutex<Option<(SqlitePool, String)>>,
        connects: AtomicUsize,
        etag_counter: AtomicUsize,
    }

    impl FakeCalendar {
        fn add_event(&self, uid: &str, etag: &str, body: &str) {
            self.objects.lock().unwrap().push(RemoteObject {
                url: format!("{}{}.ics", CALENDAR_URL, uid),
                etag: Some(etag.to_string()),
                data: vcalendar(&format!("UID:{}\r\n{}", uid, body)),
            });
        }

        fn add_raw(&self, url: &str, data: &str) {
            self.objects.lock().unwrap().push(RemoteObject {
                url: url.to_string(),
                etag: Some("\"raw\"".to_string()),
                data: data.to_string(),
            });
        }
    }

    struct FakeProvider(Arc<FakeCalendar>);

    struct FakeSession(Arc<FakeCalendar>);

    #[async_trait]
    impl CalendarProvider for FakeProvider {
        async fn connect(&self, credentials: &Credentials) -> SyncResult<Box<dyn CalendarSession>> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            assert_eq!(credentials.username, "jane@example.com");
            if self.0.reject_credentials.load(Ordering::SeqCst) {
                return Err(SyncError::Authentication("401 Unauthorized".to_string()));
            }
            Ok(Box::new(FakeSession(self.0.clone())))
        }
    }

    #[async_trait]
    impl CalendarSession for FakeSession {
        async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>> {
            Ok(vec![])
        }

        async fn list_events(&self, _calendar_url: &str) -> SyncResult<Vec<RemoteObject>> {
            let disconnect = self.0.disconnect_on_list.lock().unwrap().take();
            if let Some((pool, connection_id)) = disconnect {
                ConnectionRepository::disconnect(&pool, &connection_id).await.unwrap();
            }
            if let Some(err) = self.0.list_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self.0.objects.lock().unwrap().clone())
        }

        async fn put_event(
            &self,
            calendar_url: &str,
            filename: &str,
            ics: &str,
        ) -> SyncResult<StoredEvent> {
            let url = format!("{}{}", calendar_url, filename);
            let n = self.0.etag_counter.fetch_add(1, Ordering::SeqCst);
            let etag = format!("\"e{}\"", n);
            self.0.etags.lock().unwrap().insert(url.clone(), etag.clone());
            self.0.puts.lock().unwrap().push(ics.to_string());
            Ok(StoredEvent {
                url,
                etag: Some(etag),
            })
        }

        async fn replace_event(&self, event_url: &str, ics: &str) -> SyncResult<StoredEvent> {
            let n = self.0.etag_counter.fetch_add(1, Ordering::SeqCst);
            let etag = format!("\"e{}\"", n);
            self.0.etags.lock().unwrap().insert(event_url.to_string(), etag.clone());
            self.0.puts.lock().unwrap().push(ics.to_string());
            for object in self.0.objects.lock().unwrap().iter_mut() {
                if object.url == event_url {
                    object.etag = Some(etag.clone());
                    object.data = ics.to_string();
                }
            }
            Ok(StoredEvent {
                url: event_url.to_string(),
                etag: Some(etag),
            })
        }

        async fn event_etag(&self, event_url: &str) -> SyncResult<Option<String>> {
            Ok(self.0.etags.lock().unwrap().get(event_url).cloned())
        }
    }

    fn vcalendar(vevent_body: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//EN\r\nBEGIN:VEVENT\r\n{}END:VEVENT\r\nEND:VCALENDAR\r\n",
            vevent_body
        )
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    struct Harness {
        pool: SqlitePool,
        remote: Arc<FakeCalendar>,
        sync: SyncOrchestrator,
        connection: ExternalCalendarConnection,
    }

    async fn harness(bidirectional: bool) -> Harness {
        let pool = test_pool().await;
        let cipher = test_cipher();

        let mut create = new_connection(
            "user-1",
            &cipher.encrypt("jane@example.com").unwrap(),
            &cipher.encrypt("app-password").unwrap(),
        );
        create.bidirectional_sync = bidirectional;
        let connection = ConnectionRepository::create(&pool, create).await.unwrap();

        let remote = Arc::new(FakeCalendar::default());
        let sync = SyncOrchestrator::new(
            pool.clone(),
            cipher,
            Arc::new(FakeProvider(remote.clone())),
        );

        Harness {
            pool,
            remote,
            sync,
            connection,
        }
    }

    impl Harness {
        async fn run(&self, sync_type: SyncType) -> SyncReport {
            match self.sync.run_sync(&self.connection.id, sync_type).await.unwrap() {
                SyncOutcome::Completed(report) => report,
                SyncOutcome::Skipped => panic!("run was unexpectedly skipped"),
            }
        }

        async fn connection(&self) -> ExternalCalendarConnection {
            ConnectionRepository::find_by_id(&self.pool, &self.connection.id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn appointment(&self, id: &str) -> Appointment {
            AppointmentRepository::find_by_id(&self.pool, id).await.unwrap().unwrap()
        }

        async fn logs(&self) -> Vec<crate::db::models::CalendarSyncLog> {
            SyncLogRepository::recent_for_connection(&self.pool, &self.connection.id, 50)
                .await
                .unwrap()
        }

        /// Link an appointment to remote UID `uid` with ETag `etag` and mark the
        /// connection as synced after the appointment's last edit.
        async fn link(&self, appointment_id: &str, uid: &str, etag: &str) {
            AppointmentRepository::apply_export_link(
                &self.pool,
                appointment_id,
                &ExportLink {
                    connection_id: self.connection.id.clone(),
                    event_uid: uid.to_string(),
                    event_url: format!("{}{}.ics", CALENDAR_URL, uid),
                    etag: Some(etag.to_string()),
                },
            )
            .await
            .unwrap();
            ConnectionRepository::record_sync_completed(
                &self.pool,
                &self.connection.id,
                Utc::now().naive_utc() + Duration::seconds(1),
                None,
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn unmatched_remote_event_is_queued_for_mapping() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "SUMMARY:Lunch\r\nDTSTART:20240301T120000Z\r\nDTEND:20240301T130000Z\r\n",
        );

        let report = h.run(SyncType::Initial).await;

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.direction, SyncDirection::Import);
        assert_eq!(report.counts.events_updated, 0);
        assert_eq!(report.counts.events_imported, 0);

        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_uid, "abc");
        assert_eq!(pending[0].summary, "Lunch");

        let logs = h.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].sync_type, SyncType::Initial);
        assert_eq!(logs[0].status, SyncStatus::Success);

        let connection = h.connection().await;
        assert!(connection.last_sync_at.is_some());
        assert_eq!(connection.sync_status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn changed_remote_event_updates_linked_appointment() {
        let h = harness(false).await;
        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.link(&x, "abc", "\"v1\"").await;
        h.remote.add_event(
            "abc",
            "\"v2\"",
            "DTSTART:20240301T100000Z\r\nDTEND:20240301T113000Z\r\nDESCRIPTION:Moved\r\n",
        );

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.counts.events_updated, 1);
        assert_eq!(report.counts.conflicts_resolved, 0);

        let appt = h.appointment(&x).await;
        assert_eq!(appt.end_time, at("2024-03-01 11:30:00"));
        assert_eq!(appt.notes.as_deref(), Some("Moved"));
        assert_eq!(appt.external_etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            appt.last_modified_source,
            crate::db::models::ModificationSource::External
        );
    }

    #[tokio::test]
    async fn unchanged_etag_with_same_values_is_not_counted() {
        let h = harness(false).await;
        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.link(&x, "abc", "\"v1\"").await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "DTSTART:20240301T100000Z\r\nDTEND:20240301T110000Z\r\n",
        );

        let report = h.run(SyncType::Incremental).await;
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.counts.events_updated, 0);
    }

    #[tokio::test]
    async fn concurrent_edits_resolve_to_remote_on_import() {
        let h = harness(false).await;
        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.link(&x, "abc", "\"v1\"").await;
        touch_locally(&h.pool, &x, Utc::now().naive_utc() + Duration::seconds(30)).await;
        h.remote.add_event(
            "abc",
            "\"v2\"",
            "DTSTART:20240301T140000Z\r\nDTEND:20240301T150000Z\r\n",
        );

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.counts.conflicts_resolved, 1);
        assert_eq!(report.counts.events_updated, 1);
        let appt = h.appointment(&x).await;
        assert_eq!(appt.start_time, at("2024-03-01 14:00:00"));
        assert_eq!(appt.external_etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn bidirectional_run_pushes_local_edits() {
        let h = harness(true).await;
        let x = insert_appointment(&h.pool, "user-1", Some("Downtown")).await;
        h.link(&x, &x, "\"v1\"").await;
        h.remote
            .etags
            .lock()
            .unwrap()
            .insert(format!("{}{}.ics", CALENDAR_URL, x), "\"v1\"".to_string());
        touch_locally(&h.pool, &x, Utc::now().naive_utc() + Duration::seconds(30)).await;
        h.remote.add_event(
            &x,
            "\"v1\"",
            "DTSTART:20240301T100000Z\r\nDTEND:20240301T110000Z\r\n",
        );

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.direction, SyncDirection::Bidirectional);
        assert_eq!(report.counts.events_updated, 0);
        assert_eq!(report.counts.events_exported, 1);
        assert_eq!(report.counts.conflicts_resolved, 0);

        let puts = h.remote.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].contains("Haircut - Jane Doe"));
    }

    #[tokio::test]
    async fn export_is_idempotent() {
        let h = harness(true).await;
        let y = insert_appointment(&h.pool, "user-1", None).await;

        assert!(h.sync.export_appointment(&y, &h.connection.id).await.unwrap());
        let first = h.appointment(&y).await;
        assert_eq!(first.external_connection_id.as_deref(), Some(h.connection.id.as_str()));
        assert_eq!(first.external_event_uid.as_deref(), Some(y.as_str()));
        assert!(first.sync_enabled);

        assert!(h.sync.export_appointment(&y, &h.connection.id).await.unwrap());
        let second = h.appointment(&y).await;
        assert_eq!(second.external_event_url, first.external_event_url);
        assert_eq!(second.external_event_uid, first.external_event_uid);
        assert_ne!(second.external_etag, first.external_etag);

        let logs = h.logs().await;
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.direction == SyncDirection::Export
            && l.sync_type == SyncType::Manual
            && l.status == SyncStatus::Success
            && l.events_exported == 1
            && l.conflicts_resolved == 0));
    }

    #[tokio::test]
    async fn export_overwrites_remote_edit_and_counts_conflict() {
        let h = harness(true).await;
        let y = insert_appointment(&h.pool, "user-1", None).await;
        assert!(h.sync.export_appointment(&y, &h.connection.id).await.unwrap());

        let url = h.appointment(&y).await.external_event_url.unwrap();
        h.remote
            .etags
            .lock()
            .unwrap()
            .insert(url, "\"edited-remotely\"".to_string());

        assert!(h.sync.export_appointment(&y, &h.connection.id).await.unwrap());
        let logs = h.logs().await;
        assert_eq!(logs[0].conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_run_and_flag_the_connection() {
        let h = harness(true).await;
        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.link(&x, "abc", "\"v1\"").await;
        let before = h.appointment(&x).await;
        h.remote.reject_credentials.store(true, Ordering::SeqCst);

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.counts, SyncCounts::default());

        let connection = h.connection().await;
        assert_eq!(connection.sync_status, ConnectionStatus::Error);
        assert!(connection.last_sync_error.is_some());

        let after = h.appointment(&x).await;
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.external_etag, before.external_etag);

        let logs = h.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Failed);

        // Errored connections are no longer scheduled.
        assert_eq!(h.sync.run_due_connections().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_keeps_connection_active() {
        let h = harness(false).await;
        *h.remote.list_error.lock().unwrap() =
            Some(SyncError::Transient("request timed out".to_string()));

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Failed);
        let connection = h.connection().await;
        assert_eq!(connection.sync_status, ConnectionStatus::Active);
        assert!(connection.last_sync_at.is_none());
        assert!(connection
            .last_sync_error
            .unwrap()
            .contains("request timed out"));
    }

    #[tokio::test]
    async fn bad_objects_make_the_run_partial() {
        let h = harness(false).await;
        h.remote.add_event(
            "good",
            "\"1\"",
            "DTSTART:20240301T100000Z\r\nDTEND:20240301T110000Z\r\n",
        );
        h.remote.add_event(
            "backwards",
            "\"1\"",
            "DTSTART:20240301T110000Z\r\nDTEND:20240301T100000Z\r\n",
        );
        h.remote.add_raw(
            &format!("{}no-uid.ics", CALENDAR_URL),
            &vcalendar("DTSTART:20240301T100000Z\r\n"),
        );

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Partial);
        assert_eq!(report.errors.len(), 2);
        let logs = h.logs().await;
        let message = logs[0].error_message.clone().unwrap();
        assert!(message.contains("; "));
        assert!(message.contains("backwards"));

        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_uid, "good");
    }

    #[tokio::test]
    async fn out_of_range_duration_is_a_per_object_error() {
        let h = harness(false).await;
        h.remote.add_event(
            "big",
            "\"1\"",
            "DTSTART:20240301T100000Z\r\nDURATION:P9999999999999W\r\n",
        );
        h.remote.add_event(
            "far",
            "\"1\"",
            "DTSTART:20240301T100000Z\r\nDURATION:P4294967295W\r\n",
        );
        h.remote.add_event(
            "ok",
            "\"1\"",
            "DTSTART:20240301T100000Z\r\nDURATION:PT1H\r\n",
        );

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Partial);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(h.logs().await.len(), 1);
        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_uid, "ok");
    }

    #[tokio::test]
    async fn disconnected_connection_makes_no_network_calls() {
        let h = harness(false).await;
        ConnectionRepository::disconnect(&h.pool, &h.connection.id).await.unwrap();

        let report = h.run(SyncType::Manual).await;

        assert_eq!(report.status, SyncStatus::Failed);
        assert_eq!(report.errors, vec![DISCONNECTED_MESSAGE.to_string()]);
        assert_eq!(h.remote.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.logs().await.len(), 1);

        assert!(!h.sync.export_appointment("missing", &h.connection.id).await.unwrap());
        assert_eq!(h.remote.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnect_mid_run_cancels_remaining_work() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"1\"",
            "DTSTART:20240301T100000Z\r\nDTEND:20240301T110000Z\r\n",
        );
        *h.remote.disconnect_on_list.lock().unwrap() =
            Some((h.pool.clone(), h.connection.id.clone()));

        let report = h.run(SyncType::Incremental).await;

        assert_eq!(report.status, SyncStatus::Failed);
        assert!(report.errors.contains(&CANCELLED_MESSAGE.to_string()));
        assert!(PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(h.connection().await.sync_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let h = harness(false).await;
        let lock = h.sync.lock_for(&h.connection.id);
        let guard = lock.lock().await;

        let outcome = h
            .sync
            .run_sync(&h.connection.id, SyncType::Manual)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Skipped));
        assert!(h.logs().await.is_empty());

        drop(guard);
        assert!(matches!(
            h.sync.run_sync(&h.connection.id, SyncType::Manual).await.unwrap(),
            SyncOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn mapping_links_pending_event_and_later_runs_use_it() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "DTSTART:20240301T120000Z\r\nDTEND:20240301T130000Z\r\nDESCRIPTION:From phone\r\n",
        );
        h.run(SyncType::Initial).await;

        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();
        let x = insert_appointment(&h.pool, "user-1", None).await;

        let other_user = h.sync.map_pending_event("user-2", &pending[0].id, &x).await;
        assert!(matches!(other_user, Err(AppError::NotFound(_))));

        let linked = h
            .sync
            .map_pending_event("user-1", &pending[0].id, &x)
            .await
            .unwrap();
        assert_eq!(linked.external_event_uid.as_deref(), Some("abc"));
        assert_eq!(linked.start_time, at("2024-03-01 12:00:00"));
        assert_eq!(linked.notes.as_deref(), Some("From phone"));

        let logs = h.logs().await;
        assert_eq!(logs[0].sync_type, SyncType::Manual);
        assert_eq!(logs[0].direction, SyncDirection::Import);
        assert_eq!(logs[0].events_imported, 1);
        assert!(PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap()
            .is_empty());

        // The next run reconciles through the join key instead of re-queueing.
        let report = h.run(SyncType::Incremental).await;
        assert_eq!(report.status, SyncStatus::Success);
        assert!(PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn idle_connection_locks_are_released() {
        let h = harness(false).await;
        h.run(SyncType::Manual).await;

        let held = h.sync.lock_for("other-connection");
        {
            let locks = h.sync.locks.lock().unwrap();
            assert_eq!(locks.len(), 1);
            assert!(locks.contains_key("other-connection"));
        }

        let again = h.sync.lock_for("other-connection");
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[tokio::test]
    async fn exporting_a_mapped_appointment_updates_the_remote_event_in_place() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "DTSTART:20240301T120000Z\r\nDTEND:20240301T130000Z\r\n",
        );
        h.run(SyncType::Initial).await;
        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();
        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.sync
            .map_pending_event("user-1", &pending[0].id, &x)
            .await
            .unwrap();

        assert!(h.sync.export_appointment(&x, &h.connection.id).await.unwrap());

        let appt = h.appointment(&x).await;
        assert_eq!(appt.external_event_uid.as_deref(), Some("abc"));
        assert_eq!(
            appt.external_event_url,
            Some(format!("{}abc.ics", CALENDAR_URL))
        );
        let puts = h.remote.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].contains("UID:abc"));
        assert_eq!(h.remote.objects.lock().unwrap().len(), 1);

        let report = h.run(SyncType::Incremental).await;
        assert_eq!(report.status, SyncStatus::Success);
        assert!(PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(h.appointment(&x).await.external_event_uid.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn mapping_rejects_appointment_linked_elsewhere() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "DTSTART:20240301T120000Z\r\nDTEND:20240301T130000Z\r\n",
        );
        h.run(SyncType::Initial).await;
        let pending = PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap();

        let x = insert_appointment(&h.pool, "user-1", None).await;
        h.link(&x, "other-uid", "\"1\"").await;

        let res = h.sync.map_pending_event("user-1", &pending[0].id, &x).await;
        assert!(matches!(res, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn vanished_remote_events_leave_the_pending_list() {
        let h = harness(false).await;
        h.remote.add_event(
            "abc",
            "\"v1\"",
            "DTSTART:20240301T120000Z\r\nDTEND:20240301T130000Z\r\n",
        );
        h.run(SyncType::Initial).await;
        h.remote.objects.lock().unwrap().clear();

        h.run(SyncType::Incremental).await;

        assert!(PendingMappingRepository::list_by_connection(&h.pool, &h.connection.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn auto_export_targets_active_auto_export_connections() {
        let h = harness(true).await;
        let y = insert_appointment(&h.pool, "user-1", None).await;

        let results = h.sync.auto_export(&y).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        ConnectionRepository::disconnect(&h.pool, &h.connection.id).await.unwrap();
        assert!(h.sync.auto_export(&y).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_connections_run_as_initial_sync() {
        let h = harness(false).await;

        assert_eq!(h.sync.run_due_connections().await.unwrap(), 1);
        let logs = h.logs().await;
        assert_eq!(logs[0].sync_type, SyncType::Initial);

        // Just synced, so not due again until the interval passes.
        assert_eq!(h.sync.run_due_connections().await.unwrap(), 0);
    }
}
