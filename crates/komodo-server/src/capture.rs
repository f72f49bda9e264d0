//! Recording control and buffer flushing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use komodo_core::{CaptureId, CaptureRecord, SessionId};
use komodo_store::{AppendError, AuditEntry, AuditSink, CaptureStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::registry::SessionRegistry;

/// Starts and stops recordings and moves buffered records to the store.
///
/// Every write holds `writes`, and buffers are taken from the session only
/// while holding it, so appends for one capture land on disk in order.
/// Records from a failed write wait in `writes` and go out first on the
/// next write for the same capture.
pub struct CaptureEngine {
    registry: Arc<SessionRegistry>,
    store: CaptureStore,
    audit: Arc<dyn AuditSink>,
    max_buffered: usize,
    writes: Mutex<HashMap<CaptureId, Vec<CaptureRecord>>>,
}

impl CaptureEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: CaptureStore,
        audit: Arc<dyn AuditSink>,
        max_buffered: usize,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            max_buffered: max_buffered.max(1),
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    /// Begin recording `session_id`.
    pub async fn start(&self, session_id: &SessionId) -> Result<CaptureId, RelayError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))?;
        let started = session
            .lock()
            .begin_recording(Utc::now().timestamp_millis(), Instant::now());
        let Some(capture_id) = started else {
            return Err(RelayError::AlreadyInState(format!(
                "session {session_id} is already recording"
            )));
        };

        match self.store.create(&capture_id).await {
            Ok(dir) => debug!(capture_id = %capture_id, dir = %dir.display(), "capture directory ready"),
            Err(e) => warn!(capture_id = %capture_id, error = %e, "failed to create capture directory"),
        }
        self.audit.record(AuditEntry::CaptureStarted(capture_id.clone()));
        info!(session_id = %session_id, capture_id = %capture_id, "recording started");
        Ok(capture_id)
    }

    /// End the recording of `session_id` and write what is still buffered.
    ///
    /// The recording is over even if the final write fails; its records are
    /// kept for a later retry.
    pub async fn stop(&self, session_id: &SessionId) -> Result<CaptureId, RelayError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))?;

        let mut writes = self.writes.lock().await;
        let ended = session.lock().end_recording();
        let Some((capture_id, records)) = ended else {
            return Err(RelayError::AlreadyInState(format!(
                "session {session_id} is not recording"
            )));
        };

        let result = self.write_locked(&mut writes, &capture_id, records).await;
        drop(writes);
        self.audit.record(AuditEntry::capture_ended(capture_id.clone()));
        info!(session_id = %session_id, capture_id = %capture_id, "recording stopped");
        result.map(|_| capture_id)
    }

    /// Write the buffer of an active recording. Returns the number of records written.
    pub async fn flush(&self, session_id: &SessionId) -> Result<usize, RelayError> {
        let Some(session) = self.registry.get(session_id) else {
            return Ok(0);
        };
        let mut writes = self.writes.lock().await;
        let taken = session.lock().take_buffer();
        match taken {
            Some((capture_id, records)) => self.write_locked(&mut writes, &capture_id, records).await,
            None => Ok(0),
        }
    }

    /// Called after an append; flushes once the buffer reaches its limit.
    pub async fn after_append(&self, session_id: &SessionId, buffered: usize) {
        if buffered < self.max_buffered {
            return;
        }
        debug!(session_id = %session_id, buffered, "capture buffer full, flushing");
        if let Err(e) = self.flush(session_id).await {
            e.report("flush");
        }
    }

    /// Flush every recording session and retry earlier failed writes.
    pub async fn flush_all(&self) {
        for session_id in self.registry.recording_ids() {
            if let Err(e) = self.flush(&session_id).await {
                e.report("flush");
            }
        }

        let mut writes = self.writes.lock().await;
        let retry: Vec<CaptureId> = writes.keys().cloned().collect();
        for capture_id in retry {
            if let Err(e) = self.write_locked(&mut writes, &capture_id, Vec::new()).await {
                e.report("flush");
            }
        }
    }

    /// Stop every active recording.
    pub async fn shutdown(&self) {
        let recording = self.registry.recording_ids();
        info!(count = recording.len(), "stopping active recordings");
        for session_id in recording {
            if let Err(e) = self.stop(&session_id).await {
                e.report("end_recording");
            }
        }
        self.flush_all().await;

        let unwritten: usize = self.writes.lock().await.values().map(Vec::len).sum();
        if unwritten > 0 {
            error!(records = unwritten, "capture records lost at shutdown");
        }
    }

    /// Spawn the periodic flush task.
    pub fn spawn_flush_task(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.flush_all().await,
                    () = cancel.cancelled() => break,
                }
            }
            debug!("capture flush task stopped");
        })
    }

    pub async fn pending_records(&self) -> usize {
        self.writes.lock().await.values().map(Vec::len).sum()
    }

    async fn write_locked(
        &self,
        writes: &mut HashMap<CaptureId, Vec<CaptureRecord>>,
        capture_id: &CaptureId,
        records: Vec<CaptureRecord>,
    ) -> Result<usize, RelayError> {
        let mut batch = writes.remove(capture_id).unwrap_or_default();
        batch.extend(records);
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.append(capture_id, &batch).await {
            Ok(written) => {
                debug!(capture_id = %capture_id, written, "capture flushed");
                Ok(written)
            }
            Err(AppendError { error, unwritten }) => {
                warn!(
                    capture_id = %capture_id,
                    records = batch.len(),
                    unwritten = unwritten.len(),
                    "capture write failed, keeping unwritten records"
                );
                if !unwritten.is_empty() {
                    writes.insert(capture_id.clone(), unwritten);
                }
                Err(error.into())
            }
        }
    }
}
