//! The in-memory session record.
//!
//! A `Session` is plain data. Locking and lifetime are owned by the server's
//! registry; every method here runs under that lock and never blocks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::capture::{CaptureId, CaptureRecord, CapturedEvent};
use crate::entity::{Entity, EntityStore, InteractionEffect};
use crate::events::{InteractEvent, UpdateEvent};
use crate::ids::{ClientId, ConnectionId, EntityId, SessionId};

#[derive(Debug)]
struct ActiveRecording {
    start_ms: i64,
    clock: Instant,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// One entry per bound connection. Duplicates are expected while a bump
    /// is in flight.
    clients: Vec<ClientId>,
    connections: HashMap<ConnectionId, ClientId>,
    pub entities: EntityStore,
    pub scene: Option<i64>,
    recording: Option<ActiveRecording>,
    /// Start of the most recent recording, zero if the session never recorded.
    recording_start: i64,
    pub created_at: DateTime<Utc>,
    capture_buffer: Vec<CaptureRecord>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            clients: Vec::new(),
            connections: HashMap::new(),
            entities: EntityStore::new(),
            scene: None,
            recording: None,
            recording_start: 0,
            created_at: Utc::now(),
            capture_buffer: Vec::new(),
        }
    }

    // -- clients ------------------------------------------------------------

    pub fn clients(&self) -> &[ClientId] {
        &self.clients
    }

    pub fn has_client(&self, client_id: &ClientId) -> bool {
        self.clients.contains(client_id)
    }

    pub fn client_entries(&self, client_id: &ClientId) -> usize {
        self.clients.iter().filter(|c| *c == client_id).count()
    }

    pub fn add_client(&mut self, client_id: ClientId) {
        self.clients.push(client_id);
    }

    /// Remove exactly one entry for `client_id`. Returns false if none existed.
    pub fn remove_one_client(&mut self, client_id: &ClientId) -> bool {
        match self.clients.iter().position(|c| c == client_id) {
            Some(idx) => {
                self.clients.remove(idx);
                true
            }
            None => false,
        }
    }

    /// True once every client has departed.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    // -- connection bindings ------------------------------------------------

    pub fn bind(&mut self, conn_id: ConnectionId, client_id: ClientId) {
        self.connections.insert(conn_id, client_id);
    }

    pub fn unbind(&mut self, conn_id: &ConnectionId) -> Option<ClientId> {
        self.connections.remove(conn_id)
    }

    pub fn binding(&self, conn_id: &ConnectionId) -> Option<&ClientId> {
        self.connections.get(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections bound to `client_id` other than `except`.
    pub fn other_connections(&self, client_id: &ClientId, except: &ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(conn, client)| *client == client_id && *conn != except)
            .map(|(conn, _)| conn.clone())
            .collect()
    }

    // -- mutations ----------------------------------------------------------

    pub fn apply_update(&mut self, update: &UpdateEvent) -> bool {
        self.entities.apply_update(update)
    }

    pub fn apply_interaction(&mut self, interaction: &InteractEvent) {
        if let InteractionEffect::SceneChanged(scene) = self.entities.apply_interaction(interaction) {
            self.scene = Some(scene);
        }
    }

    // -- recording ----------------------------------------------------------

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recording_start(&self) -> i64 {
        self.recording_start
    }

    /// Capture id of the active recording.
    pub fn capture_id(&self) -> Option<CaptureId> {
        self.recording
            .as_ref()
            .map(|r| CaptureId::new(self.id.clone(), r.start_ms))
    }

    /// Start recording. Returns `None` if a recording is already active.
    pub fn begin_recording(&mut self, start_ms: i64, clock: Instant) -> Option<CaptureId> {
        if self.recording.is_some() {
            return None;
        }
        self.recording = Some(ActiveRecording { start_ms, clock });
        self.recording_start = start_ms;
        self.capture_buffer.clear();
        Some(CaptureId::new(self.id.clone(), start_ms))
    }

    /// Stop recording, handing back whatever is still buffered.
    pub fn end_recording(&mut self) -> Option<(CaptureId, Vec<CaptureRecord>)> {
        let active = self.recording.take()?;
        let id = CaptureId::new(self.id.clone(), active.start_ms);
        Some((id, std::mem::take(&mut self.capture_buffer)))
    }

    /// Append an event to the capture buffer, stamped with its arrival
    /// offset from the recording clock. Returns the buffer length, or `None`
    /// when not recording.
    pub fn capture(&mut self, payload: CapturedEvent, arrived: Instant) -> Option<usize> {
        let active = self.recording.as_ref()?;
        let seq = arrived.saturating_duration_since(active.clock).as_millis() as u64;
        self.capture_buffer.push(CaptureRecord { seq, payload });
        Some(self.capture_buffer.len())
    }

    pub fn buffered_records(&self) -> usize {
        self.capture_buffer.len()
    }

    /// Drain the buffer of the active recording for an intermediate flush.
    pub fn take_buffer(&mut self) -> Option<(CaptureId, Vec<CaptureRecord>)> {
        let id = self.capture_id()?;
        if self.capture_buffer.is_empty() {
            return None;
        }
        Some((id, std::mem::take(&mut self.capture_buffer)))
    }

    // -- snapshots ----------------------------------------------------------

    pub fn snapshot(&self, version: Option<i64>) -> StateSnapshot {
        let clients = self.clients.clone();
        let scene = self.scene;
        let is_recording = self.is_recording();
        match version {
            Some(2) => StateSnapshot::Full {
                clients,
                entities: self.entities.iter().cloned().collect(),
                scene,
                is_recording,
            },
            _ => StateSnapshot::Compact {
                clients,
                entities: self.entities.ids(),
                locked: self.entities.locked_ids(),
                scene,
                is_recording,
            },
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            clients: self.clients.clone(),
            connections: self.connection_count(),
            entities: self.entities.iter().cloned().collect(),
            scene: self.scene,
            is_recording: self.is_recording(),
            recording_start: self.recording_start,
            created_at: self.created_at,
            buffered_records: self.capture_buffer.len(),
        }
    }
}

/// Reply to a `state` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateSnapshot {
    /// Version 1: entity ids plus the ids currently locked.
    Compact {
        clients: Vec<ClientId>,
        entities: Vec<EntityId>,
        locked: Vec<EntityId>,
        scene: Option<i64>,
        #[serde(rename = "isRecording")]
        is_recording: bool,
    },
    /// Version 2: full entity objects.
    Full {
        clients: Vec<ClientId>,
        entities: Vec<Entity>,
        scene: Option<i64>,
        #[serde(rename = "isRecording")]
        is_recording: bool,
    },
}

/// Reply to a `sessionInfo` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub clients: Vec<ClientId>,
    pub connections: usize,
    pub entities: Vec<Entity>,
    pub scene: Option<i64>,
    pub is_recording: bool,
    pub recording_start: i64,
    pub created_at: DateTime<Utc>,
    pub buffered_records: usize,
}
