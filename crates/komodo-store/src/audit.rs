//! Relational audit log of connection and capture events.
//!
//! Writes are fire-and-forget: failures are logged and never reach the relay.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use komodo_core::{CaptureId, ClientId, SessionId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Reconnect,
    Disconnect,
}

impl ConnectionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEntry {
    Connection {
        timestamp: i64,
        session_id: SessionId,
        client_id: ClientId,
        event: ConnectionEvent,
    },
    CaptureStarted(CaptureId),
    CaptureEnded { capture_id: CaptureId, end: i64 },
}

impl AuditEntry {
    pub fn connection(session_id: SessionId, client_id: ClientId, event: ConnectionEvent) -> Self {
        Self::Connection {
            timestamp: Utc::now().timestamp_millis(),
            session_id,
            client_id,
            event,
        }
    }

    pub fn capture_ended(capture_id: CaptureId) -> Self {
        Self::CaptureEnded {
            capture_id,
            end: Utc::now().timestamp_millis(),
        }
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Record an entry without waiting for it to be persisted.
    fn record(&self, entry: AuditEntry);
}

/// Sink used when auditing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _entry: AuditEntry) {}
}

/// Row of the `connections` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRow {
    pub timestamp: i64,
    pub session_id: String,
    pub client_id: String,
    pub event: String,
}

/// Row of the `captures` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRow {
    pub capture_id: String,
    pub session_id: String,
    pub start: i64,
    pub end: Option<i64>,
}

enum Command {
    Write(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// `SQLite`-backed audit log.
///
/// Recorded entries go through one queue drained by a single writer thread,
/// so rows land in the order they were recorded.
#[derive(Clone)]
pub struct SqliteAuditLog {
    db: Database,
    queue: mpsc::UnboundedSender<Command>,
}

impl SqliteAuditLog {
    pub fn new(db: Database) -> Result<Self, StoreError> {
        let (queue, rx) = mpsc::unbounded_channel();
        let writer = db.clone();
        let _ = std::thread::Builder::new()
            .name("komodo-audit".into())
            .spawn(move || drain(&writer, rx))?;
        Ok(Self { db, queue })
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::new(Database::open(path)?)
    }

    /// Wait until every entry recorded before this call is persisted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Persist one entry synchronously, bypassing the queue.
    pub fn write(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        write_entry(&self.db, entry)
    }

    pub fn connection_events(&self, session_id: &SessionId) -> Result<Vec<ConnectionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, session_id, client_id, event FROM connections
                 WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([session_id.to_string()], |row| {
                Ok(ConnectionRow {
                    timestamp: row.get(0)?,
                    session_id: row.get(1)?,
                    client_id: row.get(2)?,
                    event: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn captures(&self, session_id: &SessionId) -> Result<Vec<CaptureRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT capture_id, session_id, start, \"end\" FROM captures
                 WHERE session_id = ?1 ORDER BY start",
            )?;
            let rows = stmt.query_map([session_id.to_string()], |row| {
                Ok(CaptureRow {
                    capture_id: row.get(0)?,
                    session_id: row.get(1)?,
                    start: row.get(2)?,
                    end: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

impl AuditSink for SqliteAuditLog {
    fn record(&self, entry: AuditEntry) {
        if let Err(mpsc::error::SendError(Command::Write(entry))) = self.queue.send(Command::Write(entry)) {
            error!(?entry, "audit writer stopped, entry dropped");
        }
    }
}

fn write_entry(db: &Database, entry: &AuditEntry) -> Result<(), StoreError> {
    db.with_conn(|conn| {
        match entry {
            AuditEntry::Connection {
                timestamp,
                session_id,
                client_id,
                event,
            } => {
                conn.execute(
                    "INSERT INTO connections (timestamp, session_id, client_id, event)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        timestamp,
                        session_id.to_string(),
                        client_id.to_string(),
                        event.as_str()
                    ],
                )?;
            }
            AuditEntry::CaptureStarted(id) => {
                conn.execute(
                    "INSERT OR REPLACE INTO captures (capture_id, session_id, start)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id.to_string(), id.session_id.to_string(), id.start],
                )?;
            }
            AuditEntry::CaptureEnded { capture_id, end } => {
                conn.execute(
                    "UPDATE captures SET \"end\" = ?1 WHERE capture_id = ?2",
                    rusqlite::params![end, capture_id.to_string()],
                )?;
            }
        }
        Ok(())
    })
}

fn drain(db: &Database, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Write(entry) => match write_entry(db, &entry) {
                Ok(()) => debug!(?entry, "audit entry written"),
                Err(e) => error!(error = %e, ?entry, "failed to write audit entry"),
            },
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("audit writer stopped");
}
