pub mod audit;
pub mod captures;
pub mod codec;
pub mod database;
pub mod error;
pub mod schema;

pub use audit::{AuditEntry, AuditSink, ConnectionEvent, NoopAudit, SqliteAuditLog};
pub use captures::{AppendError, CaptureStore, CaptureStreams};
pub use database::Database;
pub use error::StoreError;
