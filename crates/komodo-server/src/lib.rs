//! Komodo relay server.
//!
//! Sessions live in a [`SessionRegistry`]. Connections are bound to
//! `(session, client)` pairs by the [`ConnectionBinder`], inbound frames go
//! through the [`RelayRouter`], and recordings are written and replayed by
//! the [`CaptureEngine`] and [`PlaybackEngine`]. Everything reaches sockets
//! through the [`RoomTransport`] capability.

pub mod binder;
pub mod capture;
pub mod error;
pub mod heartbeat;
pub mod playback;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use binder::{ConnectionBinder, DisconnectReason};
pub use capture::CaptureEngine;
pub use error::RelayError;
pub use playback::PlaybackEngine;
pub use registry::{SessionHandle, SessionRegistry};
pub use router::RelayRouter;
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use transport::{Connection, ConnectionRegistry, RoomTransport};
