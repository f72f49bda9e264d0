//! Room-scoped delivery to live connections.

pub mod ws;

use komodo_core::{ConnectionId, OutboundEvent, SessionId};

pub use ws::{Connection, ConnectionRegistry};

/// What the relay needs from the transport. Rooms are keyed by session id.
///
/// Every method is non-blocking: delivery is queued, never awaited.
pub trait RoomTransport: Send + Sync {
    fn join(&self, conn: &ConnectionId, room: &SessionId);

    /// Stop delivering room broadcasts to `conn`.
    fn leave(&self, conn: &ConnectionId, room: &SessionId);

    /// Ask the connection's socket to shut down.
    fn close(&self, conn: &ConnectionId);

    fn emit_to(&self, conn: &ConnectionId, event: &OutboundEvent) -> bool;

    /// Deliver to every member of `room` except `except`. Returns the
    /// number of connections the event was queued for.
    fn emit_to_room(
        &self,
        room: &SessionId,
        event: &OutboundEvent,
        except: Option<&ConnectionId>,
    ) -> usize;

    fn is_open(&self, conn: &ConnectionId) -> bool;
}
