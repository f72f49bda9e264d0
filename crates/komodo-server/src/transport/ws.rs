//! WebSocket connections and the registry that implements [`RoomTransport`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use komodo_core::{ConnectionId, OutboundEvent, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RoomTransport;
use crate::binder::DisconnectReason;
use crate::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::router::RelayRouter;

/// One live socket.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    rooms: Mutex<HashSet<SessionId>>,
    /// Whether the peer has shown life since the last heartbeat check.
    pub is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    pub connected_at: Instant,
    dropped_messages: AtomicU64,
    close: CancellationToken,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            rooms: Mutex::new(HashSet::new()),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            connected_at: now,
            dropped_messages: AtomicU64::new(0),
            close: CancellationToken::new(),
        }
    }

    /// Queue a frame. Returns `false` if the queue is full or closed.
    pub fn send(&self, frame: Arc<String>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(conn_id = %self.id, frame_len = frame.len(), "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn in_room(&self, room: &SessionId) -> bool {
        self.rooms.lock().contains(room)
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn request_close(&self) {
        self.close.cancel();
    }

    pub fn close_requested(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Every open connection, indexed by id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return it with its outbound queue.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(ConnectionId::new(), tx));
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        (conn, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        let _ = self.connections.remove(id);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    fn members(&self, room: &SessionId, except: Option<&ConnectionId>) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| Some(entry.key()) != except && entry.value().in_room(room))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn encode(event: &OutboundEvent) -> Option<Arc<String>> {
    let frame = event.to_json();
    if frame.is_none() {
        warn!(event = event.event, "failed to encode outbound event");
    }
    frame.map(Arc::new)
}

impl RoomTransport for ConnectionRegistry {
    fn join(&self, conn: &ConnectionId, room: &SessionId) {
        if let Some(c) = self.get(conn) {
            c.rooms.lock().insert(room.clone());
        }
    }

    fn leave(&self, conn: &ConnectionId, room: &SessionId) {
        if let Some(c) = self.get(conn) {
            c.rooms.lock().remove(room);
        }
    }

    fn close(&self, conn: &ConnectionId) {
        if let Some(c) = self.get(conn) {
            c.request_close();
        }
    }

    fn emit_to(&self, conn: &ConnectionId, event: &OutboundEvent) -> bool {
        match (self.get(conn), encode(event)) {
            (Some(c), Some(frame)) => c.send(frame),
            _ => false,
        }
    }

    fn emit_to_room(
        &self,
        room: &SessionId,
        event: &OutboundEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        self.members(room, except)
            .into_iter()
            .filter(|c| c.send(Arc::clone(&frame)))
            .count()
    }

    fn is_open(&self, conn: &ConnectionId) -> bool {
        self.get(conn).is_some_and(|c| !c.close_requested())
    }
}

/// Socket-level settings for [`serve_socket`].
#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Drive one WebSocket until it ends, dispatching frames to the router.
///
/// Frames from one connection are handled in arrival order. A first
/// heartbeat timeout goes through the reconnect path and the socket stays
/// up; a second consecutive one without any traffic in between ends it.
pub async fn serve_socket(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RelayRouter>,
    config: SocketConfig,
    shutdown: CancellationToken,
) {
    let (conn, mut rx) = registry.register();
    let conn_id = conn.id.clone();
    info!(conn_id = %conn_id, "connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&conn);
    let ping_every = config.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(WsMessage::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_conn.close.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let heartbeat = run_heartbeat(
        Arc::clone(&conn),
        config.heartbeat_interval,
        config.heartbeat_timeout,
        shutdown.clone(),
    );
    tokio::pin!(heartbeat);
    let mut timed_out_without_traffic = false;

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "socket error");
                        break DisconnectReason::TransportError;
                    }
                    None => break DisconnectReason::TransportClosed,
                };
                conn.mark_alive();
                timed_out_without_traffic = false;
                match msg {
                    WsMessage::Text(text) => router.handle_frame(&conn_id, text.as_str()).await,
                    WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => router.handle_frame(&conn_id, text).await,
                        Err(_) => debug!(conn_id = %conn_id, len = data.len(), "ignoring non-UTF8 binary frame"),
                    },
                    WsMessage::Close(_) => break DisconnectReason::ExplicitClientClose,
                    WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                }
            }
            result = &mut heartbeat => {
                match result {
                    HeartbeatResult::Cancelled => break DisconnectReason::ExplicitServerClose,
                    HeartbeatResult::TimedOut if timed_out_without_traffic => {
                        break DisconnectReason::HeartbeatTimeout;
                    }
                    HeartbeatResult::TimedOut => {
                        warn!(conn_id = %conn_id, silent_for = ?conn.last_seen_elapsed(), "heartbeat timed out");
                        timed_out_without_traffic = true;
                        router.binder().disconnect(&conn_id, DisconnectReason::HeartbeatTimeout).await;
                        conn.is_alive.store(true, Ordering::Relaxed);
                        heartbeat.set(run_heartbeat(
                            Arc::clone(&conn),
                            config.heartbeat_interval,
                            config.heartbeat_timeout,
                            shutdown.clone(),
                        ));
                    }
                }
            }
            () = conn.close.cancelled() => break DisconnectReason::ExplicitServerClose,
        }
    };

    registry.unregister(&conn_id);
    if !conn.close_requested() {
        conn.request_close();
    }
    let _ = writer.await;
    info!(conn_id = %conn_id, reason = %reason, dropped = conn.drop_count(), "connection closed");
    router.binder().disconnect(&conn_id, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> OutboundEvent {
        OutboundEvent::new("joined", json!(4))
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx_a) = registry.register();
        let (_b, _rx_b) = registry.register();
        assert_eq!(registry.count(), 2);
        registry.unregister(&a.id);
        assert_eq!(registry.count(), 1);
        assert!(!registry.is_open(&a.id));
    }

    #[test]
    fn room_emit_skips_sender_and_non_members() {
        let registry = ConnectionRegistry::new(8);
        let room = SessionId::number(5);
        let (a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();
        let (_c, mut rx_c) = registry.register();
        registry.join(&a.id, &room);
        registry.join(&b.id, &room);

        assert_eq!(registry.emit_to_room(&room, &event(), Some(&a.id)), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().as_str(), r#"{"event":"joined","data":4}"#);
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn leave_stops_room_delivery() {
        let registry = ConnectionRegistry::new(8);
        let room = SessionId::number(5);
        let (a, mut rx_a) = registry.register();
        registry.join(&a.id, &room);
        registry.leave(&a.id, &room);
        assert_eq!(registry.emit_to_room(&room, &event(), None), 0);
        assert!(rx_a.try_recv().is_err());
        assert!(registry.emit_to(&a.id, &event()));
        assert!(rx_a.try_recv().is_ok());
    }

    #[test]
    fn full_queue_drops_frames() {
        let registry = ConnectionRegistry::new(1);
        let (a, _rx) = registry.register();
        assert!(registry.emit_to(&a.id, &event()));
        assert!(!registry.emit_to(&a.id, &event()));
        assert_eq!(a.drop_count(), 1);
    }

    #[test]
    fn close_marks_connection_not_open() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx) = registry.register();
        assert!(registry.is_open(&a.id));
        registry.close(&a.id);
        assert!(a.close_requested());
        assert!(!registry.is_open(&a.id));
    }
}
