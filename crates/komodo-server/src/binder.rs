//! Binds connections to `(session, client)` pairs.
//!
//! Handles joins, duplicate-connection eviction ("bump") and disconnect
//! classification. Session state changes go through [`SessionRegistry`];
//! room membership and client notifications go through [`RoomTransport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use komodo_core::events::names;
use komodo_core::{ClientId, ConnectionId, JoinRequest, OutboundEvent, SessionId};
use komodo_store::{AuditEntry, AuditSink, ConnectionEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureEngine;
use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::transport::RoomTransport;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ExplicitServerClose,
    ExplicitClientClose,
    TransportClosed,
    TransportError,
    HeartbeatTimeout,
    Unknown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitServerClose => "server namespace disconnect",
            Self::ExplicitClientClose => "client namespace disconnect",
            Self::TransportClosed => "transport close",
            Self::TransportError => "transport error",
            Self::HeartbeatTimeout => "ping timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Reasons that may be a network blip rather than a departure.
    pub fn attempts_reconnect(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::Unknown)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The session and client a connection speaks for.
pub type Binding = (SessionId, ClientId);

pub struct ConnectionBinder {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn RoomTransport>,
    capture: Arc<CaptureEngine>,
    audit: Arc<dyn AuditSink>,
    bindings: DashMap<ConnectionId, Binding>,
    bump_timers: Arc<DashMap<ConnectionId, CancellationToken>>,
    grace: Duration,
}

impl ConnectionBinder {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn RoomTransport>,
        capture: Arc<CaptureEngine>,
        audit: Arc<dyn AuditSink>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            capture,
            audit,
            bindings: DashMap::new(),
            bump_timers: Arc::new(DashMap::new()),
            grace,
        }
    }

    pub fn binding(&self, conn: &ConnectionId) -> Option<Binding> {
        self.bindings.get(conn).map(|b| b.value().clone())
    }

    pub fn bound_connections(&self) -> usize {
        self.bindings.len()
    }

    pub fn pending_bumps(&self) -> usize {
        self.bump_timers.len()
    }

    /// Bind `conn` to the requested session and client.
    ///
    /// Any other connection already bound to the same client in that
    /// session is bumped: it leaves the room now and is closed once the
    /// grace period has passed.
    pub async fn join(&self, conn: &ConnectionId, request: JoinRequest) -> Result<(), RelayError> {
        let session_id = request
            .session_id
            .ok_or_else(|| RelayError::Validation("join without session_id".into()))?;
        let client_id = request
            .client_id
            .ok_or_else(|| RelayError::Validation("join without client_id".into()))?;

        if let Some(existing) = self.binding(conn) {
            if existing == (session_id.clone(), client_id.clone()) {
                debug!(conn_id = %conn, session_id = %session_id, client_id = %client_id, "repeated join");
                self.transport.join(conn, &session_id);
                self.announce_join(&session_id, &client_id);
                return Ok(());
            }
            info!(conn_id = %conn, from = %existing.0, to = %session_id, "connection switching sessions");
            self.remove(conn, existing).await;
        }

        let stale = self.registry.update_or_create(&session_id, |session| {
            session.add_client(client_id.clone());
            session.bind(conn.clone(), client_id.clone());
            let stale = session.other_connections(&client_id, conn);
            for old in &stale {
                session.unbind(old);
                session.remove_one_client(&client_id);
            }
            stale
        });

        self.bindings
            .insert(conn.clone(), (session_id.clone(), client_id.clone()));
        self.transport.join(conn, &session_id);
        for old in stale {
            self.bump(old, &session_id, &client_id);
        }

        info!(conn_id = %conn, session_id = %session_id, client_id = %client_id, "client joined");
        self.announce_join(&session_id, &client_id);
        self.audit.record(AuditEntry::connection(
            session_id,
            client_id,
            ConnectionEvent::Connect,
        ));
        Ok(())
    }

    fn announce_join(&self, session_id: &SessionId, client_id: &ClientId) {
        let _ = self.transport.emit_to_room(
            session_id,
            &OutboundEvent::new(names::JOINED, client_id.to_value()),
            None,
        );
    }

    fn bump(&self, stale: ConnectionId, session_id: &SessionId, client_id: &ClientId) {
        let _ = self.bindings.remove(&stale);
        self.transport.leave(&stale, session_id);
        warn!(conn_id = %stale, session_id = %session_id, client_id = %client_id, "bumping duplicate connection");

        let token = CancellationToken::new();
        if let Some(previous) = self.bump_timers.insert(stale.clone(), token.clone()) {
            previous.cancel();
        }
        let timers = Arc::clone(&self.bump_timers);
        let transport = Arc::clone(&self.transport);
        let grace = self.grace;
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!(conn_id = %stale, "bump cancelled, connection already gone"),
                () = tokio::time::sleep(grace) => {
                    let _ = timers.remove_if(&stale, |_, t| !t.is_cancelled());
                    debug!(conn_id = %stale, "closing bumped connection");
                    transport.close(&stale);
                }
            }
        }));
    }

    /// Handle the loss of `conn`.
    ///
    /// Heartbeat timeouts and unknown reasons first try to keep the binding;
    /// everything else, or a failed reconnect, removes it.
    pub async fn disconnect(&self, conn: &ConnectionId, reason: DisconnectReason) {
        if let Some((_, timer)) = self.bump_timers.remove(conn) {
            timer.cancel();
        }
        let Some(binding) = self.binding(conn) else {
            debug!(conn_id = %conn, reason = %reason, "unbound connection closed");
            return;
        };

        if reason.attempts_reconnect() {
            match self.reconnect(conn, &binding) {
                Ok(()) => return,
                Err(e) => debug!(conn_id = %conn, error = %e, "reconnect failed, removing"),
            }
        }
        info!(conn_id = %conn, session_id = %binding.0, client_id = %binding.1, reason = %reason, "client disconnected");
        self.remove(conn, binding).await;
    }

    fn reconnect(&self, conn: &ConnectionId, (session_id, client_id): &Binding) -> Result<(), RelayError> {
        if !self.transport.is_open(conn) {
            return Err(RelayError::NotFound(format!("connection {conn}")));
        }
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))?;
        {
            let mut session = session.lock();
            if session.binding(conn) != Some(client_id) {
                session.bind(conn.clone(), client_id.clone());
                session.add_client(client_id.clone());
            }
        }
        self.transport.join(conn, session_id);
        info!(conn_id = %conn, session_id = %session_id, client_id = %client_id, "client reconnected");
        self.audit.record(AuditEntry::connection(
            session_id.clone(),
            client_id.clone(),
            ConnectionEvent::Reconnect,
        ));
        Ok(())
    }

    async fn remove(&self, conn: &ConnectionId, (session_id, client_id): Binding) {
        let _ = self.bindings.remove(conn);
        self.transport.leave(conn, &session_id);

        let Some(session) = self.registry.get(&session_id) else {
            error!(conn_id = %conn, session_id = %session_id, "binding points at a missing session");
            return;
        };
        let empty = {
            let mut session = session.lock();
            let _ = session.unbind(conn);
            if !session.remove_one_client(&client_id) {
                error!(conn_id = %conn, session_id = %session_id, client_id = %client_id, "client missing from session");
            }
            session.is_empty()
        };

        let _ = self.transport.emit_to_room(
            &session_id,
            &OutboundEvent::new(names::DISCONNECTED, client_id.to_value()),
            Some(conn),
        );
        self.audit.record(AuditEntry::connection(
            session_id.clone(),
            client_id,
            ConnectionEvent::Disconnect,
        ));

        if empty {
            self.cleanup(&session_id).await;
        }
    }

    /// End any recording, then drop the session if nobody rejoined meanwhile.
    async fn cleanup(&self, session_id: &SessionId) {
        let recording = self
            .registry
            .get(session_id)
            .is_some_and(|s| s.lock().is_recording());
        if recording {
            if let Err(e) = self.capture.stop(session_id).await {
                e.report(names::END_RECORDING);
            }
        }
        let _ = self.registry.remove_if_empty(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{RecordingTransport, TransportCall};
    use komodo_settings::CaptureFormat;
    use komodo_store::{CaptureStore, NoopAudit};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        transport: Arc<RecordingTransport>,
        capture: Arc<CaptureEngine>,
        binder: ConnectionBinder,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(RecordingTransport::new());
        let capture = Arc::new(CaptureEngine::new(
            Arc::clone(&registry),
            CaptureStore::new(dir.path(), CaptureFormat::Records),
            Arc::new(NoopAudit),
            100,
        ));
        let binder = ConnectionBinder::new(
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn RoomTransport>,
            Arc::clone(&capture),
            Arc::new(NoopAudit),
            Duration::from_millis(500),
        );
        Fixture {
            registry,
            transport,
            capture,
            binder,
            _dir: dir,
        }
    }

    fn join_req(session: i64, client: i64) -> JoinRequest {
        JoinRequest {
            session_id: Some(SessionId::number(session)),
            client_id: Some(ClientId::number(client)),
        }
    }

    fn clients(f: &Fixture, session: i64) -> Vec<ClientId> {
        f.registry
            .get(&SessionId::number(session))
            .map(|s| s.lock().clients().to_vec())
            .unwrap_or_default()
    }

    // ── join ──

    #[tokio::test]
    async fn join_requires_both_ids() {
        let f = fixture();
        let conn = f.transport.connect("a");
        let err = f
            .binder
            .join(&conn, JoinRequest { session_id: Some(SessionId::number(5)), client_id: None })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn join_announces_to_whole_room() {
        let f = fixture();
        let a = f.transport.connect("a");
        let b = f.transport.connect("b");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.binder.join(&b, join_req(5, 2)).await.unwrap();

        let joined_a: Vec<_> = f
            .transport
            .received_named(&a, names::JOINED)
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(joined_a, vec![serde_json::json!(1), serde_json::json!(2)]);
        assert_eq!(f.transport.received_named(&b, names::JOINED).len(), 1);
        assert_eq!(clients(&f, 5), vec![ClientId::number(1), ClientId::number(2)]);
    }

    #[tokio::test]
    async fn repeated_join_is_idempotent() {
        let f = fixture();
        let a = f.transport.connect("a");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        assert_eq!(clients(&f, 5), vec![ClientId::number(1)]);
        assert_eq!(f.transport.received_named(&a, names::JOINED).len(), 2);
    }

    #[tokio::test]
    async fn join_elsewhere_leaves_previous_session() {
        let f = fixture();
        let a = f.transport.connect("a");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.binder.join(&a, join_req(6, 1)).await.unwrap();
        assert!(f.registry.get(&SessionId::number(5)).is_none());
        assert_eq!(clients(&f, 6), vec![ClientId::number(1)]);
        assert!(!f.transport.in_room(&a, &SessionId::number(5)));
    }

    // ── bump ──

    #[tokio::test(start_paused = true)]
    async fn bump_collapses_duplicates_after_grace() {
        let f = fixture();
        let room = SessionId::number(5);
        let first = f.transport.connect("first");
        let second = f.transport.connect("second");
        let third = f.transport.connect("third");

        f.binder.join(&first, join_req(5, 1)).await.unwrap();
        f.binder.join(&second, join_req(5, 1)).await.unwrap();
        f.binder.join(&third, join_req(5, 1)).await.unwrap();

        assert!(!f.transport.in_room(&first, &room));
        assert!(!f.transport.in_room(&second, &room));
        assert!(f.transport.in_room(&third, &room));
        assert!(!f.transport.was_closed(&second));

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert!(f.transport.was_closed(&first));
        assert!(f.transport.was_closed(&second));
        assert!(!f.transport.was_closed(&third));
        assert_eq!(clients(&f, 5), vec![ClientId::number(1)]);
        assert_eq!(f.binder.bound_connections(), 1);
        assert_eq!(f.binder.pending_bumps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bump_leaves_room_before_close() {
        let f = fixture();
        let room = SessionId::number(5);
        let old = f.transport.connect("old");
        let new = f.transport.connect("new");
        f.binder.join(&old, join_req(5, 1)).await.unwrap();
        f.binder.join(&new, join_req(5, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let calls = f.transport.calls();
        let leave = calls
            .iter()
            .position(|c| *c == TransportCall::Leave(old.clone(), room.clone()))
            .unwrap();
        let close = calls
            .iter()
            .position(|c| *c == TransportCall::Close(old.clone()))
            .unwrap();
        assert!(leave < close);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_disconnect_cancels_bump_timer() {
        let f = fixture();
        let old = f.transport.connect("old");
        let new = f.transport.connect("new");
        f.binder.join(&old, join_req(5, 1)).await.unwrap();
        f.binder.join(&new, join_req(5, 1)).await.unwrap();

        f.transport.drop_connection(&old);
        f.binder.disconnect(&old, DisconnectReason::TransportClosed).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!f.transport.was_closed(&old));
        assert_eq!(clients(&f, 5), vec![ClientId::number(1)]);
        assert!(f.transport.received_named(&new, names::DISCONNECTED).is_empty());
    }

    // ── disconnect ──

    #[tokio::test]
    async fn removal_notifies_remaining_members() {
        let f = fixture();
        let a = f.transport.connect("a");
        let b = f.transport.connect("b");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.binder.join(&b, join_req(5, 2)).await.unwrap();

        f.binder.disconnect(&a, DisconnectReason::ExplicitClientClose).await;

        let notices = f.transport.received_named(&b, names::DISCONNECTED);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].data, serde_json::json!(1));
        assert!(f.transport.received_named(&a, names::DISCONNECTED).is_empty());
        assert_eq!(clients(&f, 5), vec![ClientId::number(2)]);
    }

    #[tokio::test]
    async fn heartbeat_timeout_on_open_connection_reconnects() {
        let f = fixture();
        let a = f.transport.connect("a");
        let b = f.transport.connect("b");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.binder.join(&b, join_req(5, 2)).await.unwrap();
        f.transport.clear_received();

        f.binder.disconnect(&a, DisconnectReason::HeartbeatTimeout).await;

        assert!(f.binder.binding(&a).is_some());
        assert_eq!(clients(&f, 5), vec![ClientId::number(1), ClientId::number(2)]);
        assert!(f.transport.received(&b).is_empty());
    }

    #[tokio::test]
    async fn failed_reconnect_falls_back_to_removal() {
        let f = fixture();
        let a = f.transport.connect("a");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        f.transport.drop_connection(&a);

        f.binder.disconnect(&a, DisconnectReason::Unknown).await;

        assert!(f.binder.binding(&a).is_none());
        assert!(f.registry.get(&SessionId::number(5)).is_none());
    }

    #[tokio::test]
    async fn unbound_disconnect_is_noop() {
        let f = fixture();
        let a = f.transport.connect("a");
        f.binder.disconnect(&a, DisconnectReason::TransportError).await;
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn last_client_leaving_stops_recording_before_delete() {
        let f = fixture();
        let room = SessionId::number(5);
        let a = f.transport.connect("a");
        f.binder.join(&a, join_req(5, 1)).await.unwrap();
        let capture_id = f.capture.start(&room).await.unwrap();

        let update = komodo_core::UpdateEvent::try_from(&serde_json::json!([
            0, 5, 1, 1, 3, 1, 0, 0, 0, 1, 0, 0, 0, 1
        ]))
        .unwrap();
        f.registry.get(&room).unwrap().lock().capture(
            komodo_core::CapturedEvent::Update(update),
            tokio::time::Instant::now(),
        );

        f.binder.disconnect(&a, DisconnectReason::TransportClosed).await;

        assert!(f.registry.get(&room).is_none());
        let streams = f.capture.store().read(&capture_id).await.unwrap();
        assert_eq!(streams.position.len(), 1);
    }

    #[test]
    fn reconnect_policy() {
        assert!(DisconnectReason::HeartbeatTimeout.attempts_reconnect());
        assert!(DisconnectReason::Unknown.attempts_reconnect());
        assert!(!DisconnectReason::TransportClosed.attempts_reconnect());
        assert!(!DisconnectReason::ExplicitServerClose.attempts_reconnect());
        assert_eq!(DisconnectReason::HeartbeatTimeout.to_string(), "ping timeout");
    }
}
