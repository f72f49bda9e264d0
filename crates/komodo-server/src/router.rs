//! Inbound event dispatch.

use std::sync::Arc;

use komodo_core::events::names;
use komodo_core::{
    CapturedEvent, ClientId, ConnectionId, CoreError, DrawEvent, Envelope, InboundEvent,
    InteractEvent, MessageEvent, OutboundEvent, Session, SessionId, StateRequest, UpdateEvent,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::binder::ConnectionBinder;
use crate::capture::CaptureEngine;
use crate::error::RelayError;
use crate::playback::PlaybackEngine;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::transport::RoomTransport;

/// Routes parsed frames to the binder, the engines or a room broadcast.
pub struct RelayRouter {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn RoomTransport>,
    binder: Arc<ConnectionBinder>,
    capture: Arc<CaptureEngine>,
    playback: Arc<PlaybackEngine>,
}

impl RelayRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn RoomTransport>,
        binder: Arc<ConnectionBinder>,
        capture: Arc<CaptureEngine>,
        playback: Arc<PlaybackEngine>,
    ) -> Self {
        Self {
            registry,
            transport,
            binder,
            capture,
            playback,
        }
    }

    pub fn binder(&self) -> &Arc<ConnectionBinder> {
        &self.binder
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn capture(&self) -> &Arc<CaptureEngine> {
        &self.capture
    }

    /// Parse one text frame and dispatch it. Failures are logged, never returned.
    pub async fn handle_frame(&self, conn: &ConnectionId, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %conn, error = %e, "dropping frame that is not an event envelope");
                return;
            }
        };
        let event_name = envelope.event.clone();
        let event = match InboundEvent::parse(&envelope.event, envelope.data) {
            Ok(event) => event,
            Err(e) => {
                RelayError::from(e).report(&event_name);
                return;
            }
        };
        if let Err(e) = self.dispatch(conn, event).await {
            e.report(&event_name);
        }
    }

    #[instrument(skip_all, fields(event = event.name(), conn_id = %conn))]
    pub async fn dispatch(&self, conn: &ConnectionId, event: InboundEvent) -> Result<(), RelayError> {
        let arrived = Instant::now();
        match event {
            InboundEvent::Join(request) => self.binder.join(conn, request).await,
            InboundEvent::State(request) => self.state(conn, request),
            InboundEvent::Draw(draw) => self.draw(conn, draw),
            InboundEvent::Message(message) => self.message(conn, message, arrived).await,
            InboundEvent::Update(update) => self.update(conn, update, arrived).await,
            InboundEvent::Interact(interaction) => self.interact(conn, interaction, arrived).await,
            InboundEvent::StartRecording(session_id) => {
                let session_id = required_session(session_id, names::START_RECORDING)?;
                self.capture.start(&session_id).await.map(|_| ())
            }
            InboundEvent::EndRecording(session_id) => {
                let session_id = required_session(session_id, names::END_RECORDING)?;
                self.capture.stop(&session_id).await.map(|_| ())
            }
            InboundEvent::Playback(request) => self.playback.spawn(request).map(|_| ()),
            InboundEvent::SessionInfo(session_id) => self.session_info(conn, session_id),
        }
    }

    fn session(&self, session_id: &SessionId) -> Result<SessionHandle, RelayError> {
        self.registry
            .get(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("session {session_id}")))
    }

    async fn update(&self, conn: &ConnectionId, update: UpdateEvent, arrived: Instant) -> Result<(), RelayError> {
        let session_id = update.session_id.clone();
        let session = self.session(&session_id)?;
        let buffered = {
            let mut session = session.lock();
            require_member(&session, &update.client_id)?;
            let _ = self.transport.emit_to_room(
                &session_id,
                &OutboundEvent::new(names::RELAY_UPDATE, Value::Array(update.to_packet())),
                Some(conn),
            );
            let _ = session.apply_update(&update);
            session.capture(CapturedEvent::Update(update), arrived)
        };
        self.after_capture(&session_id, buffered).await;
        Ok(())
    }

    async fn interact(
        &self,
        conn: &ConnectionId,
        interaction: InteractEvent,
        arrived: Instant,
    ) -> Result<(), RelayError> {
        let session_id = interaction.session_id.clone();
        let session = self.session(&session_id)?;
        let buffered = {
            let mut session = session.lock();
            require_member(&session, &interaction.client_id)?;
            let _ = self.transport.emit_to_room(
                &session_id,
                &OutboundEvent::new(names::INTERACTION_UPDATE, Value::Array(interaction.to_packet())),
                Some(conn),
            );
            session.apply_interaction(&interaction);
            session.capture(CapturedEvent::Interact(interaction), arrived)
        };
        self.after_capture(&session_id, buffered).await;
        Ok(())
    }

    /// Relay verbatim; `sync` and `interaction` messages from members also
    /// update entity state and are captured.
    async fn message(&self, conn: &ConnectionId, message: MessageEvent, arrived: Instant) -> Result<(), RelayError> {
        let session_id = message.session_id.clone();
        let session = self.session(&session_id)?;
        let data = serde_json::to_value(&message).map_err(CoreError::from)?;
        let buffered = {
            let mut session = session.lock();
            let _ = self
                .transport
                .emit_to_room(&session_id, &OutboundEvent::new(names::MESSAGE, data), Some(conn));

            if !(message.is_sync() || message.is_interaction()) {
                None
            } else if !session.has_client(&message.client_id) {
                debug!(client_id = %message.client_id, "message from non-member not applied");
                None
            } else {
                match apply_embedded(&mut session, &message) {
                    Ok(()) => session.capture(CapturedEvent::Message(message), arrived),
                    Err(e) => {
                        warn!(session_id = %session_id, kind = %message.message.kind, error = %e, "malformed embedded payload");
                        None
                    }
                }
            }
        };
        self.after_capture(&session_id, buffered).await;
        Ok(())
    }

    fn draw(&self, conn: &ConnectionId, draw: DrawEvent) -> Result<(), RelayError> {
        let (Some(session_id), Some(_)) = (draw.session_id(), draw.client_id()) else {
            return Err(RelayError::Validation("draw packet without session or client".into()));
        };
        let _ = self.transport.emit_to_room(
            &session_id,
            &OutboundEvent::new(names::DRAW, Value::Array(draw.0)),
            Some(conn),
        );
        Ok(())
    }

    /// Reply to the requester with a snapshot, or `stateError` if there is none.
    fn state(&self, conn: &ConnectionId, request: StateRequest) -> Result<(), RelayError> {
        let snapshot = match (&request.session_id, &request.client_id) {
            (Some(session_id), Some(_)) => self
                .registry
                .get(session_id)
                .map(|s| s.lock().snapshot(request.version))
                .ok_or_else(|| RelayError::NotFound(format!("session {session_id}"))),
            _ => Err(RelayError::Validation("state request without session or client".into())),
        };

        match snapshot {
            Ok(snapshot) => {
                let data = serde_json::to_value(snapshot).map_err(CoreError::from)?;
                let _ = self.transport.emit_to(conn, &OutboundEvent::new(names::STATE, data));
                Ok(())
            }
            Err(e) => {
                let _ = self.transport.emit_to(
                    conn,
                    &OutboundEvent::new(
                        names::STATE_ERROR,
                        json!({
                            "session_id": request.session_id,
                            "client_id": request.client_id,
                            "message": e.to_string(),
                        }),
                    ),
                );
                Err(e)
            }
        }
    }

    fn session_info(&self, conn: &ConnectionId, session_id: Option<SessionId>) -> Result<(), RelayError> {
        let session_id = required_session(session_id, names::SESSION_INFO)?;
        let info = self.session(&session_id)?.lock().info();
        let data = serde_json::to_value(info).map_err(CoreError::from)?;
        let _ = self
            .transport
            .emit_to(conn, &OutboundEvent::new(names::SESSION_INFO, data));
        Ok(())
    }

    async fn after_capture(&self, session_id: &SessionId, buffered: Option<usize>) {
        if let Some(buffered) = buffered {
            self.capture.after_append(session_id, buffered).await;
        }
    }
}

fn required_session(session_id: Option<SessionId>, event: &str) -> Result<SessionId, RelayError> {
    session_id.ok_or_else(|| RelayError::Validation(format!("{event} without session_id")))
}

fn require_member(session: &Session, client_id: &ClientId) -> Result<(), RelayError> {
    if session.has_client(client_id) {
        Ok(())
    } else {
        Err(RelayError::Validation(format!(
            "client {client_id} is not in session {}",
            session.id
        )))
    }
}

fn apply_embedded(session: &mut Session, message: &MessageEvent) -> Result<(), CoreError> {
    let packet = message.embedded_packet()?;
    if message.is_sync() {
        let _ = session.apply_update(&UpdateEvent::from_packet(&packet)?);
    } else {
        session.apply_interaction(&InteractEvent::from_packet(&packet)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use komodo_core::{EntityId, JoinRequest};
    use komodo_settings::CaptureFormat;
    use komodo_store::{CaptureStore, NoopAudit};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        transport: Arc<RecordingTransport>,
        router: RelayRouter,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(RecordingTransport::new());
        let dyn_transport = Arc::clone(&transport) as Arc<dyn RoomTransport>;
        let store = CaptureStore::new(dir.path(), CaptureFormat::Records);
        let capture = Arc::new(CaptureEngine::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::new(NoopAudit),
            100,
        ));
        let binder = Arc::new(ConnectionBinder::new(
            Arc::clone(&registry),
            Arc::clone(&dyn_transport),
            Arc::clone(&capture),
            Arc::new(NoopAudit),
            Duration::from_millis(500),
        ));
        let playback = Arc::new(PlaybackEngine::new(
            store,
            Arc::clone(&dyn_transport),
            90_000,
            CancellationToken::new(),
        ));
        let router = RelayRouter::new(Arc::clone(&registry), dyn_transport, binder, capture, playback);
        Fixture {
            registry,
            transport,
            router,
            _dir: dir,
        }
    }

    async fn joined(f: &Fixture, raw: &str, session: i64, client: i64) -> ConnectionId {
        let conn = f.transport.connect(raw);
        f.router
            .dispatch(
                &conn,
                InboundEvent::Join(JoinRequest {
                    session_id: Some(SessionId::number(session)),
                    client_id: Some(ClientId::number(client)),
                }),
            )
            .await
            .unwrap();
        conn
    }

    fn frame(event: &str, data: Value) -> String {
        json!({"event": event, "data": data}).to_string()
    }

    fn entity(f: &Fixture, session: i64, id: i64) -> Option<komodo_core::Entity> {
        f.registry
            .get(&SessionId::number(session))?
            .lock()
            .entities
            .get(EntityId(id))
            .cloned()
    }

    // ── update ──

    #[tokio::test]
    async fn update_relays_to_others_and_caches_assets() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        let packet = json!([0, 5, 1, 7, 3, 1, 0, 1, 2, 3, 0, 0, 0, 1]);

        f.router.handle_frame(&a, &frame("update", packet.clone())).await;

        let relayed = f.transport.received_named(&b, names::RELAY_UPDATE);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].data, packet);
        assert!(f.transport.received_named(&a, names::RELAY_UPDATE).is_empty());

        let e = entity(&f, 5, 7).unwrap();
        assert!(e.render);
        assert!(!e.locked);
        assert_eq!(serde_json::to_value(&e.latest).unwrap(), packet);

        let second = json!([1, 5, 1, 7, 3, 1, 0, 1, 2, 3, 9, 9, 9, 1]);
        f.router.handle_frame(&a, &frame("update", second.clone())).await;
        let store_len = f.registry.get(&SessionId::number(5)).unwrap().lock().entities.len();
        assert_eq!(store_len, 1);
        assert_eq!(serde_json::to_value(&entity(&f, 5, 7).unwrap().latest).unwrap(), second);
    }

    #[tokio::test]
    async fn non_asset_updates_are_relayed_not_cached() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        f.router
            .handle_frame(&a, &frame("update", json!([0, 5, 1, 7, 1, 1, 0, 0, 0, 1, 0, 0, 0, 1])))
            .await;
        assert_eq!(f.transport.received_named(&b, names::RELAY_UPDATE).len(), 1);
        assert!(entity(&f, 5, 7).is_none());
    }

    #[tokio::test]
    async fn non_member_updates_are_dropped() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        f.transport.clear_received();

        f.router
            .handle_frame(&a, &frame("update", json!([0, 5, 99, 7, 3, 1, 0, 0, 0, 1, 0, 0, 0, 1])))
            .await;
        f.router
            .handle_frame(&a, &frame("interact", json!([0, 5, 99, 1, 7, 8, 0])))
            .await;

        assert!(f.transport.received(&b).is_empty());
        assert!(entity(&f, 5, 7).is_none());
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        f.transport.clear_received();

        f.router.handle_frame(&a, "not json").await;
        f.router.handle_frame(&a, &frame("update", json!([0, 5, 1]))).await;
        f.router.handle_frame(&a, &frame("teleport", json!({}))).await;

        assert!(f.transport.received(&b).is_empty());
    }

    // ── interact ──

    #[tokio::test]
    async fn lock_and_unlock_unseen_entity() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;

        f.router
            .handle_frame(&a, &frame("interact", json!([0, 5, 1, 3, 42, 8, 0])))
            .await;
        let e = entity(&f, 5, 42).unwrap();
        assert!(e.locked);
        assert!(!e.render);
        assert_eq!(f.transport.received_named(&b, names::INTERACTION_UPDATE).len(), 1);

        f.router
            .handle_frame(&a, &frame("interact", json!([1, 5, 1, 3, 42, 9, 0])))
            .await;
        assert!(!entity(&f, 5, 42).unwrap().locked);
    }

    #[tokio::test]
    async fn scene_change_sets_session_scene() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        f.router
            .handle_frame(&a, &frame("interact", json!([0, 5, 1, 3, 12, 6, 0])))
            .await;
        assert_eq!(f.registry.get(&SessionId::number(5)).unwrap().lock().scene, Some(12));
    }

    // ── message ──

    #[tokio::test]
    async fn sync_message_relays_and_caches() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        let body = json!({
            "session_id": 5, "client_id": 1,
            "message": {"type": "sync", "data": "[0,5,1,8,3,1,0,0,0,1,4,5,6,1]"}
        });

        f.router.handle_frame(&a, &frame("message", body.clone())).await;

        let relayed = f.transport.received_named(&b, names::MESSAGE);
        assert_eq!(relayed[0].data, body);
        assert_eq!(entity(&f, 5, 8).unwrap().latest.unwrap().position, [4.0, 5.0, 6.0]);
    }

    #[tokio::test]
    async fn malformed_embedded_payload_still_relays() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        let body = json!({
            "session_id": 5, "client_id": 1,
            "message": {"type": "interaction", "data": "[1,2"}
        });
        f.router.handle_frame(&a, &frame("message", body)).await;
        assert_eq!(f.transport.received_named(&b, names::MESSAGE).len(), 1);
    }

    #[tokio::test]
    async fn unknown_message_types_are_relayed_only() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        let body = json!({
            "session_id": 5, "client_id": 1,
            "message": {"type": "chat", "data": "hello"}, "extra": true
        });
        f.router.handle_frame(&a, &frame("message", body.clone())).await;
        assert_eq!(f.transport.received_named(&b, names::MESSAGE)[0].data, body);
    }

    // ── draw ──

    #[tokio::test]
    async fn draw_requires_ids() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        f.router
            .handle_frame(&a, &frame("draw", json!([0, 5, 1, "stroke", [1, 2]])))
            .await;
        f.router.handle_frame(&a, &frame("draw", json!([0, 5]))).await;
        let draws = f.transport.received_named(&b, names::DRAW);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].data, json!([0, 5, 1, "stroke", [1, 2]]));
    }

    // ── state / sessionInfo ──

    #[tokio::test]
    async fn state_replies_only_to_requester() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        let b = joined(&f, "b", 5, 2).await;
        f.router
            .handle_frame(&a, &frame("interact", json!([0, 5, 1, 3, 42, 8, 0])))
            .await;

        f.router
            .handle_frame(&a, &frame("state", json!({"session_id": 5, "client_id": 1})))
            .await;
        let state = f.transport.received_named(&a, names::STATE);
        assert_eq!(
            state[0].data,
            json!({"clients": [1, 2], "entities": [42], "locked": [42], "scene": null, "isRecording": false})
        );
        assert!(f.transport.received_named(&b, names::STATE).is_empty());
    }

    #[tokio::test]
    async fn state_for_missing_session_sends_error() {
        let f = fixture();
        let conn = f.transport.connect("lonely");
        f.router
            .handle_frame(&conn, &frame("state", json!({"session_id": 9, "client_id": 1, "version": 2})))
            .await;
        f.router
            .handle_frame(&conn, &frame("state", json!({"session_id": 9})))
            .await;
        assert_eq!(f.transport.received_named(&conn, names::STATE_ERROR).len(), 2);
        assert!(f.transport.received_named(&conn, names::STATE).is_empty());
    }

    #[tokio::test]
    async fn session_info_replies_with_summary() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        f.router.handle_frame(&a, &frame("sessionInfo", json!(5))).await;
        let info = f.transport.received_named(&a, names::SESSION_INFO);
        assert_eq!(info[0].data["id"], json!(5));
        assert_eq!(info[0].data["connections"], json!(1));
        assert_eq!(info[0].data["isRecording"], json!(false));
    }

    // ── recording ──

    #[tokio::test]
    async fn recording_captures_relayed_events() {
        let f = fixture();
        let a = joined(&f, "a", 5, 1).await;
        f.router.handle_frame(&a, &frame("start_recording", json!(5))).await;
        f.router
            .handle_frame(&a, &frame("update", json!([0, 5, 1, 7, 3, 1, 0, 0, 0, 1, 0, 0, 0, 1])))
            .await;
        f.router
            .handle_frame(&a, &frame("interact", json!([0, 5, 1, 3, 7, 2, 0])))
            .await;
        f.router
            .handle_frame(&a, &frame("draw", json!([0, 5, 1])))
            .await;

        let session = f.registry.get(&SessionId::number(5)).unwrap();
        assert!(session.lock().is_recording());
        assert_eq!(session.lock().buffered_records(), 2);

        f.router.handle_frame(&a, &frame("end_recording", json!(5))).await;
        assert!(!session.lock().is_recording());
        assert_eq!(session.lock().buffered_records(), 0);
    }
}
