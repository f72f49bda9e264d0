//! Timed replay of a stored capture into a live session room.

use std::iter::Peekable;
use std::sync::Arc;
use std::time::Duration;

use komodo_core::events::names;
use komodo_core::{
    CaptureId, CaptureRecord, CapturedEvent, MessageEvent, OutboundEvent, PlaybackRequest,
    SessionId, UpdateEvent,
};
use komodo_store::{CaptureStore, CaptureStreams};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::transport::RoomTransport;

pub struct PlaybackEngine {
    store: CaptureStore,
    transport: Arc<dyn RoomTransport>,
    replay_offset: i64,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Position,
    Interaction,
}

impl Stream {
    fn end_event(self) -> &'static str {
        match self {
            Self::Position => names::PLAYBACK_END,
            Self::Interaction => names::INTERACTION_PLAYBACK_END,
        }
    }
}

impl PlaybackEngine {
    pub fn new(
        store: CaptureStore,
        transport: Arc<dyn RoomTransport>,
        replay_offset: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            replay_offset,
            cancel,
        }
    }

    /// Validate a request and replay it in the background.
    pub fn spawn(self: &Arc<Self>, request: PlaybackRequest) -> Result<JoinHandle<()>, RelayError> {
        let (Some(room), Some(client_id), Some(playback_id)) =
            (request.session_id, request.client_id, request.playback_id)
        else {
            return Err(RelayError::Validation(
                "playback needs session_id, client_id and playback_id".into(),
            ));
        };
        let capture_id: CaptureId = playback_id.parse()?;
        info!(session_id = %room, client_id = %client_id, capture_id = %capture_id, "playback requested");

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.play(room, capture_id).await }))
    }

    /// Read the capture and replay it into `room`.
    pub async fn play(&self, room: SessionId, capture_id: CaptureId) {
        match self.store.read(&capture_id).await {
            Ok(streams) => self.replay(&room, streams).await,
            Err(e) => {
                warn!(session_id = %room, capture_id = %capture_id, error = %e, "failed to read capture");
                self.emit(
                    &room,
                    names::PLAYBACK_ERROR,
                    json!({"playback_id": capture_id.to_string(), "message": e.to_string()}),
                );
                self.emit(&room, names::PLAYBACK_END, Value::Null);
                self.emit(&room, names::INTERACTION_PLAYBACK_END, Value::Null);
            }
        }
    }

    /// Emit both streams against a clock that starts now.
    ///
    /// The head with the lower `seq` goes first (position on ties) and is
    /// held until its offset is due, which pauses the other stream too.
    pub async fn replay(&self, room: &SessionId, streams: CaptureStreams) {
        let started = Instant::now();
        let mut position = streams.position.into_iter().peekable();
        let mut interaction = streams.interaction.into_iter().peekable();
        let mut position_open = true;
        let mut interaction_open = true;
        let mut emitted = 0usize;

        loop {
            position_open = self.close_if_drained(room, &mut position, position_open, Stream::Position);
            interaction_open =
                self.close_if_drained(room, &mut interaction, interaction_open, Stream::Interaction);

            let next = match (position.peek(), interaction.peek()) {
                (None, None) => break,
                (Some(_), None) => Stream::Position,
                (None, Some(_)) => Stream::Interaction,
                (Some(p), Some(i)) if p.seq <= i.seq => Stream::Position,
                (Some(_), Some(_)) => Stream::Interaction,
            };
            let stream = match next {
                Stream::Position => &mut position,
                Stream::Interaction => &mut interaction,
            };
            let Some(record) = stream.next() else { continue };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(session_id = %room, emitted, "playback cancelled");
                    return;
                }
                () = sleep_until(started + Duration::from_millis(record.seq)) => {}
            }
            self.emit_record(room, record);
            emitted += 1;
        }
        info!(session_id = %room, emitted, elapsed = ?started.elapsed(), "playback finished");
    }

    fn close_if_drained<I: Iterator<Item = CaptureRecord>>(
        &self,
        room: &SessionId,
        stream: &mut Peekable<I>,
        open: bool,
        kind: Stream,
    ) -> bool {
        if open && stream.peek().is_none() {
            self.emit(room, kind.end_event(), Value::Null);
            return false;
        }
        open
    }

    fn emit_record(&self, room: &SessionId, record: CaptureRecord) {
        match record.payload {
            CapturedEvent::Update(update) => {
                let replayed = update.for_replay(self.replay_offset);
                self.emit(room, names::RELAY_UPDATE, Value::Array(replayed.to_packet()));
            }
            CapturedEvent::Interact(interaction) => {
                self.emit(room, names::INTERACTION_UPDATE, Value::Array(interaction.to_packet()));
            }
            CapturedEvent::Message(message) => {
                let message = self.remap_message(message);
                match serde_json::to_value(&message) {
                    Ok(data) => self.emit(room, names::MESSAGE, data),
                    Err(e) => warn!(error = %e, "failed to encode replayed message"),
                }
            }
        }
    }

    fn remap_message(&self, mut message: MessageEvent) -> MessageEvent {
        if !message.is_sync() {
            return message;
        }
        let remapped = message
            .embedded_packet()
            .and_then(|packet| UpdateEvent::from_packet(&packet));
        match remapped {
            Ok(update) => {
                message.message.data = Value::Array(update.for_replay(self.replay_offset).to_packet());
            }
            Err(e) => debug!(error = %e, "replaying sync message without remap"),
        }
        message
    }

    fn emit(&self, room: &SessionId, event: &'static str, data: Value) {
        let _ = self
            .transport
            .emit_to_room(room, &OutboundEvent::new(event, data), None);
    }
}
