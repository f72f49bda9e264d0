//! Typed inbound events.
//!
//! Position and interaction packets arrive as fixed-width JSON arrays and
//! are parsed positionally; everything else is a small JSON object.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::CoreError;
use crate::ids::{ClientId, EntityId, SessionId};
use crate::wire::{self, as_f64, as_i64};

/// Entity type code of positional assets, the only entities cached from updates.
pub const ASSET_ENTITY_TYPE: i64 = 3;

pub const UPDATE_FIELDS: usize = 14;
pub const INTERACT_FIELDS: usize = 7;

/// Event names on the wire.
pub mod names {
    pub const JOIN: &str = "join";
    pub const JOINED: &str = "joined";
    pub const STATE: &str = "state";
    pub const STATE_ERROR: &str = "stateError";
    pub const DRAW: &str = "draw";
    pub const MESSAGE: &str = "message";
    pub const UPDATE: &str = "update";
    pub const RELAY_UPDATE: &str = "relayUpdate";
    pub const INTERACT: &str = "interact";
    pub const INTERACTION_UPDATE: &str = "interactionUpdate";
    pub const DISCONNECTED: &str = "disconnected";
    pub const START_RECORDING: &str = "start_recording";
    pub const END_RECORDING: &str = "end_recording";
    pub const PLAYBACK: &str = "playback";
    pub const PLAYBACK_END: &str = "playbackEnd";
    pub const INTERACTION_PLAYBACK_END: &str = "interactionPlaybackEnd";
    pub const PLAYBACK_ERROR: &str = "playbackError";
    pub const SESSION_INFO: &str = "sessionInfo";
}

fn field<T>(
    packet: &[Value],
    idx: usize,
    event: &'static str,
    name: &'static str,
    parse: impl Fn(&Value) -> Option<T>,
) -> Result<T, CoreError> {
    packet
        .get(idx)
        .and_then(parse)
        .ok_or(CoreError::InvalidField { event, field: name })
}

fn packet_of<'a>(value: &'a Value, event: &'static str) -> Result<&'a [Value], CoreError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or(CoreError::InvalidField {
            event,
            field: "packet",
        })
}

/// Position update: `[seq, session, client, entity, type, scale, qx, qy, qz, qw, px, py, pz, dirty]`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub seq: f64,
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub entity_id: EntityId,
    pub entity_type: i64,
    pub scale: f64,
    pub rotation: [f64; 4],
    pub position: [f64; 3],
    pub dirty: f64,
}

impl UpdateEvent {
    pub fn from_packet(packet: &[Value]) -> Result<Self, CoreError> {
        const EV: &str = names::UPDATE;
        if packet.len() != UPDATE_FIELDS {
            return Err(CoreError::Arity {
                event: EV,
                expected: UPDATE_FIELDS,
                actual: packet.len(),
            });
        }
        let num = |idx: usize, name: &'static str| field(packet, idx, EV, name, as_f64);
        Ok(Self {
            seq: num(0, "seq")?,
            session_id: field(packet, 1, EV, "session_id", SessionId::from_value)?,
            client_id: field(packet, 2, EV, "client_id", ClientId::from_value)?,
            entity_id: field(packet, 3, EV, "entity_id", EntityId::from_value)?,
            entity_type: field(packet, 4, EV, "entity_type", as_i64)?,
            scale: num(5, "scale")?,
            rotation: [num(6, "qx")?, num(7, "qy")?, num(8, "qz")?, num(9, "qw")?],
            position: [num(10, "px")?, num(11, "py")?, num(12, "pz")?],
            dirty: num(13, "dirty")?,
        })
    }

    pub fn to_packet(&self) -> Vec<Value> {
        let mut packet = Vec::with_capacity(UPDATE_FIELDS);
        packet.push(wire::number(self.seq));
        packet.push(self.session_id.to_value());
        packet.push(self.client_id.to_value());
        packet.push(Value::from(self.entity_id.0));
        packet.push(Value::from(self.entity_type));
        packet.push(wire::number(self.scale));
        packet.extend(self.rotation.iter().copied().map(wire::number));
        packet.extend(self.position.iter().copied().map(wire::number));
        packet.push(wire::number(self.dirty));
        packet
    }

    pub fn is_asset(&self) -> bool {
        self.entity_type == ASSET_ENTITY_TYPE
    }

    /// Copy of this update with client and entity ids moved into the replay
    /// range, unless it describes an asset. Ids that would overflow stay put.
    pub fn for_replay(&self, offset: i64) -> Self {
        let mut out = self.clone();
        if !self.is_asset() {
            out.client_id = self.client_id.offset(offset);
            out.entity_id = self.entity_id.0.checked_add(offset).map_or(self.entity_id, EntityId);
        }
        out
    }
}

impl TryFrom<&Value> for UpdateEvent {
    type Error = CoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Self::from_packet(packet_of(value, names::UPDATE)?)
    }
}

impl Serialize for UpdateEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_packet().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UpdateEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// Interaction codes carried in `interact` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionType {
    Look,
    LookEnd,
    RenderStart,
    RenderEnd,
    Grab,
    GrabEnd,
    SceneChange,
    /// Code 7 is reserved and never sent by current clients.
    Unset,
    Lock,
    Unlock,
}

impl InteractionType {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Look,
            1 => Self::LookEnd,
            2 => Self::RenderStart,
            3 => Self::RenderEnd,
            4 => Self::Grab,
            5 => Self::GrabEnd,
            6 => Self::SceneChange,
            7 => Self::Unset,
            8 => Self::Lock,
            9 => Self::Unlock,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Look => 0,
            Self::LookEnd => 1,
            Self::RenderStart => 2,
            Self::RenderEnd => 3,
            Self::Grab => 4,
            Self::GrabEnd => 5,
            Self::SceneChange => 6,
            Self::Unset => 7,
            Self::Lock => 8,
            Self::Unlock => 9,
        }
    }
}

/// Interaction: `[seq, session, client, source, target, type, dirty]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractEvent {
    pub seq: i64,
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub interaction_type: i64,
    pub dirty: i64,
}

impl InteractEvent {
    pub fn from_packet(packet: &[Value]) -> Result<Self, CoreError> {
        const EV: &str = names::INTERACT;
        if packet.len() != INTERACT_FIELDS {
            return Err(CoreError::Arity {
                event: EV,
                expected: INTERACT_FIELDS,
                actual: packet.len(),
            });
        }
        Ok(Self {
            seq: field(packet, 0, EV, "seq", as_i64)?,
            session_id: field(packet, 1, EV, "session_id", SessionId::from_value)?,
            client_id: field(packet, 2, EV, "client_id", ClientId::from_value)?,
            source_id: field(packet, 3, EV, "source_id", EntityId::from_value)?,
            target_id: field(packet, 4, EV, "target_id", EntityId::from_value)?,
            interaction_type: field(packet, 5, EV, "interaction_type", as_i64)?,
            dirty: field(packet, 6, EV, "dirty", as_i64)?,
        })
    }

    pub fn to_packet(&self) -> Vec<Value> {
        vec![
            Value::from(self.seq),
            self.session_id.to_value(),
            self.client_id.to_value(),
            Value::from(self.source_id.0),
            Value::from(self.target_id.0),
            Value::from(self.interaction_type),
            Value::from(self.dirty),
        ]
    }

    pub fn kind(&self) -> Option<InteractionType> {
        InteractionType::from_code(self.interaction_type)
    }
}

impl TryFrom<&Value> for InteractEvent {
    type Error = CoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Self::from_packet(packet_of(value, names::INTERACT)?)
    }
}

impl Serialize for InteractEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_packet().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InteractEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// Inner `message` object: a type tag plus arbitrary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generic envelope `{session_id, client_id, message: {type, data}}`.
///
/// Unknown keys are preserved so the relay forwards the object unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub message: MessageBody,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageEvent {
    pub const SYNC: &'static str = "sync";
    pub const INTERACTION: &'static str = "interaction";

    /// The embedded packet, either a JSON array or a string holding one.
    pub fn embedded_packet(&self) -> Result<Vec<Value>, CoreError> {
        match &self.message.data {
            Value::Array(items) => Ok(items.clone()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Array(items) => Ok(items),
                other => Err(CoreError::Malformed(format!(
                    "embedded payload is not an array: {other}"
                ))),
            },
            other => Err(CoreError::Malformed(format!(
                "embedded payload is not an array: {other}"
            ))),
        }
    }

    pub fn is_sync(&self) -> bool {
        self.message.kind == Self::SYNC
    }

    pub fn is_interaction(&self) -> bool {
        self.message.kind == Self::INTERACTION
    }
}

/// Opaque drawing packet; only `[1]` (session) and `[2]` (client) are read.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawEvent(pub Vec<Value>);

impl DrawEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        self.0.get(1).and_then(SessionId::from_value)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.0.get(2).and_then(ClientId::from_value)
    }
}

/// `join` payload `[session_id, client_id]`. Either id may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub session_id: Option<SessionId>,
    pub client_id: Option<ClientId>,
}

impl JoinRequest {
    pub fn from_value(value: &Value) -> Self {
        let at = |idx: usize| value.as_array().and_then(|a| a.get(idx));
        Self {
            session_id: at(0).and_then(SessionId::from_value),
            client_id: at(1).and_then(ClientId::from_value),
        }
    }
}

/// `state` request. Version 2 returns full entity objects; anything else is version 1.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRequest {
    pub session_id: Option<SessionId>,
    pub client_id: Option<ClientId>,
    pub version: Option<i64>,
}

impl StateRequest {
    pub fn from_value(value: &Value) -> Self {
        Self {
            session_id: value.get("session_id").and_then(SessionId::from_value),
            client_id: value.get("client_id").and_then(ClientId::from_value),
            version: value.get("version").and_then(as_i64),
        }
    }
}

/// `playback` request. `playback_id` is `"<session_id>_<recordingStart>"`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub session_id: Option<SessionId>,
    pub client_id: Option<ClientId>,
    pub playback_id: Option<String>,
}

impl PlaybackRequest {
    pub fn from_value(value: &Value) -> Self {
        Self {
            session_id: value.get("session_id").and_then(SessionId::from_value),
            client_id: value.get("client_id").and_then(ClientId::from_value),
            playback_id: value
                .get("playback_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        }
    }
}

/// Every event a connection may send.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Join(JoinRequest),
    State(StateRequest),
    Draw(DrawEvent),
    Message(MessageEvent),
    Update(UpdateEvent),
    Interact(InteractEvent),
    StartRecording(Option<SessionId>),
    EndRecording(Option<SessionId>),
    Playback(PlaybackRequest),
    SessionInfo(Option<SessionId>),
}

impl InboundEvent {
    pub fn parse(event: &str, data: Value) -> Result<Self, CoreError> {
        Ok(match event {
            names::JOIN => Self::Join(JoinRequest::from_value(&data)),
            names::STATE => Self::State(StateRequest::from_value(&data)),
            names::DRAW => match data {
                Value::Array(items) => Self::Draw(DrawEvent(items)),
                _ => {
                    return Err(CoreError::InvalidField {
                        event: names::DRAW,
                        field: "packet",
                    })
                }
            },
            names::MESSAGE => Self::Message(serde_json::from_value(data)?),
            names::UPDATE => Self::Update(UpdateEvent::try_from(&data)?),
            names::INTERACT => Self::Interact(InteractEvent::try_from(&data)?),
            names::START_RECORDING => Self::StartRecording(SessionId::from_value(&data)),
            names::END_RECORDING => Self::EndRecording(SessionId::from_value(&data)),
            names::PLAYBACK => Self::Playback(PlaybackRequest::from_value(&data)),
            names::SESSION_INFO => Self::SessionInfo(SessionId::from_value(&data)),
            other => return Err(CoreError::UnknownEvent(other.to_owned())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => names::JOIN,
            Self::State(_) => names::STATE,
            Self::Draw(_) => names::DRAW,
            Self::Message(_) => names::MESSAGE,
            Self::Update(_) => names::UPDATE,
            Self::Interact(_) => names::INTERACT,
            Self::StartRecording(_) => names::START_RECORDING,
            Self::EndRecording(_) => names::END_RECORDING,
            Self::Playback(_) => names::PLAYBACK,
            Self::SessionInfo(_) => names::SESSION_INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_packet() -> Value {
        json!([0, 5, 2, 1, 3, 1, 0, 1, 2, 3, 0, 0, 0, 1])
    }

    #[test]
    fn update_parses_positionally() {
        let ev = UpdateEvent::try_from(&update_packet()).unwrap();
        assert_eq!(ev.session_id, SessionId::number(5));
        assert_eq!(ev.client_id, ClientId::number(2));
        assert_eq!(ev.entity_id, EntityId(1));
        assert!(ev.is_asset());
        assert_eq!(ev.rotation, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn update_reencodes_identically() {
        let packet = update_packet();
        let ev = UpdateEvent::try_from(&packet).unwrap();
        assert_eq!(serde_json::to_value(&ev).unwrap(), packet);
    }

    #[test]
    fn update_keeps_fractional_values() {
        let packet = json!([10, "s", "c", 4, 1, 0.5, 0, 0, 0, 1, 1.25, -2.5, 3, 0]);
        let ev = UpdateEvent::try_from(&packet).unwrap();
        assert_eq!(serde_json::to_value(&ev).unwrap(), packet);
    }

    #[test]
    fn update_rejects_wrong_arity() {
        let err = UpdateEvent::try_from(&json!([0, 1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::Arity { actual: 3, .. }));
    }

    #[test]
    fn update_rejects_missing_client() {
        let err =
            UpdateEvent::try_from(&json!([0, 5, 0, 1, 3, 1, 0, 1, 2, 3, 0, 0, 0, 1])).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidField {
                field: "client_id",
                ..
            }
        ));
    }

    #[test]
    fn replay_remaps_non_assets_only() {
        let mut ev = UpdateEvent::try_from(&update_packet()).unwrap();
        assert_eq!(ev.for_replay(90_000), ev);

        ev.entity_type = 1;
        let replay = ev.for_replay(90_000);
        assert_eq!(replay.client_id, ClientId::number(90_002));
        assert_eq!(replay.entity_id, EntityId(90_001));
    }

    #[test]
    fn interact_parses_and_classifies() {
        let ev = InteractEvent::try_from(&json!([0, 5, 2, 11, 12, 8, 0])).unwrap();
        assert_eq!(ev.target_id, EntityId(12));
        assert_eq!(ev.kind(), Some(InteractionType::Lock));
        assert_eq!(serde_json::to_value(&ev).unwrap(), json!([0, 5, 2, 11, 12, 8, 0]));
    }

    #[test]
    fn interaction_codes_roundtrip() {
        for code in 0..=9 {
            assert_eq!(InteractionType::from_code(code).unwrap().code(), code);
        }
        assert!(InteractionType::from_code(10).is_none());
    }

    #[test]
    fn message_preserves_unknown_keys() {
        let raw = json!({
            "session_id": 5,
            "client_id": 2,
            "message": {"type": "custom", "data": {"a": 1}, "ts": 99},
            "extra": true
        });
        let ev: MessageEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(ev.message.kind, "custom");
        assert_eq!(serde_json::to_value(&ev).unwrap(), raw);
    }

    #[test]
    fn message_embedded_packet_accepts_string_or_array() {
        let mut ev: MessageEvent = serde_json::from_value(json!({
            "session_id": 5,
            "client_id": 2,
            "message": {"type": "sync", "data": "[1,2,3]"}
        }))
        .unwrap();
        assert!(ev.is_sync());
        assert_eq!(ev.embedded_packet().unwrap(), vec![json!(1), json!(2), json!(3)]);

        ev.message.data = json!([4]);
        assert_eq!(ev.embedded_packet().unwrap(), vec![json!(4)]);

        ev.message.data = json!("not json");
        assert!(ev.embedded_packet().is_err());
    }

    #[test]
    fn join_tolerates_missing_ids() {
        let req = JoinRequest::from_value(&json!([5]));
        assert_eq!(req.session_id, Some(SessionId::number(5)));
        assert!(req.client_id.is_none());
    }

    #[test]
    fn inbound_parse_dispatches_by_name() {
        let ev = InboundEvent::parse("update", update_packet()).unwrap();
        assert_eq!(ev.name(), names::UPDATE);

        let ev = InboundEvent::parse("start_recording", json!(5)).unwrap();
        assert_eq!(ev, InboundEvent::StartRecording(Some(SessionId::number(5))));

        let ev = InboundEvent::parse(
            "state",
            json!({"session_id": 5, "client_id": 2, "version": 2}),
        )
        .unwrap();
        assert!(matches!(ev, InboundEvent::State(StateRequest { version: Some(2), .. })));

        assert!(matches!(
            InboundEvent::parse("bogus", Value::Null),
            Err(CoreError::UnknownEvent(_))
        ));
    }

    #[test]
    fn playback_request_reads_fields() {
        let req = PlaybackRequest::from_value(&json!({
            "client_id": 1, "session_id": 5, "playback_id": "5_1700000000000"
        }));
        assert_eq!(req.playback_id.as_deref(), Some("5_1700000000000"));
    }
}
