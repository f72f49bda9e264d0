//! Capture record types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::CoreError;
use crate::events::{names, InteractEvent, MessageEvent, UpdateEvent};
use crate::ids::SessionId;

/// Identifies one recording: `"<session_id>_<recordingStart>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureId {
    pub session_id: SessionId,
    /// Recording start, epoch milliseconds.
    pub start: i64,
}

impl CaptureId {
    pub fn new(session_id: SessionId, start: i64) -> Self {
        Self { session_id, start }
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.session_id, self.start)
    }
}

impl FromStr for CaptureId {
    type Err = CoreError;

    /// Splits on the last underscore so named sessions may contain one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidCaptureId(s.to_owned());
        let (session, start) = s.rsplit_once('_').ok_or_else(invalid)?;
        let start: i64 = start.parse().map_err(|_| invalid())?;
        let session_id = match session.parse::<i64>() {
            Ok(0) => return Err(invalid()),
            Ok(n) => SessionId::number(n),
            Err(_) if !session.is_empty() => SessionId::name(session),
            Err(_) => return Err(invalid()),
        };
        Ok(Self { session_id, start })
    }
}

/// Which playback stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Position,
    Interaction,
}

/// A relayed event as it was received.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedEvent {
    Update(UpdateEvent),
    Interact(InteractEvent),
    Message(MessageEvent),
}

impl CapturedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update(_) => names::UPDATE,
            Self::Interact(_) => names::INTERACT,
            Self::Message(_) => names::MESSAGE,
        }
    }

    /// Interaction records and `interaction` messages share a stream;
    /// everything else replays on the position stream.
    pub fn stream(&self) -> StreamKind {
        match self {
            Self::Interact(_) => StreamKind::Interaction,
            Self::Message(m) if m.is_interaction() => StreamKind::Interaction,
            _ => StreamKind::Position,
        }
    }

    pub fn data(&self) -> Value {
        let value = match self {
            Self::Update(u) => serde_json::to_value(u),
            Self::Interact(i) => serde_json::to_value(i),
            Self::Message(m) => serde_json::to_value(m),
        };
        value.unwrap_or(Value::Null)
    }

    pub fn from_parts(event: &str, data: &Value) -> Result<Self, CoreError> {
        Ok(match event {
            names::UPDATE => Self::Update(UpdateEvent::try_from(data)?),
            names::INTERACT => Self::Interact(InteractEvent::try_from(data)?),
            names::MESSAGE => Self::Message(serde_json::from_value(data.clone())?),
            other => return Err(CoreError::UnknownEvent(other.to_owned())),
        })
    }
}

/// One buffered event and its offset from recording start.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    /// Milliseconds between recording start and server arrival.
    pub seq: u64,
    pub payload: CapturedEvent,
}

#[derive(Serialize, Deserialize)]
struct RecordLine {
    seq: u64,
    event: String,
    data: Value,
}

impl Serialize for CaptureRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RecordLine {
            seq: self.seq,
            event: self.payload.name().to_owned(),
            data: self.payload.data(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CaptureRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let line = RecordLine::deserialize(deserializer)?;
        let payload =
            CapturedEvent::from_parts(&line.event, &line.data).map_err(serde::de::Error::custom)?;
        Ok(Self {
            seq: line.seq,
            payload,
        })
    }
}
