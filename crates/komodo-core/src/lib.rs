//! # komodo-core
//!
//! Foundation types for the Komodo relay: externally supplied ids, typed
//! wire events, the per-session entity store, the session record and the
//! capture record format.
//!
//! Nothing in this crate performs I/O.

#![deny(unsafe_code)]

pub mod capture;
pub mod entity;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;
pub mod wire;

pub use capture::{CaptureId, CaptureRecord, CapturedEvent, StreamKind};
pub use entity::{Entity, EntityStore, InteractionEffect};
pub use errors::CoreError;
pub use events::{
    DrawEvent, InboundEvent, InteractEvent, InteractionType, JoinRequest, MessageBody,
    MessageEvent, PlaybackRequest, StateRequest, UpdateEvent, ASSET_ENTITY_TYPE,
};
pub use ids::{ClientId, ConnectionId, EntityId, ExternalId, SessionId};
pub use session::{Session, SessionInfo, StateSnapshot};
pub use wire::{Envelope, OutboundEvent};
