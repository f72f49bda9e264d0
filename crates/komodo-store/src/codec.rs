//! Fixed-width little-endian capture records.
//!
//! `pos` records are 14 × f32 and `int` records are 7 × i32, laid out like
//! the wire packets with field 0 replaced by the relative sequence number.
//! Only numeric session and client ids fit this encoding.

use bytes::{Buf, BufMut};
use komodo_core::events::{INTERACT_FIELDS, UPDATE_FIELDS};
use komodo_core::{
    CaptureRecord, CapturedEvent, ClientId, EntityId, InteractEvent, SessionId, UpdateEvent,
};
use serde_json::Value;

use crate::error::StoreError;

pub const POS_RECORD_BYTES: usize = UPDATE_FIELDS * 4;
pub const INT_RECORD_BYTES: usize = INTERACT_FIELDS * 4;

fn numeric_ids(session: &SessionId, client: &ClientId) -> Result<(i64, i64), StoreError> {
    match (session.as_external().as_number(), client.as_external().as_number()) {
        (Some(s), Some(c)) => Ok((s, c)),
        _ => Err(StoreError::Serialization(format!(
            "binary captures need numeric ids, got session {session} client {client}"
        ))),
    }
}

pub fn encode_position(buf: &mut impl BufMut, seq: u64, update: &UpdateEvent) -> Result<(), StoreError> {
    let (session, client) = numeric_ids(&update.session_id, &update.client_id)?;
    buf.put_f32_le(seq as f32);
    buf.put_f32_le(session as f32);
    buf.put_f32_le(client as f32);
    buf.put_f32_le(update.entity_id.0 as f32);
    buf.put_f32_le(update.entity_type as f32);
    buf.put_f32_le(update.scale as f32);
    for v in update.rotation.iter().chain(update.position.iter()) {
        buf.put_f32_le(*v as f32);
    }
    buf.put_f32_le(update.dirty as f32);
    Ok(())
}

pub fn encode_interaction(
    buf: &mut impl BufMut,
    seq: u64,
    interaction: &InteractEvent,
) -> Result<(), StoreError> {
    let (session, client) = numeric_ids(&interaction.session_id, &interaction.client_id)?;
    let narrow = |v: i64| {
        i32::try_from(v).map_err(|_| StoreError::Serialization(format!("{v} does not fit in i32")))
    };
    let fields = [
        narrow(seq as i64)?,
        narrow(session)?,
        narrow(client)?,
        narrow(interaction.source_id.0)?,
        narrow(interaction.target_id.0)?,
        narrow(interaction.interaction_type)?,
        narrow(interaction.dirty)?,
    ];
    for v in fields {
        buf.put_i32_le(v);
    }
    Ok(())
}

fn corrupt(what: &str, idx: usize) -> StoreError {
    StoreError::Corrupt(format!("record {idx}: invalid {what}"))
}

/// Decode a whole `pos` stream. A trailing partial record is ignored.
pub fn decode_positions(mut buf: &[u8]) -> Result<Vec<CaptureRecord>, StoreError> {
    let mut out = Vec::with_capacity(buf.len() / POS_RECORD_BYTES);
    while buf.remaining() >= POS_RECORD_BYTES {
        let idx = out.len();
        let mut f = [0f64; UPDATE_FIELDS];
        for slot in f.iter_mut() {
            *slot = f64::from(buf.get_f32_le());
        }
        let session_id =
            SessionId::from_value(&Value::from(f[1] as i64)).ok_or_else(|| corrupt("session", idx))?;
        let client_id =
            ClientId::from_value(&Value::from(f[2] as i64)).ok_or_else(|| corrupt("client", idx))?;
        let update = UpdateEvent {
            seq: f[0],
            session_id,
            client_id,
            entity_id: EntityId(f[3] as i64),
            entity_type: f[4] as i64,
            scale: f[5],
            rotation: [f[6], f[7], f[8], f[9]],
            position: [f[10], f[11], f[12]],
            dirty: f[13],
        };
        out.push(CaptureRecord {
            seq: f[0].max(0.0) as u64,
            payload: CapturedEvent::Update(update),
        });
    }
    if buf.has_remaining() {
        tracing::warn!(bytes = buf.remaining(), "ignoring partial position record");
    }
    Ok(out)
}

/// Decode a whole `int` stream. A trailing partial record is ignored.
pub fn decode_interactions(mut buf: &[u8]) -> Result<Vec<CaptureRecord>, StoreError> {
    let mut out = Vec::with_capacity(buf.len() / INT_RECORD_BYTES);
    while buf.remaining() >= INT_RECORD_BYTES {
        let idx = out.len();
        let mut f = [0i64; INTERACT_FIELDS];
        for slot in f.iter_mut() {
            *slot = i64::from(buf.get_i32_le());
        }
        let session_id =
            SessionId::from_value(&Value::from(f[1])).ok_or_else(|| corrupt("session", idx))?;
        let client_id =
            ClientId::from_value(&Value::from(f[2])).ok_or_else(|| corrupt("client", idx))?;
        let interaction = InteractEvent {
            seq: f[0],
            session_id,
            client_id,
            source_id: EntityId(f[3]),
            target_id: EntityId(f[4]),
            interaction_type: f[5],
            dirty: f[6],
        };
        out.push(CaptureRecord {
            seq: f[0].max(0) as u64,
            payload: CapturedEvent::Interact(interaction),
        });
    }
    if buf.has_remaining() {
        tracing::warn!(bytes = buf.remaining(), "ignoring partial interaction record");
    }
    Ok(out)
}
