//! On-disk capture store.
//!
//! Layout: `<root>/<session_id>/<recordingStart>/` holding either a `data`
//! file of JSON lines or the `pos`/`int` fixed-width streams. Every write
//! appends, so intermediate flushes and the final flush compose.

use std::path::{Path, PathBuf};

use komodo_core::{CaptureId, CaptureRecord, CapturedEvent, InteractEvent, StreamKind, UpdateEvent};
use komodo_settings::CaptureFormat;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::codec;
use crate::error::StoreError;

pub const RECORDS_FILE: &str = "data";
pub const POSITION_FILE: &str = "pos";
pub const INTERACTION_FILE: &str = "int";

/// A capture split into its two replay streams, each in append order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CaptureStreams {
    pub position: Vec<CaptureRecord>,
    pub interaction: Vec<CaptureRecord>,
}

impl CaptureStreams {
    fn push(&mut self, record: CaptureRecord) {
        match record.payload.stream() {
            StreamKind::Position => self.position.push(record),
            StreamKind::Interaction => self.interaction.push(record),
        }
    }

    pub fn len(&self) -> usize {
        self.position.len() + self.interaction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct CaptureStore {
    root: PathBuf,
    format: CaptureFormat,
}

/// Bytes kept as-is in a session directory name; everything else is
/// percent-encoded, so distinct session ids map to distinct directories.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

fn path_component(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_SAFE).to_string()
}

/// A failed append, carrying the records that did not reach disk.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({} records unwritten)", .unwritten.len())]
pub struct AppendError {
    pub error: StoreError,
    pub unwritten: Vec<CaptureRecord>,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>, format: CaptureFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn capture_dir(&self, id: &CaptureId) -> PathBuf {
        self.root
            .join(path_component(&id.session_id.to_string()))
            .join(id.start.to_string())
    }

    pub async fn create(&self, id: &CaptureId) -> Result<PathBuf, StoreError> {
        let dir = self.capture_dir(id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Append records in the configured format. Returns how many were written.
    ///
    /// In the binary layout the `pos` stream is written before `int`; if only
    /// `int` fails, just its records come back as unwritten.
    pub async fn append(&self, id: &CaptureId, records: &[CaptureRecord]) -> Result<usize, AppendError> {
        if records.is_empty() {
            return Ok(0);
        }
        let none_written = |error: StoreError| AppendError {
            error,
            unwritten: records.to_vec(),
        };
        let dir = self.create(id).await.map_err(none_written)?;
        let written = match self.format {
            CaptureFormat::Records => {
                let mut out = String::new();
                for record in records {
                    let line = serde_json::to_string(record).map_err(|e| none_written(e.into()))?;
                    out.push_str(&line);
                    out.push('\n');
                }
                append_file(&dir.join(RECORDS_FILE), out.as_bytes())
                    .await
                    .map_err(none_written)?;
                records.len()
            }
            CaptureFormat::Binary => {
                let batch = encode_binary(records);
                if !batch.pos.is_empty() {
                    append_file(&dir.join(POSITION_FILE), &batch.pos)
                        .await
                        .map_err(none_written)?;
                }
                if !batch.int.is_empty() {
                    append_file(&dir.join(INTERACTION_FILE), &batch.int)
                        .await
                        .map_err(|error| AppendError {
                            error,
                            unwritten: batch.interactions,
                        })?;
                }
                batch.written
            }
        };
        debug!(capture_id = %id, written, "capture records appended");
        Ok(written)
    }

    /// Read a capture back, whichever layout it was written in.
    pub async fn read(&self, id: &CaptureId) -> Result<CaptureStreams, StoreError> {
        let dir = self.capture_dir(id);
        let records_path = dir.join(RECORDS_FILE);
        if fs::try_exists(&records_path).await? {
            return read_records(&records_path).await;
        }

        let pos_path = dir.join(POSITION_FILE);
        let int_path = dir.join(INTERACTION_FILE);
        let has_pos = fs::try_exists(&pos_path).await?;
        let has_int = fs::try_exists(&int_path).await?;
        if !has_pos && !has_int {
            return Err(StoreError::NotFound(format!("capture {id}")));
        }

        let mut streams = CaptureStreams::default();
        if has_pos {
            streams.position = codec::decode_positions(&fs::read(&pos_path).await?)?;
        }
        if has_int {
            streams.interaction = codec::decode_interactions(&fs::read(&int_path).await?)?;
        }
        Ok(streams)
    }
}

async fn append_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

async fn read_records(path: &Path) -> Result<CaptureStreams, StoreError> {
    let content = fs::read_to_string(path).await?;
    let mut streams = CaptureStreams::default();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: CaptureRecord = serde_json::from_str(line)
            .map_err(|e| StoreError::Corrupt(format!("line {}: {e}", line_no + 1)))?;
        streams.push(record);
    }
    Ok(streams)
}

enum Binary {
    Position(UpdateEvent),
    Interaction(InteractEvent),
}

fn binary_payload(payload: &CapturedEvent) -> Option<Binary> {
    match payload {
        CapturedEvent::Update(u) => Some(Binary::Position(u.clone())),
        CapturedEvent::Interact(i) => Some(Binary::Interaction(i.clone())),
        CapturedEvent::Message(m) => {
            let packet = m.embedded_packet().ok()?;
            if m.is_sync() {
                UpdateEvent::from_packet(&packet).ok().map(Binary::Position)
            } else if m.is_interaction() {
                InteractEvent::from_packet(&packet).ok().map(Binary::Interaction)
            } else {
                None
            }
        }
    }
}

struct BinaryBatch {
    pos: Vec<u8>,
    int: Vec<u8>,
    /// Records encoded into `int`, in order.
    interactions: Vec<CaptureRecord>,
    written: usize,
}

fn encode_binary(records: &[CaptureRecord]) -> BinaryBatch {
    let mut batch = BinaryBatch {
        pos: Vec::new(),
        int: Vec::new(),
        interactions: Vec::new(),
        written: 0,
    };
    for record in records {
        let result = match binary_payload(&record.payload) {
            Some(Binary::Position(u)) => codec::encode_position(&mut batch.pos, record.seq, &u),
            Some(Binary::Interaction(i)) => codec::encode_interaction(&mut batch.int, record.seq, &i)
                .map(|()| batch.interactions.push(record.clone())),
            None => {
                debug!(seq = record.seq, event = record.payload.name(), "record has no binary form, skipping");
                continue;
            }
        };
        match result {
            Ok(()) => batch.written += 1,
            Err(e) => warn!(seq = record.seq, error = %e, "skipping unencodable capture record"),
        }
    }
    batch
}
