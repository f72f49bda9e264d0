/// Errors raised while turning wire payloads into typed records.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("expected {expected} fields in {event} packet, got {actual}")]
    Arity {
        event: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid field {field} in {event} packet")]
    InvalidField {
        event: &'static str,
        field: &'static str,
    },

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid capture id: {0}")]
    InvalidCaptureId(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Malformed(e.to_string())
    }
}
