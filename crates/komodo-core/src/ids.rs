use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// An id supplied by clients: either a number or a string.
///
/// Integral floats (`7.0`) are accepted as numbers. Zero and the empty
/// string are treated as absent, matching how clients signal "no id".
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ExternalId {
    Number(i64),
    Name(String),
}

impl ExternalId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                let n = match n.as_i64() {
                    Some(i) => i,
                    None => {
                        let f = n.as_f64()?;
                        if f.fract() != 0.0 || !f.is_finite() {
                            return None;
                        }
                        f as i64
                    }
                };
                (n != 0).then_some(Self::Number(n))
            }
            Value::String(s) if !s.is_empty() => Some(Self::Name(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::Name(s) => Value::String(s.clone()),
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Name(_) => None,
        }
    }

    /// Shift a numeric id by `offset`. Named ids, and numbers the shift
    /// would overflow, are returned unchanged.
    pub fn offset(&self, offset: i64) -> Self {
        match self {
            Self::Number(n) => Self::Number(n.checked_add(offset).unwrap_or(*n)),
            Self::Name(s) => Self::Name(s.clone()),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(s) => f.write_str(s),
        }
    }
}

impl Serialize for ExternalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_i64(*n),
            Self::Name(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
    }
}

macro_rules! external_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ExternalId);

        impl $name {
            pub fn from_value(value: &Value) -> Option<Self> {
                ExternalId::from_value(value).map(Self)
            }

            pub fn number(n: i64) -> Self {
                Self(ExternalId::Number(n))
            }

            pub fn name(s: impl Into<String>) -> Self {
                Self(ExternalId::Name(s.into()))
            }

            pub fn as_external(&self) -> &ExternalId {
                &self.0
            }

            pub fn to_value(&self) -> Value {
                self.0.to_value()
            }

            pub fn offset(&self, offset: i64) -> Self {
                Self(self.0.offset(offset))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $name {
            fn from(n: i64) -> Self {
                Self::number(n)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::name(s)
            }
        }
    };
}

external_id!(SessionId);
external_id!(ClientId);

/// Server-assigned id of one live transport connection.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally supplied entity id. Entity ids are always numeric.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f.is_finite()).then_some(f as i64)
            }),
            _ => None,
        }
        .map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
