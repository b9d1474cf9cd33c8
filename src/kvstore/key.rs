//! Store Keys
//!
//! Callers address entries with arbitrary key values. Every key is projected
//! onto a canonical string before it reaches a tier; two keys with the same
//! projection address the same entry, nothing else is compared.

use std::fmt;

use crate::error::{Error, Result};

/// Caller-supplied key.
///
/// Integer, string and display-projected keys normalize to their string form.
/// Floats, nil and structured values have no unambiguous projection and are
/// rejected by [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Plain string key
    Str(String),
    /// Any signed integer width
    Signed(i128),
    /// Any unsigned integer width
    Unsigned(u128),
    /// Value captured through its `Display` projection
    Display(String),
    /// Floating point value (never normalizable)
    Float(f64),
    /// Absent value
    Nil,
    /// Structured value such as a list, map or record
    Structured(serde_json::Value),
}

impl Key {
    /// Capture a key through its `Display` implementation.
    pub fn display(value: impl fmt::Display) -> Self {
        Key::Display(value.to_string())
    }

    /// Convert a dynamically typed value into a key.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Key::Nil,
            serde_json::Value::String(s) => Key::Str(s),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Key::Unsigned(u as u128)
                } else if let Some(i) = n.as_i64() {
                    Key::Signed(i as i128)
                } else {
                    Key::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            other => Key::Structured(other),
        }
    }

    /// Name of the key's kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Key::Str(_) => "string",
            Key::Signed(_) => "signed integer",
            Key::Unsigned(_) => "unsigned integer",
            Key::Display(_) => "display",
            Key::Float(_) => "float",
            Key::Nil => "nil",
            Key::Structured(serde_json::Value::Array(_)) => "slice",
            Key::Structured(serde_json::Value::Object(_)) => "map",
            Key::Structured(serde_json::Value::Bool(_)) => "bool",
            Key::Structured(_) => "structured",
        }
    }

    /// Canonical string of this key
    pub fn normalize(&self) -> Result<String> {
        normalize(self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(s) | Key::Display(s) => f.write_str(s),
            Key::Signed(i) => write!(f, "{}", i),
            Key::Unsigned(u) => write!(f, "{}", u),
            Key::Float(v) => write!(f, "{}", v),
            Key::Nil => f.write_str("<nil>"),
            Key::Structured(v) => write!(f, "{}", v),
        }
    }
}

/// Project a key onto its canonical string.
pub fn normalize(key: &Key) -> Result<String> {
    match key {
        Key::Str(s) | Key::Display(s) => Ok(s.clone()),
        Key::Signed(i) => Ok(i.to_string()),
        Key::Unsigned(u) => Ok(u.to_string()),
        Key::Float(_) | Key::Nil | Key::Structured(_) => Err(Error::UnsupportedKeyType {
            key: key.to_string(),
            kind: key.kind(),
        }),
    }
}

/// Normalize a list of keys, failing on the first key that can not be normalized.
pub fn normalize_all(keys: &[Key]) -> Result<Vec<String>> {
    keys.iter()
        .map(|key| {
            normalize(key).map_err(|e| Error::InvalidKey {
                key: key.to_string(),
                source: Box::new(e),
            })
        })
        .collect()
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

macro_rules! impl_signed_key {
    ($($t:ty),*) => {
        $(impl From<$t> for Key {
            fn from(v: $t) -> Self {
                Key::Signed(v as i128)
            }
        })*
    };
}

macro_rules! impl_unsigned_key {
    ($($t:ty),*) => {
        $(impl From<$t> for Key {
            fn from(v: $t) -> Self {
                Key::Unsigned(v as u128)
            }
        })*
    };
}

impl_signed_key!(i8, i16, i32, i64, i128, isize);
impl_unsigned_key!(u8, u16, u32, u64, u128, usize);

impl From<f32> for Key {
    fn from(v: f32) -> Self {
        Key::Float(v as f64)
    }
}

impl From<f64> for Key {
    fn from(v: f64) -> Self {
        Key::Float(v)
    }
}

impl From<uuid::Uuid> for Key {
    fn from(id: uuid::Uuid) -> Self {
        Key::Display(id.to_string())
    }
}

impl<K: Into<Key>> From<Option<K>> for Key {
    fn from(v: Option<K>) -> Self {
        v.map(Into::into).unwrap_or(Key::Nil)
    }
}

// =============================================================================
// Tests
// =============================================================================
