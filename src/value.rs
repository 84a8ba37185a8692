//! Value model shared by every backend.
//!
//! A stored entry is either a scalar [`Value`] or an ordered list of scalars.
//! [`Body`] carries the two shapes and [`Kind`] names them the way the
//! back-tier `kind` column does (`'value'` / `'list'`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// JSON object key used to carry raw bytes through JSON surfaces.
pub const BYTES_TAG: &str = "$bytes";

/// A scalar value.
///
/// `Map` and `Array` are structured scalars: they are stored and compared as
/// one element, never spliced into a list. Equality is deep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the integer a counter operation would read from this value.
    ///
    /// Only integers count. Numeric strings are rejected so that every
    /// backend, including those with native counters, agrees.
    pub fn as_counter(&self) -> Option<i64> {
        self.as_i64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// False when a NaN or infinity appears anywhere inside. Such floats
    /// have no JSON form and would persist as `null`.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::Array(items) => items.iter().all(Self::is_finite),
            Self::Map(map) => map.values().all(Self::is_finite),
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::String(_) | Self::Bytes(_) => true,
        }
    }

    /// Converts a JSON value into a scalar.
    ///
    /// Objects of the form `{"$bytes": "<hex>"}` decode to [`Value::Bytes`];
    /// a malformed hex payload is kept as a plain map.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            },
            serde_json::Value::Object(map) => {
                if map.len() == 1
                    && let Some(serde_json::Value::String(encoded)) = map.get(BYTES_TAG)
                    && let Ok(bytes) = hex::decode(encoded)
                {
                    return Self::Bytes(bytes);
                }
                Self::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, Self::from_json(v)))
                        .collect(),
                )
            },
        }
    }

    /// Converts the scalar into JSON. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::json!({ BYTES_TAG: hex::encode(b) }),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            },
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// The two shapes an entry body can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Value,
    List,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::List => "list",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "value" => Ok(Self::Value),
            "list" => Ok(Self::List),
            other => anyhow::bail!("unknown entry kind '{other}'"),
        }
    }
}

/// The body bound to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Scalar(Value),
    List(Vec<Value>),
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Scalar(_) => Kind::Value,
            Self::List(_) => Kind::List,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            Self::Scalar(_) => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::List(_) => None,
        }
    }

    /// See [`Value::is_finite`].
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Scalar(v) => v.is_finite(),
            Self::List(items) => items.iter().all(Value::is_finite),
        }
    }

    /// Encodes the body payload (without its kind) as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error for non-finite floats or if serialization fails.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(self.is_finite(), "non-finite float cannot be encoded");
        match self {
            Self::Scalar(v) => serde_json::to_vec(v).context("Failed to encode scalar body"),
            Self::List(items) => serde_json::to_vec(items).context("Failed to encode list body"),
        }
    }

    /// Decodes a payload produced by [`Body::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `kind`.
    pub fn decode(kind: Kind, bytes: &[u8]) -> anyhow::Result<Self> {
        match kind {
            Kind::Value => serde_json::from_slice(bytes)
                .map(Self::Scalar)
                .context("Failed to decode scalar body"),
            Kind::List => serde_json::from_slice(bytes)
                .map(Self::List)
                .context("Failed to decode list body"),
        }
    }

    /// Converts JSON into a body: top-level arrays become lists.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Value::from_json).collect())
            },
            other => Self::Scalar(Value::from_json(other)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Scalar(v) => v.to_json(),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<Value>> for Body {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self::Scalar(s.into())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Scalar(s.into())
    }
}

impl From<i64> for Body {
    fn from(i: i64) -> Self {
        Self::Scalar(i.into())
    }
}

impl From<i32> for Body {
    fn from(i: i32) -> Self {
        Self::Scalar(i.into())
    }
}

impl From<f64> for Body {
    fn from(f: f64) -> Self {
        Self::Scalar(f.into())
    }
}

impl From<bool> for Body {
    fn from(b: bool) -> Self {
        Self::Scalar(b.into())
    }
}
