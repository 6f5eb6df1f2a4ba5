//! Value codec for crossing the isolation boundary.
//!
//! The dispatcher never looks inside an [`EncodedValue`]; only a [`Codec`]
//! produces or consumes its bytes. Round-tripping (`decode(encode(v)) == v`)
//! is the codec's contract.

use std::fmt;

use crate::error::{Error, Result};
use crate::value::Value;

/// Opaque encoded bytes produced by a [`Codec`].
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct EncodedValue(Vec<u8>);

impl EncodedValue {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedValue({} bytes)", self.0.len())
    }
}

/// Encode/decode service shared by every worker of a batch.
pub trait Codec: Send + Sync {
    /// Encode a value into opaque bytes.
    fn encode(&self, value: &Value) -> Result<EncodedValue>;

    /// Decode opaque bytes back into a value.
    fn decode(&self, encoded: &EncodedValue) -> Result<Value>;
}

/// Default codec: serde_json over the derived [`Value`] representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<EncodedValue> {
        // JSON has no representation for NaN or infinities.
        if let Some(bad) = find_non_finite(value) {
            return Err(Error::Encode(format!(
                "float {} cannot be represented",
                bad
            )));
        }
        serde_json::to_vec(value)
            .map(EncodedValue)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode(&self, encoded: &EncodedValue) -> Result<Value> {
        serde_json::from_slice(encoded.as_bytes()).map_err(|e| Error::Decode(e.to_string()))
    }
}

fn find_non_finite(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) if !f.is_finite() => Some(*f),
        Value::List(items) => items.iter().find_map(find_non_finite),
        Value::Map(map) => map.values().find_map(find_non_finite),
        _ => None,
    }
}
