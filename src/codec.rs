//! # Serializer Boundary
//!
//! The store treats event payloads as opaque bytes; this module is the seam
//! where typed values cross into and out of that representation.
//!
//! [`Serializer`] is a capability interface injected at store construction.
//! It is dyn-safe by working on [`serde_json::Value`] rather than generic
//! types; the generic [`encode`]/[`decode`] helpers bridge to concrete serde
//! types on either side. The contract is symmetry:
//! `decode(encode(v), type_of(v)) == v`.
//!
//! A decode failure on the consumer side is a delivery-phase error: report it
//! and nack, never drop the event silently.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::EventData;

// =============================================================================
// The Codec Capability
// =============================================================================

/// Symmetric payload codec.
///
/// `type_name` is the free-form `event_type` recorded with the event; codecs
/// that need per-type framing (schema registries, versioned envelopes) key on
/// it, while self-describing formats like JSON may ignore it.
pub trait Serializer: Send + Sync + 'static {
    /// Encodes a value into payload bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decodes payload bytes back into a value.
    fn decode(&self, bytes: &[u8], type_name: &str) -> Result<Value>;
}

/// The default codec: payloads are UTF-8 JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serializer(e.to_string()))
    }

    fn decode(&self, bytes: &[u8], _type_name: &str) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serializer(e.to_string()))
    }
}

// =============================================================================
// Typed Helpers
// =============================================================================

/// Encodes a typed value through the codec.
pub fn encode<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::Serializer(e.to_string()))?;
    serializer.encode(&value)
}

/// Decodes payload bytes into a typed value.
pub fn decode<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
    type_name: &str,
) -> Result<T> {
    let value = serializer.decode(bytes, type_name)?;
    serde_json::from_value(value).map_err(|e| Error::Serializer(e.to_string()))
}

/// Builds an [`EventData`] from a typed payload.
///
/// The `event_type` doubles as the codec's `type_name` on the way back out.
pub fn event_data<T: Serialize>(
    serializer: &dyn Serializer,
    event_type: impl Into<String>,
    payload: &T,
) -> Result<EventData> {
    let event_type = event_type.into();
    let data = encode(serializer, payload)?;
    Ok(EventData::new(event_type, data))
}

// =============================================================================
// Tests
// =============================================================================
