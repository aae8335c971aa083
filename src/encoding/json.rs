//! JSON is used to encode the wire protocol envelope. The surrounding test
//! harness speaks UTF-8 JSON datagrams, so bit-level compatibility matters
//! and the encoding is not negotiable.
//!
//! This module wraps serde_json so the choice of encoding stays in one place.

use crate::error::Result;

/// Deserializes a value from JSON.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serializes a value as JSON.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
