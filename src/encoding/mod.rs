//! Data encodings.
//!
//! - json: used for the wire protocol envelope between replicas and clients.
pub mod json;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A serializable value, encoded with the wire JSON encoding.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        json::serialize(self)
    }

    /// Decodes the value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        json::deserialize(bytes)
    }
}
