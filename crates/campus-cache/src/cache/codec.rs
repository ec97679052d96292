//! Conversion between caller values and the byte payloads both tiers store.
//!
//! Strings are stored as their UTF-8 bytes with no extra encoding, so text
//! values cost nothing to decode on the hot path. Structured values opt into
//! JSON or MessagePack by wrapping them in [`Json`] or [`MsgPack`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, Result};

/// A value that can be written to and read back from the cache.
pub trait CacheCodec: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl CacheCodec for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CacheError::Serialization(format!("cached value is not UTF-8: {e}")))
    }
}

impl CacheCodec for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

/// JSON-encoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned> CacheCodec for Json<T> {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// MessagePack-encoded value, more compact than JSON for large records.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgPack<T>(pub T);

impl<T: Serialize + DeserializeOwned> CacheCodec for MsgPack<T> {
    fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(&self.0).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map(MsgPack)
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }
}
