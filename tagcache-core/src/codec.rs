//! Payload codecs.
//!
//! Every backend stores payloads and characteristic sets in an encoded
//! form. The codec is chosen per store at construction time; it is never
//! process-global state. [`PayloadCodec::Json`] is the general-purpose
//! default, [`PayloadCodec::Binary`] trades readability for speed and
//! size.
//!
//! Encoding a [`Characteristics`](crate::Characteristics) value is
//! canonical for both codecs because the set is ordered by key.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Serialization format for stored payloads and characteristic sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadCodec {
    /// Self-describing JSON via `serde_json`.
    #[default]
    Json,
    /// Compact binary encoding via `bincode`. Not self-describing: the
    /// payload type must deserialize without `deserialize_any`.
    Binary,
}

impl PayloadCodec {
    /// Encodes a value to bytes.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        match self {
            PayloadCodec::Json => {
                serde_json::to_vec(value).map_err(|err| CacheError::OperationFailed {
                    reason: format!("payload encoding failed: {err}"),
                })
            }
            PayloadCodec::Binary => {
                bincode::serialize(value).map_err(|err| CacheError::OperationFailed {
                    reason: format!("payload encoding failed: {err}"),
                })
            }
        }
    }

    /// Decodes bytes back into a value.
    ///
    /// Failure means the stored bytes do not match what this codec once
    /// wrote and is reported as [`CacheError::CorruptedStore`].
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        match self {
            PayloadCodec::Json => {
                serde_json::from_slice(bytes).map_err(|err| CacheError::CorruptedStore {
                    reason: format!("could not decode payload: {err}"),
                })
            }
            PayloadCodec::Binary => {
                bincode::deserialize(bytes).map_err(|err| CacheError::CorruptedStore {
                    reason: format!("could not decode payload: {err}"),
                })
            }
        }
    }
}
