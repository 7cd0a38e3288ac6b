//! Event payload codecs.
//!
//! The store decides which wire format payloads are persisted in; the core
//! only hands it a codec. JSON is the default; MessagePack is available where
//! payload size matters.

use crate::errors::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Supported payload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PayloadFormat {
    /// Human-readable JSON, the default.
    #[default]
    Json,
    /// Compact MessagePack binary.
    MessagePack,
}

impl PayloadFormat {
    /// Creates the codec for this format.
    pub const fn codec(self) -> EventCodec {
        match self {
            Self::Json => EventCodec::Json,
            Self::MessagePack => EventCodec::MessagePack,
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::MessagePack => write!(f, "msgpack"),
        }
    }
}

/// Serializes event payloads to bytes and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventCodec {
    /// `serde_json` encoding.
    #[default]
    Json,
    /// `rmp-serde` encoding.
    MessagePack,
}

impl EventCodec {
    /// Encodes a payload.
    pub fn serialize<E: Serialize>(&self, payload: &E) -> Result<Vec<u8>, StoreError> {
        match self {
            Self::Json => {
                serde_json::to_vec(payload).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Self::MessagePack => {
                rmp_serde::to_vec(payload).map_err(|e| StoreError::Serialization(e.to_string()))
            }
        }
    }

    /// Decodes a payload.
    pub fn deserialize<E: DeserializeOwned>(&self, bytes: &[u8]) -> Result<E, StoreError> {
        match self {
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Self::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| StoreError::Serialization(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        amount: u64,
    }

    fn sample() -> Payload {
        Payload {
            name: "widget".to_string(),
            amount: 42,
        }
    }

    #[test]
    fn json_round_trips() {
        let codec = PayloadFormat::Json.codec();
        let bytes = codec.serialize(&sample()).unwrap();
        let back: Payload = codec.deserialize(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn messagepack_is_smaller_and_round_trips() {
        let json = EventCodec::Json.serialize(&sample()).unwrap();
        let pack = EventCodec::MessagePack.serialize(&sample()).unwrap();
        assert!(pack.len() < json.len());
        let back: Payload = EventCodec::MessagePack.deserialize(&pack).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn garbage_bytes_surface_as_serialization_errors() {
        let result: Result<Payload, _> = EventCodec::Json.deserialize(b"not-json");
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
