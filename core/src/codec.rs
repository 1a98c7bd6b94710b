//! Payload codecs.
//!
//! The engine never interprets payload bytes itself. Handlers and
//! orchestrator stages hand typed values to a [`Codec`], which turns them
//! into the opaque bytes carried by [`SagaEvent`](crate::event::SagaEvent)s.
//!
//! Two formats are supported:
//!
//! - [`Codec::Json`] (default): self-describing, tolerant of added fields,
//!   and readable when inspecting a topic by hand.
//! - [`Codec::Bincode`]: compact binary encoding for all-Rust deployments.
//!
//! # Example
//!
//! ```
//! use sagaflow_core::codec::Codec;
//!
//! let bytes = Codec::Json.encode(&42_i64).unwrap();
//! let value: i64 = Codec::Json.decode(&bytes).unwrap();
//! assert_eq!(value, 42);
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for payload encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A value could not be turned into bytes.
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// Bytes could not be turned into the requested type.
    #[error("Failed to decode payload into {target}: {reason}")]
    Decode {
        /// Name of the type decoding was attempted into
        target: &'static str,
        /// The reason for failure
        reason: String,
    },
}

/// Wire format used for payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// `serde_json` encoding.
    #[default]
    Json,
    /// `bincode` encoding.
    Bincode,
}

impl Codec {
    /// Short name of the format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Bincode => "bincode",
        }
    }

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be serialized
    /// (for example a map with non-string keys under JSON).
    pub fn encode<T>(self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
            },
            Self::Bincode => {
                bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
            },
        }
    }

    /// Decode bytes into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the bytes do not describe a `T`.
    pub fn decode<T>(self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        let result = match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Self::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| CodecError::Decode {
            target: std::any::type_name::<T>(),
            reason,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reservation {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn json_and_bincode_roundtrip_structs() {
        let original = Reservation {
            sku: "sku-1".to_string(),
            quantity: 3,
        };

        for codec in [Codec::Json, Codec::Bincode] {
            let bytes = codec.encode(&original).unwrap();
            let decoded: Reservation = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, original, "codec {}", codec.name());
        }
    }

    #[test]
    fn decode_type_mismatch_names_target() {
        let bytes = Codec::Json.encode(&"not a reservation").unwrap();
        let err = Codec::Json.decode::<Reservation>(&bytes).unwrap_err();

        assert!(matches!(
            err,
            CodecError::Decode { target, .. } if target.ends_with("Reservation")
        ));
    }

    #[test]
    fn json_encode_rejects_non_string_map_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "value");

        assert!(matches!(Codec::Json.encode(&map), Err(CodecError::Encode(_))));
    }

    #[test]
    fn default_is_json() {
        assert_eq!(Codec::default(), Codec::Json);
    }
}
