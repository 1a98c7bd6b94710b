//! Typed payloads carried by lifecycle events.
//!
//! A payload is any serde type implementing [`Payload`]. Its
//! [`type_tag`](Payload::type_tag) travels with the encoded bytes so the
//! dispatcher can route an event to the handler registered for that type
//! without decoding it first.

use crate::codec::{Codec, CodecError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A value that can travel inside a lifecycle event.
///
/// The default type tag is the Rust type name. Override it when the
/// producing and consuming services do not share the type's module path.
///
/// # Example
///
/// ```
/// use sagaflow_core::payload::Payload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: String,
/// }
///
/// impl Payload for OrderPlaced {
///     fn type_tag() -> &'static str {
///         "OrderPlaced.v1"
///     }
/// }
///
/// assert_eq!(OrderPlaced::type_tag(), "OrderPlaced.v1");
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier for this payload type.
    #[must_use]
    fn type_tag() -> &'static str {
        std::any::type_name::<Self>()
    }
}

macro_rules! impl_payload {
    ($($ty:ty),* $(,)?) => {
        $(impl Payload for $ty {})*
    };
}

impl_payload!(String, bool, i32, i64, u32, u64, f64);

/// Codec-encoded payload bytes tagged with their payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedPayload {
    /// The payload's [`Payload::type_tag`].
    pub type_tag: String,
    /// Codec output.
    pub bytes: Vec<u8>,
}

impl EncodedPayload {
    /// Create an encoded payload from raw parts.
    #[must_use]
    pub const fn new(type_tag: String, bytes: Vec<u8>) -> Self {
        Self { type_tag, bytes }
    }

    /// Encode a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the codec rejects the value.
    pub fn encode<T: Payload>(codec: Codec, value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            type_tag: T::type_tag().to_string(),
            bytes: codec.encode(value)?,
        })
    }

    /// Decode the bytes into `T`.
    ///
    /// The type tag is not checked: a self-describing codec can decode a
    /// payload into any compatible shape.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes do not describe a `T`.
    pub fn decode<T: DeserializeOwned>(&self, codec: Codec) -> Result<T, CodecError> {
        codec.decode(&self.bytes)
    }

    /// Whether this payload was produced from a `T`.
    #[must_use]
    pub fn is<T: Payload>(&self) -> bool {
        self.type_tag == T::type_tag()
    }
}

/// Which payloads a handler registration accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadFilter {
    /// Events with any payload, or none at all.
    Any,
    /// Events whose payload carries exactly this type tag.
    Exact(String),
}

impl PayloadFilter {
    /// Filter for the payload type `T`.
    #[must_use]
    pub fn of<T: Payload>() -> Self {
        Self::Exact(T::type_tag().to_string())
    }

    /// Whether an event with the given payload tag is accepted.
    #[must_use]
    pub fn matches(&self, type_tag: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => type_tag == Some(expected.as_str()),
        }
    }

    /// Human-readable label for logs and errors.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Any => "*",
            Self::Exact(tag) => tag,
        }
    }
}
