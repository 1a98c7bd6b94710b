//! Values shared by the stages of one orchestrator run.

use sagaflow_core::codec::Codec;
use sagaflow_core::failure::{FailureKind, HandlerFailure};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// String-keyed values visible to every stage and compensation of a run.
///
/// Values are stored codec-encoded, so a stage can read a value back as
/// any compatible type. Clones share the same map.
///
/// # Example
///
/// ```
/// use sagaflow_runtime::orchestrator::OrchestrateContext;
///
/// let context = OrchestrateContext::new();
/// context.set("reservation", &42_u64).unwrap();
///
/// assert!(context.contains("reservation"));
/// assert_eq!(context.decode::<u64>("reservation").unwrap(), 42);
/// ```
#[derive(Clone, Default)]
pub struct OrchestrateContext {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    codec: Codec,
}

impl OrchestrateContext {
    /// An empty context using the JSON codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty context using `codec`.
    #[must_use]
    pub fn with_codec(codec: Codec) -> Self {
        Self {
            values: Arc::default(),
            codec,
        }
    }

    /// Store a value, replacing any previous value under `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Encode`] failure if the value cannot be encoded.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), HandlerFailure> {
        let bytes = self.codec.encode(value)?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), bytes);
        Ok(())
    }

    /// Read a value back.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::NotFound`] failure if nothing is stored under
    /// `key` and a [`FailureKind::Decode`] failure if the value is not a `T`.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerFailure> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = values.get(key).ok_or_else(|| {
            HandlerFailure::new(FailureKind::NotFound, format!("no context value '{key}'"))
        })?;
        Ok(self.codec.decode(bytes)?)
    }

    /// Whether a value is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Remove a value, returning whether one was stored.
    pub fn remove(&self, key: &str) -> bool {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Codec used for stored values.
    #[must_use]
    pub const fn codec(&self) -> Codec {
        self.codec
    }
}

impl fmt::Debug for OrchestrateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        f.debug_struct("OrchestrateContext")
            .field("keys", &keys)
            .field("codec", &self.codec)
            .finish()
    }
}
