//! Handler registration.
//!
//! Application code declares, per lifecycle phase, which payload type it
//! handles, which failure kinds must not be retried or rolled back, and
//! whether success should automatically publish the next phase. The
//! resulting [`HandlerRegistration`]s are collected into a
//! [`HandlerRegistry`] once at startup and are read-only afterwards.
//!
//! # Example
//!
//! ```
//! use sagaflow_core::failure::{FailureKind, HandlerFailure};
//! use sagaflow_core::payload::Payload;
//! use sagaflow_runtime::handler::{HandlerRegistration, SuccessWith};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Reserve {
//!     sku: String,
//!     quantity: i64,
//! }
//!
//! impl Payload for Reserve {}
//!
//! let registration = HandlerRegistration::on_join::<Reserve>()
//!     .id("reserve-stock")
//!     .success_with(SuccessWith::PublishCommit)
//!     .skip_retry_for([FailureKind::Validation])
//!     .handle(|event| async move {
//!         let reserve: Reserve = event.decode_event()?;
//!         if reserve.quantity <= 0 {
//!             return Err(HandlerFailure::validation("quantity must be positive"));
//!         }
//!         Ok(())
//!     });
//!
//! assert_eq!(registration.id(), "reserve-stock");
//! ```

use sagaflow_core::codec::Codec;
use sagaflow_core::error::SagaError;
use sagaflow_core::event::{EventId, SagaEvent, TransactionId};
use sagaflow_core::failure::{FailureKind, FailureKindSet, HandlerFailure};
use sagaflow_core::payload::{EncodedPayload, Payload, PayloadFilter};
use sagaflow_core::phase::Phase;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Follow-up published automatically when a handler succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SuccessWith {
    /// No follow-up; the client drives the next phase.
    #[default]
    None,
    /// Append a `Join` event (allowed on `Start` and `Join`).
    PublishJoin,
    /// Append a `Commit` event (allowed on `Start` and `Join`).
    PublishCommit,
}

impl SuccessWith {
    /// The phase this directive publishes, if any.
    #[must_use]
    pub const fn next_phase(self) -> Option<Phase> {
        match self {
            Self::None => None,
            Self::PublishJoin => Some(Phase::Join),
            Self::PublishCommit => Some(Phase::Commit),
        }
    }
}

#[derive(Debug, Default)]
struct PhaseOutputs {
    next_event: Option<EncodedPayload>,
    undo: Option<EncodedPayload>,
}

/// Values a handler supplied for the follow-up events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerOutputs {
    /// Payload for the next auto-published phase (or the rollback).
    pub next_event: Option<EncodedPayload>,
    /// Undo payload for the participant record.
    pub undo: Option<EncodedPayload>,
}

/// The view of an event handed to a handler.
///
/// Cloning is cheap; clones share the values set through
/// [`set_next_event`](Self::set_next_event) and
/// [`set_undo_payload`](Self::set_undo_payload).
#[derive(Clone)]
pub struct PhaseEvent {
    event: Arc<SagaEvent>,
    codec: Codec,
    attempt: u32,
    outputs: Arc<Mutex<PhaseOutputs>>,
}

impl PhaseEvent {
    /// Wrap an event for handler invocation.
    #[must_use]
    pub fn new(event: SagaEvent, codec: Codec, attempt: u32) -> Self {
        Self {
            event: Arc::new(event),
            codec,
            attempt,
            outputs: Arc::new(Mutex::new(PhaseOutputs::default())),
        }
    }

    /// The transaction this event belongs to.
    #[must_use]
    pub fn transaction_id(&self) -> &TransactionId {
        &self.event.transaction_id
    }

    /// The event's phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.event.phase
    }

    /// The event's id.
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event.event_id
    }

    /// Delivery number of this invocation, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The rollback cause (`Rollback` only).
    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.event.cause.as_deref()
    }

    /// Type tag of the payload, if any.
    #[must_use]
    pub fn payload_type(&self) -> Option<&str> {
        self.event.payload_type()
    }

    /// The underlying event.
    #[must_use]
    pub fn event(&self) -> &SagaEvent {
        &self.event
    }

    /// Decode the event payload.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Decode`] failure if the event carries no
    /// payload or the payload is not a `T`.
    pub fn decode_event<T: DeserializeOwned>(&self) -> Result<T, HandlerFailure> {
        decode_optional(self.event.payload.as_ref(), self.codec, "payload")
    }

    /// Decode the undo payload.
    ///
    /// On `Join` this is the undo data the participant joined with; on
    /// `Rollback` it is the undo data of the participant (or the failed
    /// step) being compensated. A failed step without undo data is not
    /// compensated.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Decode`] failure if there is no undo payload
    /// or it is not a `T`.
    pub fn decode_undo<T: DeserializeOwned>(&self) -> Result<T, HandlerFailure> {
        decode_optional(self.event.undo.as_ref(), self.codec, "undo payload")
    }

    /// Supply the payload carried by the next auto-published event.
    ///
    /// On failure, the payload is carried by the rollback instead.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Encode`] failure if the payload cannot be encoded.
    pub fn set_next_event<T: Payload>(&self, payload: &T) -> Result<(), HandlerFailure> {
        let encoded = EncodedPayload::encode(self.codec, payload)?;
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).next_event = Some(encoded);
        Ok(())
    }

    /// Supply the undo payload recorded for this participant.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::Encode`] failure if the payload cannot be encoded.
    pub fn set_undo_payload<T: Payload>(&self, undo: &T) -> Result<(), HandlerFailure> {
        let encoded = EncodedPayload::encode(self.codec, undo)?;
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).undo = Some(encoded);
        Ok(())
    }

    /// Take the values supplied by the handler.
    #[must_use]
    pub fn take_outputs(&self) -> HandlerOutputs {
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        HandlerOutputs {
            next_event: outputs.next_event.take(),
            undo: outputs.undo.take(),
        }
    }
}

impl fmt::Debug for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseEvent")
            .field("transaction_id", &self.event.transaction_id)
            .field("phase", &self.event.phase)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

fn decode_optional<T: DeserializeOwned>(
    payload: Option<&EncodedPayload>,
    codec: Codec,
    what: &str,
) -> Result<T, HandlerFailure> {
    let payload = payload.ok_or_else(|| {
        HandlerFailure::new(FailureKind::Decode, format!("event carries no {what}"))
    })?;
    Ok(payload.decode(codec)?)
}

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerFailure>> + Send>>;

type HandlerFn = Arc<dyn Fn(PhaseEvent) -> HandlerFuture + Send + Sync>;

/// A handler bound to a phase and payload type.
#[derive(Clone)]
pub struct HandlerRegistration {
    id: String,
    phase: Phase,
    payload: PayloadFilter,
    retry_exclusions: FailureKindSet,
    rollback_exclusions: FailureKindSet,
    success_with: SuccessWith,
    timeout: Option<Duration>,
    handler: HandlerFn,
}

impl HandlerRegistration {
    /// Start declaring a handler for `phase`, accepting any payload.
    #[must_use]
    pub fn builder(phase: Phase) -> HandlerBuilder {
        HandlerBuilder {
            id: None,
            phase,
            payload: PayloadFilter::Any,
            retry_exclusions: FailureKindSet::new(),
            rollback_exclusions: FailureKindSet::new(),
            success_with: SuccessWith::None,
            timeout: None,
        }
    }

    /// Declare a `Start` handler for payloads of type `T`.
    #[must_use]
    pub fn on_start<T: Payload>() -> HandlerBuilder {
        Self::builder(Phase::Start).payload::<T>()
    }

    /// Declare a `Join` handler for payloads of type `T`.
    #[must_use]
    pub fn on_join<T: Payload>() -> HandlerBuilder {
        Self::builder(Phase::Join).payload::<T>()
    }

    /// Declare a `Commit` handler for payloads of type `T`.
    #[must_use]
    pub fn on_commit<T: Payload>() -> HandlerBuilder {
        Self::builder(Phase::Commit).payload::<T>()
    }

    /// Declare a `Rollback` handler for payloads of type `T`.
    #[must_use]
    pub fn on_rollback<T: Payload>() -> HandlerBuilder {
        Self::builder(Phase::Rollback).payload::<T>()
    }

    /// Handler id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Phase handled.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Payloads accepted.
    #[must_use]
    pub const fn payload(&self) -> &PayloadFilter {
        &self.payload
    }

    /// Kinds that must not be redelivered.
    #[must_use]
    pub const fn retry_exclusions(&self) -> &FailureKindSet {
        &self.retry_exclusions
    }

    /// Kinds that must not trigger rollback.
    #[must_use]
    pub const fn rollback_exclusions(&self) -> &FailureKindSet {
        &self.rollback_exclusions
    }

    /// Follow-up published on success.
    #[must_use]
    pub const fn success_with(&self) -> SuccessWith {
        self.success_with
    }

    /// Per-handler timeout overriding the engine default.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the handler.
    #[must_use]
    pub fn invoke(&self, event: PhaseEvent) -> HandlerFuture {
        (self.handler)(event)
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("payload", &self.payload)
            .field("retry_exclusions", &self.retry_exclusions)
            .field("rollback_exclusions", &self.rollback_exclusions)
            .field("success_with", &self.success_with)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`HandlerRegistration`].
#[derive(Debug, Clone)]
pub struct HandlerBuilder {
    id: Option<String>,
    phase: Phase,
    payload: PayloadFilter,
    retry_exclusions: FailureKindSet,
    rollback_exclusions: FailureKindSet,
    success_with: SuccessWith,
    timeout: Option<Duration>,
}

impl HandlerBuilder {
    /// Name the handler. Defaults to `<phase>:<payload type>`.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Accept only payloads of type `T`.
    #[must_use]
    pub fn payload<T: Payload>(mut self) -> Self {
        self.payload = PayloadFilter::of::<T>();
        self
    }

    /// Accept any payload, or none.
    #[must_use]
    pub fn any_payload(mut self) -> Self {
        self.payload = PayloadFilter::Any;
        self
    }

    /// Publish the next phase on success.
    #[must_use]
    pub const fn success_with(mut self, success_with: SuccessWith) -> Self {
        self.success_with = success_with;
        self
    }

    /// Never redeliver failures of these kinds (or their descendants).
    #[must_use]
    pub fn skip_retry_for(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_exclusions.extend(kinds);
        self
    }

    /// Never roll back because of failures of these kinds (or their descendants).
    #[must_use]
    pub fn skip_rollback_for(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.rollback_exclusions.extend(kinds);
        self
    }

    /// Bound each invocation of this handler.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Finish with an asynchronous handler.
    #[must_use]
    pub fn handle<F, Fut>(self, handler: F) -> HandlerRegistration
    where
        F: Fn(PhaseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerFailure>> + Send + 'static,
    {
        let handler: HandlerFn =
            Arc::new(move |event: PhaseEvent| -> HandlerFuture { Box::pin(handler(event)) });
        self.finish(handler)
    }

    /// Finish with a synchronous handler.
    #[must_use]
    pub fn handle_sync<F>(self, handler: F) -> HandlerRegistration
    where
        F: Fn(&PhaseEvent) -> Result<(), HandlerFailure> + Send + Sync + 'static,
    {
        let handler: HandlerFn = Arc::new(move |event: PhaseEvent| -> HandlerFuture {
            let result = handler(&event);
            Box::pin(std::future::ready(result))
        });
        self.finish(handler)
    }

    fn finish(self, handler: HandlerFn) -> HandlerRegistration {
        let id = self
            .id
            .unwrap_or_else(|| format!("{}:{}", self.phase.as_str(), self.payload.label()));
        HandlerRegistration {
            id,
            phase: self.phase,
            payload: self.payload,
            retry_exclusions: self.retry_exclusions,
            rollback_exclusions: self.rollback_exclusions,
            success_with: self.success_with,
            timeout: self.timeout,
            handler,
        }
    }
}

/// Registered handlers, keyed by phase and payload filter.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(Phase, PayloadFilter), Arc<HandlerRegistration>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::InvalidRegistration`] if another handler is
    /// already registered for the same phase and payload, or if a
    /// `Commit`/`Rollback` handler declares a follow-up.
    pub fn register(&mut self, registration: HandlerRegistration) -> Result<(), SagaError> {
        if registration.success_with != SuccessWith::None
            && !matches!(registration.phase, Phase::Start | Phase::Join)
        {
            return Err(SagaError::InvalidRegistration(format!(
                "handler '{}' declares {:?} on {}, only START and JOIN may publish a follow-up",
                registration.id, registration.success_with, registration.phase
            )));
        }

        let key = (registration.phase, registration.payload.clone());
        if let Some(existing) = self.handlers.get(&key) {
            return Err(SagaError::InvalidRegistration(format!(
                "handler '{}' conflicts with '{}' for {} payload '{}'",
                registration.id,
                existing.id,
                registration.phase,
                registration.payload.label()
            )));
        }

        tracing::debug!(
            handler = %registration.id,
            phase = %registration.phase,
            payload = registration.payload.label(),
            "Registered handler"
        );
        self.handlers.insert(key, Arc::new(registration));
        Ok(())
    }

    /// Find the handler for an event: an exact payload match first, then an
    /// any-payload handler.
    #[must_use]
    pub fn resolve(
        &self,
        phase: Phase,
        payload_type: Option<&str>,
    ) -> Option<Arc<HandlerRegistration>> {
        payload_type
            .and_then(|tag| self.handlers.get(&(phase, PayloadFilter::Exact(tag.to_string()))))
            .or_else(|| self.handlers.get(&(phase, PayloadFilter::Any)))
            .cloned()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    impl Payload for Order {}

    fn noop(builder: HandlerBuilder) -> HandlerRegistration {
        builder.handle_sync(|_| Ok(()))
    }

    fn event_with(payload: &Order) -> SagaEvent {
        SagaEvent::new("tx-1".into(), Phase::Start, "node-a", Utc::now())
            .with_payload(Some(EncodedPayload::encode(Codec::Json, payload).unwrap()))
    }

    #[test]
    fn default_id_names_phase_and_payload() {
        let registration = noop(HandlerRegistration::on_start::<Order>());
        assert!(registration.id().starts_with("start:"));
        assert!(registration.id().ends_with("Order"));
        assert_eq!(noop(HandlerRegistration::builder(Phase::Commit)).id(), "commit:*");
    }

    #[test]
    fn resolve_prefers_exact_over_any() {
        let mut registry = HandlerRegistry::new();
        registry.register(noop(HandlerRegistration::on_join::<Order>().id("exact"))).unwrap();
        registry.register(noop(HandlerRegistration::builder(Phase::Join).id("fallback"))).unwrap();

        assert_eq!(registry.resolve(Phase::Join, Some(Order::type_tag())).unwrap().id(), "exact");
        assert_eq!(registry.resolve(Phase::Join, Some("Other")).unwrap().id(), "fallback");
        assert_eq!(registry.resolve(Phase::Join, None).unwrap().id(), "fallback");
        assert!(registry.resolve(Phase::Commit, None).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(noop(HandlerRegistration::on_start::<Order>())).unwrap();
        let err = registry.register(noop(HandlerRegistration::on_start::<Order>())).unwrap_err();
        assert!(matches!(err, SagaError::InvalidRegistration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn follow_up_only_on_start_and_join() {
        let mut registry = HandlerRegistry::new();
        let commit =
            noop(HandlerRegistration::on_commit::<Order>().success_with(SuccessWith::PublishJoin));
        assert!(registry.register(commit).is_err());

        let join =
            noop(HandlerRegistration::on_join::<Order>().success_with(SuccessWith::PublishJoin));
        assert!(registry.register(join).is_ok());
    }

    #[tokio::test]
    async fn phase_event_decodes_and_collects_outputs() {
        let view = PhaseEvent::new(event_with(&Order { id: 7 }), Codec::Json, 1);
        let registration = HandlerRegistration::on_start::<Order>().handle(|event| async move {
            let order: Order = event.decode_event()?;
            event.set_next_event(&Order { id: order.id + 1 })?;
            Ok(())
        });

        registration.invoke(view.clone()).await.unwrap();

        let outputs = view.take_outputs();
        let next: Order = outputs.next_event.unwrap().decode(Codec::Json).unwrap();
        assert_eq!(next, Order { id: 8 });
        assert!(outputs.undo.is_none());
    }

    #[test]
    fn missing_payload_is_a_decode_failure() {
        let view = PhaseEvent::new(
            SagaEvent::new("tx-1".into(), Phase::Commit, "node-a", Utc::now()),
            Codec::Json,
            1,
        );
        let failure = view.decode_event::<Order>().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Decode);
        assert_eq!(view.decode_undo::<Order>().unwrap_err().kind, FailureKind::Decode);
    }
}
