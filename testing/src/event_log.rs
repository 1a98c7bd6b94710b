//! In-memory [`EventLog`] for tests.
//!
//! Entries are stored as serialized bytes, so every delivery goes through the
//! same encode/decode path a real broker would. Consumer groups, pending
//! entries and visibility-timeout redelivery behave like a Redis stream
//! consumer group:
//!
//! - a new group starts reading from the beginning of the topic
//! - each entry is handed to one consumer of the group at a time
//! - an entry delivered but not acknowledged within the subscription's
//!   visibility timeout is delivered again, with a higher delivery count

use async_stream::stream;
use sagaflow_core::event::SagaEvent;
use sagaflow_core::event_log::{
    Delivery, DeliveryStream, DeliveryToken, EntryId, EventLog, EventLogError, Subscription,
};
use sagaflow_core::phase::Phase;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How often an idle subscription re-checks for reclaimable entries.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Pending {
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Default)]
struct TopicState {
    entries: Vec<(EntryId, Vec<u8>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, TopicState>,
    next_id: u64,
    fail_appends: bool,
}

/// In-memory event log with consumer groups and redelivery.
///
/// # Example
///
/// ```
/// use sagaflow_core::event_log::EventLog;
/// use sagaflow_core::event::SagaEvent;
/// use sagaflow_core::phase::Phase;
/// use sagaflow_testing::event_log::InMemoryEventLog;
///
/// # tokio_test::block_on(async {
/// let log = InMemoryEventLog::new();
/// let event = SagaEvent::new("tx-1".into(), Phase::Start, "test", chrono::Utc::now());
/// log.append("transactions", &event).await.unwrap();
///
/// assert_eq!(log.count_phase("transactions", Phase::Start), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<LogState>>,
    appended: Arc<Notify>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail (or succeed again).
    pub fn fail_appends(&self, fail: bool) {
        self.lock().fail_appends = fail;
    }

    /// Every event appended to `topic`, in append order.
    #[must_use]
    pub fn events(&self, topic: &str) -> Vec<SagaEvent> {
        self.lock()
            .topics
            .get(topic)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter_map(|(_, bytes)| SagaEvent::from_bytes(bytes).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of events with `phase` on `topic`.
    #[must_use]
    pub fn count_phase(&self, topic: &str, phase: Phase) -> usize {
        self.events(topic)
            .iter()
            .filter(|event| event.phase == phase)
            .count()
    }

    /// Entries delivered to `group` but not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .and_then(|state| state.groups.get(group))
            .map_or(0, |group| group.pending.len())
    }

    /// Poll until `condition` holds for the events on `topic`.
    ///
    /// Returns `false` if it still doesn't hold after `timeout`.
    pub async fn wait_until(
        &self,
        topic: &str,
        timeout: Duration,
        condition: impl Fn(&[SagaEvent]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(&self.events(topic)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out the next entry for `subscription`, preferring expired pending entries.
    fn claim(&self, subscription: &Subscription) -> Option<Result<Delivery, EventLogError>> {
        let mut state = self.lock();
        let topic = state.topics.entry(subscription.topic.clone()).or_default();
        let TopicState { entries, groups } = topic;
        let group = groups.entry(subscription.group.clone()).or_default();
        let now = Instant::now();

        let expired = group
            .pending
            .iter_mut()
            .find(|(_, pending)| {
                now.duration_since(pending.delivered_at) >= subscription.visibility_timeout
            });

        let (entry_id, delivery_count) = if let Some((id, pending)) = expired {
            pending.delivered_at = now;
            pending.delivery_count += 1;
            (*id, pending.delivery_count)
        } else {
            let (EntryId(id), _) = entries.get(group.cursor)?;
            let id = *id;
            group.cursor += 1;
            group.pending.insert(
                id,
                Pending {
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            (id, 1)
        };

        let bytes = entries
            .iter()
            .find(|(EntryId(id), _)| *id == entry_id)
            .map(|(_, bytes)| bytes)?;

        Some(
            SagaEvent::from_bytes(bytes)
                .map(|event| Delivery {
                    event,
                    token: DeliveryToken {
                        topic: subscription.topic.clone(),
                        group: subscription.group.clone(),
                        entry_id: EntryId(entry_id),
                    },
                    delivery_count,
                })
                .map_err(|err| EventLogError::DeserializationFailed(err.to_string())),
        )
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        topic: &str,
        event: &SagaEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventLogError>> + Send + '_>> {
        let topic = topic.to_string();
        let bytes = event.to_bytes();
        Box::pin(async move {
            let bytes = bytes.map_err(|err| EventLogError::AppendFailed {
                topic: topic.clone(),
                reason: err.to_string(),
            })?;

            let entry_id = {
                let mut state = self.lock();
                if state.fail_appends {
                    return Err(EventLogError::AppendFailed {
                        topic,
                        reason: "appends disabled".to_string(),
                    });
                }
                state.next_id += 1;
                let entry_id = EntryId(state.next_id);
                state
                    .topics
                    .entry(topic)
                    .or_default()
                    .entries
                    .push((entry_id, bytes));
                entry_id
            };

            self.appended.notify_waiters();
            Ok(entry_id)
        })
    }

    fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventLogError>> + Send + '_>> {
        let log = self.clone();
        let subscription = subscription.clone();
        Box::pin(async move {
            log.lock()
                .topics
                .entry(subscription.topic.clone())
                .or_default()
                .groups
                .entry(subscription.group.clone())
                .or_default();

            let deliveries: DeliveryStream = Box::pin(stream! {
                loop {
                    let claimed = log.claim(&subscription);
                    match claimed {
                        Some(delivery) => yield delivery,
                        None => {
                            let _ =
                                tokio::time::timeout(POLL_INTERVAL, log.appended.notified()).await;
                        },
                    }
                }
            });
            Ok(deliveries)
        })
    }

    fn acknowledge(
        &self,
        token: &DeliveryToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventLogError>> + Send + '_>> {
        let token = token.clone();
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(group) = state
                .topics
                .get_mut(&token.topic)
                .and_then(|topic| topic.groups.get_mut(&token.group))
            {
                group.pending.remove(&token.entry_id.0);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;

    const TOPIC: &str = "transactions";

    fn event(tx: &str, phase: Phase) -> SagaEvent {
        SagaEvent::new(tx.into(), phase, "test", Utc::now())
    }

    #[tokio::test]
    async fn delivers_in_append_order() {
        let log = InMemoryEventLog::new();
        log.append(TOPIC, &event("tx-1", Phase::Start)).await.unwrap();
        log.append(TOPIC, &event("tx-1", Phase::Join)).await.unwrap();

        let subscription = Subscription::new(TOPIC, "group", "a");
        let mut deliveries = log.subscribe(&subscription).await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.event.phase, Phase::Start);
        assert_eq!(second.event.phase, Phase::Join);
        assert_eq!(log.pending_count(TOPIC, "group"), 2);
    }

    #[tokio::test]
    async fn acknowledged_entries_are_not_redelivered() {
        let log = InMemoryEventLog::new();
        log.append(TOPIC, &event("tx-1", Phase::Start)).await.unwrap();

        let subscription = Subscription::new(TOPIC, "group", "a")
            .with_visibility_timeout(Duration::from_millis(20));
        let mut deliveries = log.subscribe(&subscription).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        log.acknowledge(&delivery.token).await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(100), deliveries.next()).await;
        assert!(next.is_err());
        assert_eq!(log.pending_count(TOPIC, "group"), 0);
    }

    #[tokio::test]
    async fn unacknowledged_entries_are_redelivered() {
        let log = InMemoryEventLog::new();
        log.append(TOPIC, &event("tx-1", Phase::Start)).await.unwrap();

        let subscription = Subscription::new(TOPIC, "group", "a")
            .with_visibility_timeout(Duration::from_millis(20));
        let mut deliveries = log.subscribe(&subscription).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(first.delivery_count, 1);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn each_group_sees_every_entry() {
        let log = InMemoryEventLog::new();
        log.append(TOPIC, &event("tx-1", Phase::Start)).await.unwrap();

        let mut a = log.subscribe(&Subscription::new(TOPIC, "one", "a")).await.unwrap();
        let mut b = log.subscribe(&Subscription::new(TOPIC, "two", "b")).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().event.phase, Phase::Start);
        assert_eq!(b.next().await.unwrap().unwrap().event.phase, Phase::Start);
    }

    #[tokio::test]
    async fn failing_appends_store_nothing() {
        let log = InMemoryEventLog::new();
        log.fail_appends(true);

        let result = log.append(TOPIC, &event("tx-1", Phase::Start)).await;

        assert!(matches!(result, Err(EventLogError::AppendFailed { .. })));
        assert!(log.events(TOPIC).is_empty());
    }
}
