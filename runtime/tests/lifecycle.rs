//! Integration tests for the event-driven transaction lifecycle
//!
//! Drives a [`SagaEngine`] over the in-memory event log and checks which
//! events end up on the topic, which handlers ran, and how transactions
//! terminate.

// Test code can use unwrap/expect/panic
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use sagaflow_core::codec::Codec;
use sagaflow_core::error::SagaError;
use sagaflow_core::event_log::EventLog;
use sagaflow_core::failure::{FailureKind, HandlerFailure};
use sagaflow_core::payload::Payload;
use sagaflow_core::phase::{Outcome, Phase, TransactionState};
use sagaflow_runtime::classifier::FailureDisposition;
use sagaflow_runtime::config::EngineConfig;
use sagaflow_runtime::engine::SagaEngine;
use sagaflow_runtime::handler::{HandlerRegistration, SuccessWith};
use sagaflow_runtime::observer::LifecycleNotice;
use sagaflow_testing::{
    InMemoryEventLog, RecordingObserver, SequentialIdGenerator, init_test_tracing,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Fixtures
// ============================================================================

const TOPIC: &str = "lifecycle-test";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reservation {
    sku: String,
    quantity: u32,
}

impl Payload for Reservation {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReleaseStock {
    sku: String,
}

impl Payload for ReleaseStock {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Charge {
    cents: u64,
}

impl Payload for Charge {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Refund {
    cents: u64,
}

impl Payload for Refund {}

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_topic(TOPIC)
        .with_visibility_timeout(Duration::from_millis(100))
        .with_handler_timeout(Duration::from_secs(1))
        .with_max_delivery_attempts(3)
}

struct Harness {
    engine: SagaEngine,
    log: Arc<InMemoryEventLog>,
    observer: Arc<RecordingObserver>,
    shutdown: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(registrations: Vec<HandlerRegistration>) -> Self {
        Self::on_log(Arc::new(InMemoryEventLog::new()), registrations)
    }

    /// An engine with a fresh registry over an existing log.
    fn on_log(log: Arc<InMemoryEventLog>, registrations: Vec<HandlerRegistration>) -> Self {
        init_test_tracing();
        let observer = Arc::new(RecordingObserver::new());
        let mut builder = SagaEngine::builder(log.clone())
            .with_config(test_config())
            .with_observer(observer.clone())
            .with_id_generator(Arc::new(SequentialIdGenerator::new("tx")));
        for registration in registrations {
            builder = builder.register(registration);
        }
        let engine = builder.build().unwrap();
        let shutdown = CancellationToken::new();
        let worker = engine.spawn(shutdown.clone());
        Self {
            engine,
            log,
            observer,
            shutdown,
            worker,
        }
    }

    fn count(&self, phase: Phase) -> usize {
        self.log.count_phase(TOPIC, phase)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.worker.await.unwrap();
    }
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Accepts payload-less starts opened through the manager.
fn open_handler() -> HandlerRegistration {
    HandlerRegistration::builder(Phase::Start)
        .any_payload()
        .handle_sync(|_event| Ok(()))
}

/// START publishes JOIN, JOIN rejects negative amounts and otherwise
/// publishes COMMIT.
fn amount_handlers(rollbacks: Arc<AtomicUsize>) -> Vec<HandlerRegistration> {
    vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishJoin)
            .handle_sync(|_event| Ok(())),
        HandlerRegistration::on_join::<i64>()
            .success_with(SuccessWith::PublishCommit)
            .skip_retry_for([FailureKind::Validation])
            .handle_sync(|event| {
                let amount: i64 = event.decode_event()?;
                if amount < 0 {
                    return Err(HandlerFailure::validation(format!("negative amount {amount}")));
                }
                Ok(())
            }),
        HandlerRegistration::on_commit::<i64>().handle_sync(|_event| Ok(())),
        HandlerRegistration::on_rollback::<i64>().handle_sync(move |_event| {
            rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    ]
}

// ============================================================================
// Happy path and rollback
// ============================================================================

#[tokio::test]
async fn positive_amount_commits() {
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(amount_handlers(rollbacks.clone()));

    let id = harness.engine.manager().start(&1_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::Committed);
    assert_eq!(harness.count(Phase::Start), 1);
    assert_eq!(harness.count(Phase::Join), 1);
    assert_eq!(harness.count(Phase::Commit), 1);
    assert_eq!(harness.count(Phase::Rollback), 0);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.engine.manager().exists(&id).unwrap(),
        TransactionState::Terminated(Outcome::Committed)
    );

    harness.stop().await;
}

#[tokio::test]
async fn rejected_join_rolls_back_once() {
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(amount_handlers(rollbacks.clone()));

    let id = harness.engine.manager().start(&-1_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(harness.count(Phase::Start), 1);
    assert_eq!(harness.count(Phase::Join), 1);
    assert_eq!(harness.count(Phase::Rollback), 1);
    assert_eq!(harness.count(Phase::Commit), 0);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);

    let rollback = harness
        .log
        .events(TOPIC)
        .into_iter()
        .find(|event| event.phase == Phase::Rollback)
        .unwrap();
    assert!(rollback.cause.unwrap().contains("negative amount"));

    harness.stop().await;
}

#[tokio::test]
async fn transient_failure_is_redelivered_then_commits() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = invocations.clone();
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishCommit)
            .handle_sync(move |event| {
                seen.fetch_add(1, Ordering::SeqCst);
                if event.attempt() == 1 {
                    return Err(HandlerFailure::transient("broker hiccup"));
                }
                Ok(())
            }),
        HandlerRegistration::on_commit::<i64>().handle_sync(|_event| Ok(())),
    ]);

    let id = harness.engine.manager().start(&7_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::Committed);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(harness.count(Phase::Rollback), 0);

    harness.stop().await;
}

#[tokio::test]
async fn exhausted_retries_roll_back() {
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishCommit)
            .handle_sync(|_event| {
                Err(HandlerFailure::new(FailureKind::Unavailable, "inventory service down"))
            }),
        HandlerRegistration::on_rollback::<i64>().handle_sync(|_event| Ok(())),
    ]);

    let id = harness.engine.manager().start(&7_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(harness.count(Phase::Rollback), 1);
    assert_eq!(
        harness.observer.count(|notice| matches!(
            notice,
            LifecycleNotice::HandlerInvoked { phase: Phase::Start, .. }
        )),
        3
    );

    harness.stop().await;
}

#[tokio::test]
async fn rollback_excluded_failure_is_dropped() {
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishJoin)
            .handle_sync(|_event| Ok(())),
        HandlerRegistration::on_join::<i64>()
            .success_with(SuccessWith::PublishCommit)
            .skip_retry_for([FailureKind::Conflict])
            .skip_rollback_for([FailureKind::Conflict])
            .handle_sync(|_event| {
                Err(HandlerFailure::new(FailureKind::Conflict, "already reserved"))
            }),
    ]);

    let id = harness.engine.manager().start(&3_i64).await.unwrap();
    let observer = harness.observer.clone();
    assert!(
        eventually(|| {
            observer.count(|notice| matches!(
                notice,
                LifecycleNotice::HandlerFailed { disposition: FailureDisposition::Drop, .. }
            )) == 1
        })
        .await
    );

    assert_eq!(harness.count(Phase::Rollback), 0);
    assert_eq!(harness.count(Phase::Commit), 0);
    assert_eq!(
        harness.engine.manager().exists(&id).unwrap(),
        TransactionState::Active(Phase::Join)
    );

    harness.stop().await;
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn duplicate_delivery_is_ignored() {
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(amount_handlers(rollbacks));

    let id = harness.engine.manager().start(&1_i64).await.unwrap();
    harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    let start = harness.log.events(TOPIC).into_iter().next().unwrap();
    harness.log.append(TOPIC, &start).await.unwrap();

    let observer = harness.observer.clone();
    assert!(
        eventually(|| {
            observer.count(|notice| matches!(
                notice,
                LifecycleNotice::DuplicateIgnored { event_id, .. } if *event_id == start.event_id
            )) >= 1
        })
        .await
    );
    assert_eq!(harness.count(Phase::Join), 1);
    assert_eq!(harness.count(Phase::Commit), 1);
    assert_eq!(
        harness.observer.count(|notice| matches!(
            notice,
            LifecycleNotice::HandlerInvoked { phase: Phase::Start, .. }
        )),
        1
    );

    harness.stop().await;
}

// ============================================================================
// Follow-up payloads
// ============================================================================

#[tokio::test]
async fn publish_join_carries_handler_payload() {
    let reserved = Arc::new(Mutex::new(Vec::new()));
    let sink = reserved.clone();
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishJoin)
            .handle_sync(|event| {
                let quantity: i64 = event.decode_event()?;
                event.set_next_event(&Reservation {
                    sku: "sku-42".to_string(),
                    quantity: u32::try_from(quantity).unwrap_or_default(),
                })
            }),
        HandlerRegistration::on_join::<Reservation>()
            .success_with(SuccessWith::PublishCommit)
            .handle(move |event| {
                let sink = sink.clone();
                async move {
                    let reservation: Reservation = event.decode_event()?;
                    sink.lock().unwrap().push(reservation);
                    Ok(())
                }
            }),
        HandlerRegistration::on_commit::<Reservation>().handle_sync(|_event| Ok(())),
    ]);

    let id = harness.engine.manager().start(&2_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::Committed);
    assert_eq!(harness.count(Phase::Join), 1);
    let join = harness
        .log
        .events(TOPIC)
        .into_iter()
        .find(|event| event.phase == Phase::Join)
        .unwrap();
    assert_eq!(join.payload_type(), Some(Reservation::type_tag()));
    assert_eq!(
        *reserved.lock().unwrap(),
        vec![Reservation {
            sku: "sku-42".to_string(),
            quantity: 2,
        }]
    );

    harness.stop().await;
}

#[tokio::test]
async fn join_handler_can_publish_another_join() {
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishJoin)
            .handle_sync(|event| {
                let quantity: i64 = event.decode_event()?;
                event.set_next_event(&Reservation {
                    sku: "sku-7".to_string(),
                    quantity: u32::try_from(quantity).unwrap_or_default(),
                })
            }),
        HandlerRegistration::on_join::<Reservation>()
            .success_with(SuccessWith::PublishJoin)
            .handle_sync(|event| {
                let reservation: Reservation = event.decode_event()?;
                event.set_next_event(&Charge {
                    cents: u64::from(reservation.quantity) * 250,
                })
            }),
        HandlerRegistration::on_join::<Charge>()
            .success_with(SuccessWith::PublishCommit)
            .handle_sync(|_event| Ok(())),
        HandlerRegistration::on_commit::<Charge>().handle_sync(|_event| Ok(())),
    ]);

    let id = harness.engine.manager().start(&4_i64).await.unwrap();
    let outcome = harness.engine.manager().await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::Committed);
    let joins: Vec<String> = harness
        .log
        .events(TOPIC)
        .into_iter()
        .filter(|event| event.phase == Phase::Join)
        .filter_map(|event| event.payload_type().map(str::to_string))
        .collect();
    assert_eq!(
        joins,
        vec![Reservation::type_tag().to_string(), Charge::type_tag().to_string()]
    );
    let commit = harness
        .log
        .events(TOPIC)
        .into_iter()
        .find(|event| event.phase == Phase::Commit)
        .unwrap();
    assert_eq!(
        commit.payload.unwrap().decode::<Charge>(Codec::Json).unwrap(),
        Charge { cents: 1_000 }
    );

    harness.stop().await;
}

#[tokio::test]
async fn rejected_follow_up_forces_rollback() {
    let gate = Arc::new(Notify::new());
    let undone = Arc::new(Mutex::new(Vec::new()));
    let (release, sink) = (gate.clone(), undone.clone());
    let harness = Harness::start(vec![
        HandlerRegistration::on_start::<i64>()
            .success_with(SuccessWith::PublishJoin)
            .handle(move |event| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    let amount: i64 = event.decode_event()?;
                    event.set_undo_payload(&-amount)
                }
            }),
        HandlerRegistration::on_commit::<i64>().handle_sync(|_event| Ok(())),
        HandlerRegistration::on_rollback::<i64>().handle_sync(move |event| {
            let undo: i64 = event.decode_undo()?;
            sink.lock().unwrap().push(undo);
            Ok(())
        }),
    ]);
    let manager = harness.engine.manager();

    let id = manager.start(&4_i64).await.unwrap();
    manager.commit(&id).await.unwrap();
    gate.notify_one();
    let outcome = manager.await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(harness.count(Phase::Join), 0);
    assert_eq!(harness.count(Phase::Rollback), 1);
    assert_eq!(*undone.lock().unwrap(), vec![-4]);
    assert_eq!(
        harness.observer.count(|notice| matches!(
            notice,
            LifecycleNotice::HandlerInvoked { phase: Phase::Commit, .. }
        )),
        0
    );

    harness.stop().await;
}

// ============================================================================
// Compensation
// ============================================================================

#[tokio::test]
async fn participants_are_compensated_newest_first() {
    let compensated = Arc::new(Mutex::new(Vec::new()));
    let stock = compensated.clone();
    let payment = compensated.clone();
    let harness = Harness::start(vec![
        open_handler(),
        HandlerRegistration::on_join::<Reservation>().handle_sync(|_event| Ok(())),
        HandlerRegistration::on_join::<Charge>().handle_sync(|_event| Ok(())),
        HandlerRegistration::on_rollback::<Reservation>().handle_sync(move |event| {
            let release: ReleaseStock = event.decode_undo()?;
            stock.lock().unwrap().push(format!("release {}", release.sku));
            Ok(())
        }),
        HandlerRegistration::on_rollback::<Charge>().handle_sync(move |event| {
            let refund: Refund = event.decode_undo()?;
            payment.lock().unwrap().push(format!("refund {}", refund.cents));
            Ok(())
        }),
    ]);
    let manager = harness.engine.manager();

    let id = manager.start_empty().await.unwrap();
    manager
        .join(
            &id,
            &ReleaseStock { sku: "sku-1".to_string() },
            &Reservation {
                sku: "sku-1".to_string(),
                quantity: 1,
            },
        )
        .await
        .unwrap();
    manager
        .join(&id, &Refund { cents: 500 }, &Charge { cents: 500 })
        .await
        .unwrap();

    let observer = harness.observer.clone();
    assert!(
        eventually(|| {
            observer.count(|notice| matches!(
                notice,
                LifecycleNotice::HandlerSucceeded { phase: Phase::Join, .. }
            )) == 2
        })
        .await
    );

    manager.rollback(&id, "customer cancelled").await.unwrap();
    let outcome = manager.await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(
        *compensated.lock().unwrap(),
        vec!["refund 500".to_string(), "release sku-1".to_string()]
    );

    harness.stop().await;
}

#[tokio::test]
async fn failed_join_compensates_itself_and_earlier_participants_once() {
    let compensated = Arc::new(Mutex::new(Vec::new()));
    let sink = compensated.clone();
    let harness = Harness::start(vec![
        open_handler(),
        HandlerRegistration::on_join::<Reservation>()
            .skip_retry_for([FailureKind::Validation])
            .handle_sync(|event| {
                let reservation: Reservation = event.decode_event()?;
                if reservation.quantity > 5 {
                    return Err(HandlerFailure::validation("not enough stock"));
                }
                Ok(())
            }),
        HandlerRegistration::on_rollback::<Reservation>().handle_sync(move |event| {
            let release: ReleaseStock = event.decode_undo()?;
            sink.lock().unwrap().push(release.sku);
            Ok(())
        }),
    ]);
    let manager = harness.engine.manager();

    let id = manager.start_empty().await.unwrap();
    for (sku, quantity) in [("a", 1), ("b", 9)] {
        manager
            .join(
                &id,
                &ReleaseStock { sku: sku.to_string() },
                &Reservation {
                    sku: sku.to_string(),
                    quantity,
                },
            )
            .await
            .unwrap();
    }
    let outcome = manager.await_completion(&id, WAIT).await.unwrap();

    assert_eq!(outcome, Outcome::RolledBack);
    assert_eq!(harness.count(Phase::Rollback), 1);
    assert_eq!(*compensated.lock().unwrap(), vec!["b".to_string(), "a".to_string()]);
    assert!(harness.engine.dead_letters().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn failed_compensation_is_dead_lettered_and_relayed() {
    let healthy = Arc::new(AtomicBool::new(false));
    let refunds = Arc::new(AtomicUsize::new(0));
    let (gate, counter) = (healthy.clone(), refunds.clone());
    let harness = Harness::start(vec![
        open_handler(),
        HandlerRegistration::on_join::<Charge>().handle_sync(|_event| Ok(())),
        HandlerRegistration::on_rollback::<Charge>()
            .id("refund")
            .handle_sync(move |_event| {
                if !gate.load(Ordering::SeqCst) {
                    return Err(HandlerFailure::new(
                        FailureKind::Unavailable,
                        "payment gateway down",
                    ));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
    ]);
    let manager = harness.engine.manager();

    let id = manager.start_empty().await.unwrap();
    manager
        .join(&id, &Refund { cents: 900 }, &Charge { cents: 900 })
        .await
        .unwrap();
    let observer = harness.observer.clone();
    assert!(
        eventually(|| {
            observer.count(|notice| matches!(
                notice,
                LifecycleNotice::HandlerSucceeded { phase: Phase::Join, .. }
            )) == 1
        })
        .await
    );
    manager.rollback(&id, "fraud check failed").await.unwrap();

    let err = manager.await_completion(&id, WAIT).await.unwrap_err();
    let SagaError::Compensation(failures) = err else {
        panic!("expected compensation failures, got {err:?}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures.failures[0].handler_id, "refund");
    assert_eq!(harness.engine.dead_letters().len(), 1);

    healthy.store(true, Ordering::SeqCst);
    let relayed = harness.engine.dispatcher().relay_dead_letter().await.unwrap();

    assert!(relayed.is_some());
    assert!(harness.engine.dead_letters().is_empty());
    assert_eq!(refunds.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn pending_follow_up_survives_engine_restart() {
    let log = Arc::new(InMemoryEventLog::new());
    let entered = Arc::new(Notify::new());
    let signal = entered.clone();
    let first = Harness::on_log(
        log.clone(),
        vec![
            HandlerRegistration::on_start::<i64>()
                .success_with(SuccessWith::PublishJoin)
                .handle_sync(|_event| Ok(())),
            HandlerRegistration::on_join::<i64>().handle(move |_event| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }),
        ],
    );

    let id = first.engine.manager().start(&5_i64).await.unwrap();
    tokio::time::timeout(WAIT, entered.notified()).await.unwrap();
    first.stop().await;

    let joins = Arc::new(AtomicUsize::new(0));
    let seen = joins.clone();
    let second = Harness::on_log(
        log.clone(),
        vec![
            HandlerRegistration::on_join::<i64>()
                .success_with(SuccessWith::PublishCommit)
                .handle_sync(move |_event| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            HandlerRegistration::on_commit::<i64>().handle_sync(|_event| Ok(())),
        ],
    );

    let manager = second.engine.manager().clone();
    assert!(
        eventually(|| {
            manager.exists(&id).ok() == Some(TransactionState::Terminated(Outcome::Committed))
        })
        .await
    );
    assert_eq!(joins.load(Ordering::SeqCst), 1);
    assert_eq!(second.count(Phase::Commit), 1);
    assert_eq!(second.count(Phase::Rollback), 0);
    let group = test_config().consumer_group;
    assert!(eventually(|| log.pending_count(TOPIC, &group) == 0).await);

    second.stop().await;
}

#[tokio::test]
async fn stalled_transaction_is_evicted_once_idle() {
    let harness = Harness::start(vec![
        HandlerRegistration::on_join::<i64>().handle_sync(|_event| Ok(())),
    ]);
    let manager = harness.engine.manager().clone();

    let id = manager.start(&5_i64).await.unwrap();
    let group = test_config().consumer_group;
    assert!(eventually(|| harness.log.pending_count(TOPIC, &group) == 0).await);
    assert!(manager.evict_idle(WAIT).is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.evict_idle(Duration::from_millis(100)), vec![id.clone()]);
    assert!(matches!(manager.exists(&id), Err(SagaError::UnknownTransaction { .. })));

    harness.stop().await;
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let log = Arc::new(InMemoryEventLog::new());
    let result = SagaEngine::builder(log)
        .register(HandlerRegistration::on_start::<i64>().handle_sync(|_event| Ok(())))
        .register(HandlerRegistration::on_start::<i64>().handle_sync(|_event| Ok(())))
        .build();

    assert!(matches!(result, Err(SagaError::InvalidRegistration(_))));
}
