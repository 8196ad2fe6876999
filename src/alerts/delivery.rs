//! Sink delivery with out-of-band retry
//!
//! A firing-state transition is final the moment it is computed; delivering
//! its event to the sink is a separate side effect. Failed deliveries are kept
//! in the rule's outbox and retried with capped exponential backoff. Events
//! that exhaust their attempts (or fail permanently) land in the dead-letter
//! log and are reported at error level.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use super::model::AlertEvent;
use super::sink::{AlertSink, SinkError};

/// Dead letters retained for inspection
const MAX_DEAD_LETTERS: usize = 1000;

/// Undelivered events one rule may hold; newer ones are dead-lettered
pub const MAX_OUTBOX: usize = 256;

/// Backoff schedule for failed deliveries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed attempts.
    ///
    /// Doubles per failure up to `max_delay`, with up to 10% jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay.saturating_add(Duration::from_millis(jitter)).min(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// An event waiting in a rule's outbox
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub event: AlertEvent,
    /// Failed attempts so far
    pub failures: u32,
    pub next_attempt_at: Instant,
    pub last_error: Option<SinkError>,
}

impl PendingDelivery {
    /// Queue behind an earlier undelivered event, without attempting it
    pub fn queued(event: AlertEvent) -> Self {
        Self {
            event,
            failures: 0,
            next_attempt_at: Instant::now(),
            last_error: None,
        }
    }

    /// Queue after a failed attempt
    pub fn failed(event: AlertEvent, error: SinkError, policy: &RetryPolicy) -> Self {
        let mut pending = Self::queued(event);
        pending.record_failure(error, policy);
        pending
    }

    pub fn record_failure(&mut self, error: SinkError, policy: &RetryPolicy) {
        self.failures = self.failures.saturating_add(1);
        self.next_attempt_at = Instant::now() + policy.backoff(self.failures);
        self.last_error = Some(error);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at <= now
    }
}

/// Per-rule ordered queue of undelivered events
pub type Outbox = VecDeque<PendingDelivery>;

/// What [`enqueue`] did with an event
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    /// The event resolved an alert whose opening was never sent; both were
    /// dropped. Carries the dropped opening.
    Collapsed(AlertEvent),
    /// The outbox is full; the event was not queued
    Overflow(AlertEvent),
}

/// Append `event` behind a rule's undelivered events.
///
/// A resolve for an alert whose open event is still at the back of the
/// outbox, never attempted, cancels it out so a flapping rule cannot grow
/// its backlog during a sink outage.
pub fn enqueue(outbox: &mut Outbox, event: AlertEvent) -> Enqueued {
    if let AlertEvent::AlertResolved { alert_id, .. } = &event {
        let unsent_open = outbox.back().is_some_and(|back| {
            back.failures == 0
                && matches!(&back.event, AlertEvent::AlertOpened { alert } if alert.id == *alert_id)
        });
        if unsent_open {
            if let Some(opened) = outbox.pop_back() {
                return Enqueued::Collapsed(opened.event);
            }
        }
    }

    if outbox.len() >= MAX_OUTBOX {
        return Enqueued::Overflow(event);
    }
    outbox.push_back(PendingDelivery::queued(event));
    Enqueued::Queued
}

/// An event the engine gave up delivering
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event: AlertEvent,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded log of abandoned deliveries
#[derive(Debug, Default)]
pub struct DeadLetterLog {
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an abandoned event and raise it loudly
    pub fn push(&self, event: AlertEvent, attempts: u32, error: &SinkError) {
        tracing::error!(
            rule_id = %event.rule_id(),
            alert_id = %event.alert_id(),
            kind = %event.kind(),
            attempts,
            error = %error,
            "Alert event could not be delivered and was dead-lettered"
        );

        let mut entries = self.entries.lock();
        while entries.len() >= MAX_DEAD_LETTERS {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            event,
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Hand one event to the sink, bounded by `timeout`
pub async fn deliver<S: AlertSink + ?Sized>(
    sink: &S,
    event: &AlertEvent,
    timeout: Duration,
) -> Result<(), SinkError> {
    let call = async {
        match event {
            AlertEvent::AlertOpened { alert } => {
                let stored = sink.create(alert).await?;
                if stored != alert.id {
                    tracing::warn!(
                        alert_id = %alert.id,
                        stored_id = %stored,
                        "Alert sink stored alert under a different id"
                    );
                }
                Ok::<(), SinkError>(())
            }
            AlertEvent::AlertResolved {
                alert_id,
                resolved_at,
                ..
            } => sink.resolve(alert_id, *resolved_at).await,
        }
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::model::{Alert, AlertId};
    use crate::alerts::sink::MemoryAlertStore;
    use crate::rules::AlertRule;
    use async_trait::async_trait;

    struct SlowSink;

    #[async_trait]
    impl AlertSink for SlowSink {
        async fn create(&self, alert: &Alert) -> Result<AlertId, SinkError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(alert.id.clone())
        }

        async fn resolve(&self, _: &AlertId, _: DateTime<Utc>) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn opened() -> AlertEvent {
        let rule = AlertRule::new("r1", "Rule", "cpu", "GT").with_threshold(1.0);
        AlertEvent::AlertOpened {
            alert: Alert::open(&rule, 2.0, Utc::now()),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));

        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));

        assert_eq!(policy.backoff(30), Duration::from_secs(1));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    fn resolved(event: &AlertEvent) -> AlertEvent {
        AlertEvent::AlertResolved {
            alert_id: event.alert_id().clone(),
            rule_id: "r1".to_string(),
            resolved_at: Utc::now(),
            reason: crate::alerts::model::ResolveReason::Recovered,
        }
    }

    fn failing_front() -> Outbox {
        let policy = RetryPolicy::default();
        let error = SinkError::Unavailable("down".to_string());
        Outbox::from([PendingDelivery::failed(opened(), error, &policy)])
    }

    #[test]
    fn test_enqueue_collapses_unsent_pair() {
        let mut outbox = failing_front();

        // Resolving the attempted front event must still be sent
        let front_resolve = resolved(&outbox[0].event);
        assert!(matches!(enqueue(&mut outbox, front_resolve), Enqueued::Queued));
        assert_eq!(outbox.len(), 2);

        let open = opened();
        assert!(matches!(enqueue(&mut outbox, open.clone()), Enqueued::Queued));
        match enqueue(&mut outbox, resolved(&open)) {
            Enqueued::Collapsed(dropped) => assert_eq!(dropped.alert_id(), open.alert_id()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_enqueue_overflow() {
        let mut outbox = failing_front();
        while outbox.len() < MAX_OUTBOX {
            assert!(matches!(enqueue(&mut outbox, opened()), Enqueued::Queued));
        }

        let extra = opened();
        match enqueue(&mut outbox, extra.clone()) {
            Enqueued::Overflow(event) => assert_eq!(event.alert_id(), extra.alert_id()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outbox.len(), MAX_OUTBOX);

        // Cancelling the newest unsent open still works when full
        let last = outbox.back().unwrap().event.clone();
        assert!(matches!(enqueue(&mut outbox, resolved(&last)), Enqueued::Collapsed(_)));
        assert_eq!(outbox.len(), MAX_OUTBOX - 1);
    }

    #[tokio::test]
    async fn test_deliver_to_store() {
        let store = MemoryAlertStore::new();
        let event = opened();

        deliver(&store, &event, Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.open_alerts().len(), 1);

        let resolved = AlertEvent::AlertResolved {
            alert_id: event.alert_id().clone(),
            rule_id: "r1".to_string(),
            resolved_at: Utc::now(),
            reason: crate::alerts::model::ResolveReason::Recovered,
        };
        deliver(&store, &resolved, Duration::from_secs(1)).await.unwrap();
        assert!(store.open_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_times_out() {
        let result = deliver(&SlowSink, &opened(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SinkError::Timeout(_))));
    }

    #[test]
    fn test_dead_letter_log_is_bounded() {
        let log = DeadLetterLog::new();
        let error = SinkError::Unavailable("down".to_string());
        for _ in 0..(MAX_DEAD_LETTERS + 5) {
            log.push(opened(), 3, &error);
        }
        assert_eq!(log.len(), MAX_DEAD_LETTERS);
    }
}
