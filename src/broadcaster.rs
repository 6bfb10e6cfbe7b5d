//! Per-case fan-out of events to live subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::error::CaseEventsError;
use crate::event::{self, CaseId};
use crate::subscriber::Subscriber;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_SUBSCRIBERS_PER_CASE: usize = 256;
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest serialized payload a publish may carry.
    pub max_payload_bytes: usize,
    /// Enforced by [`Broadcaster::try_subscribe`] only.
    pub max_subscribers_per_case: usize,
    /// Messages a connection may leave unread before it is dropped.
    pub max_queued_messages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_subscribers_per_case: DEFAULT_MAX_SUBSCRIBERS_PER_CASE,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
        }
    }
}

struct Entry {
    id: u64,
    subscriber: Arc<dyn Subscriber>,
}

struct Inner {
    // A key is present only while its list is non-empty.
    registry: Mutex<HashMap<CaseId, Vec<Entry>>>,
    next_id: AtomicU64,
    limits: Limits,
}

impl Inner {
    fn remove(&self, case_id: &CaseId, ids: &[u64]) -> usize {
        let mut registry = self.registry.lock();
        let Some(entries) = registry.get_mut(case_id) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id));
        let removed = before - entries.len();
        if entries.is_empty() {
            registry.remove(case_id);
        }
        removed
    }
}

/// Registry of live subscribers keyed by case.
///
/// Cloning is cheap and every clone shares the same registry, so one
/// instance is built at startup and handed to whatever needs to publish or
/// subscribe.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                limits,
            }),
        }
    }

    pub fn limits(&self) -> Limits {
        self.inner.limits
    }

    /// Register `subscriber` for the events of `case_id`.
    ///
    /// An empty case id registers nothing and yields a handle whose
    /// [`Unsubscribe::detach`] does nothing. Registering the same handle twice
    /// for one case keeps a single entry.
    pub fn subscribe(
        &self,
        case_id: impl Into<CaseId>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Unsubscribe {
        match self.register(case_id.into(), subscriber, None) {
            Ok(unsubscribe) => unsubscribe,
            // Unreachable without a limit, but never fail here.
            Err(_) => Unsubscribe::noop(),
        }
    }

    /// Like [`Broadcaster::subscribe`], but refuses once the case already has
    /// `max_subscribers_per_case` subscribers.
    pub fn try_subscribe(
        &self,
        case_id: impl Into<CaseId>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Unsubscribe, CaseEventsError> {
        let limit = self.inner.limits.max_subscribers_per_case;
        self.register(case_id.into(), subscriber, Some(limit))
    }

    fn register(
        &self,
        case_id: CaseId,
        subscriber: Arc<dyn Subscriber>,
        limit: Option<usize>,
    ) -> Result<Unsubscribe, CaseEventsError> {
        if case_id.is_empty() {
            return Ok(Unsubscribe::noop());
        }

        let mut registry = self.inner.registry.lock();
        let entries = registry.entry(case_id.clone()).or_default();

        let existing = entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.subscriber, &subscriber))
            .map(|e| e.id);
        let id = match existing {
            Some(id) => id,
            None => {
                if let Some(limit) = limit {
                    if entries.len() >= limit {
                        if entries.is_empty() {
                            registry.remove(&case_id);
                        }
                        return Err(CaseEventsError::CaseFull {
                            case_id: case_id.to_string(),
                            limit,
                        });
                    }
                }
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                entries.push(Entry { id, subscriber });
                id
            }
        };
        let count = entries.len();
        drop(registry);

        tracing::debug!(case_id = %case_id, subscriber = id, subscribers = count, "subscribed");
        Ok(Unsubscribe {
            target: Some(Target {
                inner: Arc::downgrade(&self.inner),
                case_id,
                id,
            }),
        })
    }

    /// Send `payload` as event `event` to every current subscriber of
    /// `case_id`.
    ///
    /// Fire-and-forget: nothing is returned and no failure reaches the caller.
    /// Subscribers whose write fails are dropped from the registry.
    pub fn publish<P>(&self, case_id: impl Into<CaseId>, event: impl AsRef<str>, payload: &P)
    where
        P: Serialize + ?Sized,
    {
        let case_id = case_id.into();
        let event = event.as_ref();
        if case_id.is_empty() {
            return;
        }

        // Snapshot so that writes happen without holding the lock.
        let targets: Vec<(u64, Arc<dyn Subscriber>)> = {
            let registry = self.inner.registry.lock();
            match registry.get(&case_id) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id, Arc::clone(&e.subscriber)))
                    .collect(),
                None => return,
            }
        };

        let message = match event::encode(event, payload, self.inner.limits.max_payload_bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(case_id = %case_id, event, "dropping event: {e}");
                return;
            }
        };

        let mut dead = Vec::new();
        for (id, subscriber) in &targets {
            if let Err(e) = subscriber.write(&message) {
                tracing::debug!(case_id = %case_id, subscriber = id, "write failed: {e}");
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let removed = self.inner.remove(&case_id, &dead);
            tracing::warn!(case_id = %case_id, removed, "pruned dead subscribers");
        }
        tracing::debug!(
            case_id = %case_id,
            event,
            delivered = targets.len() - dead.len(),
            "published"
        );
    }

    /// Publish `event` with the default empty-object payload.
    pub fn publish_empty(&self, case_id: impl Into<CaseId>, event: impl AsRef<str>) {
        self.publish(case_id, event, &json!({}));
    }

    pub fn subscriber_count(&self, case_id: &CaseId) -> usize {
        self.inner
            .registry
            .lock()
            .get(case_id)
            .map_or(0, |entries| entries.len())
    }

    /// Number of cases with at least one live subscriber.
    pub fn case_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.registry.lock().values().map(Vec::len).sum()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

struct Target {
    inner: Weak<Inner>,
    case_id: CaseId,
    id: u64,
}

/// Detaches one subscriber from the broadcaster it was registered with.
pub struct Unsubscribe {
    target: Option<Target>,
}

impl Unsubscribe {
    fn noop() -> Self {
        Self { target: None }
    }

    /// Remove the subscriber. Safe to call any number of times.
    pub fn detach(&self) {
        let Some(target) = &self.target else {
            return;
        };
        let Some(inner) = target.inner.upgrade() else {
            return;
        };
        if inner.remove(&target.case_id, &[target.id]) > 0 {
            tracing::debug!(case_id = %target.case_id, subscriber = target.id, "unsubscribed");
        }
    }

    pub fn case_id(&self) -> Option<&CaseId> {
        self.target.as_ref().map(|t| &t.case_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{Broadcaster, Limits};
    use crate::error::CaseEventsError;
    use crate::event::{CaseId, EventKind};
    use crate::subscriber::testing::{BrokenSubscriber, RecordingSubscriber};
    use crate::subscriber::ChannelSubscriber;

    const CASE: &str = "case-1";

    #[test]
    fn publish_without_subscribers_is_noop() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(CASE, "case_update", &json!({"title": "X"}));
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let first = Arc::new(RecordingSubscriber::default());
        let second = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, first.clone());
        broadcaster.subscribe(CASE, second.clone());

        broadcaster.publish(CASE, EventKind::CaseUpdate, &json!({"title": "X"}));

        let expected = vec!["event: case_update\ndata: {\"title\":\"X\"}\n\n".to_string()];
        assert_eq!(first.messages(), expected);
        assert_eq!(second.messages(), expected);
    }

    #[test]
    fn publish_only_reaches_subscribers_of_that_case() {
        let broadcaster = Broadcaster::new();
        let watcher = Arc::new(RecordingSubscriber::default());
        let other = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, watcher.clone());
        broadcaster.subscribe("case-2", other.clone());

        broadcaster.publish_empty(CASE, "new_message");

        assert_eq!(watcher.messages().len(), 1);
        assert!(other.messages().is_empty());
    }

    #[test]
    fn publish_empty_sends_empty_object() {
        let broadcaster = Broadcaster::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, subscriber.clone());

        broadcaster.publish_empty(CASE, "document_upload");

        assert_eq!(subscriber.messages(), vec!["event: document_upload\ndata: {}\n\n"]);
    }

    #[test]
    fn subscribe_adds_to_existing_set() {
        let broadcaster = Broadcaster::new();
        let case_id = CaseId::from(CASE);
        broadcaster.subscribe(&case_id, Arc::new(RecordingSubscriber::default()));
        assert_eq!(broadcaster.subscriber_count(&case_id), 1);
        broadcaster.subscribe(&case_id, Arc::new(RecordingSubscriber::default()));
        assert_eq!(broadcaster.subscriber_count(&case_id), 2);
    }

    #[test]
    fn subscribing_same_handle_twice_keeps_one_entry() {
        let broadcaster = Broadcaster::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        let first = broadcaster.subscribe(CASE, subscriber.clone());
        let second = broadcaster.subscribe(CASE, subscriber.clone());
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);

        broadcaster.publish_empty(CASE, "case_update");
        assert_eq!(subscriber.messages().len(), 1);

        second.detach();
        first.detach();
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn detach_removes_exactly_that_subscriber() {
        let broadcaster = Broadcaster::new();
        let leaving = Arc::new(RecordingSubscriber::default());
        let staying = Arc::new(RecordingSubscriber::default());
        let unsubscribe = broadcaster.subscribe(CASE, leaving.clone());
        broadcaster.subscribe(CASE, staying.clone());

        unsubscribe.detach();
        broadcaster.publish_empty(CASE, "case_update");

        assert!(leaving.messages().is_empty());
        assert_eq!(staying.messages().len(), 1);
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);
    }

    #[test]
    fn detach_twice_is_noop() {
        let broadcaster = Broadcaster::new();
        let unsubscribe = broadcaster.subscribe(CASE, Arc::new(RecordingSubscriber::default()));
        let other = broadcaster.subscribe(CASE, Arc::new(RecordingSubscriber::default()));

        unsubscribe.detach();
        unsubscribe.detach();

        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);
        other.detach();
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn last_detach_removes_case_entry() {
        let broadcaster = Broadcaster::new();
        let gone = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, gone.clone()).detach();
        assert_eq!(broadcaster.case_count(), 0);

        broadcaster.publish_empty(CASE, "case_update");
        assert!(gone.messages().is_empty());

        // A fresh subscription starts from an empty set.
        let fresh = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, fresh.clone());
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);
    }

    // Write failures are swallowed on purpose: publishing is fire-and-forget
    // and a dead connection must not affect the others.
    #[test]
    fn failing_subscriber_is_pruned_and_others_still_receive() {
        let broadcaster = Broadcaster::new();
        let broken = Arc::new(BrokenSubscriber::default());
        let healthy = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, broken.clone());
        broadcaster.subscribe(CASE, healthy.clone());

        broadcaster.publish(CASE, "case_update", &json!({"title": "X"}));

        assert_eq!(healthy.messages().len(), 1);
        assert_eq!(*broken.attempts.lock(), 1);
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);

        broadcaster.publish(CASE, "case_update", &json!({"title": "Y"}));

        assert_eq!(*broken.attempts.lock(), 1);
        assert_eq!(
            healthy.messages(),
            vec![
                "event: case_update\ndata: {\"title\":\"X\"}\n\n",
                "event: case_update\ndata: {\"title\":\"Y\"}\n\n",
            ]
        );
    }

    #[test]
    fn pruning_last_subscriber_removes_case_entry() {
        let broadcaster = Broadcaster::new();
        broadcaster.subscribe(CASE, Arc::new(BrokenSubscriber::default()));

        broadcaster.publish_empty(CASE, "case_update");

        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn detach_after_prune_is_noop() {
        let broadcaster = Broadcaster::new();
        let unsubscribe = broadcaster.subscribe(CASE, Arc::new(BrokenSubscriber::default()));
        broadcaster.publish_empty(CASE, "case_update");
        unsubscribe.detach();
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn empty_case_id_is_ignored() {
        let broadcaster = Broadcaster::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        let unsubscribe = broadcaster.subscribe("", subscriber.clone());
        assert!(unsubscribe.case_id().is_none());
        assert_eq!(broadcaster.case_count(), 0);

        broadcaster.publish("", "case_update", &json!({"title": "X"}));
        unsubscribe.detach();

        assert!(subscriber.messages().is_empty());
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn oversized_payload_is_dropped() {
        let broadcaster = Broadcaster::with_limits(Limits {
            max_payload_bytes: 16,
            ..Limits::default()
        });
        let subscriber = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, subscriber.clone());

        broadcaster.publish(CASE, "document_upload", &json!({"name": "a very long file name.pdf"}));
        broadcaster.publish(CASE, "document_upload", &json!({"n": 1}));

        assert_eq!(subscriber.messages(), vec!["event: document_upload\ndata: {\"n\":1}\n\n"]);
    }

    #[test]
    fn multiline_event_name_is_dropped() {
        let broadcaster = Broadcaster::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, subscriber.clone());

        broadcaster.publish_empty(CASE, "case_update\n\nevent: forged");

        assert!(subscriber.messages().is_empty());
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);
    }

    #[test]
    fn try_subscribe_enforces_limit() {
        let broadcaster = Broadcaster::with_limits(Limits {
            max_subscribers_per_case: 2,
            ..Limits::default()
        });
        let first = broadcaster
            .try_subscribe(CASE, Arc::new(RecordingSubscriber::default()))
            .unwrap();
        broadcaster
            .try_subscribe(CASE, Arc::new(RecordingSubscriber::default()))
            .unwrap();

        let result = broadcaster.try_subscribe(CASE, Arc::new(RecordingSubscriber::default()));
        assert!(matches!(
            result,
            Err(CaseEventsError::CaseFull { limit: 2, .. })
        ));

        first.detach();
        assert!(broadcaster
            .try_subscribe(CASE, Arc::new(RecordingSubscriber::default()))
            .is_ok());
    }

    #[test]
    fn try_subscribe_with_zero_limit_leaves_no_entry() {
        let broadcaster = Broadcaster::with_limits(Limits {
            max_subscribers_per_case: 0,
            ..Limits::default()
        });
        let result = broadcaster.try_subscribe(CASE, Arc::new(RecordingSubscriber::default()));
        assert!(result.is_err());
        assert_eq!(broadcaster.case_count(), 0);
    }

    #[test]
    fn detach_after_broadcaster_dropped_is_noop() {
        let broadcaster = Broadcaster::new();
        let unsubscribe = broadcaster.subscribe(CASE, Arc::new(RecordingSubscriber::default()));
        drop(broadcaster);
        unsubscribe.detach();
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = Broadcaster::new();
        let b = Broadcaster::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        a.subscribe(CASE, subscriber.clone());

        b.publish_empty(CASE, "case_update");

        assert!(subscriber.messages().is_empty());
        assert_eq!(b.case_count(), 0);
        assert_eq!(a.total_subscribers(), 1);
    }

    #[test]
    fn reader_that_never_drains_is_pruned_at_queue_limit() {
        let broadcaster = Broadcaster::new();
        let (stalled, _receiver) = ChannelSubscriber::new(4);
        let healthy = Arc::new(RecordingSubscriber::default());
        broadcaster.subscribe(CASE, Arc::new(stalled));
        broadcaster.subscribe(CASE, healthy.clone());

        for n in 0..4 {
            broadcaster.publish(CASE, "case_update", &json!({"n": n}));
        }
        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 2);

        broadcaster.publish(CASE, "case_update", &json!({"n": 4}));

        assert_eq!(broadcaster.subscriber_count(&CASE.into()), 1);
        assert_eq!(healthy.messages().len(), 5);
    }

    #[test]
    fn concurrent_subscribe_publish_detach_leaves_registry_empty() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;
        let broadcaster = Broadcaster::new();

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let broadcaster = &broadcaster;
                scope.spawn(move || {
                    let case_id = format!("case-{}", t % 3);
                    for round in 0..ROUNDS {
                        let subscriber = Arc::new(RecordingSubscriber::default());
                        let unsubscribe = broadcaster.subscribe(&case_id, subscriber.clone());
                        broadcaster.publish(&case_id, "case_update", &json!({"t": t, "round": round}));
                        broadcaster.publish_empty("case-0", "new_message");
                        unsubscribe.detach();
                        assert!(!subscriber.messages().is_empty());
                    }
                });
            }
        });

        assert_eq!(broadcaster.case_count(), 0);
        assert_eq!(broadcaster.total_subscribers(), 0);
    }
}
