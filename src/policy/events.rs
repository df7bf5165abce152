//! Service access change events.
//!
//! Events are buffered by the write transaction that produced them and handed
//! to an [`EventRegistry`] only after commit. Dispatch runs on a background
//! task so subscribers never hold the single writer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::policy::types::PolicyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceEventType {
    DialAccessGained,
    DialAccessLost,
    BindAccessGained,
    BindAccessLost,
    Updated,
}

impl ServiceEventType {
    pub fn access(policy_type: PolicyType, gained: bool) -> Self {
        match (policy_type, gained) {
            (PolicyType::Dial, true) => ServiceEventType::DialAccessGained,
            (PolicyType::Dial, false) => ServiceEventType::DialAccessLost,
            (PolicyType::Bind, true) => ServiceEventType::BindAccessGained,
            (PolicyType::Bind, false) => ServiceEventType::BindAccessLost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub identity_id: String,
    pub service_id: String,
    pub policy_type: PolicyType,
}

pub type Subscriber = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber list. Readers take a snapshot; subscribe and unsubscribe swap
/// in a new list, so dispatch never observes a list being modified.
#[derive(Default)]
pub struct EventRegistry {
    subscribers: RwLock<Arc<Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, Arc::new(f) as Subscriber));
        *guard = Arc::new(next);
        id
    }

    /// Returns false if the subscription was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.iter().any(|(sid, _)| *sid == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|(sid, _)| *sid != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Arc<Vec<(SubscriptionId, Subscriber)>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Deliver `events` in order to the subscribers registered at call time.
    /// A panicking subscriber is logged and skipped.
    pub fn dispatch(&self, events: Vec<ServiceEvent>) -> JoinHandle<()> {
        let subscribers = self.snapshot();
        tokio::spawn(async move {
            for event in &events {
                for (id, subscriber) in subscribers.iter() {
                    if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                        tracing::warn!(
                            subscription = id.0,
                            event_type = ?event.event_type,
                            identity_id = %event.identity_id,
                            service_id = %event.service_id,
                            "event subscriber panicked"
                        );
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(event_type: ServiceEventType) -> ServiceEvent {
        ServiceEvent {
            event_type,
            identity_id: "i1".into(),
            service_id: "s1".into(),
            policy_type: PolicyType::Dial,
        }
    }

    #[test]
    fn test_access_event_types() {
        assert_eq!(
            ServiceEventType::access(PolicyType::Dial, true),
            ServiceEventType::DialAccessGained
        );
        assert_eq!(
            ServiceEventType::access(PolicyType::Bind, false),
            ServiceEventType::BindAccessLost
        );
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(move |e| sink.lock().unwrap().push(e.event_type));

        registry
            .dispatch(vec![
                event(ServiceEventType::DialAccessGained),
                event(ServiceEventType::Updated),
                event(ServiceEventType::DialAccessLost),
            ])
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ServiceEventType::DialAccessGained,
                ServiceEventType::Updated,
                ServiceEventType::DialAccessLost,
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let registry = EventRegistry::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = registry.subscribe(move |_| *c.lock().unwrap() += 1);
        assert_eq!(registry.subscriber_count(), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry
            .dispatch(vec![event(ServiceEventType::Updated)])
            .await
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_stop_dispatch() {
        let registry = EventRegistry::new();
        let count = Arc::new(Mutex::new(0));
        registry.subscribe(|_| panic!("subscriber failure"));
        let c = count.clone();
        registry.subscribe(move |_| *c.lock().unwrap() += 1);

        registry
            .dispatch(vec![
                event(ServiceEventType::BindAccessGained),
                event(ServiceEventType::BindAccessLost),
            ])
            .await
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_subscribe_concurrently() {
        let registry = Arc::new(EventRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let id = r.subscribe(|_| {});
                        let _ = r.snapshot();
                        assert!(r.unsubscribe(id));
                    }
                    r.subscribe(|_| {});
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.subscriber_count(), 8);
    }
}
