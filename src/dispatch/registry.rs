//! Consumer registry.
//!
//! Tracks the live consumers of one subscription in join order and owns
//! their lifetime; the selector only ever sees names. Flow-control credit
//! is read through the [`Consumer`] trait on every admission pass.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::DispatchError;
use crate::log::Entry;

use super::selector::HashRange;

/// Transport-side view of one consumer.
///
/// `send_entries` resolves when the transport accepted the batch; a
/// transport error sends the batch back to redelivery. Permit accounting
/// lives with the transport and is reconciled as sends and acks complete.
#[async_trait::async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    async fn send_entries(&self, batch: Vec<Arc<Entry>>) -> Result<(), DispatchError>;

    /// Flow-control credit granted by the consumer.
    fn available_permits(&self) -> i32;

    /// Messages delivered but not yet acknowledged.
    fn unacked_messages(&self) -> i32;

    fn max_unacked_messages(&self) -> i32;

    /// Blocked consumers receive nothing regardless of permits.
    fn is_blocked(&self) -> bool {
        false
    }

    /// Hash ranges claimed at subscribe time (Sticky mode only).
    fn claimed_hash_ranges(&self) -> Option<Vec<HashRange>> {
        None
    }

    /// The dispatcher refused the consumer (e.g. it is already closed).
    fn disconnect(&self) {}
}

/// Deliverable credit: permits capped by the unacked-message budget.
pub fn effective_permits(consumer: &dyn Consumer) -> usize {
    if consumer.is_blocked() {
        return 0;
    }
    let budget = consumer.max_unacked_messages() - consumer.unacked_messages();
    consumer.available_permits().min(budget).max(0) as usize
}

/// Live consumers of one subscription, in join order.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: IndexMap<String, Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under its (unique) name.
    pub fn add(&mut self, consumer: Arc<dyn Consumer>) -> Result<(), DispatchError> {
        let name = consumer.name().to_string();
        if self.consumers.contains_key(&name) {
            return Err(DispatchError::InvalidArgument(format!(
                "consumer {name} already subscribed"
            )));
        }
        self.consumers.insert(name, consumer);
        Ok(())
    }

    /// Drop a consumer, preserving the join order of the others.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Consumer>> {
        self.consumers.get(name)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Consumer>> {
        self.consumers.values()
    }

    /// Sum of deliverable credit over all consumers.
    pub fn total_effective_permits(&self) -> usize {
        self.consumers
            .values()
            .map(|c| effective_permits(c.as_ref()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct FakeConsumer {
        name: String,
        permits: AtomicI32,
        unacked: AtomicI32,
        max_unacked: i32,
        blocked: bool,
    }

    impl FakeConsumer {
        fn new(name: &str, permits: i32, unacked: i32, max_unacked: i32, blocked: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                permits: AtomicI32::new(permits),
                unacked: AtomicI32::new(unacked),
                max_unacked,
                blocked,
            })
        }
    }

    #[async_trait::async_trait]
    impl Consumer for FakeConsumer {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send_entries(&self, _batch: Vec<Arc<Entry>>) -> Result<(), DispatchError> {
            Ok(())
        }
        fn available_permits(&self) -> i32 {
            self.permits.load(Ordering::Relaxed)
        }
        fn unacked_messages(&self) -> i32 {
            self.unacked.load(Ordering::Relaxed)
        }
        fn max_unacked_messages(&self) -> i32 {
            self.max_unacked
        }
        fn is_blocked(&self) -> bool {
            self.blocked
        }
    }

    #[test]
    fn test_effective_permits_caps_on_unacked_budget() {
        let c = FakeConsumer::new("c", 100, 45, 50, false);
        assert_eq!(effective_permits(c.as_ref()), 5);
        let c = FakeConsumer::new("c", 3, 45, 50, false);
        assert_eq!(effective_permits(c.as_ref()), 3);
        let c = FakeConsumer::new("c", 10, 60, 50, false);
        assert_eq!(effective_permits(c.as_ref()), 0);
        let c = FakeConsumer::new("c", -1, 0, 50, false);
        assert_eq!(effective_permits(c.as_ref()), 0);
    }

    #[test]
    fn test_blocked_consumer_has_no_permits() {
        let c = FakeConsumer::new("c", 100, 0, 50, true);
        assert_eq!(effective_permits(c.as_ref()), 0);
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut reg = ConsumerRegistry::new();
        reg.add(FakeConsumer::new("c1", 1, 0, 10, false)).unwrap();
        let dup = reg.add(FakeConsumer::new("c1", 1, 0, 10, false));
        assert!(matches!(dup, Err(DispatchError::InvalidArgument(_))));
    }

    #[test]
    fn test_registry_preserves_join_order() {
        let mut reg = ConsumerRegistry::new();
        for name in ["c3", "c1", "c2"] {
            reg.add(FakeConsumer::new(name, 1, 0, 10, false)).unwrap();
        }
        reg.remove("c1");
        let names: Vec<&str> = reg.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["c3", "c2"]);
    }
}
