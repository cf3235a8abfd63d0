//! In-flight request correlation.
//!
//! Each dispatch registers a one-shot waiter keyed by its payload id; the
//! response routing task resolves the waiter when the matching terminal
//! payload arrives. Waiters also record which worker the request was drained
//! to, so a dying worker can fail exactly its own in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::DispatcherError;

pub(crate) type WaiterResult = Result<Value, DispatcherError>;

struct Waiter {
    sender: oneshot::Sender<WaiterResult>,
    /// Worker index assigned at drain time; None while still queued.
    process_id: Option<usize>,
}

#[derive(Default)]
pub(crate) struct CorrelationRegistry {
    waiters: DashMap<String, Waiter>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. The returned receiver completes with the terminal
    /// result; dropping it makes the eventual response a dropped late
    /// response.
    pub fn register(&self, payload_id: String) -> oneshot::Receiver<WaiterResult> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(
            payload_id,
            Waiter {
                sender,
                process_id: None,
            },
        );
        receiver
    }

    /// Record which worker the request was drained to.
    pub fn assign(&self, payload_id: &str, process_id: usize) {
        if let Some(mut waiter) = self.waiters.get_mut(payload_id) {
            waiter.process_id = Some(process_id);
        }
    }

    /// Deliver the terminal result to the matching waiter.
    ///
    /// Returns the assigned worker index when a waiter existed; `None` for a
    /// late or unknown response.
    pub fn resolve(&self, payload_id: &str, result: WaiterResult) -> Option<Option<usize>> {
        let (_, waiter) = self.waiters.remove(payload_id)?;
        let _ = waiter.sender.send(result);
        Some(waiter.process_id)
    }

    /// Drop a waiter without resolving it (caller gave up).
    pub fn remove(&self, payload_id: &str) {
        self.waiters.remove(payload_id);
    }

    /// Fail every waiter assigned to the given worker. Returns how many were
    /// failed.
    pub fn fail_for_process(
        &self,
        process_id: usize,
        error: impl Fn() -> DispatcherError,
    ) -> usize {
        let ids: Vec<String> = self
            .waiters
            .iter()
            .filter(|entry| entry.value().process_id == Some(process_id))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            if let Some((_, waiter)) = self.waiters.remove(id) {
                let _ = waiter.sender.send(Err(error()));
            }
        }
        ids.len()
    }

    /// Fail every remaining waiter (dispatcher teardown).
    pub fn fail_all(&self, error: impl Fn() -> DispatcherError) {
        let ids: Vec<String> = self.waiters.iter().map(|entry| entry.key().clone()).collect();
        for id in &ids {
            if let Some((_, waiter)) = self.waiters.remove(id) {
                let _ = waiter.sender.send(Err(error()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Payload id source: a per-process random prefix plus a monotonic counter.
///
/// The counter gives within-process uniqueness and ordering; the prefix keeps
/// ids from colliding across parent restarts.
pub(crate) struct UidGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self {
            prefix: uuid::Uuid::new_v4().simple().to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_result_once() {
        let registry = CorrelationRegistry::new();
        let receiver = registry.register("p-1".to_string());
        registry.assign("p-1", 2);

        let assigned = registry.resolve("p-1", Ok(json!("done"))).unwrap();
        assert_eq!(assigned, Some(2));
        assert_eq!(receiver.await.unwrap().unwrap(), json!("done"));

        // Second terminal response for the same id finds no waiter.
        assert!(registry.resolve("p-1", Ok(json!("again"))).is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_none() {
        let registry = CorrelationRegistry::new();
        assert!(registry.resolve("missing", Ok(Value::Null)).is_none());
    }

    #[tokio::test]
    async fn fail_for_process_only_hits_assigned_waiters() {
        let registry = CorrelationRegistry::new();
        let on_dead = registry.register("on-dead".to_string());
        let on_live = registry.register("on-live".to_string());
        let queued = registry.register("queued".to_string());
        registry.assign("on-dead", 0);
        registry.assign("on-live", 1);

        let failed = registry.fail_for_process(0, || {
            DispatcherError::Communication("worker 0 exited".to_string())
        });
        assert_eq!(failed, 1);

        assert!(matches!(
            on_dead.await.unwrap(),
            Err(DispatcherError::Communication(_))
        ));
        assert_eq!(registry.len(), 2);
        drop(on_live);
        drop(queued);
    }

    #[tokio::test]
    async fn fail_all_clears_the_registry() {
        let registry = CorrelationRegistry::new();
        let a = registry.register("a".to_string());
        let b = registry.register("b".to_string());

        registry.fail_all(|| DispatcherError::NotStarted);
        assert!(registry.is_empty());
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
    }

    #[test]
    fn uid_generator_is_unique_and_monotonic() {
        let uid = UidGenerator::new();
        let first = uid.next();
        let second = uid.next();
        assert_ne!(first, second);

        let suffix = |id: &str| -> u64 { id.rsplit('-').next().unwrap().parse().unwrap() };
        assert!(suffix(&second) > suffix(&first));

        // Distinct generators never share a prefix.
        let other = UidGenerator::new();
        assert_ne!(
            first.split('-').next().unwrap(),
            other.next().split('-').next().unwrap()
        );
    }
}
