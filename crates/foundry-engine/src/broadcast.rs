use crate::types::BuildEvent;
use chrono::Utc;
use foundry_core::{EngineConfig, EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// A live subscription to one build's event stream.
pub struct Subscription {
    /// Handle used to unsubscribe.
    pub id: Uuid,
    /// The event queue. Dropping it is equivalent to unsubscribing; the hub
    /// removes closed queues on the next broadcast pass.
    pub receiver: mpsc::Receiver<BuildEvent>,
}

struct SubscriberEntry {
    id: Uuid,
    tx: mpsc::Sender<BuildEvent>,
    /// Unix seconds of the last successful delivery, for staleness sweeps.
    last_delivery: Arc<AtomicI64>,
}

/// Fans lifecycle events out to per-build subscriber queues.
///
/// Delivery is always non-blocking: a full or closed queue never stalls the
/// broadcaster. Offending subscribers are collected during the pass and
/// removed after it, so one slow consumer cannot accumulate backlog.
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Uuid, Vec<SubscriberEntry>>>,
    buffer: usize,
    max_per_build: usize,
    stale_after_secs: i64,
}

impl BroadcastHub {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: config.subscriber_buffer,
            max_per_build: config.max_subscribers_per_build,
            stale_after_secs: config.stale_subscriber_secs as i64,
        }
    }

    /// Register a subscriber queue for a build. Fails once the per-build cap
    /// is reached.
    pub async fn subscribe(&self, build_id: Uuid) -> EngineResult<Subscription> {
        let mut subscribers = self.subscribers.write().await;
        let entries = subscribers.entry(build_id).or_default();
        if entries.len() >= self.max_per_build {
            return Err(EngineError::Config(format!(
                "subscriber limit of {} reached for build {build_id}",
                self.max_per_build
            )));
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        entries.push(SubscriberEntry {
            id,
            tx,
            last_delivery: Arc::new(AtomicI64::new(Utc::now().timestamp())),
        });
        debug!(build_id = %build_id, subscriber = %id, "subscriber added");
        Ok(Subscription { id, receiver: rx })
    }

    /// Remove a subscriber. Idempotent; unknown ids are a no-op.
    pub async fn unsubscribe(&self, build_id: Uuid, subscriber_id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(entries) = subscribers.get_mut(&build_id) {
            entries.retain(|e| e.id != subscriber_id);
            if entries.is_empty() {
                subscribers.remove(&build_id);
            }
        }
    }

    /// Deliver an event to every subscriber of its build. A no-op for builds
    /// with no subscribers (evicted builds included).
    pub async fn broadcast(&self, event: BuildEvent) {
        let build_id = event.build_id;

        // Snapshot senders under the read lock; sends happen after release.
        let targets: Vec<(Uuid, mpsc::Sender<BuildEvent>, Arc<AtomicI64>)> = {
            let subscribers = self.subscribers.read().await;
            match subscribers.get(&build_id) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id, e.tx.clone(), Arc::clone(&e.last_delivery)))
                    .collect(),
                None => return,
            }
        };

        let mut dead: Vec<Uuid> = Vec::new();
        for (id, tx, last_delivery) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    last_delivery.store(Utc::now().timestamp(), Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(build_id = %build_id, subscriber = %id, "subscriber queue full, dropping");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            if let Some(entries) = subscribers.get_mut(&build_id) {
                entries.retain(|e| !dead.contains(&e.id));
                if entries.is_empty() {
                    subscribers.remove(&build_id);
                }
            }
        }
    }

    /// Drop every subscriber of a build, closing their queues. Used by
    /// eviction and cancellation.
    pub async fn close_build(&self, build_id: Uuid) -> usize {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&build_id).map_or(0, |e| e.len())
    }

    /// Remove subscribers with no successful delivery within the staleness
    /// window. Returns how many were removed.
    pub async fn remove_stale(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.stale_after_secs;
        let mut subscribers = self.subscribers.write().await;
        let mut removed = 0;
        subscribers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.last_delivery.load(Ordering::Relaxed) >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Number of subscribers for one build.
    pub async fn subscriber_count(&self, build_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&build_id)
            .map_or(0, Vec::len)
    }

    /// Total subscribers across all builds.
    pub async fn total_subscribers(&self) -> usize {
        self.subscribers.read().await.values().map(Vec::len).sum()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    fn event(build_id: Uuid) -> BuildEvent {
        BuildEvent::new(EventKind::BuildProgress, build_id, serde_json::json!({"p": 1}))
    }

    fn hub() -> BroadcastHub {
        BroadcastHub::new(&EngineConfig::default())
    }

    #[tokio::test]
    async fn broadcast_delivers_to_all_subscribers() {
        let hub = hub();
        let build_id = Uuid::new_v4();
        let mut sub1 = hub.subscribe(build_id).await.unwrap();
        let mut sub2 = hub.subscribe(build_id).await.unwrap();

        hub.broadcast(event(build_id)).await;

        assert_eq!(sub1.receiver.recv().await.unwrap().build_id, build_id);
        assert_eq!(sub2.receiver.recv().await.unwrap().build_id, build_id);
    }

    #[tokio::test]
    async fn broadcast_to_unknown_build_is_noop() {
        let hub = hub();
        hub.broadcast(event(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn full_subscriber_is_removed_without_blocking() {
        let config = EngineConfig::from_toml("subscriber_buffer = 2\n").unwrap();
        let hub = BroadcastHub::new(&config);
        let build_id = Uuid::new_v4();
        let _sub = hub.subscribe(build_id).await.unwrap();

        // Capacity 2, never drained: the third send finds the queue full.
        hub.broadcast(event(build_id)).await;
        hub.broadcast(event(build_id)).await;
        assert_eq!(hub.subscriber_count(build_id).await, 1);
        hub.broadcast(event(build_id)).await;
        assert_eq!(hub.subscriber_count(build_id).await, 0);

        // Subsequent broadcasts still succeed.
        hub.broadcast(event(build_id)).await;
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_pass() {
        let hub = hub();
        let build_id = Uuid::new_v4();
        let sub = hub.subscribe(build_id).await.unwrap();
        drop(sub.receiver);

        hub.broadcast(event(build_id)).await;
        assert_eq!(hub.subscriber_count(build_id).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = hub();
        let build_id = Uuid::new_v4();
        let sub = hub.subscribe(build_id).await.unwrap();
        hub.unsubscribe(build_id, sub.id).await;
        hub.unsubscribe(build_id, sub.id).await;
        assert_eq!(hub.subscriber_count(build_id).await, 0);
    }

    #[tokio::test]
    async fn subscriber_cap_enforced() {
        let config = EngineConfig::from_toml("max_subscribers_per_build = 1\n").unwrap();
        let hub = BroadcastHub::new(&config);
        let build_id = Uuid::new_v4();
        let _sub = hub.subscribe(build_id).await.unwrap();
        assert!(hub.subscribe(build_id).await.is_err());
    }

    #[tokio::test]
    async fn close_build_drops_queues() {
        let hub = hub();
        let build_id = Uuid::new_v4();
        let mut sub = hub.subscribe(build_id).await.unwrap();
        assert_eq!(hub.close_build(build_id).await, 1);
        // Sender side is gone; the receiver sees end-of-stream.
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn stale_sweep_removes_idle_subscribers() {
        let config = EngineConfig::from_toml("stale_subscriber_secs = 0\n").unwrap();
        let hub = BroadcastHub::new(&config);
        let build_id = Uuid::new_v4();
        let _sub = hub.subscribe(build_id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        assert_eq!(hub.remove_stale().await, 1);
        assert_eq!(hub.total_subscribers().await, 0);
    }
}
