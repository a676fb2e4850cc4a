// service/concurrency.rs
use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use super::error::ServiceError;

/// Compare-and-swap retries before a version conflict is surfaced.
pub const MAX_CAS_RETRIES: u32 = 3;

/// Lockable aggregates. The variant order is the global lock order:
/// project, then milestone, then dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKey {
    Project(Uuid),
    Milestone(Uuid),
    Dispute(Uuid),
}

/// Held locks, released on drop.
#[derive(Debug)]
pub struct AggregateGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Per-aggregate async mutexes shared by request handlers and sweeps.
#[derive(Debug, Clone, Default)]
pub struct AggregateLocks {
    slots: Arc<RwLock<HashMap<AggregateKey, Arc<Mutex<()>>>>>,
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: AggregateKey) -> Arc<Mutex<()>> {
        if let Some(slot) = self.slots.read().await.get(&key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn ordered(keys: &[AggregateKey]) -> Vec<AggregateKey> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Waits for every lock, always in the global order.
    pub async fn acquire(&self, keys: &[AggregateKey]) -> AggregateGuard {
        let mut guards = Vec::with_capacity(keys.len());
        for key in Self::ordered(keys) {
            guards.push(self.slot(key).await.lock_owned().await);
        }
        AggregateGuard { _guards: guards }
    }

    /// Non-blocking variant for sweeps: `None` when any lock is taken.
    pub async fn try_acquire(&self, keys: &[AggregateKey]) -> Option<AggregateGuard> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in Self::ordered(keys) {
            guards.push(self.slot(key).await.try_lock_owned().ok()?);
        }
        Some(AggregateGuard { _guards: guards })
    }

    /// Drops slots nobody holds or waits on.
    pub async fn prune(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - slots.len()
    }
}

/// Re-runs `op` when a concurrent writer bumped a version between our read
/// and our commit.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(ServiceError::ConcurrentModification(what)) if retries < MAX_CAS_RETRIES => {
                retries += 1;
                tracing::debug!(retries, conflict = %what, "Version conflict, retrying");
            }
            Err(ServiceError::ConcurrentModification(what)) => {
                return Err(ServiceError::StateConflict(format!(
                    "{} kept changing concurrently",
                    what
                )));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let locks = AggregateLocks::new();
        let milestone = AggregateKey::Milestone(Uuid::new_v4());

        let held = locks.acquire(&[milestone]).await;
        assert!(locks.try_acquire(&[milestone]).await.is_none());
        drop(held);
        assert!(locks.try_acquire(&[milestone]).await.is_some());
    }

    #[tokio::test]
    async fn keys_are_locked_in_global_order() {
        let project = AggregateKey::Project(Uuid::new_v4());
        let milestone = AggregateKey::Milestone(Uuid::new_v4());
        let dispute = AggregateKey::Dispute(Uuid::new_v4());
        assert_eq!(
            AggregateLocks::ordered(&[dispute, milestone, project, milestone]),
            vec![project, milestone, dispute]
        );
    }

    #[tokio::test]
    async fn prune_keeps_held_slots() {
        let locks = AggregateLocks::new();
        let a = AggregateKey::Project(Uuid::new_v4());
        let b = AggregateKey::Project(Uuid::new_v4());
        let _held = locks.acquire(&[a]).await;
        drop(locks.acquire(&[b]).await);
        assert_eq!(locks.prune().await, 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_then_surfaced() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), _> = retry_on_conflict(|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::ConcurrentModification("project p".into()))
        })
        .await;

        assert!(matches!(result, Err(ServiceError::StateConflict(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_CAS_RETRIES + 1);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), _> = retry_on_conflict(|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Validation("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
