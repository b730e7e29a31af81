//! Environment lease holding
//!
//! A [`LeaseGuard`] keeps an acquired lease alive with a background heartbeat
//! that renews it every third of its TTL. If a renewal is refused the guard is
//! marked lost and the holder must re-acquire before its next mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel_core::domain::lease::Lease;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::StateStore;

pub struct LeaseGuard {
    environment: String,
    holder: Uuid,
    store: Arc<dyn StateStore>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl LeaseGuard {
    /// Start heartbeating a freshly acquired lease
    pub fn start(store: Arc<dyn StateStore>, lease: Lease, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        tokio::spawn(heartbeat(
            Arc::clone(&store),
            lease.clone(),
            ttl,
            Arc::clone(&lost),
            stop.clone(),
        ));

        Self {
            environment: lease.environment,
            holder: lease.holder,
            store,
            lost,
            stop,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop heartbeating and give the lease back
    pub async fn release(self) {
        self.stop.cancel();
        match self.store.release_lease(&self.environment, self.holder).await {
            Ok(()) => info!(
                "Run {} released lease on {}",
                self.holder, self.environment
            ),
            // the lease will lapse on its own once the heartbeat has stopped
            Err(e) => warn!(
                "Failed to release lease on {} held by {}: {}",
                self.environment, self.holder, e
            ),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn heartbeat(
    store: Arc<dyn StateStore>,
    lease: Lease,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let period = ttl / 3;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_renewed = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Lease heartbeat for {} stopped", lease.environment);
                return;
            }
            _ = ticker.tick() => {}
        }

        match store.renew_lease(&lease.environment, lease.holder, ttl).await {
            Ok(true) => {
                last_renewed = tokio::time::Instant::now();
                debug!("Renewed lease on {} for run {}", lease.environment, lease.holder);
            }
            Ok(false) => {
                warn!(
                    "Run {} lost its lease on {}",
                    lease.holder, lease.environment
                );
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!("Failed to renew lease on {}: {}", lease.environment, e);
                if last_renewed.elapsed() >= ttl {
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStateStore;

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let holder = Uuid::new_v4();
        let ttl = Duration::from_millis(90);
        let lease = store.acquire_lease("prod", holder, ttl).await.unwrap().unwrap();
        let first_expiry = lease.expires_at;

        let guard = LeaseGuard::start(Arc::clone(&store), lease, ttl);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let current = store.lease("prod").await.unwrap().unwrap();
        assert_eq!(current.holder, holder);
        assert!(current.expires_at > first_expiry);
        assert!(!guard.is_lost());

        guard.release().await;
        assert!(store.lease("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stolen_lease_is_reported_lost() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let holder = Uuid::new_v4();
        let ttl = Duration::from_millis(60);
        let lease = store.acquire_lease("prod", holder, ttl).await.unwrap().unwrap();
        let guard = LeaseGuard::start(Arc::clone(&store), lease, ttl);

        // another holder takes over after a release behind our back
        store.release_lease("prod", holder).await.unwrap();
        store
            .acquire_lease("prod", Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.is_lost());
    }
}
