use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};
use crate::saga::SagaCoordinator;
use crate::tenant::TenantManager;

const REAPER_INTERVAL: Duration = Duration::from_secs(5);
const COMPACTOR_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that periodically expires lapsed holds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        interval.tick().await;
        reap_expired(&engine).await;
    }
}

/// One reaper pass. Returns how many holds were expired.
pub async fn reap_expired(engine: &Engine) -> usize {
    let mut reaped = 0;
    for (hold_id, _resource_id) in engine.collect_expired_holds(now_ms()) {
        match engine.expire_hold(hold_id).await {
            Ok(true) => {
                reaped += 1;
                info!(tenant = %engine.tenant, "reaped expired hold {hold_id}");
            }
            Ok(false) => {}
            // May have been confirmed, cancelled or deleted since collection
            Err(e) => tracing::debug!("reaper skip {hold_id}: {e}"),
        }
    }
    reaped
}

/// Background task that compacts the tenant's WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACTOR_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(tenant = %engine.tenant, "WAL compaction failed: {e}");
        }
    }
}

/// Background task that finishes orders a crash left PENDING or
/// COMPENSATING and retries unresolved compensation, across all tenants.
pub async fn run_saga_sweeper(
    tenants: Arc<TenantManager>,
    coordinator: Arc<SagaCoordinator>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        for engine in tenants.engines() {
            let recovered = coordinator.recover(&engine).await;
            if recovered > 0 {
                info!(tenant = %engine.tenant, recovered, "saga sweeper finalized orders");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::model::*;
    use crate::notify::{NotifyHub, RESERVATION_EXPIRED};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservoir_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_expires_lapsed_holds() {
        let notify = Arc::new(NotifyHub::new());
        let mut expired_rx = notify.subscribe(RESERVATION_EXPIRED);
        let engine = Engine::new("campus", test_wal_path("reaper_expire.wal"), notify).unwrap();
        let admin = AuthContext::admin("campus", "facilities");
        let member = AuthContext::member("campus", "alice");

        let rid = Ulid::new();
        engine
            .create_resource(&admin, rid, None, None, Capacity::Units(2))
            .await
            .unwrap();

        let hold_id = Ulid::new();
        engine
            .hold(&member, hold_id, rid, Claim::Quantity(2), now_ms() + 50)
            .await
            .unwrap();
        assert_eq!(engine.remaining(&member, rid, Claim::Quantity(1)).await.unwrap(), 0);
        // Not due yet
        assert_eq!(reap_expired(&engine).await, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let due = engine.collect_expired_holds(now_ms());
        assert_eq!(due, vec![(hold_id, rid)]);

        assert_eq!(reap_expired(&engine).await, 1);
        let hold = engine.get_allocation(&member, hold_id).await.unwrap();
        assert_eq!(hold.status, AllocationStatus::Failed);
        assert_eq!(engine.remaining(&member, rid, Claim::Quantity(1)).await.unwrap(), 2);
        assert!(engine.collect_expired_holds(now_ms()).is_empty());

        let event = expired_rx.recv().await.unwrap();
        assert_eq!(event.payload["allocationId"], hold_id.to_string());
        assert_eq!(event.payload["status"], "FAILED");
    }

    #[tokio::test]
    async fn confirmed_hold_is_not_reaped() {
        let engine = Engine::new(
            "campus",
            test_wal_path("reaper_confirmed.wal"),
            Arc::new(NotifyHub::new()),
        )
        .unwrap();
        let admin = AuthContext::admin("campus", "facilities");
        let member = AuthContext::member("campus", "alice");

        let rid = Ulid::new();
        engine
            .create_resource(&admin, rid, None, None, Capacity::Exclusive)
            .await
            .unwrap();
        let hold_id = Ulid::new();
        engine
            .hold(&member, hold_id, rid, Claim::Interval(Span::new(1000, 2000)), now_ms() + 60_000)
            .await
            .unwrap();
        engine.confirm_hold(&member, hold_id).await.unwrap();

        assert!(engine.collect_expired_holds(now_ms() + 120_000).is_empty());
        assert_eq!(reap_expired(&engine).await, 0);
        assert_eq!(
            engine.get_allocation(&member, hold_id).await.unwrap().status,
            AllocationStatus::Confirmed
        );
    }
}
