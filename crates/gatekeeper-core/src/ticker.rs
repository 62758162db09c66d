//! Background expiry ticker: periodically reclaims leases whose
//! `expires_at` has passed, independent of whatever traffic is hitting the
//! engine's request/heartbeat/complete paths.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::SchedulingEngine;

/// Spawns a loop that calls [`SchedulingEngine::expire_tick`] every
/// `interval`. The returned handle can be aborted to stop the ticker;
/// dropping it without aborting leaves the ticker running detached.
pub fn spawn(engine: Arc<SchedulingEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Missed ticks coalesce instead of bursting once the engine catches up.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            engine.expire_tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatekeeperConfig;
    use crate::engine::{LeaseOutcome, SchedulingEngine};
    use crate::job::{JobSpec, Priority};
    use crate::metrics::{HostStats, InMemoryMetricsProvider};
    use chrono::Utc;

    #[tokio::test]
    async fn ticker_reclaims_expired_lease_in_the_background() {
        let provider = Arc::new(InMemoryMetricsProvider::new());
        provider.set(
            Some(HostStats { sampled_at: Some(Utc::now()), cpu_percent: Some(0.0), memory_percent: Some(0.0) }),
            None,
        );
        let config = GatekeeperConfig::builder()
            .total_capacity_units(100)
            .reserve_units(0)
            .lease_ttl_s(0)
            .heartbeat_grace_s(0)
            .build();
        let engine = Arc::new(SchedulingEngine::builder(config).metrics(provider).build());

        engine.submit(JobSpec::new("demo.task", Priority::Normal, 10)).await;
        let granted = engine.request_lease("w1", None).await;
        assert!(matches!(granted, LeaseOutcome::Granted { .. }));

        let handle = spawn(engine.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        let snap = engine.snapshot().await;
        assert_eq!(snap.active_leases, 0);
    }
}
