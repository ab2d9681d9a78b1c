//! Eviction sweeper: periodic `cleanup` of idle sessions.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SessionPool;

/// Run `pool.cleanup(max_age)` every `interval` until `cancel` fires.
pub fn spawn_sweeper(
    pool: SessionPool,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs_f64(),
            max_age_secs = max_age.as_secs_f64(),
            "Session sweeper started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = pool.cleanup(max_age).await;
                    debug!(evicted = report.evicted.len(), live = pool.len(), "Sweep finished");
                }
            }
        }

        debug!("Session sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::PoolConfig;
    use crate::engine::testing::ScriptedFactory;
    use crate::model::test_support::descriptor;
    use crate::store::file::FileSessionStateStore;

    #[tokio::test]
    async fn sweeper_evicts_idle_sessions_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let factory = ScriptedFactory::new(100);
        let pool = SessionPool::new(
            &PoolConfig {
                size: 2,
                persistence: false,
                ..PoolConfig::default()
            },
            Arc::new(factory.clone()),
            Arc::new(FileSessionStateStore::new(dir.path())),
        );
        drop(
            pool.get_or_create("c1", Arc::new(descriptor("m")), false)
                .await
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let join = spawn_sweeper(
            pool.clone(),
            Duration::from_millis(10),
            Duration::from_millis(5),
            cancel.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while (pool.contains("c1") || factory.live() > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!pool.contains("c1"));
        assert_eq!(factory.live(), 0);

        cancel.cancel();
        join.await.unwrap();
    }
}
