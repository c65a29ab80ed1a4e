use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::error;

use crate::{NotificationRefresher, RetentionPolicy, RetentionSweeper};

/// Cron jobs for the periodic retention sweep and timer-driven refresh. The
/// returned scheduler is not started.
pub async fn build_scheduler(
    refresher: Arc<NotificationRefresher>,
    sweeper: Arc<RetentionSweeper>,
    policy: RetentionPolicy,
    retention_cron: &str,
    refresh_cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sweep_job = Job::new_async(retention_cron, move |_uuid, _l| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            if let Err(err) = sweeper.sweep(policy).await {
                error!(error = %err, "scheduled retention sweep failed");
            }
        })
    })
    .with_context(|| format!("creating retention job for cron {retention_cron}"))?;
    sched.add(sweep_job).await.context("adding retention job")?;

    let refresh_job = Job::new_async(refresh_cron, move |_uuid, _l| {
        let refresher = refresher.clone();
        Box::pin(async move {
            if let Err(err) = refresher.refresh().await {
                error!(error = %err, "scheduled notification refresh failed");
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {refresh_cron}"))?;
    sched.add(refresh_job).await.context("adding refresh job")?;

    Ok(sched)
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use tradewatch_core::SystemClock;
    use tradewatch_storage::MemoryStore;

    use super::*;
    use crate::AlertMatcher;

    fn parts() -> (Arc<NotificationRefresher>, Arc<RetentionSweeper>, RetentionPolicy) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock);
        let refresher = Arc::new(NotificationRefresher::new(
            AlertMatcher::new(store.clone(), clock.clone()),
            store.clone(),
            clock.clone(),
            Duration::hours(1),
            Duration::hours(24),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(store.clone(), store, clock));
        let policy = RetentionPolicy {
            offer_max_age: Duration::hours(72),
            notification_max_age: None,
        };
        (refresher, sweeper, policy)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_refresh_runs() {
        let (refresher, sweeper, policy) = parts();
        let mut sched = build_scheduler(
            refresher.clone(),
            sweeper,
            policy,
            "0 0 * * * *",
            "* * * * * *",
        )
        .await
        .unwrap();
        sched.start().await.unwrap();

        let mut ran = false;
        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            if refresher.last_refresh().await.is_some() {
                ran = true;
                break;
            }
        }
        sched.shutdown().await.unwrap();
        assert!(ran, "refresh job did not fire within 5s");
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let (refresher, sweeper, policy) = parts();
        assert!(build_scheduler(refresher, sweeper, policy, "not a cron", "* * * * * *")
            .await
            .is_err());
    }
}
