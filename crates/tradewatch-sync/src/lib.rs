//! Pipeline orchestration: scrape loop, alert matching, notification refresh,
//! retention sweeps and their scheduling.

use std::sync::Arc;

use tokio_cron_scheduler::JobScheduler;
use tradewatch_adapters::SourceAdapter;
use tradewatch_core::Clock;
use tradewatch_storage::Stores;

mod config;
mod gate;
mod matching;
mod notify;
mod retention;
mod scheduler;
mod scrape;

pub use config::{ConfigError, PipelineConfig, SourceConfig, SourceKind, SourceRegistry};
pub use gate::IngestGate;
pub use matching::AlertMatcher;
pub use notify::{NotificationRefresher, NotificationService, RefreshReport};
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport};
pub use scheduler::build_scheduler;
pub use scrape::{
    inter_cycle_delay, DelayWindow, RetryPolicy, ScrapeConfig, ScrapeError, ScrapeLoop,
};

pub const CRATE_NAME: &str = "tradewatch-sync";

/// The wired-up components sharing one set of stores, one clock and one
/// ingest gate. Cloning shares the refresh gate.
#[derive(Clone)]
pub struct Pipeline {
    pub stores: Stores,
    pub clock: Arc<dyn Clock>,
    pub matcher: AlertMatcher,
    pub refresher: Arc<NotificationRefresher>,
    pub notifications: NotificationService,
    pub sweeper: Arc<RetentionSweeper>,
    pub gate: IngestGate,
}

impl Pipeline {
    pub fn new(
        stores: Stores,
        clock: Arc<dyn Clock>,
        alert_default_max_age: chrono::Duration,
        notification_expiry: chrono::Duration,
    ) -> Self {
        let gate = IngestGate::new();
        let matcher = AlertMatcher::new(stores.offers.clone(), clock.clone());
        let refresher = Arc::new(
            NotificationRefresher::new(
                matcher.clone(),
                stores.notifications.clone(),
                clock.clone(),
                alert_default_max_age,
                notification_expiry,
            )
            .with_gate(gate.clone()),
        );
        let notifications = NotificationService::new(
            refresher.clone(),
            stores.notifications.clone(),
            clock.clone(),
        );
        let sweeper = Arc::new(RetentionSweeper::new(
            stores.offers.clone(),
            stores.notifications.clone(),
            clock.clone(),
        ));
        Self {
            stores,
            clock,
            matcher,
            refresher,
            notifications,
            sweeper,
            gate,
        }
    }

    pub fn from_config(stores: Stores, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Self {
        Self::new(stores, clock, config.alert_default_max_age, config.notification_expiry)
    }

    pub fn scrape_loop(&self, adapter: Arc<dyn SourceAdapter>, config: ScrapeConfig) -> ScrapeLoop {
        ScrapeLoop::new(adapter, self.stores.offers.clone(), self.clock.clone(), config)
            .with_gate(self.gate.clone())
    }

    pub async fn scheduler(&self, config: &PipelineConfig) -> anyhow::Result<JobScheduler> {
        build_scheduler(
            self.refresher.clone(),
            self.sweeper.clone(),
            config.retention,
            &config.retention_cron,
            &config.refresh_cron,
        )
        .await
    }
}
