use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tradewatch_adapters::{SourceAdapter, SourceError};
use tradewatch_core::{Clock, TradeOffer};
use tradewatch_storage::{OfferStore, StoreError};

use crate::{ConfigError, IngestGate};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scrape failed after {retries} retries: {last}")]
    RetriesExhausted { retries: u32, last: SourceError },
    #[error("persisting offers: {0}")]
    Store(#[from] StoreError),
}

/// Bounded retry with exponential spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_interval: Duration,
    backoff_rate: f64,
}

impl RetryPolicy {
    pub fn new(
        max_retries: i64,
        base_interval: Duration,
        backoff_rate: f64,
    ) -> Result<Self, ConfigError> {
        if max_retries < 0 {
            return Err(ConfigError::NegativeRetries(max_retries));
        }
        if !backoff_rate.is_finite() || backoff_rate <= 0.0 {
            return Err(ConfigError::InvalidBackoffRate(backoff_rate));
        }
        Ok(Self {
            max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
            base_interval,
            backoff_rate,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the next attempt once `consecutive_failures` (>= 1) attempts
    /// have failed in a row: `base * rate^(failures - 1)`.
    pub fn delay_for_failure(&self, consecutive_failures: u32) -> Duration {
        let exponent = i32::try_from(consecutive_failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_interval.as_secs_f64() * self.backoff_rate.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures > self.max_retries
    }
}

/// Randomized pause between successful cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    min: Duration,
    max: Duration,
}

impl DelayWindow {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedDelayWindow { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min_ms = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

/// Sampled delay minus the time the fetch already took, floored at zero.
pub fn inter_cycle_delay(sampled: Duration, fetch_elapsed: Duration) -> Duration {
    sampled.saturating_sub(fetch_elapsed)
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub delay: DelayWindow,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

enum CycleOutcome {
    Sleep(Duration),
    Stop,
}

/// Fetch, dedup and persist loop for one source. Failure counter and the
/// previous page belong to this instance only.
pub struct ScrapeLoop {
    adapter: Arc<dyn SourceAdapter>,
    offers: Arc<dyn OfferStore>,
    clock: Arc<dyn Clock>,
    config: ScrapeConfig,
    consecutive_failures: u32,
    previous: HashSet<TradeOffer>,
    previous_cycle_ok: bool,
    cycle: u64,
    gate: IngestGate,
}

impl ScrapeLoop {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        offers: Arc<dyn OfferStore>,
        clock: Arc<dyn Clock>,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            adapter,
            offers,
            clock,
            config,
            consecutive_failures: 0,
            previous: HashSet::new(),
            previous_cycle_ok: false,
            cycle: 0,
            gate: IngestGate::new(),
        }
    }

    /// Shares `gate` with the notification refresher.
    pub fn with_gate(mut self, gate: IngestGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn previous_offers(&self) -> &HashSet<TradeOffer> {
        &self.previous
    }

    /// Runs until `cancel` fires (`Ok`) or the retry budget is spent or a
    /// write fails (`Err`).
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ScrapeError> {
        info!(
            source = self.adapter.source_name(),
            max_retries = self.config.retry.max_retries(),
            "scrape loop started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.cycle += 1;
            let span = info_span!(
                "scrape_cycle",
                source = self.adapter.source_name(),
                cycle = self.cycle
            );
            let outcome = self.run_cycle(&cancel).instrument(span).await?;
            let delay = match outcome {
                CycleOutcome::Sleep(delay) => delay,
                CycleOutcome::Stop => break,
            };
            debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "sleeping");
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }
        info!(source = self.adapter.source_name(), "scrape loop stopped");
        Ok(())
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome, ScrapeError> {
        let started = Instant::now();
        let fetched = self.fetch(cancel).await;
        let elapsed = started.elapsed();

        match fetched {
            Ok(latest) => {
                self.persist(latest).await?;
                Ok(CycleOutcome::Sleep(inter_cycle_delay(self.config.delay.sample(), elapsed)))
            }
            Err(SourceError::Cancelled) => Ok(CycleOutcome::Stop),
            Err(err) => self.record_failure(err).map(CycleOutcome::Sleep),
        }
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<TradeOffer>, SourceError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SourceError::Cancelled),
            res = tokio::time::timeout(
                self.config.fetch_timeout,
                self.adapter.fetch_offers(cancel),
            ) => res.unwrap_or(Err(SourceError::TimedOut)),
        };
        // A deadline or network error that races with cancellation is a cancellation.
        match result {
            Err(_) if cancel.is_cancelled() => Err(SourceError::Cancelled),
            other => other,
        }
    }

    async fn persist(&mut self, latest: Vec<TradeOffer>) -> Result<(), StoreError> {
        let mut page = HashSet::with_capacity(latest.len());
        let mut new_offers = Vec::new();
        for offer in latest {
            if page.insert(offer.clone()) && !self.previous.contains(&offer) {
                new_offers.push(offer);
            }
        }

        if !new_offers.is_empty() {
            let _ingest = self.gate.ingest().await;
            self.offers.add_offers(&new_offers, self.clock.now()).await?;
        }

        if zero_overlap(self.previous_cycle_ok, page.len(), new_offers.len()) {
            warn!(
                source = self.adapter.source_name(),
                offers = page.len(),
                "no overlap with the previous cycle; \
                 the scrape interval may be too long for this source"
            );
        }

        info!(fetched = page.len(), new_offers = new_offers.len(), "cycle persisted");
        self.consecutive_failures = 0;
        self.previous_cycle_ok = true;
        self.previous = page;
        Ok(())
    }

    fn record_failure(&mut self, err: SourceError) -> Result<Duration, ScrapeError> {
        self.consecutive_failures += 1;
        self.previous_cycle_ok = false;
        let attempt = self.consecutive_failures;
        let max_retries = self.config.retry.max_retries();
        let source = self.adapter.source_name();

        match &err {
            SourceError::Unavailable { source_name, reason } => {
                warn!(
                    source = %source_name,
                    reason = %reason,
                    attempt,
                    max_retries,
                    "source unavailable"
                )
            }
            SourceError::TimedOut => warn!(source, attempt, max_retries, "fetch timed out"),
            SourceError::Network(reason) => {
                warn!(source, reason = %reason, attempt, max_retries, "network failure")
            }
            SourceError::Cancelled => {}
        }

        if self.config.retry.is_exhausted(attempt) {
            error!(
                source,
                attempts = attempt,
                error = %err,
                "scrape failed after {max_retries} retries"
            );
            return Err(ScrapeError::RetriesExhausted {
                retries: max_retries,
                last: err,
            });
        }
        Ok(self.config.retry.delay_for_failure(attempt))
    }
}

/// True when a page shares nothing with the previous successful cycle's page.
/// The first cycle and the cycle after a failure have nothing to compare with.
fn zero_overlap(previous_cycle_ok: bool, page_len: usize, new_len: usize) -> bool {
    previous_cycle_ok && page_len > 0 && new_len == page_len
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
