use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics::OutboxMetrics;
use crate::{
    FailureAction, OutboxError, OutboxEvent, OutboxPublisher, OutboxRepository, OutboxResult,
};

/// Relay tuning. Defaults match the service's environment defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    /// Rows claimed per tick
    pub batch_size: i64,
    /// Publish attempts before a row is dead-lettered
    pub max_retries: i32,
    /// Concurrent publishes within one batch
    pub worker_count: usize,
    /// First retry delay; doubles per attempt
    pub base_backoff: Duration,
    /// How long a claim hides a row from other relays
    pub claim_lease: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            max_retries: 3,
            worker_count: 10,
            base_backoff: Duration::from_secs(1),
            claim_lease: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    const MAX_BACKOFF: Duration = Duration::from_secs(300);

    /// Delay before the next attempt after `attempts` failures:
    /// base, 2·base, 4·base, ... capped at 5 minutes.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
        self.base_backoff
            .saturating_mul(2u32.pow(exponent))
            .min(Self::MAX_BACKOFF)
    }

    fn failure_action(&self, attempts: i32, error: &OutboxError) -> FailureAction {
        if error.is_permanent() || attempts >= self.max_retries.max(1) {
            FailureAction::DeadLetter
        } else {
            FailureAction::RetryAfter(self.backoff(attempts))
        }
    }
}

/// Tally of one [`OutboxRelay::poll_once`] cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Rows whose bookkeeping write failed; their lease expiry makes them
    /// claimable again.
    pub unresolved: usize,
}

enum Delivery {
    Published,
    Retrying,
    DeadLettered,
    Unresolved,
}

impl BatchReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Published => self.published += 1,
            Delivery::Retrying => self.retrying += 1,
            Delivery::DeadLettered => self.dead_lettered += 1,
            Delivery::Unresolved => self.unresolved += 1,
        }
    }
}

/// Background relay from the outbox table to the broadcast channel.
///
/// One timer drives the loop; each tick claims a batch and fans it out to a
/// bounded pool of publish workers. Several relays (in one process or many)
/// may run against the same table: claims never overlap.
pub struct OutboxRelay<R: OutboxRepository + 'static, P: OutboxPublisher + 'static> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: RelayConfig,
    metrics: Option<OutboxMetrics>,
}

impl<R: OutboxRepository + 'static, P: OutboxPublisher + 'static> OutboxRelay<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: RelayConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    /// Same as [`OutboxRelay::new`], also updating Prometheus metrics each cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A batch that is already being published is finished before returning;
    /// no new batch is claimed after the signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            worker_count = self.config.worker_count,
            "Outbox relay starting"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                claimed = report.claimed,
                                published = report.published,
                                retrying = report.retrying,
                                dead_lettered = report.dead_lettered,
                                "Outbox batch processed"
                            );
                        }
                        Ok(_) => debug!("No outbox events to publish"),
                        Err(e) => error!(error = %e, "Outbox relay poll failed"),
                    }
                    self.refresh_gauges().await;
                }
            }
        }

        info!("Outbox relay stopped");
    }

    /// Claim one batch and publish it. Exposed for tests and one-shot drains.
    pub async fn poll_once(&self) -> OutboxResult<BatchReport> {
        let started = Instant::now();
        let events = self
            .repository
            .claim_batch(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = BatchReport {
            claimed: events.len(),
            ..BatchReport::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut workers = JoinSet::new();

        for event in events {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| OutboxError::Other(e.into()))?;
            let repository = Arc::clone(&self.repository);
            let publisher = Arc::clone(&self.publisher);
            let config = self.config.clone();
            let metrics = self.metrics.clone();

            workers.spawn(async move {
                let _permit = permit;
                deliver(
                    repository.as_ref(),
                    publisher.as_ref(),
                    &config,
                    metrics.as_ref(),
                    event,
                )
                .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(delivery) => report.record(delivery),
                Err(e) => {
                    error!(error = %e, "Outbox publish worker aborted");
                    report.record(Delivery::Unresolved);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .batch_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        Ok(report)
    }

    async fn refresh_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            match self.repository.pending_stats().await {
                Ok((pending, age)) => {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
                Err(e) => debug!(error = %e, "Failed to refresh outbox gauges"),
            }
        }
    }
}

async fn deliver<R: OutboxRepository, P: OutboxPublisher>(
    repository: &R,
    publisher: &P,
    config: &RelayConfig,
    metrics: Option<&OutboxMetrics>,
    event: OutboxEvent,
) -> Delivery {
    let published = match event.envelope() {
        Ok(envelope) => publisher.publish(&envelope).await,
        Err(e) => Err(e),
    };

    match published {
        Ok(()) => match repository.mark_processed(event.id).await {
            Ok(true) => {
                if let Some(metrics) = metrics {
                    metrics.published.inc();
                }
                debug!(event_id = %event.id, "Outbox event published");
                Delivery::Published
            }
            Ok(false) => {
                debug!(event_id = %event.id, "Outbox event was already processed");
                Delivery::Published
            }
            Err(e) => {
                // Published but not marked: the next claim re-publishes it.
                error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to mark event as processed after publishing"
                );
                Delivery::Unresolved
            }
        },
        Err(publish_err) => {
            if let Some(metrics) = metrics {
                metrics.publish_failures.inc();
            }

            let attempts = event.retry_count.saturating_add(1);
            let action = config.failure_action(attempts, &publish_err);
            let reason = publish_err.to_string();

            if let Err(e) = repository.mark_failed(event.id, &reason, action).await {
                error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to record publish failure"
                );
                return Delivery::Unresolved;
            }

            match action {
                FailureAction::RetryAfter(delay) => {
                    warn!(
                        event_id = %event.id,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Outbox publish failed, will retry"
                    );
                    Delivery::Retrying
                }
                FailureAction::DeadLetter => {
                    if let Some(metrics) = metrics {
                        metrics.dead_lettered.inc();
                    }
                    error!(
                        event_id = %event.id,
                        aggregate_type = %event.aggregate_type,
                        aggregate_id = %event.aggregate_id,
                        attempts,
                        error = %reason,
                        "Outbox event dead-lettered; needs manual requeue"
                    );
                    Delivery::DeadLettered
                }
            }
        }
    }
}
