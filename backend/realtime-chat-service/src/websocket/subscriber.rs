use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use transactional_outbox::OutboxEnvelope;

use super::{EventRouter, RouteReport};

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub channel: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            channel: transactional_outbox::RedisOutboxPublisher::DEFAULT_CHANNEL.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SubscriberConfig {
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

enum ListenEnd {
    Shutdown,
    StreamClosed,
}

/// Feeds the broadcast channel into the [`EventRouter`].
///
/// Undecodable messages are logged and skipped. A lost Redis connection is
/// retried with exponential backoff until shutdown.
pub struct BroadcastSubscriber {
    client: redis::Client,
    router: EventRouter,
    config: SubscriberConfig,
}

impl BroadcastSubscriber {
    pub fn new(client: redis::Client, router: EventRouter, config: SubscriberConfig) -> Self {
        Self {
            client,
            router,
            config,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.listen(&mut shutdown).await {
                Ok(ListenEnd::Shutdown) => break,
                Ok(ListenEnd::StreamClosed) => {
                    warn!(channel = %self.config.channel, "Broadcast subscription ended; reconnecting");
                    backoff = self.config.initial_backoff;
                }
                Err(e) => {
                    error!(
                        channel = %self.config.channel,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Broadcast subscription failed"
                    );
                }
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = self.config.next_backoff(backoff);
        }

        info!(channel = %self.config.channel, "Broadcast subscriber stopped");
    }

    async fn listen(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ListenEnd, redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.channel).await?;
        info!(channel = %self.config.channel, "Subscribed to broadcast channel");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(ListenEnd::Shutdown);
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Ok(ListenEnd::StreamClosed);
                    };
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            self.handle_payload(&payload).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read broadcast payload");
                            self.count_decode_failure();
                        }
                    }
                }
            }
        }
    }

    /// Decode one broadcast message and route it. Returns `None` when the
    /// message is not a valid envelope.
    pub async fn handle_payload(&self, payload: &str) -> Option<RouteReport> {
        let envelope: OutboxEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable broadcast message");
                self.count_decode_failure();
                return None;
            }
        };

        debug!(
            event_id = %envelope.event_id,
            aggregate_type = %envelope.aggregate_type,
            "Received broadcast event"
        );
        Some(self.router.handle_event(envelope).await)
    }

    fn count_decode_failure(&self) {
        if let Some(metrics) = self.router.registry().metrics() {
            metrics.decode_failures.inc();
        }
    }
}
