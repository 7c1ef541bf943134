use futures::future::join_all;
use tracing::{debug, warn};
use transactional_outbox::OutboxEnvelope;

use super::{ConnectionRegistry, ServerEvent};
use crate::models::{MessageSentPayload, MESSAGE_AGGREGATE};

/// Outcome of routing one broadcast envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    /// Receivers with at least one live connection on this gateway.
    pub online_receivers: usize,
    /// Frames enqueued across all of their connections.
    pub delivered: usize,
    /// Frames enqueued after evicting an older one.
    pub dropped_oldest: usize,
    /// Envelope was not a chat message and was ignored.
    pub skipped: bool,
    /// Envelope payload failed validation.
    pub invalid: bool,
}

/// Resolves recipients of broadcast events and fans them out through the
/// [`ConnectionRegistry`].
///
/// Never waits on a client: every enqueue is non-blocking, so one slow socket
/// cannot hold up the subscriber loop. Duplicate `event_id`s are simply
/// delivered again; clients dedupe on `message_id`.
#[derive(Clone)]
pub struct EventRouter {
    registry: ConnectionRegistry,
}

impl EventRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn handle_event(&self, envelope: OutboxEnvelope) -> RouteReport {
        if envelope.aggregate_type != MESSAGE_AGGREGATE {
            debug!(
                event_id = %envelope.event_id,
                aggregate_type = %envelope.aggregate_type,
                "Skipping non-message event"
            );
            return RouteReport {
                skipped: true,
                ..RouteReport::default()
            };
        }

        let payload = match MessageSentPayload::from_value(envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %envelope.event_id, error = %e, "Invalid message payload");
                if let Some(metrics) = self.registry.metrics() {
                    metrics.decode_failures.inc();
                }
                return RouteReport {
                    invalid: true,
                    ..RouteReport::default()
                };
            }
        };

        let receiver_ids = payload.receiver_ids.clone();
        let event = ServerEvent::Message {
            event: OutboxEnvelope {
                event_id: envelope.event_id,
                aggregate_type: envelope.aggregate_type,
                aggregate_id: envelope.aggregate_id,
                created_at: envelope.created_at,
                payload,
            },
        };
        let frame = match event.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event_id = %envelope.event_id, error = %e, "Failed to encode message event");
                return RouteReport {
                    invalid: true,
                    ..RouteReport::default()
                };
            }
        };

        let deliveries = join_all(
            receiver_ids
                .iter()
                .map(|receiver_id| self.registry.send_to_user(*receiver_id, &frame)),
        )
        .await;

        let mut report = RouteReport::default();
        for delivery in deliveries {
            if delivery.delivered > 0 {
                report.online_receivers += 1;
            }
            report.delivered += delivery.delivered;
            report.dropped_oldest += delivery.dropped_oldest;
        }

        if report.dropped_oldest > 0 {
            warn!(
                event_id = %envelope.event_id,
                dropped = report.dropped_oldest,
                "Outbound queues full; oldest frames dropped"
            );
        }
        debug!(
            event_id = %envelope.event_id,
            receivers = receiver_ids.len(),
            online = report.online_receivers,
            delivered = report.delivered,
            "Event routed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MESSAGE_SENT_EVENT};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn message_envelope(sender: Uuid, receivers: Vec<Uuid>) -> OutboxEnvelope {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: sender,
            content: "Hello".to_string(),
            created_at: Utc::now(),
        };
        OutboxEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_type: MESSAGE_AGGREGATE.to_string(),
            aggregate_id: message.id,
            created_at: message.created_at,
            payload: serde_json::to_value(MessageSentPayload::new(&message, receivers)).unwrap(),
        }
    }

    #[tokio::test]
    async fn routes_to_every_device_of_each_receiver() {
        let registry = ConnectionRegistry::new(8);
        let router = EventRouter::new(registry.clone());
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        let mut bob_phone = registry.add(bob).await;
        let mut bob_laptop = registry.add(bob).await;

        let envelope = message_envelope(Uuid::new_v4(), vec![bob, carol]);
        let report = router.handle_event(envelope.clone()).await;

        assert_eq!(report.online_receivers, 1);
        assert_eq!(report.delivered, 2);

        for receiver in [&mut bob_phone.receiver, &mut bob_laptop.receiver] {
            let frame = receiver.recv().await.unwrap();
            let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(json["type"], "message");
            assert_eq!(json["event"]["event_id"], json!(envelope.event_id.to_string()));
            assert_eq!(json["event"]["payload"]["content"], "Hello");
        }
    }

    #[tokio::test]
    async fn skips_other_aggregates() {
        let router = EventRouter::new(ConnectionRegistry::new(8));
        let mut envelope = message_envelope(Uuid::new_v4(), vec![]);
        envelope.aggregate_type = "conversation".to_string();

        let report = router.handle_event(envelope).await;
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn rejects_payload_missing_receivers() {
        let router = EventRouter::new(ConnectionRegistry::new(8));
        let mut envelope = message_envelope(Uuid::new_v4(), vec![]);
        envelope.payload = json!({ "event_type": MESSAGE_SENT_EVENT, "content": "Hello" });

        let report = router.handle_event(envelope).await;
        assert!(report.invalid);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn duplicate_events_stay_bounded() {
        let registry = ConnectionRegistry::new(4);
        let router = EventRouter::new(registry.clone());
        let bob = Uuid::new_v4();
        let mut registration = registry.add(bob).await;

        let envelope = message_envelope(Uuid::new_v4(), vec![bob]);
        let mut dropped = 0;
        for _ in 0..10 {
            dropped += router.handle_event(envelope.clone()).await.dropped_oldest;
        }
        assert_eq!(dropped, 6);
        assert_eq!(registry.connection_count(bob).await, 1);

        registry.remove(bob, registration.connection_id).await;
        let mut frames = 0;
        while registration.receiver.recv().await.is_some() {
            frames += 1;
        }
        assert_eq!(frames, 4);
    }
}
