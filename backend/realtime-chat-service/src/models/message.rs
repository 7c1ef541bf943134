use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type stamped on every message outbox row.
pub const MESSAGE_AGGREGATE: &str = "message";
pub const MESSAGE_SENT_EVENT: &str = "message.sent";

/// Message struct matching the `messages` table. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Payload of a `message.sent` outbox row and broadcast envelope.
///
/// Every field is required on decode, so a row written by an older or broken
/// producer fails loudly instead of fanning out to nobody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub receiver_ids: Vec<Uuid>,
}

impl MessageSentPayload {
    pub fn new(message: &Message, receiver_ids: Vec<Uuid>) -> Self {
        Self {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
            event_type: MESSAGE_SENT_EVENT.to_string(),
            receiver_ids,
        }
    }

    /// Decode and check the discriminator.
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let payload: Self = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if payload.event_type != MESSAGE_SENT_EVENT {
            return Err(format!("unexpected event_type {}", payload.event_type));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: "Hello".to_string(),
            created_at: Utc::now(),
        };
        let receiver = Uuid::new_v4();
        let value = serde_json::to_value(MessageSentPayload::new(&message, vec![receiver])).unwrap();

        assert_eq!(value["event_type"], "message.sent");
        assert_eq!(value["content"], "Hello");
        assert_eq!(value["message_id"], json!(message.id.to_string()));
        assert_eq!(value["receiver_ids"], json!([receiver.to_string()]));
        assert!(value["created_at"].is_string());
    }

    #[test]
    fn test_from_value_rejects_missing_fields() {
        let err = MessageSentPayload::from_value(json!({
            "event_type": "message.sent",
            "content": "Hello"
        }))
        .unwrap_err();
        assert!(err.contains("missing field"));
    }

    #[test]
    fn test_from_value_rejects_other_event_types() {
        let payload = json!({
            "message_id": Uuid::new_v4(),
            "conversation_id": Uuid::new_v4(),
            "sender_id": Uuid::new_v4(),
            "content": "Hello",
            "created_at": "2024-01-15T10:30:00Z",
            "event_type": "message.edited",
            "receiver_ids": []
        });
        assert!(MessageSentPayload::from_value(payload).is_err());
    }
}
