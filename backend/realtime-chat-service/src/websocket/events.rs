use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use transactional_outbox::OutboxEnvelope;
use uuid::Uuid;

use crate::models::MessageSentPayload;

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// First frame on a fresh connection. `server_time` is unix millis; the
    /// client syncs from it.
    #[serde(rename = "welcome")]
    Welcome {
        server_time: i64,
        user_id: Uuid,
        instance_id: String,
    },

    /// First frame when this user connected before. The client should fetch
    /// messages it missed during the gap through `GetMessages`.
    #[serde(rename = "reconnected")]
    Reconnected {
        server_time: i64,
        user_id: Uuid,
        previous_conn_at: i64,
        gap_duration_ms: i64,
        instance_id: String,
    },

    #[serde(rename = "message")]
    Message {
        event: OutboxEnvelope<MessageSentPayload>,
    },
}

impl ServerEvent {
    pub fn welcome(user_id: Uuid, instance_id: &str, now: DateTime<Utc>) -> Self {
        ServerEvent::Welcome {
            server_time: now.timestamp_millis(),
            user_id,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn reconnected(
        user_id: Uuid,
        instance_id: &str,
        previous_conn_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        ServerEvent::Reconnected {
            server_time: now.timestamp_millis(),
            user_id,
            previous_conn_at: previous_conn_at.timestamp_millis(),
            gap_duration_ms: (now - previous_conn_at).num_milliseconds().max(0),
            instance_id: instance_id.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_welcome_wire_shape() {
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let json: serde_json::Value =
            serde_json::from_str(&ServerEvent::welcome(user_id, "gw-1", now).to_json().unwrap())
                .unwrap();

        assert_eq!(json["type"], "welcome");
        assert_eq!(json["server_time"], now.timestamp_millis());
        assert_eq!(json["user_id"], user_id.to_string());
        assert_eq!(json["instance_id"], "gw-1");
    }

    #[test]
    fn test_reconnected_gap() {
        let now = Utc::now();
        let event = ServerEvent::reconnected(Uuid::new_v4(), "gw-1", now - Duration::seconds(90), now);
        match event {
            ServerEvent::Reconnected {
                gap_duration_ms, ..
            } => assert_eq!(gap_duration_ms, 90_000),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
