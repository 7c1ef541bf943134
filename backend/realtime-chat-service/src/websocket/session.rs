//! Glue between an accepted socket and the registry.
//!
//! The accept path calls [`open`] once the caller is authenticated, then
//! drives [`run_writer`] with the socket's sink half. The writer owns the
//! connection's lifecycle: when it returns, the connection is Disconnected
//! and no longer registered.

use chrono::Utc;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionId, ConnectionRegistry, ConnectionState, OutboundReceiver, ServerEvent};

/// A registered connection that has not started writing yet.
pub struct Session {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub receiver: OutboundReceiver,
    /// `welcome` or `reconnected` frame, written before anything else.
    pub greeting: ServerEvent,
}

/// Register a connection for `user_id` and prepare its greeting.
pub async fn open(registry: &ConnectionRegistry, user_id: Uuid, instance_id: &str) -> Session {
    let registration = registry.add(user_id).await;
    let now = Utc::now();
    let greeting = match registration.previous_conn_at {
        Some(previous) => ServerEvent::reconnected(user_id, instance_id, previous, now),
        None => ServerEvent::welcome(user_id, instance_id, now),
    };

    info!(
        user_id = %user_id,
        connection_id = %registration.connection_id,
        reconnect = registration.previous_conn_at.is_some(),
        "Connection opened"
    );

    Session {
        user_id,
        connection_id: registration.connection_id,
        receiver: registration.receiver,
        greeting,
    }
}

/// Drain the connection's queue into `sink` until the sink fails or the
/// connection is removed, then deregister it.
pub async fn run_writer<S>(registry: ConnectionRegistry, session: Session, mut sink: S) -> ConnectionState
where
    S: Sink<String> + Unpin,
    S::Error: Display,
{
    let Session {
        user_id,
        connection_id,
        mut receiver,
        greeting,
    } = session;
    let mut state = ConnectionState::Connected;

    let mut next = match greeting.to_json() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Failed to encode greeting");
            receiver.recv().await
        }
    };

    while let Some(frame) = next {
        if let Err(e) = sink.send(frame).await {
            debug!(connection_id = %connection_id, error = %e, "Socket write failed");
            break;
        }
        next = receiver.recv().await;
    }

    if state.disconnect() {
        registry.remove(user_id, connection_id).await;
        if let Err(e) = sink.close().await {
            debug!(connection_id = %connection_id, error = %e, "Socket close failed");
        }
        info!(user_id = %user_id, connection_id = %connection_id, "Connection closed");
    }
    state
}
