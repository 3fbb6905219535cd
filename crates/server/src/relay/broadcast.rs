use std::sync::Arc;

use shared::{
    domain::{ChatMessage, ConnectionId, NewMessage},
    protocol::OutboundFrame,
};
use storage::MessageStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{connection::Connection, forwarder::RelayForwarder, registry::ConnectionRegistry};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("message store unavailable: {0:#}")]
    Persistence(anyhow::Error),
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct PublishReport {
    pub message: ChatMessage,
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

/// Persists accepted messages and fans them out to every registered
/// connection.
///
/// Publishing and joining share one ordering lock. Under it a message is
/// persisted and queued on every connection before the next one is accepted,
/// and a joining connection is registered and handed its history snapshot.
/// Fan-out only enqueues; socket writes happen on each connection's writer
/// task, outside the lock.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    order: Mutex<()>,
    forwarder: Option<Arc<RelayForwarder>>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        forwarder: Option<Arc<RelayForwarder>>,
    ) -> Self {
        Self {
            registry,
            store,
            order: Mutex::new(()),
            forwarder,
        }
    }

    pub async fn publish(&self, message: NewMessage) -> Result<PublishReport, BroadcastError> {
        let _order = self.order.lock().await;

        let message_id = self
            .store
            .insert_message(&message)
            .await
            .map_err(BroadcastError::Persistence)?;
        let message = message.into_persisted(message_id);
        let payload: Arc<str> = serde_json::to_string(&OutboundFrame::from(&message))?.into();

        let (delivered, dropped) = self.fan_out(&payload);
        debug!(
            message_id = message.message_id.0,
            user_id = %message.user_id,
            delivered,
            dropped = dropped.len(),
            "broadcast message"
        );

        if let Some(forwarder) = &self.forwarder {
            forwarder.enqueue(payload.to_string());
        }

        Ok(PublishReport {
            message,
            delivered,
            dropped,
        })
    }

    /// Registers the connection and returns the history it must replay.
    /// Anything published after this returns is queued on the connection.
    pub async fn join(
        &self,
        connection: Arc<Connection>,
    ) -> Result<Vec<ChatMessage>, BroadcastError> {
        let _order = self.order.lock().await;
        self.registry.register(connection);
        self.store
            .message_history()
            .await
            .map_err(BroadcastError::Persistence)
    }

    fn fan_out(&self, payload: &Arc<str>) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for connection in self.registry.snapshot() {
            match connection.enqueue(Arc::clone(payload)) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        conn_id = %connection.id(),
                        user_id = %connection.user_id(),
                        %error,
                        "dropping connection from broadcast"
                    );
                    self.registry.deregister(connection.id());
                    connection.close();
                    dropped.push(connection.id());
                }
            }
        }
        (delivered, dropped)
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
