//! Connection registry, broadcast engine and per-connection sessions.

use std::{sync::Arc, time::Duration};

use storage::{AttachmentStore, MessageStore};

pub mod broadcast;
pub mod connection;
pub mod forwarder;
pub mod registry;
pub mod session;

pub use broadcast::Broadcaster;
pub use forwarder::{HttpRelay, RelayForwarder};
pub use registry::ConnectionRegistry;

/// Everything a session needs to take part in the shared room.
#[derive(Clone)]
pub struct Relay {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub write_timeout: Duration,
}

impl Relay {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        attachments: Arc<dyn AttachmentStore>,
        write_timeout: Duration,
        forwarder: Option<Arc<RelayForwarder>>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            messages,
            forwarder,
        ));
        Self {
            registry,
            broadcaster,
            attachments,
            write_timeout,
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
