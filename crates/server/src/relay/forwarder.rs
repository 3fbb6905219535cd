use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

/// Best-effort pub/sub side channel for broadcast payloads.
#[async_trait]
pub trait ExternalRelay: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;
}

/// Posts each payload as JSON to a fixed endpoint.
pub struct HttpRelay {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Serialize)]
struct RelayEnvelope<'a> {
    channel: &'a str,
    payload: &'a str,
}

impl HttpRelay {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl ExternalRelay for HttpRelay {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&RelayEnvelope { channel, payload })
            .send()
            .await
            .with_context(|| format!("relay request to {} failed", self.endpoint))?
            .error_for_status()
            .context("relay rejected publish")?;
        Ok(())
    }
}

/// Bounded queue between the broadcast engine and a single forwarding task.
/// When full, the oldest pending payload is discarded.
pub struct RelayForwarder {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl RelayForwarder {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Never blocks the caller.
    pub fn enqueue(&self, payload: String) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(total_dropped = total, "relay queue full, dropped oldest payload");
            }
            queue.push_back(payload);
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn spawn(
        self: &Arc<Self>,
        relay: Arc<dyn ExternalRelay>,
        channel: impl Into<String>,
    ) -> JoinHandle<()> {
        let forwarder = Arc::clone(self);
        let channel = channel.into();
        info!(%channel, capacity = self.capacity, "relay forwarder started");
        tokio::spawn(async move { forwarder.run(relay, channel).await })
    }

    async fn run(&self, relay: Arc<dyn ExternalRelay>, channel: String) {
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(payload) => {
                    if let Err(error) = relay.publish(&channel, &payload).await {
                        warn!(%channel, error = %format!("{error:#}"), "relay publish failed");
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/forwarder_tests.rs"]
mod tests;
