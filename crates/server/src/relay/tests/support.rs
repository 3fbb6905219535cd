use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{AttachmentId, ChatMessage, MessageId, NewMessage, UserId},
    protocol::OutboundFrame,
};
use storage::{AttachmentStore, MessageStore, Storage, StoredAttachment};
use tokio::sync::mpsc;

use super::{
    connection::{Connection, ConnectionWriter, FrameSink, TransportError},
    Relay,
};

pub(crate) const TEST_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Delivers frames into an unbounded channel; fails once the receiver is
/// dropped, which is how tests sever a client.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::Write("peer went away".into()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FailingSink;

#[async_trait]
impl FrameSink for FailingSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        Err(TransportError::Write("connection reset by peer".into()))
    }

    async fn close(&mut self) {}
}

/// Never completes a write.
pub(crate) struct StallingSink;

#[async_trait]
impl FrameSink for StallingSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Sleeps before every write; slower than a healthy peer, still inside the
/// write timeout.
pub(crate) struct SlowSink {
    tx: mpsc::UnboundedSender<String>,
    delay: Duration,
}

#[async_trait]
impl FrameSink for SlowSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        tokio::time::sleep(self.delay).await;
        self.tx
            .send(text)
            .map_err(|_| TransportError::Write("peer went away".into()))
    }

    async fn close(&mut self) {}
}

/// A connection whose writer has not been started yet.
pub(crate) fn channel_parts(
    user: &str,
) -> (
    Arc<Connection>,
    ConnectionWriter,
    mpsc::UnboundedReceiver<String>,
    Arc<AtomicBool>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let sink = ChannelSink {
        tx,
        closed: Arc::clone(&closed),
    };
    let (conn, writer) = Connection::open(UserId::from(user), Box::new(sink), TEST_WRITE_TIMEOUT);
    (conn, writer, rx, closed)
}

pub(crate) fn channel_connection(
    user: &str,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
    let (conn, rx, _closed) = observed_connection(user);
    (conn, rx)
}

pub(crate) fn observed_connection(
    user: &str,
) -> (
    Arc<Connection>,
    mpsc::UnboundedReceiver<String>,
    Arc<AtomicBool>,
) {
    let (conn, writer, rx, closed) = channel_parts(user);
    writer.spawn(Vec::new());
    (conn, rx, closed)
}

fn started(user: &str, sink: Box<dyn FrameSink>) -> Arc<Connection> {
    let (conn, writer) = Connection::open(UserId::from(user), sink, TEST_WRITE_TIMEOUT);
    writer.spawn(Vec::new());
    conn
}

pub(crate) fn failing_connection(user: &str) -> Arc<Connection> {
    started(user, Box::new(FailingSink))
}

pub(crate) fn stalling_connection(user: &str) -> Arc<Connection> {
    started(user, Box::new(StallingSink))
}

pub(crate) fn slow_parts(
    user: &str,
    delay: Duration,
) -> (Arc<Connection>, ConnectionWriter, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (conn, writer) = Connection::open(
        UserId::from(user),
        Box::new(SlowSink { tx, delay }),
        TEST_WRITE_TIMEOUT,
    );
    (conn, writer, rx)
}

pub(crate) struct FailingMessageStore;

#[async_trait]
impl MessageStore for FailingMessageStore {
    async fn insert_message(&self, _message: &NewMessage) -> anyhow::Result<MessageId> {
        Err(anyhow::anyhow!("message store offline"))
    }

    async fn message_history(&self) -> anyhow::Result<Vec<ChatMessage>> {
        Err(anyhow::anyhow!("message store offline"))
    }
}

pub(crate) struct FailingAttachmentStore;

#[async_trait]
impl AttachmentStore for FailingAttachmentStore {
    async fn store_attachment(
        &self,
        _bytes: &[u8],
        _file_name: &str,
        _content_type: &str,
    ) -> anyhow::Result<AttachmentId> {
        Err(anyhow::anyhow!("blob store offline"))
    }

    async fn load_attachment(
        &self,
        _attachment_id: &AttachmentId,
    ) -> anyhow::Result<Option<StoredAttachment>> {
        Err(anyhow::anyhow!("blob store offline"))
    }
}

pub(crate) async fn memory_relay() -> (Relay, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let relay = Relay::new(
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        TEST_WRITE_TIMEOUT,
        None,
    );
    (relay, storage)
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        frames.push(serde_json::from_str(&raw).expect("outbound frame"));
    }
    frames
}

/// Waits for exactly `count` outbound frames.
pub(crate) async fn collect(
    rx: &mut mpsc::UnboundedReceiver<String>,
    count: usize,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        frames.push(serde_json::from_str(&raw).expect("outbound frame"));
    }
    frames
}

/// Waits until the connection has been closed by its writer or the relay.
pub(crate) async fn wait_closed(connection: &Connection) {
    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .expect("connection closed in time");
}

pub(crate) fn texts(frames: &[OutboundFrame]) -> Vec<String> {
    frames.iter().map(|f| f.text.clone()).collect()
}
