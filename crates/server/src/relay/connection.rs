use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{stream::SplitSink, SinkExt};
use shared::domain::{ConnectionId, UserId};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, Notify,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Live frames a connection may have queued before it counts as too slow.
pub const OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Backlogged,
    #[error("write failed: {0}")]
    Write(String),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("read failed: {0}")]
    Read(String),
}

/// Outbound half of a client transport.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self);
}

pub struct WsSink(pub SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// One live client. Frames are queued here and written to the socket by the
/// connection's own [`ConnectionWriter`] task, so enqueueing never waits on
/// the network.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    open: AtomicBool,
    closed: Notify,
    outbox: mpsc::Sender<Arc<str>>,
}

impl Connection {
    pub fn open(
        user_id: UserId,
        sink: Box<dyn FrameSink>,
        write_timeout: Duration,
    ) -> (Arc<Self>, ConnectionWriter) {
        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        let connection = Arc::new(Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            user_id,
            open: AtomicBool::new(true),
            closed: Notify::new(),
            outbox,
        });
        let writer = ConnectionWriter {
            connection: Arc::clone(&connection),
            sink,
            queue,
            write_timeout,
        };
        (connection, writer)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Never blocks. A full queue means the peer has fallen too far behind.
    pub fn enqueue(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.outbox.try_send(frame).map_err(|error| match error {
            TrySendError::Full(_) => TransportError::Backlogged,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Marks the connection closed and wakes everything waiting in
    /// [`Connection::closed`]. Later calls are no-ops.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closed.notify_waiters();
        }
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }
}

/// Owns the socket sink. Writes the replay backlog first, then drains the
/// live queue in order until the connection closes or a write fails.
pub struct ConnectionWriter {
    connection: Arc<Connection>,
    sink: Box<dyn FrameSink>,
    queue: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
}

pub struct WriterTask {
    pub handle: JoinHandle<()>,
    /// Fires once the backlog is written; dropped unsent if replay failed.
    pub replayed: oneshot::Receiver<()>,
}

impl ConnectionWriter {
    pub fn spawn(self, backlog: Vec<String>) -> WriterTask {
        let (done, replayed) = oneshot::channel();
        let handle = tokio::spawn(self.run(backlog, done));
        WriterTask { handle, replayed }
    }

    async fn run(mut self, backlog: Vec<String>, done: oneshot::Sender<()>) {
        let conn_id = self.connection.id();
        match self.write_backlog(backlog).await {
            Ok(()) => {
                let _ = done.send(());
                if let Err(error) = self.drain().await {
                    warn!(%conn_id, user_id = %self.connection.user_id(), %error, "dropping connection after failed write");
                }
            }
            Err(error) => {
                warn!(%conn_id, %error, "history replay failed");
            }
        }

        self.connection.close();
        let _ = tokio::time::timeout(self.write_timeout, self.sink.close()).await;
        debug!(%conn_id, "writer stopped");
    }

    async fn write_backlog(&mut self, backlog: Vec<String>) -> Result<(), TransportError> {
        for frame in backlog {
            if !self.connection.is_open() {
                return Err(TransportError::Closed);
            }
            self.write(frame).await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        loop {
            let frame = tokio::select! {
                frame = self.queue.recv() => frame,
                () = self.connection.closed() => None,
            };
            match frame {
                Some(frame) => self.write(frame.to_string()).await?,
                None => return Ok(()),
            }
        }
    }

    async fn write(&mut self, text: String) -> Result<(), TransportError> {
        match tokio::time::timeout(self.write_timeout, self.sink.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        }
    }
}
