use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Stream, StreamExt};
use server_api::AuthenticatedUser;
use shared::{
    domain::{AttachmentRef, NewMessage, UserId},
    error::{ApiError, ErrorCode},
    protocol::{DecodedFrame, ErrorFrame, FrameError, InboundFrame, OutboundFrame},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    connection::{Connection, ConnectionWriter, TransportError, WsSink},
    Relay,
};

/// Lifecycle of one client connection. The access gate runs in the HTTP
/// layer before a session exists, so a `Session` starts in `Upgrading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Upgrading,
    Replaying,
    Active,
    Closing,
    Closed,
}

/// One inbound transport event, independent of the socket library.
#[derive(Debug)]
pub enum InboundEvent {
    Text(String),
    Binary(Vec<u8>),
    Keepalive,
    Close,
}

impl From<Message> for InboundEvent {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Self::Text(text),
            Message::Binary(bytes) => Self::Binary(bytes),
            Message::Ping(_) | Message::Pong(_) => Self::Keepalive,
            Message::Close(_) => Self::Close,
        }
    }
}

/// Drives an upgraded WebSocket for its whole lifetime.
pub async fn serve_socket(relay: Relay, user: AuthenticatedUser, socket: WebSocket) {
    let (sender, receiver) = socket.split();
    let (connection, writer) =
        Connection::open(user.user_id, Box::new(WsSink(sender)), relay.write_timeout);
    let inbound = receiver.map(|message| {
        message
            .map(InboundEvent::from)
            .map_err(|e| TransportError::Read(e.to_string()))
    });
    Session::new(relay, connection, writer).run(inbound).await;
}

/// Per-connection control loop: replay, read/publish loop, teardown.
pub struct Session {
    relay: Relay,
    connection: Arc<Connection>,
    writer: Option<ConnectionWriter>,
    writer_task: Option<JoinHandle<()>>,
    state: SessionState,
}

impl Session {
    pub fn new(relay: Relay, connection: Arc<Connection>, writer: ConnectionWriter) -> Self {
        Self {
            relay,
            connection,
            writer: Some(writer),
            writer_task: None,
            state: SessionState::Upgrading,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run<S>(mut self, mut inbound: S) -> SessionState
    where
        S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin,
    {
        info!(
            conn_id = %self.connection.id(),
            user_id = %self.connection.user_id(),
            "websocket connection established"
        );

        self.transition(SessionState::Replaying);
        if !self.replay().await {
            self.teardown().await;
            return self.state;
        }

        self.transition(SessionState::Active);
        loop {
            let event = tokio::select! {
                event = inbound.next() => event,
                () = self.connection.closed() => {
                    debug!(conn_id = %self.connection.id(), "connection closed by relay");
                    break;
                }
            };
            let decoded = match event {
                Some(Ok(InboundEvent::Text(text))) => InboundFrame::decode(&text),
                Some(Ok(InboundEvent::Binary(bytes))) => InboundFrame::decode_bytes(&bytes),
                Some(Ok(InboundEvent::Keepalive)) => continue,
                Some(Ok(InboundEvent::Close)) | None => break,
                Some(Err(error)) => {
                    debug!(conn_id = %self.connection.id(), %error, "read failed");
                    break;
                }
            };
            if let Err(error) = self.handle_frame(decoded).await {
                warn!(conn_id = %self.connection.id(), %error, "failed to answer client");
                break;
            }
        }

        self.teardown().await;
        self.state
    }

    /// Idempotent; every exit path ends here.
    pub async fn teardown(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.transition(SessionState::Closing);
        self.relay.registry.deregister(self.connection.id());
        self.connection.close();
        self.writer = None;
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
        self.transition(SessionState::Closed);
        info!(
            conn_id = %self.connection.id(),
            user_id = %self.connection.user_id(),
            connections = self.relay.registry.len(),
            "websocket connection closed"
        );
    }

    fn transition(&mut self, next: SessionState) {
        debug!(conn_id = %self.connection.id(), from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Joins the room, hands the history backlog to the writer and waits
    /// until it is on the wire. Returns `false` when the backlog could not be
    /// written.
    async fn replay(&mut self) -> bool {
        let Some(writer) = self.writer.take() else {
            return false;
        };

        let backlog = match self
            .relay
            .broadcaster
            .join(Arc::clone(&self.connection))
            .await
        {
            Ok(history) => history
                .iter()
                .filter_map(|message| match serde_json::to_string(&OutboundFrame::from(message)) {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        warn!(message_id = message.message_id.0, %error, "skipping unencodable history entry");
                        None
                    }
                })
                .collect(),
            Err(error) => {
                error!(conn_id = %self.connection.id(), %error, "failed to load history");
                vec![error_frame(ErrorCode::Internal, "history is unavailable")]
            }
        };

        let replayed = backlog.len();
        let task = writer.spawn(backlog);
        self.writer_task = Some(task.handle);
        match task.replayed.await {
            Ok(()) => {
                debug!(conn_id = %self.connection.id(), replayed, "history replayed");
                true
            }
            Err(_) => false,
        }
    }

    async fn handle_frame(
        &self,
        decoded: Result<DecodedFrame, FrameError>,
    ) -> Result<(), TransportError> {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(error) => {
                warn!(conn_id = %self.connection.id(), %error, "skipping malformed frame");
                return Ok(());
            }
        };

        let author = self.connection.user_id().clone();
        if !frame.claimed_user_id.is_empty() && frame.claimed_user_id != author.as_str() {
            warn!(
                conn_id = %self.connection.id(),
                user_id = %author,
                claimed = %frame.claimed_user_id,
                "ignoring client-supplied user_id"
            );
        }

        let attachment = match frame.attachment {
            Some(upload) => {
                match self
                    .relay
                    .attachments
                    .store_attachment(&upload.bytes, &upload.file_name, &upload.content_type)
                    .await
                {
                    Ok(attachment_id) => {
                        info!(%attachment_id, size = upload.bytes.len(), "attachment stored");
                        Some(AttachmentRef {
                            attachment_id,
                            file_name: upload.file_name,
                            content_type: upload.content_type,
                        })
                    }
                    Err(error) => {
                        error!(conn_id = %self.connection.id(), error = %format!("{error:#}"), "failed to store attachment");
                        return self.reject("failed to store attachment");
                    }
                }
            }
            None => None,
        };

        self.publish(author, frame.text, attachment).await
    }

    async fn publish(
        &self,
        author: UserId,
        text: String,
        attachment: Option<AttachmentRef>,
    ) -> Result<(), TransportError> {
        let message = NewMessage::now(author, text, attachment);
        match self.relay.broadcaster.publish(message).await {
            Ok(_) => Ok(()),
            Err(error) => {
                error!(conn_id = %self.connection.id(), %error, "message rejected");
                self.reject("message could not be saved")
            }
        }
    }

    fn reject(&self, message: &str) -> Result<(), TransportError> {
        self.connection
            .enqueue(error_frame(ErrorCode::Internal, message).into())
    }
}

fn error_frame(code: ErrorCode, message: &str) -> String {
    let frame = ErrorFrame {
        error: ApiError::new(code, message),
    };
    serde_json::to_string(&frame).unwrap_or_else(|_| {
        r#"{"error":{"code":"internal","message":"internal error"}}"#.to_string()
    })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
