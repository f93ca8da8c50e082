//! Transport-neutral Live session handle
//!
//! A `LiveTransport` opens a session and returns a `LiveConnection` (the
//! outbound side) plus a receiver of `SessionEvent`s (the inbound side).
//! How the transport produces those events is its own business; the call
//! controller only dispatches on the event kind.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig};
use super::StreamingError;

/// How long `close()` waits for the writer to flush the close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound events from an open session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A parsed server message
    Message(ServerMessage),
    /// The remote side closed the session (or the stream ended)
    Closed { reason: Option<String> },
    /// The transport failed
    Error(String),
}

/// Requests consumed by a transport's writer
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Receiver for inbound session events
pub type EventReceiver = mpsc::Receiver<SessionEvent>;

/// Cloneable, non-blocking handle for sending on the session
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Outbound>,
}

impl FrameSender {
    /// Queue a message without waiting.
    ///
    /// Failures (queue full, session gone) are swallowed: a dropped audio
    /// frame is superseded by the next one and is never retried. Returns
    /// whether the message was queued.
    pub fn send_best_effort(&self, msg: ClientMessage) -> bool {
        match self.tx.try_send(Outbound::Message(msg)) {
            Ok(()) => true,
            Err(e) => {
                log::trace!("LiveClient: dropped outbound frame: {}", e);
                false
            }
        }
    }

    /// Queue a message, waiting for room in the queue
    pub async fn send(&self, msg: ClientMessage) -> Result<(), StreamingError> {
        self.tx
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| StreamingError::SendFailed("session is closed".to_string()))
    }
}

/// Outbound side of an open Live session
pub struct LiveConnection {
    sender: FrameSender,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveConnection {
    /// Wrap the writer queue of a session.
    ///
    /// `writer`/`reader` are the transport's background tasks, if any; they
    /// are awaited or aborted by `close()`.
    pub fn new(
        outbound: mpsc::Sender<Outbound>,
        writer: Option<JoinHandle<()>>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            sender: FrameSender { tx: outbound },
            writer,
            reader,
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Close the session: send the close request, wait briefly for the
    /// writer to flush it, then stop the reader.
    pub async fn close(mut self) -> Result<(), StreamingError> {
        let requested =
            tokio::time::timeout(CLOSE_TIMEOUT, self.sender.tx.send(Outbound::Close)).await;

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                log::warn!("LiveClient: writer did not finish closing in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        match requested {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(StreamingError::Disconnected(
                "session already closed".to_string(),
            )),
            Err(_) => Err(StreamingError::SendFailed(
                "outbound queue full while closing".to_string(),
            )),
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens Live sessions
pub trait LiveTransport: Send + Sync + 'static {
    /// Connect and complete setup. Resolves once the session is open.
    fn connect(
        &self,
        setup: SetupConfig,
    ) -> impl Future<Output = Result<(LiveConnection, EventReceiver), StreamingError>> + Send;
}
