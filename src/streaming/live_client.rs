//! Live API WebSocket client
//!
//! Manages the WebSocket connection lifecycle for a call.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. Writer task - drains the outbound queue onto the socket
//! 3. Reader task - parses frames into `SessionEvent`s
//! 4. `LiveConnection::close()` - close frame, reader stopped
//!
//! There are no retries: a failed connect fails the call, and a session that
//! drops mid-call ends it.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::connection::{EventReceiver, LiveConnection, LiveTransport, Outbound, SessionEvent};
use super::protocol::{ClientMessage, ServerMessage, SetupConfig};
use super::StreamingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Capacity of the inbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Opens Live sessions over a WebSocket
#[derive(Clone)]
pub struct LiveClient {
    endpoint: String,
    api_key: String,
    connect_timeout: Duration,
    outbound_capacity: usize,
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

impl LiveClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        outbound_capacity: usize,
    ) -> Result<Self, StreamingError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }

        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            connect_timeout,
            outbound_capacity: outbound_capacity.max(1),
        })
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    async fn open(&self, setup: SetupConfig) -> Result<(LiveConnection, EventReceiver), StreamingError> {
        let request = self
            .url()
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("LiveClient: connecting to {}...", self.endpoint);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        send_json(&mut write, &ClientMessage::Setup(setup))
            .await
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("LiveClient: WebSocket connected, waiting for setupComplete...");

        timeout(self.connect_timeout, wait_for_setup(&mut read))
            .await
            .map_err(|_| StreamingError::ConnectionFailed("Setup timeout".to_string()))??;

        log::info!("LiveClient: session open");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let writer = tokio::spawn(run_writer(write, outbound_rx));
        let reader = tokio::spawn(run_reader(read, events_tx));

        Ok((
            LiveConnection::new(outbound_tx, Some(writer), Some(reader)),
            events_rx,
        ))
    }
}

impl LiveTransport for LiveClient {
    async fn connect(
        &self,
        setup: SetupConfig,
    ) -> Result<(LiveConnection, EventReceiver), StreamingError> {
        self.open(setup).await
    }
}

async fn send_json(write: &mut WsWrite, msg: &ClientMessage) -> Result<(), StreamingError> {
    let json =
        serde_json::to_string(msg).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

    write
        .send(Message::Text(json))
        .await
        .map_err(|e| StreamingError::SendFailed(e.to_string()))
}

/// Parse a text or binary frame as a server message.
/// Returns `None` for control frames.
fn parse_frame(msg: &Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(bytes)),
        _ => None,
    }
}

async fn wait_for_setup(read: &mut WsRead) -> Result<(), StreamingError> {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(StreamingError::SetupRejected(reason));
            }
            Ok(msg) => match parse_frame(&msg) {
                Some(Ok(server)) if server.is_setup_complete() => return Ok(()),
                Some(Ok(_)) => log::debug!("LiveClient: ignoring message before setupComplete"),
                Some(Err(e)) => log::warn!("LiveClient: failed to parse message: {}", e),
                None => {}
            },
            Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
        }
    }
    Err(StreamingError::Disconnected("Stream ended before setup".to_string()))
}

async fn run_writer(mut write: WsWrite, mut outbound_rx: mpsc::Receiver<Outbound>) {
    let mut frames_sent: u64 = 0;

    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Message(msg) => {
                // Send failures are not fatal; the reader reports a dead socket
                if let Err(e) = send_json(&mut write, &msg).await {
                    log::debug!("LiveClient: send failed (ignored): {}", e);
                    continue;
                }
                frames_sent += 1;
                if frames_sent % 50 == 0 {
                    log::debug!("LiveClient: sent {} messages", frames_sent);
                }
            }
            Outbound::Close => {
                if let Err(e) = write.close().await {
                    log::debug!("LiveClient: error closing WebSocket: {}", e);
                }
                break;
            }
        }
    }

    log::debug!("LiveClient: writer exiting after {} messages", frames_sent);
}

async fn run_reader(mut read: WsRead, events_tx: mpsc::Sender<SessionEvent>) {
    let terminal = loop {
        match read.next().await {
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string());
                log::info!("LiveClient: WebSocket closed by server ({:?})", reason);
                break SessionEvent::Closed { reason };
            }
            Some(Ok(msg)) => match parse_frame(&msg) {
                Some(Ok(server)) => {
                    if let Some(go_away) = &server.go_away {
                        log::warn!(
                            "LiveClient: server going away (time left: {:?})",
                            go_away.time_left
                        );
                    }
                    if events_tx.send(SessionEvent::Message(server)).await.is_err() {
                        log::debug!("LiveClient: event channel closed");
                        return;
                    }
                }
                Some(Err(e)) => log::warn!("LiveClient: failed to parse message: {}", e),
                None => {}
            },
            Some(Err(e)) => {
                log::warn!("LiveClient: WebSocket error: {}", e);
                break SessionEvent::Error(e.to_string());
            }
            None => break SessionEvent::Closed { reason: None },
        }
    };

    let _ = events_tx.send(terminal).await;
    log::debug!("LiveClient: reader exiting");
}
