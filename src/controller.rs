//! Call session controller
//!
//! Owns everything a call acquires: the output device, the microphone, the
//! Live connection and the task pumping inbound events. All of it is
//! released by a single teardown routine, whatever ends the call.
//!
//! ```text
//! Idle ──start_call──▶ Connecting ──open──▶ Open
//!                          │                  │
//!                          └──── error ───────┴──close/error/stop──▶ Closed
//! ```
//!
//! A closed session never reopens; `start_call` always builds a new one
//! (with a new call id) after tearing the previous one down. Events from a
//! session that has already been torn down are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{
    decode_base64, decode_frame, AudioBackend, AudioCapture, AudioError, PlaybackPipeline,
};
use crate::call::{bootstrap_message, CallConfiguration};
use crate::settings::CallSettings;
use crate::streaming::protocol::pcm_rate;
use crate::streaming::{
    ClientMessage, EventReceiver, LiveConnection, LiveTransport, ServerMessage, SessionEvent,
    StreamingError,
};
use crate::transcript::{TranscriptAccumulator, TranscriptItem};

/// Errors surfaced to the caller of `start_call` or to `CallEvents::on_error`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Microphone access denied
    #[error("Microphone permission denied: {0}")]
    Permission(String),
    /// No usable capture or playback device
    #[error("Audio device unavailable: {0}")]
    Device(String),
    /// The session could not be opened, or was lost
    #[error("Connection lost: {0}")]
    Connection(String),
    /// The opening "phone rings" message could not be sent
    #[error("Failed to start the conversation: {0}")]
    Bootstrap(String),
}

impl From<AudioError> for CallError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::PermissionDenied(msg) => CallError::Permission(msg),
            other => CallError::Device(other.to_string()),
        }
    }
}

impl From<StreamingError> for CallError {
    fn from(err: StreamingError) -> Self {
        CallError::Connection(err.to_string())
    }
}

/// Callbacks into the UI collaborator
pub trait CallEvents: Send + Sync + 'static {
    /// The remote side closed the call
    fn on_disconnect(&self);
    /// The call ended because of an error
    fn on_error(&self, error: &CallError);
    /// RMS level of each captured block, roughly 0.0..1.0
    fn on_volume(&self, level: f32);
    /// A finished utterance
    fn on_transcript(&self, item: TranscriptItem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Resources held by one call
struct ActiveCall {
    call_id: Uuid,
    playback_rate: u32,
    playback: Option<PlaybackPipeline>,
    capture: Option<AudioCapture>,
    connection: Option<LiveConnection>,
    pump: Option<JoinHandle<()>>,
    dropped_frames: Arc<AtomicU64>,
}

impl ActiveCall {
    fn new(call_id: Uuid, playback_rate: u32) -> Self {
        Self {
            call_id,
            playback_rate,
            playback: None,
            capture: None,
            connection: None,
            pump: None,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        // Teardown takes the handle first; this only fires when the
        // controller itself is dropped mid-call
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct Inner {
    state: CallState,
    call: Option<ActiveCall>,
    transcript: TranscriptAccumulator,
}

impl Inner {
    fn current_call_id(&self) -> Option<Uuid> {
        self.call.as_ref().map(|c| c.call_id)
    }

    /// Apply one server message; returns the transcript items it finished
    fn handle_message(&mut self, msg: &ServerMessage) -> Vec<TranscriptItem> {
        let Some(content) = &msg.server_content else {
            return Vec::new();
        };

        if let Some(text) = content.output_text() {
            self.transcript.append_agent_fragment(text);
        }
        if let Some(text) = content.input_text() {
            self.transcript.append_user_fragment(text);
        }

        let items = if content.turn_complete {
            self.transcript.flush_on_turn_complete()
        } else {
            Vec::new()
        };

        if let Some(call) = &self.call {
            if let Some(playback) = &call.playback {
                for blob in content.inline_audio() {
                    let rate = pcm_rate(&blob.mime_type).unwrap_or(call.playback_rate);
                    let decoded = decode_base64(&blob.data)
                        .and_then(|bytes| decode_frame(&bytes, rate, 1));
                    match decoded {
                        Ok(buffer) => {
                            playback.enqueue(&buffer);
                        }
                        // A malformed segment is skipped; the stream continues
                        Err(e) => log::debug!("Call: skipping undecodable audio: {}", e),
                    }
                }

                if content.interrupted {
                    playback.interrupt();
                }
            }
        }

        if content.interrupted {
            log::info!("Call: agent interrupted");
            self.transcript.discard_agent_on_interrupt();
        }

        items
    }

    /// Release everything the current call holds. Returns the pump handle so
    /// the caller can decide whether to abort it.
    async fn teardown(&mut self) -> Option<JoinHandle<()>> {
        self.transcript.reset();

        let Some(mut call) = self.call.take() else {
            if self.state != CallState::Idle {
                self.state = CallState::Closed;
            }
            return None;
        };

        log::info!("Call: tearing down {}", call.call_id);

        if let Some(connection) = call.connection.take() {
            if let Err(e) = connection.close().await {
                log::debug!("Call: error closing session (ignored): {}", e);
            }
        }

        let capture = call.capture.take();
        let playback = call.playback.take();
        let (chunks, segments) =
            tokio::task::spawn_blocking(move || release_devices(capture, playback))
                .await
                .unwrap_or_else(|e| {
                    log::warn!("Call: device release task failed: {}", e);
                    (0, 0)
                });

        self.state = CallState::Closed;

        log::info!(
            "Call: {} closed ({} chunks captured, {} frames dropped, {} segments played)",
            call.call_id,
            chunks,
            call.dropped_frames.load(Ordering::SeqCst),
            segments
        );

        call.pump.take()
    }
}

/// Stop the microphone and the output device. Joining the device threads
/// blocks, so this runs on the blocking pool.
fn release_devices(
    capture: Option<AudioCapture>,
    playback: Option<PlaybackPipeline>,
) -> (u64, u64) {
    let mut chunks = 0;
    if let Some(mut capture) = capture {
        chunks = capture.chunks_captured();
        capture.stop();
    }

    let mut segments = 0;
    if let Some(mut playback) = playback {
        segments = playback.segments_completed();
        playback.shutdown();
    }

    (chunks, segments)
}

/// Runs one call at a time against a transport and an audio backend.
///
/// Dropping the controller ends any call in progress and releases its
/// devices and session without notifying `CallEvents`.
pub struct CallController<T: LiveTransport, B: AudioBackend> {
    transport: Arc<T>,
    backend: Arc<B>,
    settings: CallSettings,
    events: Arc<dyn CallEvents>,
    inner: Arc<Mutex<Inner>>,
}

impl<T: LiveTransport, B: AudioBackend> CallController<T, B> {
    pub fn new(
        transport: T,
        backend: B,
        settings: CallSettings,
        events: Arc<dyn CallEvents>,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            backend: Arc::new(backend),
            settings,
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: CallState::Idle,
                call: None,
                transcript: TranscriptAccumulator::new(),
            })),
        }
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        matches!(self.state().await, CallState::Connecting | CallState::Open)
    }

    /// Start a call, tearing down any previous one first.
    ///
    /// Fails if a device cannot be acquired or the session cannot be opened;
    /// anything acquired so far is released before returning. Once this
    /// returns `Ok`, failures are only reported through `CallEvents`.
    ///
    /// The controller is not locked while connecting, so `stop_call` can end
    /// the call during that time; `start_call` then fails and closes the
    /// late session.
    pub async fn start_call(&self, config: CallConfiguration) -> Result<(), CallError> {
        let call_id = Uuid::new_v4();

        {
            let mut inner = self.inner.lock().await;
            if let Some(previous) = inner.teardown().await {
                previous.abort();
            }

            log::info!(
                "Call: starting {} ({} / {})",
                call_id,
                config.language.display_name,
                config.scenario.title
            );

            inner.state = CallState::Connecting;
            inner.call = Some(ActiveCall::new(call_id, self.settings.playback_sample_rate));

            if let Err(e) = self.acquire_devices(&mut inner) {
                return Err(fail_start(&mut inner, e).await);
            }
        }

        let connected = self.transport.connect(config.setup(&self.settings)).await;

        let mut inner = self.inner.lock().await;
        if inner.current_call_id() != Some(call_id) {
            log::info!("Call: {} was stopped while connecting", call_id);
            drop(inner);
            if let Ok((connection, _)) = connected {
                if let Err(e) = connection.close().await {
                    log::debug!("Call: error closing late session (ignored): {}", e);
                }
            }
            return Err(CallError::Connection(
                "call was stopped while connecting".to_string(),
            ));
        }

        let opened = match connected {
            Ok((connection, events_rx)) => self
                .open(&mut inner, connection)
                .await
                .map(|()| events_rx),
            Err(e) => Err(e.into()),
        };

        match opened {
            Ok(events_rx) => {
                let pump = tokio::spawn(pump_events(
                    Arc::downgrade(&self.inner),
                    self.events.clone(),
                    call_id,
                    events_rx,
                ));
                if let Some(call) = inner.call.as_mut() {
                    call.pump = Some(pump);
                }
                log::info!("Call: {} open", call_id);
                Ok(())
            }
            Err(e) => Err(fail_start(&mut inner, e).await),
        }
    }

    /// Open the output device and the microphone for the new call
    fn acquire_devices(&self, inner: &mut Inner) -> Result<(), CallError> {
        let settings = &self.settings;
        let backend: &dyn AudioBackend = self.backend.as_ref();

        let playback = PlaybackPipeline::start(backend, settings.playback_sample_rate)?;
        active(inner)?.playback = Some(playback);

        let capture = AudioCapture::acquire(
            backend,
            settings.capture_sample_rate,
            settings.capture_block_size,
        )?;
        active(inner)?.capture = Some(capture);

        Ok(())
    }

    /// Wire capture to the new session and send the opening turn
    async fn open(&self, inner: &mut Inner, connection: LiveConnection) -> Result<(), CallError> {
        let sender = connection.sender();

        let call = active(inner)?;
        call.connection = Some(connection);

        let events = self.events.clone();
        let dropped = call.dropped_frames.clone();
        let frame_sender = sender.clone();
        if let Some(capture) = &call.capture {
            capture.start(Box::new(move |frame, volume| {
                events.on_volume(volume);
                if !frame_sender.send_best_effort(ClientMessage::realtime_audio(frame)) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        inner.state = CallState::Open;

        sender
            .send(bootstrap_message())
            .await
            .map_err(|e| CallError::Bootstrap(e.to_string()))
    }

    /// Tear down the current call, if any. Safe to call at any time and
    /// any number of times.
    pub async fn stop_call(&self) {
        let pump = self.inner.lock().await.teardown().await;
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

async fn fail_start(inner: &mut Inner, error: CallError) -> CallError {
    log::error!("Call: failed to start: {}", error);
    if let Some(pump) = inner.teardown().await {
        pump.abort();
    }
    error
}

fn active(inner: &mut Inner) -> Result<&mut ActiveCall, CallError> {
    inner
        .call
        .as_mut()
        .ok_or_else(|| CallError::Connection("call was torn down during setup".to_string()))
}

/// Dispatch inbound session events until the session ends
async fn pump_events(
    inner: Weak<Mutex<Inner>>,
    events: Arc<dyn CallEvents>,
    call_id: Uuid,
    mut events_rx: EventReceiver,
) {
    loop {
        let event = events_rx.recv().await;

        // Gone with the controller, which released the call on drop
        let Some(shared) = inner.upgrade() else {
            return;
        };
        let mut guard = shared.lock().await;
        if guard.current_call_id() != Some(call_id) {
            log::debug!("Call: ignoring event for stale call {}", call_id);
            return;
        }

        match event {
            Some(SessionEvent::Message(msg)) => {
                let items = guard.handle_message(&msg);
                drop(guard);
                for item in items {
                    events.on_transcript(item);
                }
            }
            Some(SessionEvent::Error(message)) => {
                log::warn!("Call: session error: {}", message);
                // This task is the pump being torn down; let it finish on its own
                let _own = guard.teardown().await;
                drop(guard);
                events.on_error(&CallError::Connection(message));
                return;
            }
            Some(SessionEvent::Closed { reason }) => {
                log::info!("Call: session closed by remote ({:?})", reason);
                let _own = guard.teardown().await;
                drop(guard);
                events.on_disconnect();
                return;
            }
            None => {
                log::info!("Call: session event stream ended");
                let _own = guard.teardown().await;
                drop(guard);
                events.on_disconnect();
                return;
            }
        }
    }
}
