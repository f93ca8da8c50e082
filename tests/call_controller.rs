//! Integration tests for the call controller
//!
//! The Live API and the audio devices are replaced with in-memory fakes, so
//! these run without network access, an API key or a sound card:
//!
//! ```bash
//! cargo test --test call_controller
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Notify};

use polyglot_caller::audio::{
    encode_samples, AudioBackend, AudioError, DeviceStream, InputCallback, RenderCallback,
    StreamRequest,
};
use polyglot_caller::call::BOOTSTRAP_MARKER;
use polyglot_caller::streaming::{
    ClientMessage, EventReceiver, LiveConnection, LiveTransport, Outbound, ServerMessage,
    SessionEvent, SetupConfig, StreamingError,
};
use polyglot_caller::{
    CallConfiguration, CallController, CallError, CallEvents, CallSettings, CallState, Language,
    Scenario, Speaker, TranscriptItem,
};

const WAIT: Duration = Duration::from_secs(2);
const BLOCK: usize = 160;

// ============================================================================
// Fakes
// ============================================================================

struct FakeStream {
    rate: u32,
    channels: u16,
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl DeviceStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Audio devices driven by the test
#[derive(Clone, Default)]
struct FakeAudio {
    input: Arc<Mutex<Option<InputCallback>>>,
    render: Arc<Mutex<Option<RenderCallback>>>,
    open: Arc<AtomicUsize>,
    input_error: Option<AudioError>,
}

impl FakeAudio {
    fn failing_input(error: AudioError) -> Self {
        Self {
            input_error: Some(error),
            ..Default::default()
        }
    }

    fn feed(&self, samples: &[f32]) {
        if let Some(cb) = self.input.lock().unwrap().as_mut() {
            cb(samples);
        }
    }

    fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        if let Some(cb) = self.render.lock().unwrap().as_mut() {
            cb(&mut out, 1);
        }
        out
    }

    fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn stream(&self, request: StreamRequest) -> Box<dyn DeviceStream> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeStream {
            rate: request.sample_rate,
            channels: request.channels,
            open: self.open.clone(),
            closed: false,
        })
    }
}

impl AudioBackend for FakeAudio {
    fn open_input(
        &self,
        request: StreamRequest,
        on_samples: InputCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        if let Some(err) = &self.input_error {
            return Err(err.clone());
        }
        *self.input.lock().unwrap() = Some(on_samples);
        Ok(self.stream(request))
    }

    fn open_output(
        &self,
        request: StreamRequest,
        render: RenderCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        *self.render.lock().unwrap() = Some(render);
        Ok(self.stream(request))
    }
}

/// The server side of one fake session
struct Remote {
    setup: SetupConfig,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<SessionEvent>,
}

impl Remote {
    async fn next_message(&mut self) -> ClientMessage {
        match tokio::time::timeout(WAIT, self.outbound.recv()).await {
            Ok(Some(Outbound::Message(msg))) => msg,
            other => panic!("expected an outbound message, got {:?}", other),
        }
    }

    async fn send(&self, value: serde_json::Value) {
        let msg: ServerMessage = serde_json::from_value(value).unwrap();
        self.events.send(SessionEvent::Message(msg)).await.unwrap();
    }
}

/// Holds `connect` open until the test releases it
#[derive(Default)]
struct ConnectGate {
    entered: Notify,
    release: Notify,
}

/// Hands each session's server side to the test
#[derive(Clone, Default)]
struct FakeTransport {
    sessions: Arc<Mutex<Vec<Remote>>>,
    refuse: Option<StreamingError>,
    gate: Option<Arc<ConnectGate>>,
}

impl FakeTransport {
    fn take_remote(&self) -> Remote {
        self.sessions.lock().unwrap().remove(0)
    }
}

impl LiveTransport for FakeTransport {
    async fn connect(
        &self,
        setup: SetupConfig,
    ) -> Result<(LiveConnection, EventReceiver), StreamingError> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(err) = &self.refuse {
            return Err(err.clone());
        }
        let (out_tx, out_rx) = mpsc::channel(256);
        let (ev_tx, ev_rx) = mpsc::channel(16);
        self.sessions.lock().unwrap().push(Remote {
            setup,
            outbound: out_rx,
            events: ev_tx,
        });
        Ok((LiveConnection::new(out_tx, None, None), ev_rx))
    }
}

#[derive(Debug)]
enum Observed {
    Disconnect { open_streams: usize },
    Error(CallError),
    Volume(f32),
    Transcript(TranscriptItem),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Observed>,
    audio: FakeAudio,
}

impl CallEvents for Recorder {
    fn on_disconnect(&self) {
        let _ = self.tx.send(Observed::Disconnect {
            open_streams: self.audio.open_streams(),
        });
    }

    fn on_error(&self, error: &CallError) {
        let _ = self.tx.send(Observed::Error(error.clone()));
    }

    fn on_volume(&self, level: f32) {
        let _ = self.tx.send(Observed::Volume(level));
    }

    fn on_transcript(&self, item: TranscriptItem) {
        let _ = self.tx.send(Observed::Transcript(item));
    }
}

struct Harness {
    controller: Arc<CallController<FakeTransport, FakeAudio>>,
    transport: FakeTransport,
    audio: FakeAudio,
    observed: mpsc::UnboundedReceiver<Observed>,
}

impl Harness {
    fn new(transport: FakeTransport, audio: FakeAudio) -> Self {
        let (tx, observed) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            tx,
            audio: audio.clone(),
        });
        let settings = CallSettings {
            capture_block_size: BLOCK,
            ..Default::default()
        };
        Self {
            controller: Arc::new(CallController::new(
                transport.clone(),
                audio.clone(),
                settings,
                recorder,
            )),
            transport,
            audio,
            observed,
        }
    }

    fn standard() -> Self {
        Self::new(FakeTransport::default(), FakeAudio::default())
    }

    async fn next_event(&mut self) -> Observed {
        tokio::time::timeout(WAIT, self.observed.recv())
            .await
            .expect("timed out waiting for a call event")
            .expect("event channel closed")
    }

    async fn next_transcript(&mut self) -> TranscriptItem {
        loop {
            if let Observed::Transcript(item) = self.next_event().await {
                return item;
            }
        }
    }
}

fn spanish_bakery() -> CallConfiguration {
    CallConfiguration {
        language: Language {
            display_name: "Spanish".to_string(),
            wire_code: "es-ES".to_string(),
        },
        scenario: Scenario {
            title: "Bakery".to_string(),
            system_prompt: "You run a small bakery in Madrid.".to_string(),
        },
    }
}

fn agent_audio(level: f32, frames: usize) -> serde_json::Value {
    let frame = encode_samples(&vec![level; frames], 24000);
    json!({ "inlineData": { "mimeType": frame.mime_type, "data": frame.data } })
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn start_call_opens_session_and_sends_bootstrap() {
    let mut h = Harness::standard();
    assert_eq!(h.controller.state().await, CallState::Idle);

    h.controller.start_call(spanish_bakery()).await.unwrap();
    assert_eq!(h.controller.state().await, CallState::Open);
    assert!(h.controller.is_active().await);
    assert_eq!(h.audio.open_streams(), 2);

    let mut remote = h.transport.take_remote();
    let setup = serde_json::to_value(&remote.setup).unwrap();
    let instruction = setup["systemInstruction"]["parts"][0]["text"]
        .as_str()
        .unwrap();
    assert!(instruction.contains("Spanish"));
    assert!(instruction.contains("bakery in Madrid"));

    match remote.next_message().await {
        ClientMessage::ClientContent(content) => {
            let text = content.turns[0].parts[0].text.as_deref().unwrap();
            assert!(text.contains(BOOTSTRAP_MARKER));
            assert!(content.turn_complete);
        }
        other => panic!("expected the bootstrap turn first, got {:?}", other),
    }
}

#[tokio::test]
async fn silent_block_reports_zero_volume_once_and_streams_frame() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let mut remote = h.transport.take_remote();
    let _bootstrap = remote.next_message().await;

    h.audio.feed(&[0.0; BLOCK]);

    match h.next_event().await {
        Observed::Volume(level) => assert_eq!(level, 0.0),
        other => panic!("expected a volume reading, got {:?}", other),
    }
    assert!(h.observed.try_recv().is_err());

    match remote.next_message().await {
        ClientMessage::RealtimeInput(input) => {
            assert_eq!(input.audio.mime_type, "audio/pcm;rate=16000");
            assert_eq!(input.audio.data, encode_samples(&[0.0; BLOCK], 16000).data);
        }
        other => panic!("expected a realtime audio frame, got {:?}", other),
    }
}

#[tokio::test]
async fn stop_call_is_idempotent_and_safe_before_start() {
    let h = Harness::standard();
    h.controller.stop_call().await;
    assert_eq!(h.controller.state().await, CallState::Idle);

    h.controller.start_call(spanish_bakery()).await.unwrap();
    h.controller.stop_call().await;
    h.controller.stop_call().await;

    assert_eq!(h.controller.state().await, CallState::Closed);
    assert!(!h.controller.is_active().await);
    assert_eq!(h.audio.open_streams(), 0);
}

#[tokio::test]
async fn stop_call_closes_session() {
    let h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let mut remote = h.transport.take_remote();

    h.controller.stop_call().await;

    let mut saw_close = false;
    while let Ok(Some(outbound)) = tokio::time::timeout(WAIT, remote.outbound.recv()).await {
        if matches!(outbound, Outbound::Close) {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn restart_tears_down_previous_call() {
    let h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let first = h.transport.take_remote();

    h.controller.start_call(spanish_bakery()).await.unwrap();
    assert_eq!(h.controller.state().await, CallState::Open);
    assert_eq!(h.audio.open_streams(), 2);

    // Events from the old session no longer reach the new call
    let _ = first.events.send(SessionEvent::Closed { reason: None }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.state().await, CallState::Open);
}

#[tokio::test]
async fn remote_close_releases_devices_before_disconnect() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let remote = h.transport.take_remote();

    remote
        .events
        .send(SessionEvent::Closed {
            reason: Some("bye".to_string()),
        })
        .await
        .unwrap();

    match h.next_event().await {
        Observed::Disconnect { open_streams } => assert_eq!(open_streams, 0),
        other => panic!("expected a disconnect, got {:?}", other),
    }
    assert_eq!(h.controller.state().await, CallState::Closed);

    // Nothing further is reported and stopping again is harmless
    h.controller.stop_call().await;
    assert!(h.observed.try_recv().is_err());
}

#[tokio::test]
async fn transport_error_is_reported_once() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let remote = h.transport.take_remote();

    remote
        .events
        .send(SessionEvent::Error("socket reset".to_string()))
        .await
        .unwrap();

    match h.next_event().await {
        Observed::Error(CallError::Connection(msg)) => assert!(msg.contains("socket reset")),
        other => panic!("expected a connection error, got {:?}", other),
    }
    assert_eq!(h.audio.open_streams(), 0);

    h.controller.stop_call().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.observed.try_recv().is_err());
}

#[tokio::test]
async fn dropping_controller_releases_call() {
    let h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let mut remote = h.transport.take_remote();
    let _bootstrap = remote.next_message().await;

    let Harness {
        controller, audio, ..
    } = h;
    drop(controller);

    assert_eq!(audio.open_streams(), 0);
    // Every sender on the session is gone
    let end = tokio::time::timeout(WAIT, remote.outbound.recv()).await;
    assert!(matches!(end, Ok(None)), "got {:?}", end);
}

#[tokio::test]
async fn stop_call_does_not_wait_for_connect() {
    let gate = Arc::new(ConnectGate::default());
    let transport = FakeTransport {
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = Harness::new(transport, FakeAudio::default());

    let controller = h.controller.clone();
    let starting = tokio::spawn(async move { controller.start_call(spanish_bakery()).await });

    tokio::time::timeout(WAIT, gate.entered.notified())
        .await
        .expect("connect never started");
    assert_eq!(h.controller.state().await, CallState::Connecting);

    tokio::time::timeout(WAIT, h.controller.stop_call())
        .await
        .expect("stop_call blocked on the pending connect");
    assert_eq!(h.controller.state().await, CallState::Closed);
    assert_eq!(h.audio.open_streams(), 0);

    gate.release.notify_one();
    let result = starting.await.unwrap();
    assert!(matches!(result, Err(CallError::Connection(_))));
    assert_eq!(h.controller.state().await, CallState::Closed);

    // The session that arrived late is closed without a bootstrap turn
    let mut remote = h.transport.take_remote();
    let first = tokio::time::timeout(WAIT, remote.outbound.recv()).await;
    assert!(matches!(first, Ok(Some(Outbound::Close))), "got {:?}", first);
}

// ============================================================================
// Start failures
// ============================================================================

#[tokio::test]
async fn microphone_permission_denied() {
    let mut h = Harness::new(
        FakeTransport::default(),
        FakeAudio::failing_input(AudioError::PermissionDenied("user said no".to_string())),
    );

    let err = h.controller.start_call(spanish_bakery()).await.unwrap_err();
    assert!(matches!(err, CallError::Permission(_)));
    assert_eq!(h.audio.open_streams(), 0);
    assert!(!h.controller.is_active().await);
    assert!(h.observed.try_recv().is_err());
}

#[tokio::test]
async fn missing_microphone_is_a_device_error() {
    let h = Harness::new(
        FakeTransport::default(),
        FakeAudio::failing_input(AudioError::NoInputDevice),
    );

    let err = h.controller.start_call(spanish_bakery()).await.unwrap_err();
    assert!(matches!(err, CallError::Device(_)));
    assert!(h.transport.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn refused_connection_releases_devices() {
    let transport = FakeTransport {
        refuse: Some(StreamingError::ConnectionFailed("Connection timeout".to_string())),
        ..Default::default()
    };
    let mut h = Harness::new(transport, FakeAudio::default());

    let err = h.controller.start_call(spanish_bakery()).await.unwrap_err();
    assert!(matches!(err, CallError::Connection(_)));
    assert_eq!(h.audio.open_streams(), 0);
    assert_eq!(h.controller.state().await, CallState::Closed);
    assert!(h.observed.try_recv().is_err());
}

// ============================================================================
// Inbound handling
// ============================================================================

#[tokio::test]
async fn transcripts_emitted_on_turn_complete() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let remote = h.transport.take_remote();

    remote
        .send(json!({ "serverContent": { "inputTranscription": { "text": "(Phone rings) [INITIAL_TRIGGER]" } } }))
        .await;
    remote
        .send(json!({ "serverContent": { "outputTranscription": { "text": "Panadería Sol," } } }))
        .await;
    remote
        .send(json!({ "serverContent": { "outputTranscription": { "text": " buenos días." } } }))
        .await;
    remote
        .send(json!({ "serverContent": { "turnComplete": true } }))
        .await;

    let item = h.next_transcript().await;
    assert_eq!(item.sender, Speaker::Agent);
    assert_eq!(item.text, "Panadería Sol, buenos días.");

    remote
        .send(json!({ "serverContent": {
            "inputTranscription": { "text": " Hola, quisiera una barra de pan. " },
            "outputTranscription": { "text": "¡Claro!" },
            "turnComplete": true
        } }))
        .await;

    let user = h.next_transcript().await;
    let agent = h.next_transcript().await;
    assert_eq!(user.sender, Speaker::User);
    assert_eq!(user.text, "Hola, quisiera una barra de pan.");
    assert_eq!(agent.sender, Speaker::Agent);
    assert_eq!(agent.text, "¡Claro!");
}

#[tokio::test]
async fn interruption_silences_scheduled_audio() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let remote = h.transport.take_remote();

    remote
        .send(json!({ "serverContent": {
            "modelTurn": { "parts": [agent_audio(0.25, 2400)] },
            "outputTranscription": { "text": "Un momento" },
            "turnComplete": true
        } }))
        .await;
    h.next_transcript().await;

    let playing = h.audio.render(100);
    assert!(playing.iter().all(|&s| (s - 0.25).abs() < 1e-3));

    remote
        .send(json!({ "serverContent": {
            "modelTurn": { "parts": [agent_audio(0.5, 2400), agent_audio(0.5, 2400)] },
            "outputTranscription": { "text": "Como le decía" }
        } }))
        .await;
    remote
        .send(json!({ "serverContent": { "interrupted": true } }))
        .await;
    remote
        .send(json!({ "serverContent": {
            "inputTranscription": { "text": "Perdón" },
            "turnComplete": true
        } }))
        .await;

    // The interrupted agent text is dropped; only the user's turn remains
    let item = h.next_transcript().await;
    assert_eq!(item.sender, Speaker::User);
    assert_eq!(item.text, "Perdón");

    assert!(h.audio.render(4800).iter().all(|&s| s == 0.0));
}

#[tokio::test]
async fn malformed_audio_does_not_end_call() {
    let mut h = Harness::standard();
    h.controller.start_call(spanish_bakery()).await.unwrap();
    let remote = h.transport.take_remote();

    remote
        .send(json!({ "serverContent": {
            "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "not base64!" } },
                agent_audio(0.25, 480)
            ] },
            "outputTranscription": { "text": "Hola" },
            "turnComplete": true
        } }))
        .await;

    assert_eq!(h.next_transcript().await.text, "Hola");
    assert_eq!(h.controller.state().await, CallState::Open);
    assert!(h.audio.render(100).iter().any(|&s| s != 0.0));
}
