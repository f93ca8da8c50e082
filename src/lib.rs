//! Polyglot Caller
//!
//! Simulated phone calls in a foreign language with a realtime voice agent.
//! The user picks a language and a scenario; the agent answers the phone in
//! character, and both sides of the conversation are transcribed.
//!
//! ```text
//! microphone ─▶ AudioCapture ─▶ LiveConnection ─▶ Live API
//!                                                    │
//! speaker ◀─ PlaybackPipeline ◀─ CallController ◀────┘
//!                                      │
//!                                      └─▶ CallEvents (transcript, volume, end of call)
//! ```

pub mod api_key;
pub mod audio;
pub mod call;
pub mod controller;
pub mod settings;
pub mod streaming;
pub mod transcript;

pub use call::{CallConfiguration, Language, Scenario};
pub use controller::{CallController, CallError, CallEvents, CallState};
pub use settings::{load_settings, CallSettings};
pub use transcript::{Speaker, TranscriptItem};
