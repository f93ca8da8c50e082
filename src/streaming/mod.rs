//! Live session streaming for a simulated phone call
//!
//! This module provides the WebSocket transport to the Live API: microphone
//! frames flow out, agent audio and transcription fragments flow back.
//!
//! # Architecture
//!
//! ```text
//! Capture callback ──try_send──▶ outbound queue ──▶ writer task ──▶ WebSocket
//!                                                                      │
//! CallController ◀── SessionEvent channel ◀── reader task ◀────────────┘
//! ```
//!
//! # Failure Policy
//!
//! - Connect and setup failures fail the call; there are no retries
//! - Individual outbound frames that cannot be queued or written are dropped
//! - A mid-call close or socket error ends the call

mod connection;
mod live_client;
pub mod protocol;

pub use connection::{
    EventReceiver, FrameSender, LiveConnection, LiveTransport, Outbound, SessionEvent,
};
pub use live_client::LiveClient;
pub use protocol::{ClientMessage, ServerContent, ServerMessage, SetupConfig};

/// Errors that can occur on the Live session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamingError {
    /// API key not configured
    #[error("API key not configured. Set GEMINI_API_KEY or store one with `polyglot-caller set-key`.")]
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to the Live API: {0}")]
    ConnectionFailed(String),
    /// Server closed the session before acknowledging setup
    #[error("Session setup rejected: {0}")]
    SetupRejected(String),
    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    /// Connection was closed unexpectedly
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    /// Failed to send a message
    #[error("Failed to send: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::SetupRejected("invalid model".to_string());
        assert!(err.to_string().contains("invalid model"));
    }
}
