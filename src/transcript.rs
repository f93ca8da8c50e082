//! Transcript accumulation for a live call
//!
//! Transcription arrives as small fragments for both speakers. Fragments
//! are appended per speaker and a finished utterance is emitted only when
//! the server signals turn completion.
//!
//! - **User fragments** containing the bootstrap marker are dropped, so the
//!   synthetic "phone rings" trigger never shows up in the log
//! - **Interrupts** discard the pending agent text: the response was cut off
//!   and its partial text is not recorded

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::call::BOOTSTRAP_MARKER;

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Agent => "Agent",
        }
    }
}

/// One finished utterance in the call history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptItem {
    pub id: Uuid,
    pub sender: Speaker,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

impl TranscriptItem {
    fn new(sender: Speaker, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.to_string(),
            timestamp: Local::now(),
        }
    }
}

/// Per-speaker fragment buffers
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    user: String,
    agent: String,
    fragment_count: u64,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of the agent's speech
    pub fn append_agent_fragment(&mut self, text: &str) {
        self.agent.push_str(text);
        self.count_fragment();
    }

    /// Append a fragment of the user's speech, unless it carries the
    /// bootstrap marker
    pub fn append_user_fragment(&mut self, text: &str) {
        if text.contains(BOOTSTRAP_MARKER) {
            log::debug!("Transcript: dropped bootstrap fragment");
            return;
        }
        self.user.push_str(text);
        self.count_fragment();
    }

    /// Emit one item per non-blank buffer (user first) and clear them
    pub fn flush_on_turn_complete(&mut self) -> Vec<TranscriptItem> {
        let mut items = Vec::with_capacity(2);

        for (speaker, buffer) in [
            (Speaker::User, &mut self.user),
            (Speaker::Agent, &mut self.agent),
        ] {
            let text = buffer.trim();
            if !text.is_empty() {
                items.push(TranscriptItem::new(speaker, text));
                buffer.clear();
            }
        }

        if !items.is_empty() {
            log::info!(
                "Transcript: turn complete, {} item(s) after {} fragments",
                items.len(),
                self.fragment_count
            );
        }
        items
    }

    /// Drop the pending agent text without emitting it
    pub fn discard_agent_on_interrupt(&mut self) {
        if !self.agent.is_empty() {
            log::debug!(
                "Transcript: discarding {} chars of interrupted agent speech",
                self.agent.len()
            );
        }
        self.agent.clear();
    }

    /// Clear both buffers for a new call
    pub fn reset(&mut self) {
        self.user.clear();
        self.agent.clear();
        self.fragment_count = 0;
    }

    pub fn pending_user(&self) -> &str {
        &self.user
    }

    pub fn pending_agent(&self) -> &str {
        &self.agent
    }

    fn count_fragment(&mut self) {
        self.fragment_count += 1;
        if self.fragment_count % 25 == 0 {
            log::debug!(
                "Transcript: {} fragments, {} user / {} agent chars pending",
                self.fragment_count,
                self.user.len(),
                self.agent.len()
            );
        }
    }
}
