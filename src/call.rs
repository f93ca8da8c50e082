//! Call configuration and the persona prompt sent at session setup

use serde::{Deserialize, Serialize};

use crate::settings::CallSettings;
use crate::streaming::{ClientMessage, SetupConfig};

/// Reserved tag identifying the synthetic "phone rings" message
pub const BOOTSTRAP_MARKER: &str = "[INITIAL_TRIGGER]";

/// Hidden first user turn that makes the agent answer the phone
pub const BOOTSTRAP_TEXT: &str =
    "(Phone rings) [INITIAL_TRIGGER]: Please answer the call now with your opening greeting.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Name used in the persona prompt, e.g. "Spanish"
    pub display_name: String,
    /// Code the language is known by on the wire, e.g. "es-ES"
    pub wire_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub title: String,
    /// Role description for the remote agent
    pub system_prompt: String,
}

/// What the user picked for this call. Immutable once the call starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfiguration {
    pub language: Language,
    pub scenario: Scenario,
}

impl CallConfiguration {
    /// Persona instructions for the remote agent
    pub fn system_instruction(&self) -> String {
        let language = &self.language.display_name;
        format!(
            "You are an actor in a phone call simulation.\n\
             Language: {language} ({code}).\n\
             Scenario: {scenario}\n\
             \n\
             CRITICAL INSTRUCTIONS:\n\
             1. You are the receiver of the call. Answer immediately.\n\
             2. Your FIRST words must be a professional greeting in {language} appropriate for the scenario.\n\
             3. Stay in character for the whole call.\n\
             4. Do not mention that you are an AI or a simulation unless asked.\n\
             5. Keep responses conversational and brief.",
            code = self.language.wire_code,
            scenario = self.scenario.system_prompt,
        )
    }

    /// Setup message for this call
    pub fn setup(&self, settings: &CallSettings) -> SetupConfig {
        SetupConfig::audio_session(&settings.model, &settings.voice_name, self.system_instruction())
    }
}

/// The hidden "phone rings" turn sent right after the session opens
pub fn bootstrap_message() -> ClientMessage {
    ClientMessage::user_text(BOOTSTRAP_TEXT)
}
