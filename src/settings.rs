use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::DEFAULT_BLOCK_SIZE;
use crate::streaming::protocol::{DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL};

const SETTINGS_DIR_NAME: &str = "polyglot-caller";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Live API WebSocket endpoint (the API key is appended as a query parameter).
    pub endpoint: String,

    /// Native-audio model used for the call.
    pub model: String,

    /// Prebuilt voice the agent speaks with.
    pub voice_name: String,

    /// Microphone audio is sent at this rate (PCM16 mono).
    pub capture_sample_rate: u32,

    /// Agent audio arrives at this rate (PCM16 mono).
    pub playback_sample_rate: u32,

    /// Samples per captured block. Smaller blocks lower latency, larger
    /// blocks lower per-message overhead.
    pub capture_block_size: usize,

    /// Outbound frames queued for the socket writer before new frames are dropped.
    pub outbound_queue_capacity: usize,

    /// Bound on the WebSocket handshake and setup acknowledgement.
    /// An open session has no timeout.
    pub connect_timeout_ms: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            capture_block_size: DEFAULT_BLOCK_SIZE,
            outbound_queue_capacity: 64,
            connect_timeout_ms: 10_000,
        }
    }
}

impl CallSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// `$CONFIG_DIR/polyglot-caller/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from `path`, or from the default location when `None`.
/// A missing or unreadable file yields the defaults.
pub fn load_settings(path: Option<&Path>) -> CallSettings {
    let path = match path.map(Path::to_path_buf).or_else(default_settings_path) {
        Some(p) => p,
        None => {
            log::warn!("Settings: could not determine config directory");
            return CallSettings::default();
        }
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<CallSettings>(&contents) {
            Ok(settings) => {
                log::info!("Settings: loaded {:?}", path);
                settings
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                CallSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CallSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            CallSettings::default()
        }
    }
}
