//! API key resolution and storage.
//!
//! The key is resolved from `GEMINI_API_KEY`, then `API_KEY` (either may
//! come from a `.env` file loaded at startup), then the OS credential store
//! (Keychain, Credential Manager, or the Secret Service on Linux). Only the
//! credential store is written to.
//!
//! Never log the key value; use `mask_key()` for display.

use keyring::Entry;

const SERVICE_NAME: &str = "polyglot-caller";
const KEY_NAME: &str = "gemini-api-key";
const ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Env(&'static str),
    Keyring,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Env(name) => write!(f, "${}", name),
            KeySource::Keyring => write!(f, "system keyring"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("API key is empty")]
    Empty,
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

fn entry() -> Result<Entry, keyring::Error> {
    Entry::new(SERVICE_NAME, KEY_NAME)
}

fn from_env() -> Option<(String, KeySource)> {
    ENV_VARS.iter().find_map(|&name| {
        std::env::var(name)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(|key| (key, KeySource::Env(name)))
    })
}

fn from_keyring() -> Option<String> {
    match entry().and_then(|e| e.get_password()) {
        Ok(key) if !key.is_empty() => Some(key),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("ApiKey: keyring lookup failed: {}", e);
            None
        }
    }
}

/// The key to use and where it was found
pub fn resolve_api_key() -> Option<(String, KeySource)> {
    from_env().or_else(|| from_keyring().map(|key| (key, KeySource::Keyring)))
}

pub fn get_api_key() -> Option<String> {
    resolve_api_key().map(|(key, _)| key)
}

/// Save `key` in the credential store, replacing any previous one
pub fn store_api_key(key: &str) -> Result<(), ApiKeyError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ApiKeyError::Empty);
    }
    entry()?.set_password(key)?;
    log::info!("ApiKey: stored {}", mask_key(key));
    Ok(())
}

/// Remove the stored key. Returns whether there was one.
pub fn clear_api_key() -> Result<bool, ApiKeyError> {
    match entry()?.delete_credential() {
        Ok(()) => {
            log::info!("ApiKey: removed stored key");
            Ok(true)
        }
        Err(keyring::Error::NoEntry) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Masked form of a key for display (e.g. "AIz...c123ab")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
