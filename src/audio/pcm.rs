//! PCM16 wire codec
//!
//! Converts between `f32` samples in `[-1.0, 1.0]` and the base64-framed
//! 16-bit little-endian PCM used on the Live session.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Scale factor between float samples and PCM16.
const PCM_SCALE: f32 = 32768.0;

/// Errors produced when decoding inbound audio payloads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid base64 audio payload: {0}")]
    InvalidBase64(String),
    #[error("PCM16 payload has odd byte length {0}")]
    OddByteLength(usize),
    #[error("Channel count must be at least 1")]
    ZeroChannels,
    #[error("{samples} samples do not divide into {channels} channels")]
    MisalignedFrames { samples: usize, channels: u16 },
}

/// One outbound audio frame, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    /// MIME descriptor, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64-encoded PCM16 little-endian samples
    pub data: String,
}

/// Decoded audio, stored planar (one `Vec` per channel)
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    /// Mono buffer from a single channel of samples
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// MIME descriptor for raw PCM16 at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Encode float samples as a base64 PCM16 frame.
///
/// Samples are clamped to `[-1.0, 1.0]` before scaling by 32768 and
/// truncating toward zero; `1.0` saturates to `i16::MAX`.
pub fn encode_samples(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    let bytes: Vec<u8> = samples
        .iter()
        .map(|&s| float_to_i16(s))
        .flat_map(i16::to_le_bytes)
        .collect();

    EncodedFrame {
        mime_type: pcm_mime_type(sample_rate),
        data: STANDARD.encode(&bytes),
    }
}

/// Decode a base64 payload into raw bytes
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Decode interleaved PCM16 little-endian bytes into a planar float buffer
pub fn decode_frame(bytes: &[u8], sample_rate: u32, channel_count: u16) -> Result<PcmBuffer, CodecError> {
    if channel_count == 0 {
        return Err(CodecError::ZeroChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteLength(bytes.len()));
    }

    let samples = bytes.len() / 2;
    let channels = channel_count as usize;
    if samples % channels != 0 {
        return Err(CodecError::MisalignedFrames {
            samples,
            channels: channel_count,
        });
    }

    let frames = samples / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];

    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        planar[i % channels].push(value as f32 / PCM_SCALE);
    }

    Ok(PcmBuffer {
        sample_rate,
        channels: planar,
    })
}

fn float_to_i16(sample: f32) -> i16 {
    // Float-to-int `as` casts truncate toward zero and saturate at the bounds
    (sample.clamp(-1.0, 1.0) * PCM_SCALE) as i16
}
