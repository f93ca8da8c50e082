//! Audio module for Polyglot Caller
//!
//! Microphone capture, gapless playback of agent speech, and the PCM16
//! codec used on the wire. Device access goes through `AudioBackend` so the
//! pipelines can run against cpal or an in-memory backend.

pub mod capture;
pub mod device;
pub mod pcm;
pub mod playback;
mod resample;

pub use capture::{rms, AudioCapture, ChunkSink, DEFAULT_BLOCK_SIZE};
pub use device::{
    AudioBackend, AudioError, CpalBackend, DeviceStream, InputCallback, RenderCallback,
    StreamRequest,
};
pub use pcm::{decode_base64, decode_frame, encode_samples, CodecError, EncodedFrame, PcmBuffer};
pub use playback::{PlaybackPipeline, PlaybackTimeline, SegmentSchedule};
pub use resample::{downmix_to_mono, resample, StreamResampler};
