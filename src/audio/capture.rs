//! Microphone capture pipeline
//!
//! Frames microphone audio into fixed-size blocks, measures each block's
//! RMS volume, encodes it as PCM16 and hands `(frame, volume)` to a sink.
//!
//! # Lifecycle
//!
//! ```text
//! acquire()  ──▶ device open, blocks discarded (gate closed)
//! start(sink) ──▶ gate open, every block goes to the sink
//! stop()     ──▶ gate closed, sink dropped, device released
//! ```
//!
//! Captured audio is never routed to an output device, so the user's voice
//! is not played back locally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::device::{AudioBackend, AudioError, DeviceStream, StreamRequest};
use super::pcm::{encode_samples, EncodedFrame};

/// Reference block size: 4096 samples per tick (256 ms at 16 kHz)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Receives each encoded block and its RMS volume
pub type ChunkSink = Box<dyn FnMut(EncodedFrame, f32) + Send + 'static>;

/// Root-mean-square level of a block; 0.0 for an empty block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

struct Framer {
    pending: Vec<f32>,
    sink: Option<ChunkSink>,
}

struct CaptureShared {
    sample_rate: u32,
    block_size: usize,
    active: AtomicBool,
    chunks: AtomicU64,
    framer: Mutex<Framer>,
}

impl CaptureShared {
    /// Called from the device callback with mono samples at `sample_rate`
    fn push(&self, samples: &[f32]) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let mut framer = self.framer.lock().unwrap_or_else(PoisonError::into_inner);
        framer.pending.extend_from_slice(samples);

        while framer.pending.len() >= self.block_size {
            let block: Vec<f32> = framer.pending.drain(..self.block_size).collect();
            let volume = rms(&block);
            let frame = encode_samples(&block, self.sample_rate);

            let count = self.chunks.fetch_add(1, Ordering::SeqCst) + 1;
            if count % 50 == 0 {
                log::debug!("Capture: {} chunks captured", count);
            }

            if let Some(sink) = framer.sink.as_mut() {
                sink(frame, volume);
            }
        }
    }
}

/// Exclusive owner of the microphone stream
pub struct AudioCapture {
    shared: Arc<CaptureShared>,
    stream: Option<Box<dyn DeviceStream>>,
}

impl AudioCapture {
    /// Acquire the microphone. Audio is discarded until `start()`.
    pub fn acquire(
        backend: &dyn AudioBackend,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Self, AudioError> {
        let shared = Arc::new(CaptureShared {
            sample_rate,
            block_size: block_size.max(1),
            active: AtomicBool::new(false),
            chunks: AtomicU64::new(0),
            framer: Mutex::new(Framer {
                pending: Vec::with_capacity(block_size * 2),
                sink: None,
            }),
        });

        let callback_shared = shared.clone();
        let stream = backend.open_input(
            StreamRequest::mono(sample_rate),
            Box::new(move |samples: &[f32]| callback_shared.push(samples)),
        )?;

        log::info!(
            "Capture: microphone acquired ({} Hz mono, {} samples/block)",
            sample_rate,
            shared.block_size
        );

        Ok(Self {
            shared,
            stream: Some(stream),
        })
    }

    /// Begin delivering blocks to `sink`
    pub fn start(&self, sink: ChunkSink) {
        {
            let mut framer = self.shared.framer.lock().unwrap_or_else(PoisonError::into_inner);
            framer.pending.clear();
            framer.sink = Some(sink);
        }
        self.shared.active.store(true, Ordering::SeqCst);
        log::info!("Capture: streaming started");
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn chunks_captured(&self) -> u64 {
        self.shared.chunks.load(Ordering::SeqCst)
    }

    /// Disconnect the sink and release the microphone. Safe to call twice.
    pub fn stop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        {
            let mut framer = self.shared.framer.lock().unwrap_or_else(PoisonError::into_inner);
            framer.sink = None;
            framer.pending.clear();
        }

        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close() {
                log::warn!("Capture: failed to close microphone: {}", e);
            }
            log::info!(
                "Capture: microphone released after {} chunks",
                self.chunks_captured()
            );
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
