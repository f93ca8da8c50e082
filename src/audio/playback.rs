//! Gapless playback of streamed agent audio
//!
//! Segments arrive as discrete network messages. Each one is scheduled at
//! `max(next_start_time, current_time)` and the cursor then advances by the
//! segment's duration, so consecutive segments play back-to-back in arrival
//! order with no gap and no overlap.
//!
//! The clock is the number of frames the output device has rendered. The
//! render callback mixes every live segment into the device buffer and drops
//! segments as soon as their last frame has been played; nothing polls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::device::{AudioBackend, AudioError, DeviceStream, StreamRequest};
use super::pcm::PcmBuffer;
use super::resample::resample;

/// Where and for how long a segment was scheduled, in seconds on the
/// playback clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSchedule {
    pub id: u64,
    pub start_time: f64,
    pub duration: f64,
}

#[derive(Debug)]
struct ScheduledSegment {
    start_frame: u64,
    /// Mono samples at the timeline's output rate
    samples: Vec<f32>,
}

impl ScheduledSegment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Playback schedule and mixer, shared between the pipeline and the
/// output device's render callback.
#[derive(Debug)]
pub struct PlaybackTimeline {
    sample_rate: u32,
    frames_rendered: u64,
    next_start_time: f64,
    next_id: u64,
    live: BTreeMap<u64, ScheduledSegment>,
    segments_completed: u64,
}

impl PlaybackTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            next_start_time: 0.0,
            next_id: 0,
            live: BTreeMap::new(),
            segments_completed: 0,
        }
    }

    /// Output rate the segments are rendered at
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate > 0 && self.live.is_empty() {
            self.sample_rate = sample_rate;
        }
    }

    /// Current playback clock in seconds
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    /// Start time the cursor will offer the next segment
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Number of segments scheduled but not yet finished
    pub fn live_segments(&self) -> usize {
        self.live.len()
    }

    pub fn segments_completed(&self) -> u64 {
        self.segments_completed
    }

    /// Schedule a decoded segment right after everything already queued
    pub fn enqueue(&mut self, buffer: &PcmBuffer) -> SegmentSchedule {
        let start_time = self.next_start_time.max(self.current_time());
        let duration = buffer.duration_secs();

        let mono = mix_down(buffer);
        let samples = resample(&mono, buffer.sample_rate, self.sample_rate);
        let start_frame = (start_time * self.sample_rate as f64).round() as u64;

        let id = self.next_id;
        self.next_id += 1;
        self.next_start_time = start_time + duration;

        self.live.insert(
            id,
            ScheduledSegment {
                start_frame,
                samples,
            },
        );

        SegmentSchedule {
            id,
            start_time,
            duration,
        }
    }

    /// Stop every live segment and rewind the cursor so the next segment
    /// starts at the current clock time. Returns how many were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.live.len();
        self.live.clear();
        self.next_start_time = 0.0;
        stopped
    }

    /// Mix live segments into an interleaved output buffer and advance the clock
    pub fn render(&mut self, out: &mut [f32], channels: u16) {
        out.fill(0.0);
        let channels = channels.max(1) as usize;
        let frames = (out.len() / channels) as u64;
        let block_start = self.frames_rendered;
        let block_end = block_start + frames;

        for segment in self.live.values() {
            let from = segment.start_frame.max(block_start);
            let to = segment.end_frame().min(block_end);
            for frame in from..to {
                let value = segment.samples[(frame - segment.start_frame) as usize];
                let base = (frame - block_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += value;
                }
            }
        }

        self.frames_rendered = block_end;

        let before = self.live.len();
        self.live.retain(|_, segment| segment.end_frame() > block_end);
        self.segments_completed += (before - self.live.len()) as u64;
    }
}

fn mix_down(buffer: &PcmBuffer) -> Vec<f32> {
    match buffer.channels.as_slice() {
        [] => Vec::new(),
        [only] => only.clone(),
        channels => {
            let scale = 1.0 / channels.len() as f32;
            (0..buffer.frames())
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() * scale)
                .collect()
        }
    }
}

fn lock(timeline: &Mutex<PlaybackTimeline>) -> MutexGuard<'_, PlaybackTimeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the output device and the timeline feeding it
pub struct PlaybackPipeline {
    timeline: Arc<Mutex<PlaybackTimeline>>,
    stream: Option<Box<dyn DeviceStream>>,
}

impl PlaybackPipeline {
    /// Open the output device at `sample_rate` (24 kHz for agent speech).
    /// If the device runs at another rate, segments are resampled to it.
    pub fn start(backend: &dyn AudioBackend, sample_rate: u32) -> Result<Self, AudioError> {
        let timeline = Arc::new(Mutex::new(PlaybackTimeline::new(sample_rate)));
        let render_timeline = timeline.clone();

        let stream = backend.open_output(
            StreamRequest {
                sample_rate,
                channels: 1,
            },
            Box::new(move |out: &mut [f32], channels: u16| {
                lock(&render_timeline).render(out, channels);
            }),
        )?;

        lock(&timeline).set_sample_rate(stream.sample_rate());

        log::info!(
            "Playback: started ({} Hz stream, device at {} Hz, {} channels)",
            sample_rate,
            stream.sample_rate(),
            stream.channels()
        );

        Ok(Self {
            timeline,
            stream: Some(stream),
        })
    }

    pub fn enqueue(&self, buffer: &PcmBuffer) -> SegmentSchedule {
        let schedule = lock(&self.timeline).enqueue(buffer);
        log::trace!(
            "Playback: segment {} at {:.3}s for {:.3}s",
            schedule.id,
            schedule.start_time,
            schedule.duration
        );
        schedule
    }

    pub fn interrupt(&self) -> usize {
        let stopped = lock(&self.timeline).interrupt();
        log::debug!("Playback: interrupted, {} segments stopped", stopped);
        stopped
    }

    pub fn live_segments(&self) -> usize {
        lock(&self.timeline).live_segments()
    }

    pub fn current_time(&self) -> f64 {
        lock(&self.timeline).current_time()
    }

    pub fn segments_completed(&self) -> u64 {
        lock(&self.timeline).segments_completed()
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        lock(&self.timeline).interrupt();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close() {
                log::warn!("Playback: failed to close output device: {}", e);
            }
            log::info!("Playback: output device released");
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
