//! Sample-rate and channel conversion between device formats and the
//! fixed wire formats (16 kHz capture, 24 kHz playback).

/// Average interleaved frames down to a single channel
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    let channels = channels as usize;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio from `source_rate` to `target_rate`.
///
/// Integer down-ratios (48 kHz → 16 kHz) average each group of samples;
/// every other ratio falls back to linear interpolation.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    linear(samples, source_rate, target_rate)
}

fn linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    let step = source_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64) / step).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

/// Resampler for a continuous stream delivered in arbitrary-sized pieces.
///
/// The read position and any input not yet consumed carry over between
/// calls, so output length and interpolation phase do not depend on how the
/// device splits its callbacks.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    /// Input not yet fully consumed
    pending: Vec<f32>,
    /// Fractional read position into `pending` (linear path only)
    position: f64,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate,
            target_rate,
            pending: Vec::new(),
            position: 0.0,
        }
    }

    fn passthrough(&self) -> bool {
        self.source_rate == 0 || self.target_rate == 0 || self.source_rate == self.target_rate
    }

    /// Resample the next piece of the stream
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.passthrough() {
            return input.to_vec();
        }

        self.pending.extend_from_slice(input);

        if self.source_rate > self.target_rate && self.source_rate % self.target_rate == 0 {
            let ratio = (self.source_rate / self.target_rate) as usize;
            let whole = self.pending.len() / ratio * ratio;
            let out = self.pending[..whole]
                .chunks_exact(ratio)
                .map(|chunk| chunk.iter().sum::<f32>() / ratio as f32)
                .collect();
            self.pending.drain(..whole);
            return out;
        }

        let step = self.source_rate as f64 / self.target_rate as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / step) as usize + 1);

        // Interpolation needs the sample after the read position
        while (self.position.floor() as usize) + 1 < self.pending.len() {
            let idx = self.position.floor() as usize;
            let frac = (self.position - idx as f64) as f32;
            let (a, b) = (self.pending[idx], self.pending[idx + 1]);
            out.push(a + (b - a) * frac);
            self.position += step;
        }

        let consumed = (self.position.floor() as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.position -= consumed as f64;

        out
    }
}
