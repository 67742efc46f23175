//! Filter / spike-detection capability.
//!
//! The acquisition core hands each decoded block of amplifier samples to an
//! `XpuFilter` and gets back the per-channel band lanes plus a spike id per
//! sample. GPU implementations live outside this crate and are selected by
//! index; index 0 is always the built-in CPU implementation below.

use crate::api::{AMP_MICROVOLTS_PER_BIT, CHANNELS_PER_STREAM, SPIKE_ID_NO_SPIKE};
use crate::error::Result;

/// One block of raw amplifier samples, flattened (stream, channel, frame).
pub struct AmpBlock {
    pub num_streams: usize,
    pub samples: usize,
    data: Vec<u16>,
}

impl AmpBlock {
    pub fn new(num_streams: usize, samples: usize) -> AmpBlock {
        AmpBlock { num_streams, samples, data: vec![32768; num_streams * CHANNELS_PER_STREAM * samples] }
    }

    #[inline]
    fn offset(&self, stream: usize, channel: usize, frame: usize) -> usize {
        (stream * CHANNELS_PER_STREAM + channel) * self.samples + frame
    }

    #[inline]
    pub fn get(&self, stream: usize, channel: usize, frame: usize) -> u16 {
        self.data[self.offset(stream, channel, frame)]
    }

    #[inline]
    pub fn set(&mut self, stream: usize, channel: usize, frame: usize, value: u16) {
        let off = self.offset(stream, channel, frame);
        self.data[off] = value;
    }
}

/// Filter products for one block, same shape as the input.
pub struct FilterOutput {
    pub num_streams: usize,
    pub samples: usize,
    pub wide: Vec<u16>,
    pub low: Vec<u16>,
    pub high: Vec<u16>,
    pub spike_ids: Vec<u8>,
}

impl FilterOutput {
    pub fn new(num_streams: usize, samples: usize) -> FilterOutput {
        let n = num_streams * CHANNELS_PER_STREAM * samples;
        FilterOutput {
            num_streams,
            samples,
            wide: vec![32768; n],
            low: vec![32768; n],
            high: vec![32768; n],
            spike_ids: vec![SPIKE_ID_NO_SPIKE; n],
        }
    }

    #[inline]
    pub fn index(&self, stream: usize, channel: usize, frame: usize) -> usize {
        (stream * CHANNELS_PER_STREAM + channel) * self.samples + frame
    }

    pub fn resize_for(&mut self, num_streams: usize, samples: usize) {
        let n = num_streams * CHANNELS_PER_STREAM * samples;
        self.num_streams = num_streams;
        self.samples = samples;
        self.wide.resize(n, 32768);
        self.low.resize(n, 32768);
        self.high.resize(n, 32768);
        self.spike_ids.resize(n, SPIKE_ID_NO_SPIKE);
    }
}

pub trait XpuFilter: Send {
    fn name(&self) -> String;

    /// (Re)configure for a run. Forgets all filter state.
    fn configure(&mut self, sample_rate: f64, num_streams: usize) -> Result<()>;

    /// Per-channel spike thresholds in microvolts, flattened
    /// (stream, channel). Negative thresholds fire on downward crossings.
    fn set_spike_thresholds(&mut self, thresholds_uv: &[f32]) -> Result<()>;

    /// Filter one block into `output`. State (IIR history, refractory
    /// counters) carries across consecutive blocks of a run.
    fn process_block(&mut self, input: &AmpBlock, output: &mut FilterOutput) -> Result<()>;
}

/// Built-in CPU filter: first-order low/high split at 250 Hz and
/// threshold-crossing spike detection with a 1 ms refractory hold-off.
pub struct CpuFilter {
    sample_rate: f64,
    num_streams: usize,
    /// Low-pass IIR coefficient, derived from the corner and sample rate.
    alpha: f32,
    refractory_samples: u32,
    low_state_uv: Vec<f32>,
    prev_high_uv: Vec<f32>,
    refractory_left: Vec<u32>,
    thresholds_uv: Vec<f32>,
}

const LOW_PASS_CORNER_HZ: f64 = 250.0;
const DEFAULT_SPIKE_THRESHOLD_UV: f32 = -70.0;

impl CpuFilter {
    pub fn new() -> CpuFilter {
        CpuFilter {
            sample_rate: 30000.0,
            num_streams: 0,
            alpha: 0.0,
            refractory_samples: 30,
            low_state_uv: Vec::new(),
            prev_high_uv: Vec::new(),
            refractory_left: Vec::new(),
            thresholds_uv: Vec::new(),
        }
    }

    fn num_channels(&self) -> usize { self.num_streams * CHANNELS_PER_STREAM }
}

impl Default for CpuFilter {
    fn default() -> Self { Self::new() }
}

#[inline]
fn raw_to_uv(raw: u16) -> f32 {
    AMP_MICROVOLTS_PER_BIT * (raw as f32 - 32768.0)
}

#[inline]
fn uv_to_raw(uv: f32) -> u16 {
    (uv / AMP_MICROVOLTS_PER_BIT + 32768.0).clamp(0.0, 65535.0) as u16
}

impl XpuFilter for CpuFilter {
    fn name(&self) -> String { "CPU (builtin filter)".to_owned() }

    fn configure(&mut self, sample_rate: f64, num_streams: usize) -> Result<()> {
        self.sample_rate = sample_rate;
        self.num_streams = num_streams;
        self.alpha =
            (1.0 - (-2.0 * std::f64::consts::PI * LOW_PASS_CORNER_HZ / sample_rate).exp()) as f32;
        self.refractory_samples = (sample_rate / 1000.0).round() as u32;
        let n = self.num_channels();
        self.low_state_uv = vec![0.0; n];
        self.prev_high_uv = vec![0.0; n];
        self.refractory_left = vec![0; n];
        if self.thresholds_uv.len() != n {
            self.thresholds_uv = vec![DEFAULT_SPIKE_THRESHOLD_UV; n];
        }
        log::debug!(
            "cpu filter configured: {} streams at {} Hz, alpha {:.5}",
            num_streams,
            sample_rate,
            self.alpha
        );
        Ok(())
    }

    fn set_spike_thresholds(&mut self, thresholds_uv: &[f32]) -> Result<()> {
        self.thresholds_uv = thresholds_uv.to_vec();
        Ok(())
    }

    fn process_block(&mut self, input: &AmpBlock, output: &mut FilterOutput) -> Result<()> {
        output.resize_for(input.num_streams, input.samples);
        for stream in 0..input.num_streams {
            for channel in 0..CHANNELS_PER_STREAM {
                let ch = stream * CHANNELS_PER_STREAM + channel;
                let mut low = self.low_state_uv[ch];
                let mut prev_high = self.prev_high_uv[ch];
                let mut refractory = self.refractory_left[ch];
                let threshold = self.thresholds_uv.get(ch).copied().unwrap_or(DEFAULT_SPIKE_THRESHOLD_UV);
                for frame in 0..input.samples {
                    let raw = input.get(stream, channel, frame);
                    let uv = raw_to_uv(raw);
                    low += self.alpha * (uv - low);
                    let high = uv - low;
                    let idx = output.index(stream, channel, frame);
                    output.wide[idx] = raw;
                    output.low[idx] = uv_to_raw(low);
                    output.high[idx] = uv_to_raw(high);
                    let crossed = if threshold < 0.0 {
                        prev_high >= threshold && high < threshold
                    } else {
                        prev_high <= threshold && high > threshold
                    };
                    if refractory > 0 {
                        refractory -= 1;
                        output.spike_ids[idx] = SPIKE_ID_NO_SPIKE;
                    } else if crossed {
                        output.spike_ids[idx] = 1;
                        refractory = self.refractory_samples;
                    } else {
                        output.spike_ids[idx] = SPIKE_ID_NO_SPIKE;
                    }
                    prev_high = high;
                }
                self.low_state_uv[ch] = low;
                self.prev_high_uv[ch] = prev_high;
                self.refractory_left[ch] = refractory;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with_step(num_streams: usize, samples: usize, step_at: usize, uv: f32) -> AmpBlock {
        let mut block = AmpBlock::new(num_streams, samples);
        for frame in step_at..samples {
            block.set(0, 0, frame, uv_to_raw(uv));
        }
        block
    }

    #[test]
    fn wide_band_is_raw_passthrough() {
        let mut filter = CpuFilter::new();
        filter.configure(30000.0, 1).unwrap();
        let mut block = AmpBlock::new(1, 128);
        for frame in 0..128 {
            block.set(0, 0, frame, 30000 + frame as u16);
        }
        let mut output = FilterOutput::new(1, 128);
        filter.process_block(&block, &mut output).unwrap();
        for frame in 0..128 {
            assert_eq!(output.wide[output.index(0, 0, frame)], 30000 + frame as u16);
        }
    }

    #[test]
    fn bands_sum_back_to_wide() {
        let mut filter = CpuFilter::new();
        filter.configure(30000.0, 1).unwrap();
        let block = block_with_step(1, 128, 10, 400.0);
        let mut output = FilterOutput::new(1, 128);
        filter.process_block(&block, &mut output).unwrap();
        for frame in 0..128 {
            let idx = output.index(0, 0, frame);
            let wide = raw_to_uv(output.wide[idx]);
            let low = raw_to_uv(output.low[idx]);
            let high = raw_to_uv(output.high[idx]);
            assert!((wide - (low + high)).abs() < 0.4, "band split lost signal at {}", frame);
        }
    }

    #[test]
    fn negative_step_fires_one_spike_within_refractory() {
        let mut filter = CpuFilter::new();
        filter.configure(30000.0, 1).unwrap();
        // sharp negative transient well past the -70 uV default threshold
        let block = block_with_step(1, 128, 64, -400.0);
        let mut output = FilterOutput::new(1, 128);
        filter.process_block(&block, &mut output).unwrap();
        let spikes: Vec<usize> = (0..128)
            .filter(|&f| output.spike_ids[output.index(0, 0, f)] != SPIKE_ID_NO_SPIKE)
            .collect();
        assert_eq!(spikes, vec![64]);
    }

    #[test]
    fn spike_state_carries_across_blocks() {
        let mut filter = CpuFilter::new();
        filter.configure(30000.0, 1).unwrap();
        let first = block_with_step(1, 128, 120, -400.0);
        let mut output = FilterOutput::new(1, 128);
        filter.process_block(&first, &mut output).unwrap();
        assert_ne!(output.spike_ids[output.index(0, 0, 120)], SPIKE_ID_NO_SPIKE);
        // still inside the refractory window at the top of the next block:
        // the sustained level must not retrigger
        let mut second = AmpBlock::new(1, 128);
        for frame in 0..128 {
            second.set(0, 0, frame, uv_to_raw(-400.0));
        }
        filter.process_block(&second, &mut output).unwrap();
        for frame in 0..20 {
            assert_eq!(output.spike_ids[output.index(0, 0, frame)], SPIKE_ID_NO_SPIKE);
        }
    }

    #[test]
    fn per_channel_thresholds_apply() {
        let mut filter = CpuFilter::new();
        filter.configure(30000.0, 1).unwrap();
        let mut thresholds = vec![-70.0f32; CHANNELS_PER_STREAM];
        thresholds[0] = -1000.0; // effectively disabled
        filter.set_spike_thresholds(&thresholds).unwrap();
        let block = block_with_step(1, 128, 64, -400.0);
        let mut output = FilterOutput::new(1, 128);
        filter.process_block(&block, &mut output).unwrap();
        for frame in 0..128 {
            assert_eq!(output.spike_ids[output.index(0, 0, frame)], SPIKE_ID_NO_SPIKE);
        }
    }
}
