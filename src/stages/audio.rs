//! Audio monitor stage: one selected channel → the host's output device.
//!
//! Mixes the selected amplifier channel's wideband lane down to the default
//! cpal output at the device's native rate, with a threshold-based noise
//! slicer and a linear volume. If no output device can be opened the stage
//! keeps draining its reader (a run must never stall on a missing sound
//! card); the failure is surfaced once as a warning event.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;

use crate::api::{BusEvent, Reader, AMP_MICROVOLTS_PER_BIT};
use crate::bus::EventBus;
use crate::stages::{spawn_stage, Stage, StageControl};
use crate::state::SystemState;
use crate::wavefifo::WaveformFifo;

const CHUNK_SAMPLES: usize = 256;
const DEVICE_QUEUE_DEPTH: usize = 16384;
/// Full scale corresponds to +-5 mV at the electrode.
const FULL_SCALE_MICROVOLTS: f32 = 5000.0;

/// Slice away sub-threshold noise, then scale to [-1, 1].
pub fn shape_sample(micro_volts: f32, threshold_uv: f32, volume: f32) -> f32 {
    let sliced = if micro_volts.abs() < threshold_uv {
        0.0
    } else if micro_volts > 0.0 {
        micro_volts - threshold_uv
    } else {
        micro_volts + threshold_uv
    };
    (sliced / FULL_SCALE_MICROVOLTS * volume).clamp(-1.0, 1.0)
}

pub fn spawn_audio_output(
    fifo: Arc<WaveformFifo>,
    state: Arc<RwLock<SystemState>>,
    bus: Arc<EventBus>,
) -> Stage {
    spawn_stage("audio", move |control| {
        session(control, &fifo, &state, &bus);
    })
}

fn open_device(
    bus: &EventBus,
) -> Option<(cpal::Stream, Sender<f32>, f64)> {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            log::warn!("audio: no output device, monitoring disabled");
            bus.publish(BusEvent::StageError("no audio output device found".into()));
            return None;
        }
    };
    let config = match device.default_output_config() {
        Ok(config) => config,
        Err(err) => {
            log::warn!("audio: couldn't query output config: {}", err);
            bus.publish(BusEvent::StageError(format!("audio device unusable: {}", err)));
            return None;
        }
    };
    let device_rate = config.sample_rate().0 as f64;
    let channels = config.channels() as usize;
    let stream_config: cpal::StreamConfig = config.into();
    let (tx, rx): (Sender<f32>, Receiver<f32>) = bounded(DEVICE_QUEUE_DEPTH);
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let sample = rx.try_recv().unwrap_or(0.0);
                for out in frame.iter_mut() {
                    *out = sample;
                }
            }
        },
        |err| log::warn!("audio: stream error: {}", err),
        None,
    );
    match stream {
        Ok(stream) => match stream.play() {
            Ok(()) => Some((stream, tx, device_rate)),
            Err(err) => {
                log::warn!("audio: couldn't start stream: {}", err);
                bus.publish(BusEvent::StageError(format!("audio stream failed: {}", err)));
                None
            }
        },
        Err(err) => {
            log::warn!("audio: couldn't build stream: {}", err);
            bus.publish(BusEvent::StageError(format!("audio stream failed: {}", err)));
            None
        }
    }
}

fn session(
    control: &StageControl,
    fifo: &WaveformFifo,
    state: &RwLock<SystemState>,
    bus: &EventBus,
) {
    let (channel_name, sample_rate) = {
        let state = state.read();
        let name = state.globals().locate("audiochannel").unwrap().as_text().to_owned();
        let name = if name.is_empty() {
            state
                .signals
                .amplifier_channels()
                .next()
                .map(|c| c.native_name().to_owned())
                .unwrap_or_default()
        } else {
            name
        };
        (name, state.sample_rate())
    };
    let lane = fifo.lanes().amp_index(&format!("{}|WIDE", channel_name.to_ascii_uppercase()));
    if lane.is_none() {
        log::warn!("audio: channel '{}' has no wideband lane, draining only", channel_name);
    } else {
        log::info!("audio: monitoring {}", channel_name);
    }

    // the cpal stream lives (and dies) with this session
    let device = open_device(bus);
    let mut resample_acc = 0.0f64;
    let step = device.as_ref().map(|(_, _, rate)| rate / sample_rate).unwrap_or(0.0);

    while control.keep_going() {
        let window = match fifo.request_read(Reader::Audio, CHUNK_SAMPLES) {
            Some(window) => window,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        if let (Some(lane), Some((_stream, tx, _rate))) = (lane, device.as_ref()) {
            let (volume, threshold) = {
                let state = state.read();
                let volume =
                    state.globals().locate("audiovolume").unwrap().as_int() as f32 / 100.0;
                let threshold =
                    state.globals().locate("audiothresholdmicrovolts").unwrap().as_int() as f32;
                (volume, threshold)
            };
            let lanes = fifo.lanes();
            for i in 0..CHUNK_SAMPLES {
                // device-rate resampling by fractional repetition
                resample_acc += step;
                let emit = resample_acc as usize;
                if emit == 0 {
                    continue;
                }
                resample_acc -= emit as f64;
                let raw = lanes.amp(lane, window, i as isize);
                let micro_volts = AMP_MICROVOLTS_PER_BIT * (raw as f32 - 32768.0);
                let sample = shape_sample(micro_volts, threshold, volume);
                for _ in 0..emit {
                    // a full device queue just drops samples; monitoring
                    // audio is best-effort
                    if tx.try_send(sample).is_err() {
                        break;
                    }
                }
            }
        }
        fifo.free(Reader::Audio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slicer_zeroes_below_threshold() {
        assert_eq!(shape_sample(30.0, 50.0, 1.0), 0.0);
        assert_eq!(shape_sample(-49.9, 50.0, 1.0), 0.0);
        assert!(shape_sample(100.0, 50.0, 1.0) > 0.0);
        assert!(shape_sample(-100.0, 50.0, 1.0) < 0.0);
    }

    #[test]
    fn slicer_is_continuous_at_threshold() {
        // just above threshold should be near zero, not a step
        let just_over = shape_sample(50.1, 50.0, 1.0);
        assert!(just_over > 0.0 && just_over < 0.001);
    }

    #[test]
    fn volume_scales_and_clamps() {
        let half = shape_sample(1050.0, 50.0, 0.5);
        let full = shape_sample(1050.0, 50.0, 1.0);
        assert!((full / half - 2.0).abs() < 1e-5);
        assert_eq!(shape_sample(1.0e6, 0.0, 1.0), 1.0);
        assert_eq!(shape_sample(-1.0e6, 0.0, 1.0), -1.0);
    }
}
