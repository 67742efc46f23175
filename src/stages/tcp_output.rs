//! TCP output stage: waveform FIFO → waveform/spike data sockets.
//!
//! Packs committed samples into the little-endian wire format consumed by
//! remote analysis clients. The waveform stream carries a magic word per
//! data block, a timestamp per frame, and one `u16` per enabled band and
//! channel; detected spikes go out the second socket as fixed 14-byte
//! records. When neither peer is connected the stage still drains its
//! reader cursor so the writer never stalls on it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use crate::api::{
    Band, ControllerKind, Reader, SPIKE_ID_NO_SPIKE, SPIKE_MAGIC, FRAMES_PER_BLOCK, WAVEFORM_MAGIC,
};
use crate::signal::SignalKind;
use crate::stages::{spawn_stage, Stage, StageControl};
use crate::state::SystemState;
use crate::stim::resolve_magnitudes;
use crate::tcp::DataOutputSocket;
use crate::wavefifo::{LaneStore, ReadWindow, WaveformFifo};

enum BandRef {
    Wide(usize),
    Low(usize),
    High(usize),
    Spike { lane: usize },
    Dc(usize),
    Stim { lane: usize, positive: u8, negative: u8 },
}

enum PlanEntry {
    Amp { name5: [u8; 5], bands: Vec<BandRef> },
    Aux { lane: usize },
    Vdd { lane: usize },
    Adc { lane: usize },
    Dac { lane: usize },
    DigitalIn,
    DigitalOut,
}

pub struct TcpPlan {
    entries: Vec<PlanEntry>,
    digital_in_enabled: bool,
    digital_out_enabled: bool,
    digital_in_lane: usize,
    digital_out_lane: usize,
    usb2_adc_scaling: bool,
    change_serial: u64,
}

fn name5(name: &str) -> [u8; 5] {
    let mut out = [b' '; 5];
    for (dst, src) in out.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out
}

/// Walk the signal model once and cache lane handles for every enabled
/// output, in model order. Rebuilt whenever the state serial moves.
pub fn build_plan(state: &SystemState, lanes: &LaneStore) -> TcpPlan {
    let model = &state.signals;
    let stim_step = state.stim_step_size_ua();
    let mut plan = TcpPlan {
        entries: Vec::new(),
        digital_in_enabled: false,
        digital_out_enabled: false,
        digital_in_lane: lanes.digital_index("DIGITAL-IN-WORD").unwrap_or(0),
        digital_out_lane: lanes.digital_index("DIGITAL-OUT-WORD").unwrap_or(0),
        usb2_adc_scaling: model.controller_kind() == ControllerKind::RecordUsb2,
        change_serial: state.change_serial(),
    };

    for channel in model.channels() {
        let name = channel.native_name();
        match channel.kind() {
            SignalKind::Amplifier => {
                let bands = channel.tcp_bands();
                if bands.is_empty() {
                    continue;
                }
                let mut refs = Vec::with_capacity(bands.len());
                for band in bands {
                    let lane_name = format!("{}|{}", name, band.suffix());
                    let band_ref = match band {
                        Band::Wide => lanes.amp_index(&lane_name).map(BandRef::Wide),
                        Band::Low => lanes.amp_index(&lane_name).map(BandRef::Low),
                        Band::High => lanes.amp_index(&lane_name).map(BandRef::High),
                        Band::Spike => {
                            lanes.digital_index(&lane_name).map(|lane| BandRef::Spike { lane })
                        }
                        Band::Dc => lanes.analog_index(&lane_name).map(BandRef::Dc),
                        Band::Stim => lanes.digital_index(&lane_name).map(|lane| {
                            let (positive, negative) = channel
                                .stim_parameters()
                                .map(|p| resolve_magnitudes(&p, stim_step))
                                .unwrap_or((0, 0));
                            BandRef::Stim { lane, positive, negative }
                        }),
                    };
                    match band_ref {
                        Some(r) => refs.push(r),
                        None => log::warn!("tcp-output: lane {} missing, band skipped", lane_name),
                    }
                }
                plan.entries.push(PlanEntry::Amp { name5: name5(name), bands: refs });
            }
            SignalKind::AuxInput if channel.output_to_tcp() => {
                if let Some(lane) = lanes.analog_index(name) {
                    plan.entries.push(PlanEntry::Aux { lane });
                }
            }
            SignalKind::SupplyVoltage if channel.output_to_tcp() => {
                if let Some(lane) = lanes.analog_index(name) {
                    plan.entries.push(PlanEntry::Vdd { lane });
                }
            }
            SignalKind::BoardAdc if channel.output_to_tcp() => {
                if let Some(lane) = lanes.analog_index(name) {
                    plan.entries.push(PlanEntry::Adc { lane });
                }
            }
            SignalKind::BoardDac if channel.output_to_tcp() => {
                if let Some(lane) = lanes.analog_index(name) {
                    plan.entries.push(PlanEntry::Dac { lane });
                }
            }
            SignalKind::BoardDigitalIn if channel.output_to_tcp() => {
                if !plan.digital_in_enabled {
                    plan.entries.push(PlanEntry::DigitalIn);
                    plan.digital_in_enabled = true;
                }
            }
            SignalKind::BoardDigitalOut if channel.output_to_tcp() => {
                if !plan.digital_out_enabled {
                    plan.entries.push(PlanEntry::DigitalOut);
                    plan.digital_out_enabled = true;
                }
            }
            _ => {}
        }
    }
    plan
}

impl TcpPlan {
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[inline]
fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Pack `frames` samples from `window` into the waveform and spike wire
/// buffers. Pure with respect to the sockets, which keeps the framing
/// testable byte-for-byte.
pub fn pack_frames(
    plan: &TcpPlan,
    lanes: &LaneStore,
    window: ReadWindow,
    frames: usize,
    waveform: &mut Vec<u8>,
    spikes: &mut Vec<u8>,
) {
    waveform.clear();
    spikes.clear();
    for i in 0..frames {
        if i % FRAMES_PER_BLOCK == 0 {
            waveform.extend_from_slice(&WAVEFORM_MAGIC.to_le_bytes());
        }
        let timestamp = lanes.timestamp(window, i as isize);
        waveform.extend_from_slice(&timestamp.to_le_bytes());

        let digital_in_word = lanes.digital(plan.digital_in_lane, window, i as isize);
        let digital_out_word = lanes.digital(plan.digital_out_lane, window, i as isize);
        let mut digital_in_sent = false;
        let mut digital_out_sent = false;

        for entry in &plan.entries {
            match entry {
                PlanEntry::Amp { name5, bands } => {
                    for band in bands {
                        match band {
                            BandRef::Wide(lane) | BandRef::Low(lane) | BandRef::High(lane) => {
                                put_u16(waveform, lanes.amp(*lane, window, i as isize));
                            }
                            BandRef::Spike { lane } => {
                                let spike_id = lanes.digital(*lane, window, i as isize) as u8;
                                if spike_id != SPIKE_ID_NO_SPIKE {
                                    spikes.extend_from_slice(&SPIKE_MAGIC.to_le_bytes());
                                    spikes.extend_from_slice(name5);
                                    spikes.extend_from_slice(&timestamp.to_le_bytes());
                                    spikes.push(spike_id);
                                }
                            }
                            BandRef::Dc(lane) => {
                                let volts = lanes.analog(*lane, window, i as isize);
                                let sample =
                                    ((volts / -0.01923).round() as i64 + 512) as u16;
                                put_u16(waveform, sample);
                            }
                            BandRef::Stim { lane, positive, negative } => {
                                let word = lanes.digital(*lane, window, i as isize);
                                let stim_on = word & 1 != 0;
                                let negative_polarity = word & (1 << 8) != 0;
                                let magnitude = if stim_on {
                                    if negative_polarity { *negative } else { *positive }
                                } else {
                                    0
                                };
                                put_u16(waveform, (word & 0xff00) | magnitude as u16);
                            }
                        }
                    }
                }
                PlanEntry::Aux { lane } => {
                    // true rate is every 4th frame; the lane repeats between
                    let volts = lanes.analog(*lane, window, i as isize);
                    put_u16(waveform, ((volts / 37.4e-6).round() as i64) as u16);
                }
                PlanEntry::Vdd { lane } => {
                    let volts = lanes.analog(*lane, window, i as isize);
                    put_u16(waveform, ((volts / 74.8e-6).round() as i64) as u16);
                }
                PlanEntry::Adc { lane } => {
                    let volts = lanes.analog(*lane, window, i as isize);
                    let sample = if plan.usb2_adc_scaling {
                        ((volts / 50.354e-6).round() as i64) as u16
                    } else {
                        ((volts as f64 * 3200.0).round() as i64 + 32768) as u16
                    };
                    put_u16(waveform, sample);
                }
                PlanEntry::Dac { lane } => {
                    let volts = lanes.analog(*lane, window, i as isize);
                    put_u16(waveform, ((volts as f64 * 3200.0).round() as i64 + 32768) as u16);
                }
                PlanEntry::DigitalIn => {
                    if !digital_in_sent {
                        put_u16(waveform, digital_in_word);
                        digital_in_sent = true;
                    }
                }
                PlanEntry::DigitalOut => {
                    if !digital_out_sent {
                        put_u16(waveform, digital_out_word);
                        digital_out_sent = true;
                    }
                }
            }
        }
    }
}

pub fn spawn_tcp_output(
    fifo: Arc<WaveformFifo>,
    state: Arc<RwLock<SystemState>>,
    sockets_in: Receiver<(DataOutputSocket, DataOutputSocket)>,
    sockets_out: Sender<(DataOutputSocket, DataOutputSocket)>,
) -> Stage {
    spawn_stage("tcp-output", move |control| {
        let (mut wave_sock, mut spike_sock) = match sockets_in.recv_timeout(Duration::from_secs(1))
        {
            Ok(pair) => pair,
            Err(_) => {
                log::error!("tcp-output: no sockets handed over, session aborted");
                return;
            }
        };
        session(control, &fifo, &state, &mut wave_sock, &mut spike_sock);
        if sockets_out.send((wave_sock, spike_sock)).is_err() {
            log::error!("tcp-output: socket hand-back failed");
        }
    })
}

fn session(
    control: &StageControl,
    fifo: &WaveformFifo,
    state: &RwLock<SystemState>,
    wave_sock: &mut DataOutputSocket,
    spike_sock: &mut DataOutputSocket,
) {
    let mut plan = {
        let state = state.read();
        build_plan(&state, &fifo.lanes())
    };
    let mut waveform_buf: Vec<u8> = Vec::new();
    let mut spike_buf: Vec<u8> = Vec::new();

    while control.keep_going() {
        wave_sock.service();
        spike_sock.service();

        let num_blocks = {
            let state = state.read();
            if state.change_serial() != plan.change_serial {
                plan = build_plan(&state, &fifo.lanes());
            }
            state.globals().locate("tcpnumdatablockswrite").map(|i| i.as_int()).unwrap_or(1)
                as usize
        };
        // never ask for more than the writer could ever run ahead by
        let max_blocks = (fifo.live_len() / FRAMES_PER_BLOCK / 2).max(1);
        let frames = FRAMES_PER_BLOCK * num_blocks.min(max_blocks);

        let connected = wave_sock.config().is_connected() || spike_sock.config().is_connected();
        let window = match fifo.request_read(Reader::Tcp, frames) {
            Some(window) => window,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        if !connected || plan.is_empty() {
            // nothing to emit; keep the cursor moving
            fifo.free(Reader::Tcp);
            continue;
        }

        {
            let lanes = fifo.lanes();
            pack_frames(&plan, &lanes, window, frames, &mut waveform_buf, &mut spike_buf);
        }
        if wave_sock.config().is_connected() {
            wave_sock.write_data(&waveform_buf);
        }
        if spike_sock.config().is_connected() {
            spike_sock.write_data(&spike_buf);
        }
        fifo.free(Reader::Tcp);
    }
}
