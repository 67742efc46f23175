//! Waveform processor stage: block FIFO → filter → waveform FIFO.
//!
//! Decodes each USB block into per-channel samples, runs the XPU filter to
//! produce the band lanes and spike ids, converts auxiliary lanes to
//! physical units, and commits everything to the waveform FIFO in one
//! logical advance so readers always observe a consistent sample suffix.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::api::{
    BusEvent, ControllerKind, Band, ADC_USB2_VOLTS_PER_BIT, ADC_VOLTS_PER_BIT, AUX_PER_STREAM,
    AUX_VOLTS_PER_BIT, CHANNELS_PER_STREAM, DC_AMP_OFFSET, DC_AMP_VOLTS_PER_BIT, FRAMES_PER_BLOCK,
    NUM_BOARD_ADCS, NUM_BOARD_DACS, VDD_VOLTS_PER_BIT,
};
use crate::block_fifo::BlockFifo;
use crate::bus::EventBus;
use crate::signal::SignalKind;
use crate::stages::{spawn_stage, Stage, StageControl};
use crate::state::{RunFlags, SystemState};
use crate::usb_block::{BlockLayout, BlockView};
use crate::wavefifo::WaveformFifo;
use crate::xpu::{AmpBlock, FilterOutput, XpuFilter};

const MAX_CONSECUTIVE_FILTER_FAILURES: u32 = 3;
const CPU_LOAD_HISTORY: usize = 20;
const CPU_LOAD_REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Resolved lane handles for one amplifier channel.
struct AmpLanes {
    stream: usize,
    channel: usize,
    wide: usize,
    low: usize,
    high: usize,
    spike: usize,
    dc: Option<usize>,
    stim: Option<usize>,
}

struct LanePlan {
    kind: ControllerKind,
    num_streams: usize,
    amps: Vec<AmpLanes>,
    /// (stream, slot) -> analog lane
    aux: Vec<(usize, usize, usize)>,
    /// stream -> analog lane
    vdd: Vec<(usize, usize)>,
    adc: Vec<Option<usize>>,
    dac: Vec<Option<usize>>,
    digital_in: usize,
    digital_out: usize,
}

fn build_plan(state: &SystemState, fifo: &WaveformFifo) -> Option<LanePlan> {
    let lanes = fifo.lanes();
    let model = &state.signals;
    let kind = model.controller_kind();
    let mut plan = LanePlan {
        kind,
        num_streams: model.num_streams(),
        amps: Vec::new(),
        aux: Vec::new(),
        vdd: Vec::new(),
        adc: vec![None; NUM_BOARD_ADCS],
        dac: vec![None; NUM_BOARD_DACS],
        digital_in: lanes.digital_index("DIGITAL-IN-WORD")?,
        digital_out: lanes.digital_index("DIGITAL-OUT-WORD")?,
    };
    for channel in model.channels() {
        let name = channel.native_name();
        match channel.kind() {
            SignalKind::Amplifier => {
                let stream = channel.stream();
                let chip = channel.chip_channel();
                plan.amps.push(AmpLanes {
                    stream,
                    channel: chip,
                    wide: lanes.amp_address(stream, chip, Band::Wide)?,
                    low: lanes.amp_address(stream, chip, Band::Low)?,
                    high: lanes.amp_address(stream, chip, Band::High)?,
                    spike: lanes.digital_index(&format!("{}|SPK", name))?,
                    dc: lanes.analog_index(&format!("{}|DC", name)),
                    stim: lanes.digital_index(&format!("{}|STIM", name)),
                });
            }
            SignalKind::AuxInput => {
                plan.aux.push((channel.stream(), channel.chip_channel(), lanes.analog_index(name)?));
            }
            SignalKind::SupplyVoltage => {
                plan.vdd.push((channel.stream(), lanes.analog_index(name)?));
            }
            SignalKind::BoardAdc => {
                plan.adc[channel.native_channel_number()] = lanes.analog_index(name);
            }
            SignalKind::BoardDac => {
                plan.dac[channel.native_channel_number()] = lanes.analog_index(name);
            }
            _ => {}
        }
    }
    Some(plan)
}

pub fn spawn_waveform_processor(
    block_fifo: Arc<BlockFifo>,
    wave_fifo: Arc<WaveformFifo>,
    xpu: Arc<Mutex<Box<dyn XpuFilter>>>,
    state: Arc<RwLock<SystemState>>,
    flags: Arc<RunFlags>,
    bus: Arc<EventBus>,
) -> Stage {
    spawn_stage("waveform-processor", move |control| {
        session(control, &block_fifo, &wave_fifo, &xpu, &state, &flags, &bus);
    })
}

fn session(
    control: &StageControl,
    block_fifo: &BlockFifo,
    wave_fifo: &WaveformFifo,
    xpu: &Mutex<Box<dyn XpuFilter>>,
    state: &RwLock<SystemState>,
    flags: &RunFlags,
    bus: &EventBus,
) {
    let (sample_rate, plan) = {
        let state = state.read();
        let plan = match build_plan(&state, wave_fifo) {
            Some(plan) => plan,
            None => {
                log::error!("waveform-processor: lane plan incomplete, was rescan run?");
                bus.publish(BusEvent::StageError("waveform lanes missing".into()));
                flags.running.store(false, std::sync::atomic::Ordering::Release);
                return;
            }
        };
        (state.sample_rate(), plan)
    };

    if let Err(err) = xpu.lock().configure(sample_rate, plan.num_streams) {
        bus.publish(BusEvent::StageError(format!("filter configuration failed: {}", err)));
        flags.running.store(false, std::sync::atomic::Ordering::Release);
        return;
    }

    let layout = BlockLayout::new(plan.kind, plan.num_streams);
    let mut raw_block: Vec<u8> = Vec::with_capacity(layout.bytes_per_block());
    let mut amp_in = AmpBlock::new(plan.num_streams, FRAMES_PER_BLOCK);
    let mut bands = FilterOutput::new(plan.num_streams, FRAMES_PER_BLOCK);
    let mut filter_failures = 0u32;
    let mut last_timestamp: Option<u32> = None;

    let mut cpu_history = [0.0f64; CPU_LOAD_HISTORY];
    let mut work_nanos = 0u128;
    let mut loop_start = Instant::now();
    let mut last_report = Instant::now();

    while control.keep_going() {
        if !block_fifo.try_pop_into(&mut raw_block) {
            std::thread::sleep(Duration::from_micros(500));
            continue;
        }
        let work_start = Instant::now();

        let view = match BlockView::new(layout, &raw_block) {
            Some(view) => view,
            None => {
                log::error!("waveform-processor: bad block magic, USB stream desynced");
                bus.publish(BusEvent::StageError("USB data stream lost alignment".into()));
                flags.running.store(false, std::sync::atomic::Ordering::Release);
                break;
            }
        };

        for stream in 0..plan.num_streams {
            for channel in 0..CHANNELS_PER_STREAM {
                for frame in 0..FRAMES_PER_BLOCK {
                    amp_in.set(stream, channel, frame, view.amp(frame, stream, channel));
                }
            }
        }

        match xpu.lock().process_block(&amp_in, &mut bands) {
            Ok(()) => filter_failures = 0,
            Err(err) => {
                filter_failures += 1;
                log::error!(
                    "waveform-processor: filter failed ({} consecutive): {}",
                    filter_failures,
                    err
                );
                if filter_failures >= MAX_CONSECUTIVE_FILTER_FAILURES {
                    bus.publish(BusEvent::StageError(format!(
                        "filter failed {} blocks in a row: {}",
                        filter_failures, err
                    )));
                    flags.running.store(false, std::sync::atomic::Ordering::Release);
                    break;
                }
                // carry the previous block's output forward and keep going
            }
        }

        while !wave_fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_millis(10)) {
            if !control.keep_going() {
                return;
            }
            bus.publish(BusEvent::BackpressureWarning {
                hardware: false,
                percent_full: wave_fifo.percent_full(),
            });
        }

        {
            let lanes = wave_fifo.lanes();
            let base = wave_fifo.write_pos();
            let mut pos = base;
            for frame in 0..FRAMES_PER_BLOCK {
                let timestamp = view.timestamp(frame);
                if let Some(last) = last_timestamp {
                    if timestamp != last.wrapping_add(1) {
                        log::warn!("timestamp discontinuity: {} -> {}", last, timestamp);
                    }
                }
                last_timestamp = Some(timestamp);
                lanes.put_timestamp(pos, timestamp);

                for amp in &plan.amps {
                    let idx = bands.index(amp.stream, amp.channel, frame);
                    lanes.put_amp(amp.wide, pos, bands.wide[idx]);
                    lanes.put_amp(amp.low, pos, bands.low[idx]);
                    lanes.put_amp(amp.high, pos, bands.high[idx]);
                    lanes.put_digital(amp.spike, pos, bands.spike_ids[idx] as u16);
                    if let Some(dc) = amp.dc {
                        let raw = view.dc_amp(frame, amp.stream, amp.channel);
                        lanes.put_analog(
                            dc,
                            pos,
                            DC_AMP_VOLTS_PER_BIT * (raw as f32 - DC_AMP_OFFSET),
                        );
                    }
                    if let Some(stim) = amp.stim {
                        lanes.put_digital(stim, pos, view.stim_word(frame, amp.stream, amp.channel));
                    }
                }

                if frame % 4 == 0 {
                    for &(stream, slot, lane) in &plan.aux {
                        debug_assert!(slot < AUX_PER_STREAM);
                        let raw = view.aux(frame, stream, slot);
                        lanes.put_analog(lane, pos, AUX_VOLTS_PER_BIT * raw as f32);
                    }
                }
                if frame == 0 {
                    for &(stream, lane) in &plan.vdd {
                        let raw = view.supply_voltage(frame, stream);
                        lanes.put_analog(lane, pos, VDD_VOLTS_PER_BIT * raw as f32);
                    }
                }
                for (adc, lane) in plan.adc.iter().enumerate() {
                    if let Some(lane) = *lane {
                        let raw = view.adc(frame, adc);
                        let volts = if plan.kind == ControllerKind::RecordUsb2 {
                            ADC_USB2_VOLTS_PER_BIT * raw as f32
                        } else {
                            ADC_VOLTS_PER_BIT * (raw as f32 - 32768.0)
                        };
                        lanes.put_analog(lane, pos, volts);
                    }
                }
                if plan.kind.has_dc_amplifiers() {
                    for (dac, lane) in plan.dac.iter().enumerate() {
                        if let Some(lane) = *lane {
                            let raw = view.dac(frame, dac);
                            lanes.put_analog(lane, pos, ADC_VOLTS_PER_BIT * (raw as f32 - 32768.0));
                        }
                    }
                }
                lanes.put_digital(plan.digital_in, pos, view.digital_in(frame));
                lanes.put_digital(plan.digital_out, pos, view.digital_out(frame));

                pos = lanes.advance(pos, 1);
            }
        }
        wave_fifo.commit(FRAMES_PER_BLOCK);

        work_nanos += work_start.elapsed().as_nanos();
        if last_report.elapsed() >= CPU_LOAD_REPORT_INTERVAL {
            let loop_nanos = loop_start.elapsed().as_nanos().max(1);
            let usage = 100.0 * work_nanos as f64 / loop_nanos as f64;
            cpu_history.rotate_left(1);
            cpu_history[CPU_LOAD_HISTORY - 1] = usage;
            let average = cpu_history.iter().sum::<f64>() / CPU_LOAD_HISTORY as f64;
            bus.publish(BusEvent::CpuLoadReport(average));
            work_nanos = 0;
            loop_start = Instant::now();
            last_report = Instant::now();
        }
    }
}
