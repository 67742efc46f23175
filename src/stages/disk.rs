//! Disk writer stage: waveform FIFO → record sink.
//!
//! Three session modes, chosen from the run flags when the stage wakes:
//! plain recording (segment opens immediately), triggered recording (armed
//! until the configured digital/analog trigger edge, with a pre-trigger
//! history flush), and a drain mode that keeps the disk cursor moving when
//! nothing is being saved.
//!
//! `WriteToDiskLatency` picks the flush granularity: fewer blocks per flush
//! costs more sink calls but shortens the window between acquisition and
//! bytes on disk.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::RwLock;

use crate::api::{BusEvent, Reader, FRAMES_PER_BLOCK};
use crate::bus::EventBus;
use crate::signal::SignalKind;
use crate::sink::{RecordSink, SegmentHeader};
use crate::stages::{spawn_stage, Stage, StageControl};
use crate::state::{RunFlags, SystemState};
use crate::wavefifo::{LaneStore, ReadWindow, WaveformFifo};

/// Flush granularity in data blocks per latency setting, Highest..Lowest.
const LATENCY_BLOCKS: [usize; 5] = [1, 4, 16, 64, 256];

enum LaneRef {
    AmpU16 { label: String, lane: usize },
    DigitalU16 { label: String, lane: usize },
    AnalogF32 { label: String, lane: usize },
}

enum TriggerLane {
    Digital { lane: usize, mask: u16 },
    Analog { lane: usize, threshold: f32 },
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Drain,
    Recording,
    Armed,
    Triggered,
}

struct SessionPlan {
    flush_samples: usize,
    lanes: Vec<LaneRef>,
    trigger: Option<TriggerLane>,
    rising: bool,
    pre_samples: usize,
    post_samples: usize,
    header: SegmentHeader,
}

fn build_plan(state: &SystemState, fifo: &WaveformFifo) -> SessionPlan {
    let lanes = fifo.lanes();
    let globals = state.globals();
    let latency = globals.locate("writetodisklatency").unwrap().enum_index();
    let sample_rate = state.sample_rate();
    let pre_seconds = globals.locate("pretriggerbufferseconds").unwrap().as_int() as f64;
    let post_seconds = globals.locate("posttriggerbufferseconds").unwrap().as_int() as f64;

    let mut refs = Vec::new();
    let mut saved_names = Vec::new();
    for channel in state.signals.channels() {
        if !channel.is_enabled() || !channel.output_to_disk() {
            continue;
        }
        let name = channel.native_name();
        match channel.kind() {
            SignalKind::Amplifier => {
                if let Some(lane) = lanes.amp_index(&format!("{}|WIDE", name)) {
                    refs.push(LaneRef::AmpU16 { label: format!("{}|WIDE", name), lane });
                    saved_names.push(name.to_owned());
                }
                if let Some(lane) = lanes.digital_index(&format!("{}|SPK", name)) {
                    refs.push(LaneRef::DigitalU16 { label: format!("{}|SPK", name), lane });
                }
                if let Some(lane) = lanes.analog_index(&format!("{}|DC", name)) {
                    refs.push(LaneRef::AnalogF32 { label: format!("{}|DC", name), lane });
                }
            }
            SignalKind::AuxInput
            | SignalKind::SupplyVoltage
            | SignalKind::BoardAdc
            | SignalKind::BoardDac => {
                if let Some(lane) = lanes.analog_index(name) {
                    refs.push(LaneRef::AnalogF32 { label: name.to_owned(), lane });
                    saved_names.push(name.to_owned());
                }
            }
            // individual lines ride along in the shared words below
            SignalKind::BoardDigitalIn | SignalKind::BoardDigitalOut => {}
        }
    }
    for word in ["DIGITAL-IN-WORD", "DIGITAL-OUT-WORD"] {
        if let Some(lane) = lanes.digital_index(word) {
            refs.push(LaneRef::DigitalU16 { label: word.to_owned(), lane });
        }
    }

    let source_item = globals.locate("triggersource").unwrap();
    let source_index = source_item.enum_index();
    let trigger = if source_index < 16 {
        lanes
            .digital_index("DIGITAL-IN-WORD")
            .map(|lane| TriggerLane::Digital { lane, mask: 1u16 << source_index })
    } else {
        let threshold = globals.locate("triggeranalogvoltagethreshold").unwrap().as_double() as f32;
        lanes
            .analog_index(&format!("ANALOG-IN-{}", source_index - 16 + 1))
            .map(|lane| TriggerLane::Analog { lane, threshold })
    };

    // a flush larger than the writer's headroom could never be granted
    let max_flush_blocks = (fifo.live_len() / FRAMES_PER_BLOCK / 2).max(1);
    SessionPlan {
        flush_samples: LATENCY_BLOCKS[latency].min(max_flush_blocks) * FRAMES_PER_BLOCK,
        lanes: refs,
        trigger,
        rising: globals.locate("triggerpolarity").unwrap().enum_index() == 0,
        pre_samples: (pre_seconds * sample_rate) as usize,
        post_samples: (post_seconds * sample_rate) as usize,
        header: SegmentHeader {
            sample_rate,
            controller: state.controller_kind(),
            lower_bandwidth_hz: globals.locate("desiredlowerbandwidthhertz").unwrap().as_double(),
            upper_bandwidth_hz: globals.locate("desiredupperbandwidthhertz").unwrap().as_double(),
            expander_present: false,
            channels: saved_names,
            first_timestamp: 0,
        },
    }
}

pub fn spawn_disk_writer(
    fifo: Arc<WaveformFifo>,
    state: Arc<RwLock<SystemState>>,
    flags: Arc<RunFlags>,
    bus: Arc<EventBus>,
    mut sink: Box<dyn RecordSink>,
    notes: Receiver<String>,
) -> Stage {
    spawn_stage("disk-writer", move |control| {
        session(control, &fifo, &state, &flags, &bus, sink.as_mut(), &notes);
    })
}

fn write_range(
    sink: &mut dyn RecordSink,
    lanes: &LaneStore,
    plan: &SessionPlan,
    window: ReadWindow,
    from: isize,
    to: isize,
    bus: &EventBus,
) -> Option<u32> {
    if from >= to {
        return None;
    }
    let mut timestamps = Vec::with_capacity((to - from) as usize);
    for i in from..to {
        timestamps.push(lanes.timestamp(window, i));
    }
    let last = *timestamps.last().unwrap();
    let mut failed = None;
    if let Err(err) = sink.append_timestamps(&timestamps) {
        failed = Some(err);
    }
    let mut scratch_u16: Vec<u16> = Vec::new();
    let mut scratch_f32: Vec<f32> = Vec::new();
    for lane_ref in &plan.lanes {
        if failed.is_some() {
            break;
        }
        let result = match lane_ref {
            LaneRef::AmpU16 { label, lane } => {
                scratch_u16.clear();
                for i in from..to {
                    scratch_u16.push(lanes.amp(*lane, window, i));
                }
                sink.append_u16(label, &scratch_u16)
            }
            LaneRef::DigitalU16 { label, lane } => {
                scratch_u16.clear();
                for i in from..to {
                    scratch_u16.push(lanes.digital(*lane, window, i));
                }
                sink.append_u16(label, &scratch_u16)
            }
            LaneRef::AnalogF32 { label, lane } => {
                scratch_f32.clear();
                for i in from..to {
                    scratch_f32.push(lanes.analog(*lane, window, i));
                }
                sink.append_f32(label, &scratch_f32)
            }
        };
        if let Err(err) = result {
            failed = Some(err);
        }
    }
    if let Some(err) = failed {
        // the run keeps going; whoever is listening decides what to do
        log::error!("disk-writer: sink write failed: {}", err);
        bus.publish(BusEvent::StageError(format!("disk write failed: {}", err)));
    }
    Some(last)
}

fn trigger_level(lanes: &LaneStore, trigger: &TriggerLane, window: ReadWindow, i: isize) -> bool {
    match trigger {
        TriggerLane::Digital { lane, mask } => lanes.digital(*lane, window, i) & mask != 0,
        TriggerLane::Analog { lane, threshold } => {
            lanes.analog_as_digital(*lane, window, i, *threshold) != 0
        }
    }
}

fn session(
    control: &StageControl,
    fifo: &WaveformFifo,
    state: &RwLock<SystemState>,
    flags: &RunFlags,
    bus: &EventBus,
    sink: &mut dyn RecordSink,
    notes: &Receiver<String>,
) {
    let plan = build_plan(&state.read(), fifo);
    let mut mode = if flags.is_recording() {
        Mode::Recording
    } else if flags.trigger_set.load(std::sync::atomic::Ordering::Acquire) {
        Mode::Armed
    } else {
        Mode::Drain
    };

    let mut segment_open = false;
    let mut prev_level: Option<bool> = None;
    let mut last_timestamp = 0u32;
    // samples still owed to the segment after the trigger released
    let mut post_remaining: Option<usize> = None;

    if mode == Mode::Recording {
        if sink.begin_segment(&plan.header).is_ok() {
            segment_open = true;
        } else {
            bus.publish(BusEvent::StageError("could not open recording segment".into()));
        }
    }

    while control.keep_going() {
        match fifo.request_read(Reader::Disk, plan.flush_samples) {
            Some(window) => {
                handle_window(
                    fifo,
                    sink,
                    bus,
                    flags,
                    &plan,
                    window,
                    &mut mode,
                    &mut segment_open,
                    &mut prev_level,
                    &mut last_timestamp,
                    &mut post_remaining,
                );
                drain_notes(sink, bus, notes, segment_open, last_timestamp);
                fifo.free(Reader::Disk);
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    // final flush: whatever was committed before the stop request still
    // belongs to the segment; the backlog is bounded because the writer is
    // being stopped right behind us
    let mut final_windows = 0;
    while final_windows < 64 {
        match fifo.request_read(Reader::Disk, plan.flush_samples) {
            Some(window) => {
                handle_window(
                    fifo,
                    sink,
                    bus,
                    flags,
                    &plan,
                    window,
                    &mut mode,
                    &mut segment_open,
                    &mut prev_level,
                    &mut last_timestamp,
                    &mut post_remaining,
                );
                fifo.free(Reader::Disk);
                final_windows += 1;
            }
            None => break,
        }
    }

    if segment_open {
        sink.end_segment().ok();
    }
    flags.triggered.store(false, std::sync::atomic::Ordering::Release);
}

fn handle_window(
    fifo: &WaveformFifo,
    sink: &mut dyn RecordSink,
    bus: &EventBus,
    flags: &RunFlags,
    plan: &SessionPlan,
    window: ReadWindow,
    mode: &mut Mode,
    segment_open: &mut bool,
    prev_level: &mut Option<bool>,
    last_timestamp: &mut u32,
    post_remaining: &mut Option<usize>,
) {
    let lanes = fifo.lanes();
    let len = window.len as isize;

    match *mode {
        Mode::Drain => {}
        Mode::Recording => {
            if *segment_open {
                if let Some(ts) = write_range(sink, &lanes, plan, window, 0, len, bus) {
                    *last_timestamp = ts;
                }
            }
        }
        Mode::Armed => {
            let mut found = None;
            if let Some(trigger) = plan.trigger.as_ref() {
                for i in 0..len {
                    let level = trigger_level(&lanes, trigger, window, i);
                    let prev = prev_level.unwrap_or(level);
                    let edge = if plan.rising { !prev && level } else { prev && !level };
                    *prev_level = Some(level);
                    if edge {
                        found = Some(i);
                        break;
                    }
                }
            }
            if let Some(at) = found {
                let trigger_timestamp = lanes.timestamp(window, at);
                log::info!("trigger found at timestamp {}", trigger_timestamp);
                flags.triggered.store(true, std::sync::atomic::Ordering::Release);
                if sink.begin_segment(&plan.header).is_ok() {
                    *segment_open = true;
                    let history = fifo.words_in_memory(Reader::Disk) as isize;
                    let start = (at - plan.pre_samples as isize).max(-history);
                    if let Some(ts) = write_range(sink, &lanes, plan, window, start, len, bus) {
                        *last_timestamp = ts;
                    }
                    *post_remaining = None;
                    *mode = Mode::Triggered;
                } else {
                    bus.publish(BusEvent::StageError("could not open triggered segment".into()));
                }
            }
        }
        Mode::Triggered => {
            if let Some(ts) = write_range(sink, &lanes, plan, window, 0, len, bus) {
                *last_timestamp = ts;
            }
            if post_remaining.is_none() {
                // watch for the trigger releasing
                if let Some(trigger) = plan.trigger.as_ref() {
                    for i in 0..len {
                        let level = trigger_level(&lanes, trigger, window, i);
                        let prev = prev_level.unwrap_or(level);
                        let released = if plan.rising { prev && !level } else { !prev && level };
                        *prev_level = Some(level);
                        if released {
                            let tail = (len - i) as usize;
                            *post_remaining = Some(plan.post_samples.saturating_sub(tail));
                            break;
                        }
                    }
                }
            }
            if let Some(remaining) = *post_remaining {
                if remaining == 0 {
                    log::info!("post-trigger buffer complete, re-arming");
                    sink.end_segment().ok();
                    *segment_open = false;
                    *post_remaining = None;
                    flags.triggered.store(false, std::sync::atomic::Ordering::Release);
                    *mode = Mode::Armed;
                } else {
                    *post_remaining = Some(remaining.saturating_sub(window.len));
                }
            }
        }
    }
}

fn drain_notes(
    sink: &mut dyn RecordSink,
    bus: &EventBus,
    notes: &Receiver<String>,
    segment_open: bool,
    last_timestamp: u32,
) {
    while let Ok(text) = notes.try_recv() {
        if segment_open {
            if sink.insert_live_note(&text, last_timestamp).is_ok() {
                bus.publish(BusEvent::LiveNote { text, timestamp: last_timestamp });
            }
        }
    }
}
