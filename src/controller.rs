//! Orchestrator: owns the board, the FIFOs, and the five worker stages, and
//! drives the run/record/trigger/stop state machine.
//!
//! All transitions happen on the control thread. Starting a run activates
//! the waveform readers, hands the TCP data sockets to the output stage,
//! unparks every worker, and spawns a monitor thread that drains the
//! display reader and performs the ordered teardown (TCP → audio → disk →
//! processor → USB reader) once the running flag drops — whether that was a
//! stop command or a stage fault.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::api::{BusEvent, ControllerKind, Reader, FRAMES_PER_BLOCK};
use crate::block_fifo::BlockFifo;
use crate::board::{BoardDriver, StimRegister};
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::signal::{SignalKind, MANUAL_TRIGGER_BASE};
use crate::sink::RecordSink;
use crate::stages::{
    audio::spawn_audio_output, disk::spawn_disk_writer, processor::spawn_waveform_processor,
    tcp_output::spawn_tcp_output, usb::spawn_usb_reader, Stage,
};
use crate::state::{RunFlags, SystemState};
use crate::stim::{compute_schedule, StimProgrammer};
use crate::tcp::{DataOutputSocket, EndpointConfig};
use crate::usb_block::BlockLayout;
use crate::wavefifo::WaveformFifo;
use crate::xpu::XpuFilter;

/// FIFO capacities; `for_rate` is the production sizing, `compact` keeps
/// tests lean.
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub block_fifo_blocks: usize,
    pub block_slot_streams: usize,
    pub wave_buffer_blocks: usize,
    pub wave_memory_blocks: usize,
}

impl Sizing {
    pub fn for_rate(sample_rate: f64, kind: ControllerKind, streams: usize) -> Sizing {
        let blocks_per_second = sample_rate / FRAMES_PER_BLOCK as f64;
        // leave headroom for chips hot-plugged on a later rescan
        let slot_streams = (streams.max(2) * 2).min(kind.max_streams());
        Sizing {
            // 10 seconds of RAM buffering between the USB reader and the
            // processor
            block_fifo_blocks: (10.0 * blocks_per_second).ceil() as usize,
            block_slot_streams: slot_streams,
            wave_buffer_blocks: (45.0 * blocks_per_second).ceil() as usize,
            wave_memory_blocks: (30.0 * blocks_per_second).ceil() as usize,
        }
    }

    pub fn compact() -> Sizing {
        Sizing {
            block_fifo_blocks: 32,
            block_slot_streams: 2,
            wave_buffer_blocks: 48,
            wave_memory_blocks: 8,
        }
    }
}

pub struct Controller {
    state: Arc<RwLock<SystemState>>,
    flags: Arc<RunFlags>,
    bus: Arc<EventBus>,
    board: Arc<Mutex<Box<dyn BoardDriver>>>,
    xpu: Arc<Mutex<Box<dyn XpuFilter>>>,
    block_fifo: Arc<BlockFifo>,
    wave_fifo: Arc<WaveformFifo>,

    usb_reader: Arc<Stage>,
    processor: Arc<Stage>,
    disk_writer: Arc<Stage>,
    tcp_output: Arc<Stage>,
    audio: Arc<Stage>,

    notes_tx: Sender<String>,
    wave_endpoint: Arc<EndpointConfig>,
    spike_endpoint: Arc<EndpointConfig>,
    sockets: Option<(DataOutputSocket, DataOutputSocket)>,
    sockets_to_stage: Sender<(DataOutputSocket, DataOutputSocket)>,
    sockets_from_stage: Receiver<(DataOutputSocket, DataOutputSocket)>,

    listing_sink: Box<dyn RecordSink>,
    monitor: Option<JoinHandle<()>>,
    xpu_names: Vec<String>,
    xpu_index: usize,
    audio_running: bool,
}

impl Controller {
    pub fn new(
        board: Box<dyn BoardDriver>,
        xpu: Box<dyn XpuFilter>,
        record_sink: Box<dyn RecordSink>,
        listing_sink: Box<dyn RecordSink>,
        bus: Arc<EventBus>,
        sizing: Sizing,
    ) -> Result<Controller> {
        let kind = board.controller_kind();
        let sample_rate = board.sample_rate();
        let xpu_names = vec![xpu.name()];

        let mut state = SystemState::new(kind, bus.clone());
        if let crate::state::SetOutcome::Invalid { .. } =
            state.set_path("sampleratehertz", &format!("{}", sample_rate))
        {
            return Err(Error::config(format!("board reports unusable sample rate {}", sample_rate)));
        }
        let flags = state.flags();

        let slot_bytes = BlockLayout::new(kind, sizing.block_slot_streams).bytes_per_block();
        let block_fifo = Arc::new(BlockFifo::new(sizing.block_fifo_blocks, slot_bytes));
        let wave_fifo = Arc::new(WaveformFifo::with_capacity_blocks(
            sizing.wave_buffer_blocks,
            sizing.wave_memory_blocks,
        ));
        log::info!(
            "pipeline FIFOs: {} usb slots of {} bytes, {} waveform blocks",
            sizing.block_fifo_blocks,
            slot_bytes,
            sizing.wave_buffer_blocks
        );

        let state = Arc::new(RwLock::new(state));
        let board = Arc::new(Mutex::new(board));
        let xpu = Arc::new(Mutex::new(xpu));

        let wave_endpoint = EndpointConfig::new("TCPWaveformDataOutput", false);
        let spike_endpoint = EndpointConfig::new("TCPSpikeDataOutput", true);
        let sockets = Some((
            DataOutputSocket::new(wave_endpoint.clone(), bus.clone()),
            DataOutputSocket::new(spike_endpoint.clone(), bus.clone()),
        ));
        let (sockets_to_stage, stage_sockets_rx) = bounded(1);
        let (stage_sockets_tx, sockets_from_stage) = bounded(1);
        let (notes_tx, notes_rx) = bounded(64);

        let usb_reader = Arc::new(spawn_usb_reader(
            board.clone(),
            block_fifo.clone(),
            state.clone(),
            flags.clone(),
            bus.clone(),
        ));
        let processor = Arc::new(spawn_waveform_processor(
            block_fifo.clone(),
            wave_fifo.clone(),
            xpu.clone(),
            state.clone(),
            flags.clone(),
            bus.clone(),
        ));
        let disk_writer = Arc::new(spawn_disk_writer(
            wave_fifo.clone(),
            state.clone(),
            flags.clone(),
            bus.clone(),
            record_sink,
            notes_rx,
        ));
        let tcp_output =
            Arc::new(spawn_tcp_output(wave_fifo.clone(), state.clone(), stage_sockets_rx, stage_sockets_tx));
        let audio = Arc::new(spawn_audio_output(wave_fifo.clone(), state.clone(), bus.clone()));

        let mut controller = Controller {
            state,
            flags,
            bus,
            board,
            xpu,
            block_fifo,
            wave_fifo,
            usb_reader,
            processor,
            disk_writer,
            tcp_output,
            audio,
            notes_tx,
            wave_endpoint,
            spike_endpoint,
            sockets,
            sockets_to_stage,
            sockets_from_stage,
            listing_sink,
            monitor: None,
            xpu_names,
            xpu_index: 0,
            audio_running: false,
        };
        controller.rescan_ports()?;
        Ok(controller)
    }

    pub fn state(&self) -> Arc<RwLock<SystemState>> { self.state.clone() }
    pub fn flags(&self) -> Arc<RunFlags> { self.flags.clone() }
    pub fn bus(&self) -> Arc<EventBus> { self.bus.clone() }
    pub fn wave_fifo(&self) -> Arc<WaveformFifo> { self.wave_fifo.clone() }
    pub fn block_fifo(&self) -> Arc<BlockFifo> { self.block_fifo.clone() }
    pub fn wave_endpoint(&self) -> Arc<EndpointConfig> { self.wave_endpoint.clone() }
    pub fn spike_endpoint(&self) -> Arc<EndpointConfig> { self.spike_endpoint.clone() }

    /// True while any worker is inside its session body.
    pub fn any_stage_active(&self) -> bool {
        [&self.usb_reader, &self.processor, &self.disk_writer, &self.tcp_output, &self.audio]
            .iter()
            .any(|stage| stage.is_active())
    }

    pub fn controller_kind(&self) -> ControllerKind { self.state.read().controller_kind() }

    pub fn is_running(&self) -> bool { self.flags.is_running() }

    // ---- port scan ----

    /// Re-enumerate the board, rebuild the signal model and waveform lanes.
    /// Only legal while stopped.
    pub fn rescan_ports(&mut self) -> Result<()> {
        let chips = self.board.lock().find_connected_chips()?;
        {
            let mut state = self.state.write();
            state.hold_update();
            state.signals.clear_undo_stack();
            state.signals.rebuild_from_scan(&chips);
            state.signals.clear_stim_enables();
            let present = state.signals.num_amplifier_channels() > 0;
            state.set_headstage_present(present);
            state.release_update();
        }
        self.wave_fifo.update_for_rescan(&self.state.read().signals);
        self.set_manual_cable_delays()?;
        let leds: Vec<bool> = {
            let state = self.state.read();
            state.signals.ports().iter().map(|p| !p.channels().is_empty()).collect()
        };
        self.board.lock().set_spi_led_display(&leds)?;
        Ok(())
    }

    fn set_manual_cable_delays(&mut self) -> Result<()> {
        let delays: Vec<(usize, i64)> = {
            let state = self.state.read();
            state
                .signals
                .ports()
                .iter()
                .enumerate()
                .filter(|(_, port)| {
                    port.items().locate("manualcabledelayenabled").map(|i| i.as_bool()).unwrap_or(false)
                })
                .map(|(index, port)| {
                    (index, port.items().locate("manualcabledelay").unwrap().as_int())
                })
                .collect()
        };
        let mut board = self.board.lock();
        for (port, delay) in delays {
            board.set_cable_delay(port, delay as u32)?;
        }
        Ok(())
    }

    // ---- run state machine ----

    pub fn set_run_mode(&mut self, value: &str) -> std::result::Result<(), String> {
        match value.to_ascii_lowercase().as_str() {
            "run" => {
                if self.flags.is_running() {
                    return Err("Board must be stopped in order to start running".into());
                }
                self.begin_run(false, false)
            }
            "record" => {
                if self.flags.is_running() {
                    return Err("Board must be stopped in order to start recording".into());
                }
                if !self.state.read().filename("filename").map(|f| f.is_valid()).unwrap_or(false) {
                    return Err("Filename.BaseFilename and Filename.Path must both be specified \
                                before recording can occur"
                        .into());
                }
                self.begin_run(true, false)
            }
            "trigger" => {
                if self.flags.is_running() {
                    return Err("Board must be stopped in order to start trigger".into());
                }
                if !self.state.read().filename("filename").map(|f| f.is_valid()).unwrap_or(false) {
                    return Err("Filename.BaseFilename and Filename.Path must both be specified \
                                before triggered recording can occur"
                        .into());
                }
                self.begin_run(false, true)
            }
            "stop" => {
                if !self.flags.is_running() {
                    return Err("Board must be running in order to stop".into());
                }
                self.stop_run();
                Ok(())
            }
            _ => Err("Invalid value for SetRunMode command".into()),
        }
    }

    fn begin_run(&mut self, recording: bool, trigger_armed: bool) -> std::result::Result<(), String> {
        if self.flags.upload_in_progress.load(std::sync::atomic::Ordering::Acquire) {
            return Err("Error - To avoid data corruption, controller cannot start running until \
                        previously started upload function completes"
                .into());
        }
        // make sure the previous run's monitor is fully gone
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        self.collect_returned_sockets();

        let audio_enabled =
            self.state.read().globals().locate("audioenabled").unwrap().as_bool();
        self.block_fifo.reset();
        self.wave_fifo.reset();
        for reader in [Reader::Disk, Reader::Display, Reader::Tcp] {
            self.wave_fifo.set_reader_active(reader, true);
        }
        // an idle audio stage must never hold the writer back
        self.wave_fifo.set_reader_active(Reader::Audio, audio_enabled);

        {
            let mut state = self.state.write();
            state.hold_update();
            state.set_run_flags(true, recording, trigger_armed, false, false);
            state.release_update();
        }

        if let Some(pair) = self.sockets.take() {
            if self.sockets_to_stage.send(pair).is_err() {
                return Err("TCP output stage unavailable".into());
            }
        }

        self.usb_reader.start_running();
        self.processor.start_running();
        self.disk_writer.start_running();
        self.tcp_output.start_running();
        if audio_enabled {
            self.audio.start_running();
            self.audio_running = true;
        }

        let flags = self.flags.clone();
        let wave_fifo = self.wave_fifo.clone();
        let block_fifo = self.block_fifo.clone();
        let bus = self.bus.clone();
        let stages: Vec<Arc<Stage>> = vec![
            self.tcp_output.clone(),
            self.audio.clone(),
            self.disk_writer.clone(),
            self.processor.clone(),
            self.usb_reader.clone(),
        ];
        self.monitor = Some(
            std::thread::Builder::new()
                .name("run-monitor".into())
                .spawn(move || monitor_loop(flags, wave_fifo, block_fifo, bus, stages))
                .expect("couldn't spawn run monitor"),
        );
        log::info!(
            "run started (recording={}, trigger={})",
            recording,
            trigger_armed
        );
        Ok(())
    }

    /// Signal the run to end and block until every stage has parked and the
    /// FIFOs are quiesced.
    pub fn stop_run(&mut self) {
        {
            let mut state = self.state.write();
            state.hold_update();
            state.set_run_flags(false, false, false, false, false);
            state.release_update();
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        self.collect_returned_sockets();
        self.audio_running = false;
        log::info!("run stopped");
    }

    /// Called by the control loop when a `Stopped` event arrives without a
    /// stop command (stage fault). Synchronizes the state mirrors.
    pub fn on_stopped_event(&mut self) {
        if self.flags.is_running() {
            return;
        }
        let mut state = self.state.write();
        state.hold_update();
        state.set_run_flags(false, false, false, false, false);
        state.release_update();
        drop(state);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        self.collect_returned_sockets();
        self.audio_running = false;
    }

    fn collect_returned_sockets(&mut self) {
        if let Ok(pair) = self.sockets_from_stage.try_recv() {
            self.sockets = Some(pair);
        }
    }

    /// Periodic housekeeping from the control loop: service queued TCP
    /// connect/disconnect requests while the output stage is parked, and
    /// react to state changes.
    pub fn service(&mut self) {
        self.collect_returned_sockets();
        if let Some((wave, spike)) = self.sockets.as_mut() {
            wave.service();
            spike.service();
        }
        self.update_from_state();
    }

    /// Reconfigure stages whose enables live in the registry.
    pub fn update_from_state(&mut self) {
        let audio_enabled =
            self.state.read().globals().locate("audioenabled").unwrap().as_bool();
        if self.flags.is_running() {
            if audio_enabled && !self.audio_running {
                self.wave_fifo.set_reader_active(Reader::Audio, true);
                self.audio.start_running();
                self.audio_running = true;
            } else if !audio_enabled && self.audio_running {
                self.audio.stop_running();
                self.audio.wait_until_parked();
                self.wave_fifo.set_reader_active(Reader::Audio, false);
                self.audio_running = false;
            }
        }
    }

    // ---- command surface helpers ----

    pub fn live_note(&self, text: &str) -> std::result::Result<(), String> {
        if !self.flags.is_recording() {
            return Err("LiveNotes cannot be added unless the board is recording".into());
        }
        self.notes_tx
            .try_send(text.to_owned())
            .map_err(|_| "live note queue is full".to_owned())
    }

    pub fn available_xpu_list(&self) -> String {
        let mut out = String::new();
        for (index, name) in self.xpu_names.iter().enumerate() {
            out.push_str(&format!("{}:{}...", index, name));
        }
        out
    }

    pub fn used_xpu_index(&self) -> usize { self.xpu_index }

    pub fn set_used_xpu_index(&mut self, value: &str) -> std::result::Result<(), String> {
        if self.flags.is_running() {
            return Err("UsedXPUIndex cannot be set while board is running".into());
        }
        let index: usize =
            value.trim().parse().map_err(|_| "Invalid value for UsedXPUIndex command".to_owned())?;
        if index >= self.xpu_names.len() {
            return Err("Invalid value for UsedXPUIndex command".into());
        }
        self.xpu_index = index;
        self.state.write().force_update();
        Ok(())
    }

    pub fn clear_all_data_outputs(&mut self) {
        let mut state = self.state.write();
        state.signals.clear_tcp_outputs();
        state.touch();
    }

    pub fn set_all_spike_detection_thresholds(&mut self) -> Result<()> {
        let thresholds: Vec<f32> = {
            let state = self.state.read();
            let num = state.signals.num_streams() * crate::api::CHANNELS_PER_STREAM;
            let mut thresholds = vec![-70.0f32; num];
            for channel in state.signals.amplifier_channels() {
                let index = channel.stream() * crate::api::CHANNELS_PER_STREAM + channel.chip_channel();
                if let Some(item) = channel.items().locate("spikethresholdmicrovolts") {
                    thresholds[index] = item.as_int() as f32;
                }
            }
            thresholds
        };
        self.xpu.lock().set_spike_thresholds(&thresholds)
    }

    pub fn manual_stim_trigger(&mut self, key: &str, on: bool) -> Result<()> {
        let key = key.to_ascii_lowercase();
        let line = key
            .strip_prefix('f')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| (1..=8).contains(n))
            .ok_or_else(|| Error::config(format!("unknown manual trigger key '{}'", key)))?;
        self.board.lock().set_manual_stim_trigger(MANUAL_TRIGGER_BASE + line - 1, on)
    }

    pub fn manual_stim_trigger_pulse(&mut self, key: &str) -> Result<()> {
        self.manual_stim_trigger(key, true)?;
        std::thread::sleep(Duration::from_millis(1));
        self.manual_stim_trigger(key, false)
    }

    // ---- uploads (stopped only; serialized on the upload flag) ----

    fn with_upload_flag<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.state.write().set_upload_in_progress(true);
        let result = body(self);
        self.state.write().set_upload_in_progress(false);
        result
    }

    pub fn upload_stim_parameters(&mut self, channel_name: Option<&str>) -> Result<()> {
        self.with_upload_flag(|this| {
            let state = this.state.read();
            let sample_rate = state.sample_rate();
            let step = state.stim_step_size_ua();
            let mut board = this.board.lock();
            let mut programmer = StimProgrammer::new(&mut **board, sample_rate, step);
            match channel_name {
                Some(name) => {
                    let channel = state
                        .signals
                        .channel_by_name(name)
                        .ok_or_else(|| Error::config(format!("no channel named '{}'", name)))?;
                    programmer.upload_channel(channel)
                }
                None => {
                    for channel in state.signals.channels().filter(|c| c.stim_capable()) {
                        programmer.upload_channel(channel)?;
                    }
                    Ok(())
                }
            }
        })
    }

    pub fn upload_amp_settle_settings(&mut self) -> Result<()> {
        self.with_upload_flag(|this| {
            let state = this.state.read();
            let sample_rate = state.sample_rate();
            let mut board = this.board.lock();
            for channel in state.signals.channels() {
                if channel.kind() != SignalKind::Amplifier || !channel.stim_capable() {
                    continue;
                }
                let params = channel.stim_parameters().unwrap();
                let schedule = compute_schedule(&params, sample_rate, false)?;
                let stream = channel.stream();
                let chip = channel.chip_channel();
                for (reg, value) in [
                    (StimRegister::EventAmpSettleOn, schedule.amp_settle_on),
                    (StimRegister::EventAmpSettleOff, schedule.amp_settle_off),
                    (StimRegister::EventAmpSettleOnRepeat, schedule.amp_settle_on_repeat),
                    (StimRegister::EventAmpSettleOffRepeat, schedule.amp_settle_off_repeat),
                ] {
                    board.program_stim_reg(stream, chip, reg, value)?;
                }
            }
            Ok(())
        })
    }

    pub fn upload_charge_recovery_settings(&mut self) -> Result<()> {
        self.with_upload_flag(|this| {
            let state = this.state.read();
            let sample_rate = state.sample_rate();
            let mut board = this.board.lock();
            for channel in state.signals.channels() {
                if channel.kind() != SignalKind::Amplifier || !channel.stim_capable() {
                    continue;
                }
                let params = channel.stim_parameters().unwrap();
                let schedule = compute_schedule(&params, sample_rate, false)?;
                let stream = channel.stream();
                let chip = channel.chip_channel();
                for (reg, value) in [
                    (StimRegister::EventChargeRecovOn, schedule.charge_recov_on),
                    (StimRegister::EventChargeRecovOff, schedule.charge_recov_off),
                ] {
                    board.program_stim_reg(stream, chip, reg, value)?;
                }
            }
            Ok(())
        })
    }

    pub fn upload_bandwidth_settings(&mut self) -> Result<()> {
        self.with_upload_flag(|this| {
            let (lower, upper) = {
                let state = this.state.read();
                (
                    state.globals().locate("desiredlowerbandwidthhertz").unwrap().as_double(),
                    state.globals().locate("desiredupperbandwidthhertz").unwrap().as_double(),
                )
            };
            this.board.lock().upload_bandwidth_settings(lower, upper)
        })
    }

    // ---- impedance ----

    pub fn measure_impedances(&mut self) -> Result<usize> {
        let targets: Vec<(String, usize, usize)> = {
            let state = self.state.read();
            state
                .signals
                .amplifier_channels()
                .filter(|c| c.is_enabled())
                .map(|c| (c.native_name().to_owned(), c.stream(), c.chip_channel()))
                .collect()
        };
        let mut measured = Vec::with_capacity(targets.len());
        {
            let mut board = self.board.lock();
            for (name, stream, chip) in targets {
                let (magnitude, phase) = board.measure_impedance(stream, chip)?;
                measured.push((name, magnitude, phase));
            }
        }
        let count = measured.len();
        let mut state = self.state.write();
        state.hold_update();
        for (name, magnitude, phase) in measured {
            if let Some(channel) = state.signals.channel_by_name_mut(&name) {
                channel.impedance = Some((magnitude, phase));
            }
        }
        state.touch();
        state.release_update();
        log::info!("measured impedance on {} channels", count);
        Ok(count)
    }

    pub fn save_impedances(&mut self) -> Result<()> {
        let (valid, full_path) = {
            let state = self.state.read();
            let item = state.filename("impedancefilename").unwrap();
            (item.is_valid(), item.full_path())
        };
        if !valid {
            return Err(Error::config(
                "ImpedanceFilename.BaseFilename and ImpedanceFilename.Path must both be \
                 specified before impedances can be saved",
            ));
        }
        let mut text = String::from("Channel,Magnitude(ohms),Phase(degrees)\n");
        {
            let state = self.state.read();
            for channel in state.signals.amplifier_channels() {
                if let Some((magnitude, phase)) = channel.impedance {
                    text.push_str(&format!(
                        "{},{:.0},{:.1}\n",
                        channel.native_name(),
                        magnitude,
                        phase
                    ));
                }
            }
        }
        self.listing_sink.write_listing(&full_path, &text)
    }

    /// Final teardown: stop any active run and end the worker threads.
    pub fn shutdown(&mut self) {
        if self.flags.is_running() {
            self.stop_run();
        }
        // stages close via Drop in reverse declaration order
    }
}

fn monitor_loop(
    flags: Arc<RunFlags>,
    wave_fifo: Arc<WaveformFifo>,
    block_fifo: Arc<BlockFifo>,
    bus: Arc<EventBus>,
    stages: Vec<Arc<Stage>>,
) {
    const DISPLAY_CHUNK: usize = 4 * FRAMES_PER_BLOCK;
    while flags.is_running() {
        // the display reader has no GUI attached here; keep its cursor
        // moving so it never becomes the slowest reader
        if wave_fifo.request_read(Reader::Display, DISPLAY_CHUNK).is_some() {
            wave_fifo.free(Reader::Display);
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    log::info!("run ending, stopping stages");
    for stage in &stages {
        stage.stop_running();
        stage.wait_until_parked();
        log::debug!("{} parked", stage.name());
    }
    wave_fifo.pause();
    block_fifo.reset();
    debug_assert!(block_fifo.is_empty());
    bus.publish(BusEvent::CpuLoadReport(0.0));
    bus.publish(BusEvent::Stopped);
}
