//! Board driver capability.
//!
//! The streaming core never talks USB registers directly; it consumes this
//! trait. The real driver (bitfile upload, endpoint I/O, register maps)
//! lives outside this crate. `SyntheticBoard` is the in-tree implementation:
//! deterministic sine-plus-noise signal generation, wall-clock pacing, and a
//! register write log, which is what the tests and `--synthetic` mode run
//! against.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::api::{ControllerKind, FRAMES_PER_BLOCK, NUM_BOARD_ADCS};
use crate::error::{Error, Result};
use crate::signal::{StimShape, StreamInfo};
use crate::usb_block::{BlockBuilder, BlockLayout};

/// Stim event registers, one sequencer per (stream, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimRegister {
    EventAmpSettleOn,
    EventStartStim,
    EventStimPhase2,
    EventStimPhase3,
    EventEndStim,
    EventRepeatStim,
    EventAmpSettleOff,
    EventChargeRecovOn,
    EventChargeRecovOff,
    EventAmpSettleOnRepeat,
    EventAmpSettleOffRepeat,
    EventEnd,
    DacBaseline,
    DacPositive,
    DacNegative,
}

/// One entry in the synthetic board's register log; tests assert on these.
#[derive(Debug, Clone, PartialEq)]
pub enum StimWrite {
    Trigger { stream: usize, channel: usize, source: usize, enabled: bool, edge: bool, low: bool },
    Pulses { stream: usize, channel: usize, num_pulses: u32, shape: StimShape, neg_first: bool },
    Register { stream: usize, channel: usize, reg: StimRegister, value: u16 },
    Magnitudes { stream: usize, channel: usize, positive: u8, negative: u8 },
}

pub trait BoardDriver: Send {
    fn controller_kind(&self) -> ControllerKind;
    fn sample_rate(&self) -> f64;
    fn set_sample_rate(&mut self, rate: f64) -> Result<()>;

    /// Scan ports for headstage chips; the result drives the signal model.
    fn find_connected_chips(&mut self) -> Result<Vec<StreamInfo>>;
    fn num_enabled_streams(&self) -> usize;

    fn start_streaming(&mut self) -> Result<()>;
    fn stop_streaming(&mut self) -> Result<()>;

    /// Append up to `max_blocks` whole data blocks to `out`; returns how
    /// many were delivered. Zero is normal when the board has nothing yet.
    fn read_blocks(&mut self, max_blocks: usize, out: &mut Vec<u8>) -> Result<usize>;

    /// Fill level of the board's on-device FIFO, 0..=100.
    fn hardware_fifo_percent(&self) -> f64;

    fn set_cable_delay(&mut self, port: usize, delay: u32) -> Result<()>;
    fn set_spi_led_display(&mut self, leds: &[bool]) -> Result<()>;
    fn upload_bandwidth_settings(&mut self, lower_hz: f64, upper_hz: f64) -> Result<()>;

    // stimulation sequencer (stim controllers only)
    fn configure_stim_trigger(
        &mut self,
        stream: usize,
        channel: usize,
        source: usize,
        enabled: bool,
        edge: bool,
        low: bool,
    ) -> Result<()>;
    fn configure_stim_pulses(
        &mut self,
        stream: usize,
        channel: usize,
        num_pulses: u32,
        shape: StimShape,
        neg_first: bool,
    ) -> Result<()>;
    fn program_stim_reg(
        &mut self,
        stream: usize,
        channel: usize,
        reg: StimRegister,
        value: u16,
    ) -> Result<()>;
    fn set_stim_magnitudes(
        &mut self,
        stream: usize,
        channel: usize,
        positive: u8,
        negative: u8,
    ) -> Result<()>;
    fn enable_aux_commands_on_stream(&mut self, stream: usize) -> Result<()>;
    fn enable_aux_commands_on_all(&mut self) -> Result<()>;
    fn set_manual_stim_trigger(&mut self, trigger: usize, on: bool) -> Result<()>;

    /// Measure one amplifier channel's electrode impedance (magnitude in
    /// ohms, phase in degrees). Only legal while stopped.
    fn measure_impedance(&mut self, stream: usize, channel: usize) -> Result<(f64, f64)>;
}

/// Scheduled value for the synthetic digital input word, used to exercise
/// triggered recording.
#[derive(Debug, Clone, Copy)]
pub struct DigitalInPlan {
    pub from_timestamp: u32,
    pub word: u16,
}

pub struct SyntheticBoard {
    kind: ControllerKind,
    sample_rate: f64,
    chips: Vec<StreamInfo>,
    streaming: bool,
    /// Wall-clock pacing; off means blocks are produced on demand.
    paced: bool,
    /// On-demand mode: stop producing after this many blocks.
    block_limit: Option<u64>,
    started_at: Option<Instant>,
    blocks_emitted: u64,
    next_timestamp: u32,
    digital_in_plan: Vec<DigitalInPlan>,
    rng: StdRng,
    stim_log: Arc<Mutex<Vec<StimWrite>>>,
}

impl SyntheticBoard {
    pub fn new(kind: ControllerKind, chips: Vec<StreamInfo>, sample_rate: f64) -> SyntheticBoard {
        SyntheticBoard {
            kind,
            sample_rate,
            chips,
            streaming: false,
            paced: true,
            block_limit: None,
            started_at: None,
            blocks_emitted: 0,
            next_timestamp: 0,
            digital_in_plan: Vec::new(),
            rng: StdRng::seed_from_u64(0x6e65_7572_6163_7131),
            stim_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// On-demand production for tests: `read_blocks` always has data until
    /// `limit` blocks have been emitted.
    pub fn unpaced(mut self, limit: Option<u64>) -> SyntheticBoard {
        self.paced = false;
        self.block_limit = limit;
        self
    }

    pub fn with_digital_in_plan(mut self, plan: Vec<DigitalInPlan>) -> SyntheticBoard {
        self.digital_in_plan = plan;
        self
    }

    /// Shared handle to the stim register log for test assertions.
    pub fn stim_log(&self) -> Arc<Mutex<Vec<StimWrite>>> { self.stim_log.clone() }

    fn layout(&self) -> BlockLayout { BlockLayout::new(self.kind, self.chips.len()) }

    fn digital_in_word(&self, timestamp: u32) -> u16 {
        let mut word = 0u16;
        for plan in &self.digital_in_plan {
            if timestamp >= plan.from_timestamp {
                word = plan.word;
            }
        }
        word
    }

    fn blocks_due(&self) -> u64 {
        if !self.paced {
            return match self.block_limit {
                Some(limit) => limit.saturating_sub(self.blocks_emitted),
                None => u64::MAX,
            };
        }
        let started = match self.started_at {
            Some(t) => t,
            None => return 0,
        };
        let samples = started.elapsed().as_secs_f64() * self.sample_rate;
        (samples as u64 / FRAMES_PER_BLOCK as u64).saturating_sub(self.blocks_emitted)
    }

    fn synthesize_block(&mut self) -> Vec<u8> {
        let layout = self.layout();
        let mut builder = BlockBuilder::new(layout);
        let num_streams = self.chips.len();
        let stim = self.kind.has_dc_amplifiers();
        for frame in 0..FRAMES_PER_BLOCK {
            let t = self.next_timestamp.wrapping_add(frame as u32);
            let seconds = t as f64 / self.sample_rate;
            builder.set_timestamp(frame, t);
            for stream in 0..num_streams {
                for channel in 0..crate::api::CHANNELS_PER_STREAM {
                    // a few hundred microvolts of sine per channel plus noise
                    let freq = 20.0 + 5.0 * (stream * 32 + channel) as f64;
                    let micro_volts = 200.0 * (2.0 * std::f64::consts::PI * freq * seconds).sin()
                        + self.rng.gen_range(-15.0..15.0);
                    let raw = (micro_volts / crate::api::AMP_MICROVOLTS_PER_BIT as f64 + 32768.0)
                        .clamp(0.0, 65535.0) as u16;
                    builder.set_amp(frame, stream, channel, raw);
                    if stim {
                        builder.set_dc_amp(frame, stream, channel, 512);
                        builder.set_stim_word(frame, stream, channel, 0);
                    }
                }
                if frame % 4 == 0 {
                    for slot in 0..crate::api::AUX_PER_STREAM {
                        builder.set_aux(frame, stream, slot, (20000 + 1000 * slot) as u16);
                    }
                }
                if frame == 0 {
                    // ~3.3 V supply
                    builder.set_supply_voltage(frame, stream, 44117);
                }
            }
            for adc in 0..NUM_BOARD_ADCS {
                let volts = 1.0 * (2.0 * std::f64::consts::PI * 10.0 * seconds).sin();
                let raw = (volts / crate::api::ADC_VOLTS_PER_BIT as f64 + 32768.0)
                    .clamp(0.0, 65535.0) as u16;
                builder.set_adc(frame, adc, raw);
            }
            if stim {
                for dac in 0..crate::api::NUM_BOARD_DACS {
                    builder.set_dac(frame, dac, 32768);
                }
            }
            builder.set_digital_in(frame, self.digital_in_word(t));
            builder.set_digital_out(frame, 0);
        }
        self.next_timestamp = self.next_timestamp.wrapping_add(FRAMES_PER_BLOCK as u32);
        self.blocks_emitted += 1;
        builder.into_bytes()
    }

    fn log(&self, write: StimWrite) {
        self.stim_log.lock().push(write);
    }

    fn require_stim(&self) -> Result<()> {
        if self.kind.has_dc_amplifiers() {
            Ok(())
        } else {
            Err(Error::hardware("controller has no stimulation sequencer"))
        }
    }
}

impl BoardDriver for SyntheticBoard {
    fn controller_kind(&self) -> ControllerKind { self.kind }

    fn sample_rate(&self) -> f64 { self.sample_rate }

    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        if self.streaming {
            return Err(Error::hardware("cannot change sample rate while streaming"));
        }
        self.sample_rate = rate;
        Ok(())
    }

    fn find_connected_chips(&mut self) -> Result<Vec<StreamInfo>> { Ok(self.chips.clone()) }

    fn num_enabled_streams(&self) -> usize { self.chips.len() }

    fn start_streaming(&mut self) -> Result<()> {
        self.streaming = true;
        self.started_at = Some(Instant::now());
        self.blocks_emitted = 0;
        self.next_timestamp = 0;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.streaming = false;
        self.started_at = None;
        Ok(())
    }

    fn read_blocks(&mut self, max_blocks: usize, out: &mut Vec<u8>) -> Result<usize> {
        if !self.streaming {
            return Ok(0);
        }
        let due = self.blocks_due().min(max_blocks as u64) as usize;
        for _ in 0..due {
            let block = self.synthesize_block();
            out.extend_from_slice(&block);
        }
        Ok(due)
    }

    fn hardware_fifo_percent(&self) -> f64 {
        // the synthetic "hardware FIFO" backlog is whatever pacing has
        // produced but the reader has not collected yet
        if !self.paced || !self.streaming {
            return 0.0;
        }
        let backlog = self.blocks_due() as f64;
        (backlog / 64.0 * 100.0).min(100.0)
    }

    fn set_cable_delay(&mut self, _port: usize, _delay: u32) -> Result<()> { Ok(()) }

    fn set_spi_led_display(&mut self, _leds: &[bool]) -> Result<()> { Ok(()) }

    fn upload_bandwidth_settings(&mut self, lower_hz: f64, upper_hz: f64) -> Result<()> {
        log::info!("bandwidth settings uploaded: {:.1} Hz - {:.1} Hz", lower_hz, upper_hz);
        Ok(())
    }

    fn configure_stim_trigger(
        &mut self,
        stream: usize,
        channel: usize,
        source: usize,
        enabled: bool,
        edge: bool,
        low: bool,
    ) -> Result<()> {
        self.require_stim()?;
        self.log(StimWrite::Trigger { stream, channel, source, enabled, edge, low });
        Ok(())
    }

    fn configure_stim_pulses(
        &mut self,
        stream: usize,
        channel: usize,
        num_pulses: u32,
        shape: StimShape,
        neg_first: bool,
    ) -> Result<()> {
        self.require_stim()?;
        self.log(StimWrite::Pulses { stream, channel, num_pulses, shape, neg_first });
        Ok(())
    }

    fn program_stim_reg(
        &mut self,
        stream: usize,
        channel: usize,
        reg: StimRegister,
        value: u16,
    ) -> Result<()> {
        self.require_stim()?;
        self.log(StimWrite::Register { stream, channel, reg, value });
        Ok(())
    }

    fn set_stim_magnitudes(
        &mut self,
        stream: usize,
        channel: usize,
        positive: u8,
        negative: u8,
    ) -> Result<()> {
        self.require_stim()?;
        self.log(StimWrite::Magnitudes { stream, channel, positive, negative });
        Ok(())
    }

    fn enable_aux_commands_on_stream(&mut self, _stream: usize) -> Result<()> {
        self.require_stim()
    }

    fn enable_aux_commands_on_all(&mut self) -> Result<()> { self.require_stim() }

    fn set_manual_stim_trigger(&mut self, trigger: usize, on: bool) -> Result<()> {
        self.require_stim()?;
        log::info!("manual stim trigger {} {}", trigger, if on { "on" } else { "off" });
        Ok(())
    }

    fn measure_impedance(&mut self, stream: usize, channel: usize) -> Result<(f64, f64)> {
        if self.streaming {
            return Err(Error::hardware("impedance measurement requires a stopped board"));
        }
        // plausible electrode: a few hundred kilohm, capacitive phase
        let magnitude = 250_000.0 + 10_000.0 * ((stream * 32 + channel) % 17) as f64;
        let phase = -60.0 + ((stream * 32 + channel) % 7) as f64;
        Ok((magnitude, phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_block::BlockView;

    #[test]
    fn unpaced_board_respects_block_limit() {
        let mut board = SyntheticBoard::new(
            ControllerKind::RecordUsb3,
            vec![StreamInfo { port: 0, num_channels: 32 }],
            30000.0,
        )
        .unpaced(Some(3));
        board.start_streaming().unwrap();
        let mut out = Vec::new();
        assert_eq!(board.read_blocks(2, &mut out).unwrap(), 2);
        assert_eq!(board.read_blocks(8, &mut out).unwrap(), 1);
        assert_eq!(board.read_blocks(8, &mut out).unwrap(), 0);
        assert_eq!(out.len(), 3 * board.layout().bytes_per_block());
    }

    #[test]
    fn timestamps_are_contiguous_across_blocks() {
        let mut board = SyntheticBoard::new(
            ControllerKind::RecordUsb3,
            vec![StreamInfo { port: 0, num_channels: 32 }],
            30000.0,
        )
        .unpaced(Some(2));
        board.start_streaming().unwrap();
        let mut out = Vec::new();
        board.read_blocks(2, &mut out).unwrap();
        let layout = board.layout();
        let first = BlockView::new(layout, &out).unwrap();
        let second = BlockView::new(layout, &out[layout.bytes_per_block()..]).unwrap();
        assert_eq!(first.timestamp(0), 0);
        assert_eq!(first.timestamp(127), 127);
        assert_eq!(second.timestamp(0), 128);
    }

    #[test]
    fn digital_in_plan_asserts_at_timestamp() {
        let mut board = SyntheticBoard::new(
            ControllerKind::RecordUsb3,
            vec![StreamInfo { port: 0, num_channels: 32 }],
            30000.0,
        )
        .unpaced(Some(2))
        .with_digital_in_plan(vec![DigitalInPlan { from_timestamp: 130, word: 0x0001 }]);
        board.start_streaming().unwrap();
        let mut out = Vec::new();
        board.read_blocks(2, &mut out).unwrap();
        let layout = board.layout();
        let first = BlockView::new(layout, &out).unwrap();
        let second = BlockView::new(layout, &out[layout.bytes_per_block()..]).unwrap();
        assert_eq!(first.digital_in(127), 0);
        assert_eq!(second.digital_in(1), 0);
        assert_eq!(second.digital_in(2), 0x0001);
        assert_eq!(second.digital_in(127), 0x0001);
    }

    #[test]
    fn stim_calls_rejected_on_record_controller() {
        let mut board = SyntheticBoard::new(
            ControllerKind::RecordUsb3,
            vec![StreamInfo { port: 0, num_channels: 32 }],
            30000.0,
        );
        assert!(board
            .program_stim_reg(0, 0, StimRegister::EventStartStim, 10)
            .is_err());
    }
}
