//! Translation of per-channel stimulation parameters into board sequencer
//! registers.
//!
//! All times quantize to sample steps, all amplitudes to current steps. The
//! full register image is computed and validated before the first hardware
//! write, so a rejected parameter set leaves the board untouched.

use crate::api::NEVER;
use crate::board::{BoardDriver, StimRegister};
use crate::error::{Error, Result};
use crate::signal::{Channel, SignalKind, StimParams, StimPolarity, StimShape};

/// Event times for one channel's sequencer, in sample steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimSchedule {
    pub start_stim: u16,
    pub phase2: u16,
    pub phase3: u16,
    pub end_stim: u16,
    pub end: u16,
    pub repeat: u16,
    pub amp_settle_on: u16,
    pub amp_settle_off: u16,
    pub amp_settle_on_repeat: u16,
    pub amp_settle_off_repeat: u16,
    pub charge_recov_on: u16,
    pub charge_recov_off: u16,
}

fn quantize_time(us: f64, timestep_us: f64, what: &str) -> Result<i64> {
    let steps = (us / timestep_us).round() as i64;
    if steps < 0 {
        return Err(Error::config(format!("{} quantizes below zero", what)));
    }
    Ok(steps)
}

fn into_event(steps: i64, what: &str) -> Result<u16> {
    if !(0..=NEVER as i64).contains(&steps) {
        return Err(Error::config(format!(
            "{} does not fit the stim sequencer at this sample rate",
            what
        )));
    }
    Ok(steps as u16)
}

/// Pure schedule computation shared by the amplifier, analog-out, and
/// digital-out variants. `allow_monophasic` is false for amplifier channels.
pub fn compute_schedule(
    params: &StimParams,
    sample_rate: f64,
    allow_monophasic: bool,
) -> Result<StimSchedule> {
    let timestep_us = 1.0e6 / sample_rate;
    let q = |us: f64, what: &str| quantize_time(us, timestep_us, what);

    let pre = q(params.pre_stim_amp_settle_us, "PreStimAmpSettle")?;
    let post = q(params.post_stim_amp_settle_us, "PostStimAmpSettle")?;
    let delay = q(params.post_trigger_delay_us, "PostTriggerDelay")?;
    let d1 = q(params.first_phase_duration_us, "FirstPhaseDuration")?;
    let d2 = q(params.second_phase_duration_us, "SecondPhaseDuration")?;
    let inter = q(params.interphase_delay_us, "InterphaseDelay")?;
    let refractory = q(params.refractory_period_us, "RefractoryPeriod")?;
    let recov_on = q(params.post_stim_charge_recov_on_us, "PostStimChargeRecovOn")?;
    let recov_off = q(params.post_stim_charge_recov_off_us, "PostStimChargeRecovOff")?;
    let period = q(params.pulse_train_period_us, "PulseTrainPeriod")?;

    let start_stim = delay;
    let (phase2, phase3, end_stim) = match params.shape {
        StimShape::Biphasic => (start_stim + d1, NEVER as i64, start_stim + d1 + d2),
        StimShape::BiphasicWithInterphaseDelay => {
            let p2 = start_stim + d1;
            let p3 = p2 + inter;
            (p2, p3, p3 + d2)
        }
        StimShape::Triphasic => {
            let p2 = start_stim + d1;
            let p3 = p2 + d2;
            (p2, p3, p3 + d1)
        }
        StimShape::Monophasic => {
            if !allow_monophasic {
                return Err(Error::config(
                    "Monophasic stimulation is not supported on amplifier channels",
                ));
            }
            (NEVER as i64, NEVER as i64, start_stim + d1)
        }
    };
    let end = end_stim + refractory;

    let repeat = if params.pulse_train { start_stim + period } else { NEVER as i64 };

    let (amp_settle_on, amp_settle_off, amp_settle_on_repeat, amp_settle_off_repeat) =
        if params.enable_amp_settle {
            let on = start_stim - pre;
            let off = end_stim + post;
            if params.maintain_amp_settle {
                (on, off, NEVER as i64, NEVER as i64)
            } else {
                (on, off, repeat - pre, post)
            }
        } else {
            (NEVER as i64, 0, NEVER as i64, NEVER as i64)
        };

    let (charge_recov_on, charge_recov_off) = if params.enable_charge_recovery {
        (end_stim + recov_on, end_stim + recov_off)
    } else {
        (NEVER as i64, 0)
    };

    Ok(StimSchedule {
        start_stim: into_event(start_stim, "StartStim")?,
        phase2: into_event(phase2, "StimPhase2")?,
        phase3: into_event(phase3, "StimPhase3")?,
        end_stim: into_event(end_stim, "EndStim")?,
        end: into_event(end, "End")?,
        repeat: into_event(repeat, "RepeatStim")?,
        amp_settle_on: into_event(amp_settle_on, "AmpSettleOn")?,
        amp_settle_off: into_event(amp_settle_off, "AmpSettleOff")?,
        amp_settle_on_repeat: into_event(amp_settle_on_repeat, "AmpSettleOnRepeat")?,
        amp_settle_off_repeat: into_event(amp_settle_off_repeat, "AmpSettleOffRepeat")?,
        charge_recov_on: into_event(charge_recov_on, "ChargeRecovOn")?,
        charge_recov_off: into_event(charge_recov_off, "ChargeRecovOff")?,
    })
}

/// First/second phase amplitudes resolved to (positive, negative) current
/// steps per the polarity setting, clamped to the 8-bit magnitude DAC.
pub fn resolve_magnitudes(params: &StimParams, current_step_ua: f64) -> (u8, u8) {
    let first = (params.first_phase_amplitude_ua / current_step_ua).round().clamp(0.0, 255.0) as u8;
    let second =
        (params.second_phase_amplitude_ua / current_step_ua).round().clamp(0.0, 255.0) as u8;
    match params.polarity {
        StimPolarity::NegativeFirst => (second, first),
        StimPolarity::PositiveFirst => (first, second),
    }
}

pub struct StimProgrammer<'a> {
    board: &'a mut dyn BoardDriver,
    sample_rate: f64,
    current_step_ua: f64,
}

impl<'a> StimProgrammer<'a> {
    pub fn new(
        board: &'a mut dyn BoardDriver,
        sample_rate: f64,
        current_step_ua: f64,
    ) -> StimProgrammer<'a> {
        StimProgrammer { board, sample_rate, current_step_ua }
    }

    /// Program one channel, dispatched on its signal kind. Everything is
    /// validated before the first register write.
    pub fn upload_channel(&mut self, channel: &Channel) -> Result<()> {
        let params = channel
            .stim_parameters()
            .ok_or_else(|| Error::config("channel has no stimulation parameters"))?;
        match channel.kind() {
            SignalKind::Amplifier => self.upload_amplifier(channel, &params),
            SignalKind::BoardDac => self.upload_analog_out(channel, &params),
            SignalKind::BoardDigitalOut => self.upload_digital_out(channel, &params),
            _ => Err(Error::config("channel kind cannot be stimulated")),
        }
    }

    fn num_pulses(params: &StimParams) -> u32 {
        if params.pulse_train { params.number_of_pulses } else { 1 }
    }

    fn upload_amplifier(&mut self, channel: &Channel, params: &StimParams) -> Result<()> {
        let schedule = compute_schedule(params, self.sample_rate, false)?;
        let (positive, negative) = resolve_magnitudes(params, self.current_step_ua);
        let stream = channel.stream();
        let chip_channel = channel.chip_channel();

        self.board.configure_stim_trigger(
            stream,
            chip_channel,
            params.trigger_source,
            params.enabled,
            params.trigger_on_edge,
            params.trigger_on_low,
        )?;
        self.board.configure_stim_pulses(
            stream,
            chip_channel,
            Self::num_pulses(params),
            params.shape,
            params.polarity == StimPolarity::NegativeFirst,
        )?;

        let writes = [
            (StimRegister::EventAmpSettleOn, schedule.amp_settle_on),
            (StimRegister::EventStartStim, schedule.start_stim),
            (StimRegister::EventStimPhase2, schedule.phase2),
            (StimRegister::EventStimPhase3, schedule.phase3),
            (StimRegister::EventEndStim, schedule.end_stim),
            (StimRegister::EventRepeatStim, schedule.repeat),
            (StimRegister::EventAmpSettleOff, schedule.amp_settle_off),
            (StimRegister::EventChargeRecovOn, schedule.charge_recov_on),
            (StimRegister::EventChargeRecovOff, schedule.charge_recov_off),
            (StimRegister::EventAmpSettleOnRepeat, schedule.amp_settle_on_repeat),
            (StimRegister::EventAmpSettleOffRepeat, schedule.amp_settle_off_repeat),
            (StimRegister::EventEnd, schedule.end),
        ];
        for (reg, value) in writes {
            self.board.program_stim_reg(stream, chip_channel, reg, value)?;
        }

        self.board.enable_aux_commands_on_stream(stream)?;
        self.board.set_stim_magnitudes(stream, chip_channel, positive, negative)?;
        self.board.enable_aux_commands_on_all()?;
        log::info!("stim parameters uploaded for {}", channel.native_name());
        Ok(())
    }

    fn upload_analog_out(&mut self, channel: &Channel, params: &StimParams) -> Result<()> {
        let schedule = compute_schedule(params, self.sample_rate, true)?;
        // analog-out sequencers sit on dedicated streams above the headstages
        let stream = 8 + channel.native_channel_number();

        const DAC_LSB: f64 = (2.0 * 10.24) / 65536.0;
        const DAC_MID: i64 = 32768;
        let baseline = DAC_MID + (params.baseline_voltage_v / DAC_LSB) as i64;
        let (positive, negative) = if params.shape == StimShape::Monophasic {
            if params.polarity == StimPolarity::NegativeFirst {
                (baseline, baseline + (-params.first_phase_amplitude_ua / DAC_LSB) as i64)
            } else {
                (baseline + (params.first_phase_amplitude_ua / DAC_LSB) as i64, baseline)
            }
        } else {
            let (pos_v, neg_v) = if params.polarity == StimPolarity::NegativeFirst {
                (params.second_phase_amplitude_ua, params.first_phase_amplitude_ua)
            } else {
                (params.first_phase_amplitude_ua, params.second_phase_amplitude_ua)
            };
            (baseline + (pos_v / DAC_LSB) as i64, baseline + (-neg_v / DAC_LSB) as i64)
        };
        let dac_baseline = baseline.clamp(0, 65535) as u16;
        let dac_positive = positive.clamp(0, 65535) as u16;
        let dac_negative = negative.clamp(0, 65535) as u16;

        self.board.configure_stim_trigger(
            stream,
            0,
            params.trigger_source,
            params.enabled,
            params.trigger_on_edge,
            params.trigger_on_low,
        )?;
        self.board.configure_stim_pulses(
            stream,
            0,
            Self::num_pulses(params),
            params.shape,
            params.polarity == StimPolarity::NegativeFirst,
        )?;
        let writes = [
            (StimRegister::EventStartStim, schedule.start_stim),
            (StimRegister::EventStimPhase2, schedule.phase2),
            (StimRegister::EventStimPhase3, schedule.phase3),
            (StimRegister::EventEndStim, schedule.end_stim),
            (StimRegister::EventRepeatStim, schedule.repeat),
            (StimRegister::EventEnd, schedule.end),
            (StimRegister::DacBaseline, dac_baseline),
            (StimRegister::DacPositive, dac_positive),
            (StimRegister::DacNegative, dac_negative),
        ];
        for (reg, value) in writes {
            self.board.program_stim_reg(stream, 0, reg, value)?;
        }
        log::info!("analog-out sequence uploaded for {}", channel.native_name());
        Ok(())
    }

    fn upload_digital_out(&mut self, channel: &Channel, params: &StimParams) -> Result<()> {
        // digital outputs only pulse: treat the shape as monophasic
        let mut flat = params.clone();
        flat.shape = StimShape::Monophasic;
        let schedule = compute_schedule(&flat, self.sample_rate, true)?;
        let stream = 16;
        let line = channel.native_channel_number();

        self.board.configure_stim_trigger(
            stream,
            line,
            params.trigger_source,
            params.enabled,
            params.trigger_on_edge,
            params.trigger_on_low,
        )?;
        self.board.configure_stim_pulses(
            stream,
            line,
            Self::num_pulses(params),
            StimShape::Monophasic,
            false,
        )?;
        let writes = [
            (StimRegister::EventStartStim, schedule.start_stim),
            (StimRegister::EventEndStim, schedule.end_stim),
            (StimRegister::EventRepeatStim, schedule.repeat),
            (StimRegister::EventEnd, schedule.end),
        ];
        for (reg, value) in writes {
            self.board.program_stim_reg(stream, line, reg, value)?;
        }
        log::info!("digital-out sequence uploaded for {}", channel.native_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ControllerKind;
    use crate::board::{StimWrite, SyntheticBoard};
    use crate::signal::{SignalModel, StreamInfo};

    fn params() -> StimParams {
        StimParams {
            enabled: true,
            shape: StimShape::Biphasic,
            polarity: StimPolarity::NegativeFirst,
            trigger_source: 0,
            trigger_on_edge: true,
            trigger_on_low: false,
            pulse_train: false,
            number_of_pulses: 2,
            first_phase_duration_us: 100.0,
            second_phase_duration_us: 100.0,
            interphase_delay_us: 50.0,
            refractory_period_us: 1000.0,
            pulse_train_period_us: 10000.0,
            post_trigger_delay_us: 200.0,
            first_phase_amplitude_ua: 10.0,
            second_phase_amplitude_ua: 10.0,
            enable_amp_settle: false,
            maintain_amp_settle: false,
            pre_stim_amp_settle_us: 0.0,
            post_stim_amp_settle_us: 0.0,
            enable_charge_recovery: false,
            post_stim_charge_recov_on_us: 0.0,
            post_stim_charge_recov_off_us: 0.0,
            baseline_voltage_v: 0.0,
        }
    }

    // at 20 kHz, one sample step is 50 us
    const RATE: f64 = 20000.0;

    #[test]
    fn biphasic_schedule() {
        let schedule = compute_schedule(&params(), RATE, false).unwrap();
        assert_eq!(schedule.start_stim, 4); // 200 us
        assert_eq!(schedule.phase2, 6); // +100 us
        assert_eq!(schedule.phase3, NEVER);
        assert_eq!(schedule.end_stim, 8);
        assert_eq!(schedule.end, 28); // +1000 us refractory
        assert_eq!(schedule.repeat, NEVER);
        assert_eq!(schedule.amp_settle_on, NEVER);
        assert_eq!(schedule.amp_settle_off, 0);
        assert_eq!(schedule.charge_recov_on, NEVER);
        assert_eq!(schedule.charge_recov_off, 0);
    }

    #[test]
    fn biphasic_with_interphase_schedule() {
        let mut p = params();
        p.shape = StimShape::BiphasicWithInterphaseDelay;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.phase2, 6);
        assert_eq!(schedule.phase3, 7); // +50 us interphase
        assert_eq!(schedule.end_stim, 9);
    }

    #[test]
    fn triphasic_schedule_repeats_first_duration() {
        let mut p = params();
        p.shape = StimShape::Triphasic;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.phase2, 6);
        assert_eq!(schedule.phase3, 8);
        assert_eq!(schedule.end_stim, 10); // phase3 + first duration
    }

    #[test]
    fn monophasic_rejected_on_amplifier() {
        let mut p = params();
        p.shape = StimShape::Monophasic;
        assert!(compute_schedule(&p, RATE, false).is_err());
        let schedule = compute_schedule(&p, RATE, true).unwrap();
        assert_eq!(schedule.phase2, NEVER);
        assert_eq!(schedule.phase3, NEVER);
        assert_eq!(schedule.end_stim, 6);
    }

    #[test]
    fn pulse_train_sets_repeat() {
        let mut p = params();
        p.pulse_train = true;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.repeat, 4 + 200); // start + 10000 us
    }

    #[test]
    fn amp_settle_windows() {
        let mut p = params();
        p.enable_amp_settle = true;
        p.pre_stim_amp_settle_us = 100.0;
        p.post_stim_amp_settle_us = 150.0;
        p.pulse_train = true;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.amp_settle_on, 2); // start 4 - 2 steps
        assert_eq!(schedule.amp_settle_off, 11); // end_stim 8 + 3 steps
        assert_eq!(schedule.amp_settle_on_repeat, 204 - 2);
        assert_eq!(schedule.amp_settle_off_repeat, 3);

        p.maintain_amp_settle = true;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.amp_settle_on_repeat, NEVER);
        assert_eq!(schedule.amp_settle_off_repeat, NEVER);
    }

    #[test]
    fn charge_recovery_windows() {
        let mut p = params();
        p.enable_charge_recovery = true;
        p.post_stim_charge_recov_on_us = 100.0;
        p.post_stim_charge_recov_off_us = 500.0;
        let schedule = compute_schedule(&p, RATE, false).unwrap();
        assert_eq!(schedule.charge_recov_on, 10);
        assert_eq!(schedule.charge_recov_off, 18);
    }

    #[test]
    fn settle_before_trigger_rejected() {
        let mut p = params();
        p.enable_amp_settle = true;
        p.pre_stim_amp_settle_us = 500.0; // start is only 200 us after trigger
        assert!(compute_schedule(&p, RATE, false).is_err());
    }

    #[test]
    fn overlong_schedule_rejected() {
        let mut p = params();
        p.refractory_period_us = 1.0e6; // 20000 steps is fine
        assert!(compute_schedule(&p, RATE, false).is_ok());
        p.post_trigger_delay_us = 5.0e5;
        p.refractory_period_us = 1.0e6;
        p.pulse_train = true;
        p.pulse_train_period_us = 1.0e6;
        // start 10000 + refractory 20000 + end_stim 4 -> still ok; stretch it
        p.first_phase_duration_us = 5000.0;
        p.second_phase_duration_us = 5000.0;
        let schedule = compute_schedule(&p, RATE, false);
        assert!(schedule.is_ok());
        p.post_trigger_delay_us = 3.0e6; // 60000 steps + durations overflows
        assert!(compute_schedule(&p, RATE, false).is_err());
    }

    #[test]
    fn magnitudes_follow_polarity() {
        let mut p = params();
        p.first_phase_amplitude_ua = 20.0;
        p.second_phase_amplitude_ua = 10.0;
        // 10 uA steps
        assert_eq!(resolve_magnitudes(&p, 10.0), (1, 2)); // negative first
        p.polarity = StimPolarity::PositiveFirst;
        assert_eq!(resolve_magnitudes(&p, 10.0), (2, 1));
        // clamped at the 8-bit DAC limit
        p.first_phase_amplitude_ua = 1.0e6;
        assert_eq!(resolve_magnitudes(&p, 10.0).0, 255);
    }

    #[test]
    fn invalid_upload_touches_no_register() {
        let mut model = SignalModel::new(ControllerKind::StimRecord);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        {
            let channel = model.channel_by_name_mut("A-003").unwrap();
            let items = channel.items_mut();
            items.locate_mut("shape").unwrap().set_from_str("Monophasic").unwrap();
        }
        let mut board = SyntheticBoard::new(
            ControllerKind::StimRecord,
            vec![StreamInfo { port: 0, num_channels: 16 }],
            RATE,
        );
        let log = board.stim_log();
        let channel = model.channel_by_name("A-003").unwrap();
        let mut programmer = StimProgrammer::new(&mut board, RATE, 10.0);
        assert!(programmer.upload_channel(channel).is_err());
        assert!(log.lock().is_empty(), "rejected upload must write nothing");
    }

    #[test]
    fn valid_upload_writes_full_register_image() {
        let mut model = SignalModel::new(ControllerKind::StimRecord);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        {
            let channel = model.channel_by_name_mut("A-003").unwrap();
            let items = channel.items_mut();
            items.locate_mut("stimenabled").unwrap().set_from_str("true").unwrap();
            items.locate_mut("firstphaseamplitudemicroamps").unwrap().set_from_str("50").unwrap();
        }
        let mut board = SyntheticBoard::new(
            ControllerKind::StimRecord,
            vec![StreamInfo { port: 0, num_channels: 16 }],
            RATE,
        );
        let log = board.stim_log();
        let channel = model.channel_by_name("A-003").unwrap();
        let mut programmer = StimProgrammer::new(&mut board, RATE, 10.0);
        programmer.upload_channel(channel).unwrap();
        let writes = log.lock();
        let registers = writes
            .iter()
            .filter(|w| matches!(w, StimWrite::Register { .. }))
            .count();
        assert_eq!(registers, 12);
        assert!(writes.iter().any(|w| matches!(
            w,
            StimWrite::Magnitudes { positive: 0, negative: 5, .. }
        )));
    }
}
