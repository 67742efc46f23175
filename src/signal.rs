//! Canonical description of what is being acquired: ports, channels, and the
//! per-channel parameter registries (including stimulation parameters).
//!
//! Channels are created by a port scan (or a synthetic equivalent) and
//! destroyed on rescan. Native names are stable and unique ("A-005",
//! "ANALOG-IN-3", "DIGITAL-OUT-02"); custom names are user-editable items.

use crate::api::{
    Band, ControllerKind, AUX_PER_STREAM, NUM_BOARD_ADCS, NUM_BOARD_DACS, NUM_DIGITAL_IN,
    NUM_DIGITAL_OUT,
};
use crate::state::item::{Registry, StateItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Amplifier,
    AuxInput,
    SupplyVoltage,
    BoardAdc,
    BoardDac,
    BoardDigitalIn,
    BoardDigitalOut,
}

/// Stimulation waveform shapes. The enum order is the index programmed into
/// the board's pulse-shape register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum StimShape {
    Biphasic = 0,
    BiphasicWithInterphaseDelay = 1,
    Triphasic = 2,
    Monophasic = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimPolarity {
    NegativeFirst,
    PositiveFirst,
}

pub const STIM_SHAPES: [&str; 4] =
    ["Biphasic", "BiphasicWithInterphaseDelay", "Triphasic", "Monophasic"];
pub const STIM_POLARITIES: [&str; 2] = ["NegativeFirst", "PositiveFirst"];

/// Trigger source register values: digital lines 0-15, analog lines 16-23,
/// manual key-press lines 24-31.
pub const TRIGGER_SOURCES: [&str; 32] = [
    "DigitalIn01", "DigitalIn02", "DigitalIn03", "DigitalIn04", "DigitalIn05", "DigitalIn06",
    "DigitalIn07", "DigitalIn08", "DigitalIn09", "DigitalIn10", "DigitalIn11", "DigitalIn12",
    "DigitalIn13", "DigitalIn14", "DigitalIn15", "DigitalIn16", "AnalogIn1", "AnalogIn2",
    "AnalogIn3", "AnalogIn4", "AnalogIn5", "AnalogIn6", "AnalogIn7", "AnalogIn8", "KeyPressF1",
    "KeyPressF2", "KeyPressF3", "KeyPressF4", "KeyPressF5", "KeyPressF6", "KeyPressF7",
    "KeyPressF8",
];

pub const MANUAL_TRIGGER_BASE: usize = 24;

#[derive(Debug, Clone)]
pub struct Channel {
    native_name: String,
    kind: SignalKind,
    /// Data stream carrying this channel (amplifier/aux/vdd signals).
    stream: usize,
    /// Channel index on the chip (amplifier signals).
    chip_channel: usize,
    /// Index within its signal kind (ADC 0-7, digital 0-15, ...).
    native_channel_number: usize,
    /// Impedance magnitude (ohms) and phase (degrees), once measured.
    pub impedance: Option<(f64, f64)>,
    items: Registry,
    stim_capable: bool,
}

impl Channel {
    fn base_items(name: &str, color: &str) -> Registry {
        let mut items = Registry::new();
        items.insert(StateItem::bool_item("Enabled", true));
        items.insert(StateItem::text_item("CustomChannelName", name));
        items.insert(StateItem::text_item("Color", color));
        items.insert(StateItem::bool_item("OutputToDisk", true));
        items.insert(StateItem::bool_item("OutputToTcp", false));
        items
    }

    fn amplifier(
        port_letter: char,
        index: usize,
        stream: usize,
        chip_channel: usize,
        stim_capable: bool,
    ) -> Channel {
        let native_name = format!("{}-{:03}", port_letter, index);
        let mut items = Self::base_items(&native_name, auto_color(index));
        items.insert(StateItem::text_item("Reference", "Hardware"));
        items.insert(StateItem::bool_item("OutputToTcpLow", false));
        items.insert(StateItem::bool_item("OutputToTcpHigh", false));
        items.insert(StateItem::bool_item("OutputToTcpSpike", false));
        items.insert(StateItem::bool_item("OutputToTcpDc", false));
        items.insert(StateItem::bool_item("OutputToTcpStim", false));
        items.insert(StateItem::int_item("SpikeThresholdMicroVolts", -70, -5000, 5000));
        if stim_capable {
            insert_stim_items(&mut items, false);
        }
        Channel {
            native_name,
            kind: SignalKind::Amplifier,
            stream,
            chip_channel,
            native_channel_number: index,
            impedance: None,
            items,
            stim_capable,
        }
    }

    fn aux_input(port_letter: char, number: usize, stream: usize, slot: usize) -> Channel {
        let native_name = format!("{}-AUX{}", port_letter, number + 1);
        let items = Self::base_items(&native_name, "#808080");
        Channel {
            native_name,
            kind: SignalKind::AuxInput,
            stream,
            chip_channel: slot,
            native_channel_number: number,
            impedance: None,
            items,
            stim_capable: false,
        }
    }

    fn supply_voltage(port_letter: char, number: usize, stream: usize) -> Channel {
        let native_name = format!("{}-VDD{}", port_letter, number + 1);
        let items = Self::base_items(&native_name, "#808080");
        Channel {
            native_name,
            kind: SignalKind::SupplyVoltage,
            stream,
            chip_channel: 0,
            native_channel_number: number,
            impedance: None,
            items,
            stim_capable: false,
        }
    }

    fn board_channel(kind: SignalKind, index: usize, stim_capable: bool) -> Channel {
        let native_name = match kind {
            SignalKind::BoardAdc => format!("ANALOG-IN-{}", index + 1),
            SignalKind::BoardDac => format!("ANALOG-OUT-{}", index + 1),
            SignalKind::BoardDigitalIn => format!("DIGITAL-IN-{:02}", index + 1),
            SignalKind::BoardDigitalOut => format!("DIGITAL-OUT-{:02}", index + 1),
            _ => unreachable!("not a board signal"),
        };
        let mut items = Self::base_items(&native_name, "#808080");
        if stim_capable {
            insert_stim_items(&mut items, kind == SignalKind::BoardDac);
        }
        Channel {
            native_name,
            kind,
            stream: 0,
            chip_channel: index,
            native_channel_number: index,
            impedance: None,
            items,
            stim_capable,
        }
    }

    pub fn native_name(&self) -> &str { &self.native_name }
    pub fn kind(&self) -> SignalKind { self.kind }
    pub fn stream(&self) -> usize { self.stream }
    pub fn chip_channel(&self) -> usize { self.chip_channel }
    pub fn native_channel_number(&self) -> usize { self.native_channel_number }
    pub fn stim_capable(&self) -> bool { self.stim_capable }

    pub fn items(&self) -> &Registry { &self.items }
    pub fn items_mut(&mut self) -> &mut Registry { &mut self.items }

    pub fn is_enabled(&self) -> bool { self.items.locate("enabled").unwrap().as_bool() }

    fn flag(&self, name: &str) -> bool {
        self.items.locate(name).map(|i| i.as_bool()).unwrap_or(false)
    }

    pub fn output_to_disk(&self) -> bool { self.flag("outputtodisk") }
    pub fn output_to_tcp(&self) -> bool { self.flag("outputtotcp") }
    pub fn output_to_tcp_low(&self) -> bool { self.flag("outputtotcplow") }
    pub fn output_to_tcp_high(&self) -> bool { self.flag("outputtotcphigh") }
    pub fn output_to_tcp_spike(&self) -> bool { self.flag("outputtotcpspike") }
    pub fn output_to_tcp_dc(&self) -> bool { self.flag("outputtotcpdc") }
    pub fn output_to_tcp_stim(&self) -> bool { self.flag("outputtotcpstim") }

    /// Bands this amplifier channel streams to TCP, in wire order.
    pub fn tcp_bands(&self) -> Vec<Band> {
        let mut bands = Vec::new();
        if self.output_to_tcp() {
            bands.push(Band::Wide);
        }
        if self.output_to_tcp_low() {
            bands.push(Band::Low);
        }
        if self.output_to_tcp_high() {
            bands.push(Band::High);
        }
        if self.output_to_tcp_spike() {
            bands.push(Band::Spike);
        }
        if self.output_to_tcp_dc() {
            bands.push(Band::Dc);
        }
        if self.output_to_tcp_stim() {
            bands.push(Band::Stim);
        }
        bands
    }

    pub fn clear_tcp_outputs(&mut self) {
        for name in [
            "outputtotcp",
            "outputtotcplow",
            "outputtotcphigh",
            "outputtotcpspike",
            "outputtotcpdc",
            "outputtotcpstim",
        ] {
            if let Some(item) = self.items.locate_mut(name) {
                item.set_bool(false);
            }
        }
    }

    pub fn stim_parameters(&self) -> Option<StimParams> {
        if !self.stim_capable {
            return None;
        }
        Some(StimParams::from_registry(&self.items))
    }
}

fn insert_stim_items(items: &mut Registry, analog_out: bool) {
    items.insert(StateItem::bool_item("StimEnabled", false));
    items.insert(StateItem::enum_item("Shape", 0, STIM_SHAPES.to_vec()));
    items.insert(StateItem::enum_item("Polarity", 0, STIM_POLARITIES.to_vec()));
    items.insert(StateItem::enum_item("Source", 24, TRIGGER_SOURCES.to_vec()));
    items.insert(StateItem::enum_item("TriggerEdgeOrLevel", 0, vec!["Edge", "Level"]));
    items.insert(StateItem::enum_item("TriggerHighOrLow", 0, vec!["High", "Low"]));
    items.insert(StateItem::enum_item("PulseOrTrain", 0, vec!["SinglePulse", "PulseTrain"]));
    items.insert(StateItem::int_item("NumberOfStimPulses", 2, 1, 256));
    items.insert(StateItem::double_item("FirstPhaseDurationMicroseconds", 100.0, 0.0, 5000.0, 1.0));
    items.insert(StateItem::double_item("SecondPhaseDurationMicroseconds", 100.0, 0.0, 5000.0, 1.0));
    items.insert(StateItem::double_item("InterphaseDelayMicroseconds", 100.0, 0.0, 5000.0, 1.0));
    items.insert(StateItem::double_item("RefractoryPeriodMicroseconds", 1000.0, 0.0, 1.0e6, 1.0));
    items.insert(StateItem::double_item("PulseTrainPeriodMicroseconds", 10000.0, 0.0, 1.0e6, 1.0));
    items.insert(StateItem::double_item("PostTriggerDelayMicroseconds", 0.0, 0.0, 5.0e5, 1.0));
    items.insert(StateItem::double_item("FirstPhaseAmplitudeMicroAmps", 0.0, 0.0, 2550.0, 0.01));
    items.insert(StateItem::double_item("SecondPhaseAmplitudeMicroAmps", 0.0, 0.0, 2550.0, 0.01));
    items.insert(StateItem::bool_item("EnableAmpSettle", false));
    items.insert(StateItem::bool_item("MaintainAmpSettle", false));
    items.insert(StateItem::double_item("PreStimAmpSettleMicroseconds", 0.0, 0.0, 5.0e5, 1.0));
    items.insert(StateItem::double_item("PostStimAmpSettleMicroseconds", 0.0, 0.0, 5.0e5, 1.0));
    items.insert(StateItem::bool_item("EnableChargeRecovery", false));
    items.insert(StateItem::double_item("PostStimChargeRecovOnMicroseconds", 0.0, 0.0, 1.0e6, 1.0));
    items.insert(StateItem::double_item("PostStimChargeRecovOffMicroseconds", 0.0, 0.0, 1.0e6, 1.0));
    if analog_out {
        items.insert(StateItem::double_item("BaselineVoltageVolts", 0.0, -10.24, 10.24, 0.01));
        // analog-out amplitudes are volts rather than current steps
    }
}

/// Typed snapshot of a channel's stimulation parameters, assembled from the
/// per-channel registry just before programming or TCP re-encoding.
#[derive(Debug, Clone)]
pub struct StimParams {
    pub enabled: bool,
    pub shape: StimShape,
    pub polarity: StimPolarity,
    pub trigger_source: usize,
    pub trigger_on_edge: bool,
    pub trigger_on_low: bool,
    pub pulse_train: bool,
    pub number_of_pulses: u32,
    pub first_phase_duration_us: f64,
    pub second_phase_duration_us: f64,
    pub interphase_delay_us: f64,
    pub refractory_period_us: f64,
    pub pulse_train_period_us: f64,
    pub post_trigger_delay_us: f64,
    pub first_phase_amplitude_ua: f64,
    pub second_phase_amplitude_ua: f64,
    pub enable_amp_settle: bool,
    pub maintain_amp_settle: bool,
    pub pre_stim_amp_settle_us: f64,
    pub post_stim_amp_settle_us: f64,
    pub enable_charge_recovery: bool,
    pub post_stim_charge_recov_on_us: f64,
    pub post_stim_charge_recov_off_us: f64,
    pub baseline_voltage_v: f64,
}

const STIM_ITEM_NAMES: [&str; 24] = [
    "stimenabled",
    "shape",
    "polarity",
    "source",
    "triggeredgeorlevel",
    "triggerhighorlow",
    "pulseortrain",
    "numberofstimpulses",
    "firstphasedurationmicroseconds",
    "secondphasedurationmicroseconds",
    "interphasedelaymicroseconds",
    "refractoryperiodmicroseconds",
    "pulsetrainperiodmicroseconds",
    "posttriggerdelaymicroseconds",
    "firstphaseamplitudemicroamps",
    "secondphaseamplitudemicroamps",
    "enableampsettle",
    "maintainampsettle",
    "prestimampsettlemicroseconds",
    "poststimampsettlemicroseconds",
    "enablechargerecovery",
    "poststimchargerecovonmicroseconds",
    "poststimchargerecovoffmicroseconds",
    "baselinevoltagevolts",
];

/// True when a channel attribute belongs to the stimulation parameter set
/// (the undoable part of a channel's registry).
pub fn is_stim_item(attr: &str) -> bool {
    let lower = attr.to_ascii_lowercase();
    STIM_ITEM_NAMES.contains(&lower.as_str())
}

impl StimParams {
    fn from_registry(items: &Registry) -> StimParams {
        let get = |name: &str| items.locate(name).expect("stim item missing");
        StimParams {
            enabled: get("stimenabled").as_bool(),
            shape: num_traits::FromPrimitive::from_usize(get("shape").enum_index())
                .expect("stim shape index"),
            polarity: if get("polarity").enum_index() == 0 {
                StimPolarity::NegativeFirst
            } else {
                StimPolarity::PositiveFirst
            },
            trigger_source: get("source").enum_index(),
            trigger_on_edge: get("triggeredgeorlevel").enum_index() == 0,
            trigger_on_low: get("triggerhighorlow").enum_index() == 1,
            pulse_train: get("pulseortrain").enum_index() == 1,
            number_of_pulses: get("numberofstimpulses").as_int() as u32,
            first_phase_duration_us: get("firstphasedurationmicroseconds").as_double(),
            second_phase_duration_us: get("secondphasedurationmicroseconds").as_double(),
            interphase_delay_us: get("interphasedelaymicroseconds").as_double(),
            refractory_period_us: get("refractoryperiodmicroseconds").as_double(),
            pulse_train_period_us: get("pulsetrainperiodmicroseconds").as_double(),
            post_trigger_delay_us: get("posttriggerdelaymicroseconds").as_double(),
            first_phase_amplitude_ua: get("firstphaseamplitudemicroamps").as_double(),
            second_phase_amplitude_ua: get("secondphaseamplitudemicroamps").as_double(),
            enable_amp_settle: get("enableampsettle").as_bool(),
            maintain_amp_settle: get("maintainampsettle").as_bool(),
            pre_stim_amp_settle_us: get("prestimampsettlemicroseconds").as_double(),
            post_stim_amp_settle_us: get("poststimampsettlemicroseconds").as_double(),
            enable_charge_recovery: get("enablechargerecovery").as_bool(),
            post_stim_charge_recov_on_us: get("poststimchargerecovonmicroseconds").as_double(),
            post_stim_charge_recov_off_us: get("poststimchargerecovoffmicroseconds").as_double(),
            baseline_voltage_v: items
                .locate("baselinevoltagevolts")
                .map(|i| i.as_double())
                .unwrap_or(0.0),
        }
    }

    /// Write these values back into a channel's item registry; the reverse
    /// of `from_registry`, used when an edit is undone.
    fn write_to_registry(&self, items: &mut Registry) {
        let mut set = |name: &str, value: String| {
            if let Some(item) = items.locate_mut(name) {
                let _ = item.set_from_str(&value);
            }
        };
        set("stimenabled", if self.enabled { "True" } else { "False" }.to_owned());
        set("shape", STIM_SHAPES[self.shape as usize].to_owned());
        let polarity = match self.polarity {
            StimPolarity::NegativeFirst => 0,
            StimPolarity::PositiveFirst => 1,
        };
        set("polarity", STIM_POLARITIES[polarity].to_owned());
        set("source", TRIGGER_SOURCES[self.trigger_source].to_owned());
        set("triggeredgeorlevel", if self.trigger_on_edge { "Edge" } else { "Level" }.to_owned());
        set("triggerhighorlow", if self.trigger_on_low { "Low" } else { "High" }.to_owned());
        set("pulseortrain", if self.pulse_train { "PulseTrain" } else { "SinglePulse" }.to_owned());
        set("numberofstimpulses", self.number_of_pulses.to_string());
        set("firstphasedurationmicroseconds", self.first_phase_duration_us.to_string());
        set("secondphasedurationmicroseconds", self.second_phase_duration_us.to_string());
        set("interphasedelaymicroseconds", self.interphase_delay_us.to_string());
        set("refractoryperiodmicroseconds", self.refractory_period_us.to_string());
        set("pulsetrainperiodmicroseconds", self.pulse_train_period_us.to_string());
        set("posttriggerdelaymicroseconds", self.post_trigger_delay_us.to_string());
        set("firstphaseamplitudemicroamps", self.first_phase_amplitude_ua.to_string());
        set("secondphaseamplitudemicroamps", self.second_phase_amplitude_ua.to_string());
        set("enableampsettle", if self.enable_amp_settle { "True" } else { "False" }.to_owned());
        set("maintainampsettle", if self.maintain_amp_settle { "True" } else { "False" }.to_owned());
        set("prestimampsettlemicroseconds", self.pre_stim_amp_settle_us.to_string());
        set("poststimampsettlemicroseconds", self.post_stim_amp_settle_us.to_string());
        set(
            "enablechargerecovery",
            if self.enable_charge_recovery { "True" } else { "False" }.to_owned(),
        );
        set("poststimchargerecovonmicroseconds", self.post_stim_charge_recov_on_us.to_string());
        set("poststimchargerecovoffmicroseconds", self.post_stim_charge_recov_off_us.to_string());
        set("baselinevoltagevolts", self.baseline_voltage_v.to_string());
    }
}

/// One undoable stimulation edit: the channel and the values it carried
/// before the change was applied.
#[derive(Debug, Clone)]
pub struct StimSnapshot {
    pub channel: String,
    pub params: StimParams,
}

impl StimSnapshot {
    pub fn capture(channel: &Channel) -> Option<StimSnapshot> {
        channel.stim_parameters().map(|params| StimSnapshot {
            channel: channel.native_name().to_owned(),
            params,
        })
    }
}

const MAX_UNDO_DEPTH: usize = 64;

/// History of stimulation-parameter edits. Cleared whenever a port scan
/// rebuilds the channels the snapshots point at.
#[derive(Debug, Clone, Default)]
pub struct UndoStack {
    entries: Vec<StimSnapshot>,
}

impl UndoStack {
    pub fn push(&mut self, snapshot: StimSnapshot) {
        if self.entries.len() == MAX_UNDO_DEPTH {
            self.entries.remove(0);
        }
        self.entries.push(snapshot);
    }

    pub fn pop(&mut self) -> Option<StimSnapshot> { self.entries.pop() }

    pub fn clear(&mut self) { self.entries.clear(); }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Ordered collection of channels sharing a physical port (or the board
/// itself, for ADC/DAC/digital signals).
#[derive(Debug, Clone)]
pub struct SignalGroup {
    name: String,
    prefix: Option<char>,
    channels: Vec<Channel>,
    items: Registry,
}

impl SignalGroup {
    fn port(letter: char) -> SignalGroup {
        let mut items = Registry::new();
        items.insert(StateItem::bool_item("PortEnabled", false));
        items.insert(StateItem::bool_item("ManualCableDelayEnabled", false));
        items.insert(StateItem::int_item("ManualCableDelay", 0, 0, 15));
        items.insert(StateItem::bool_item("AuxDigOutEnabled", false));
        items.insert(StateItem::int_item("AuxDigOutChannel", 0, 0, 15));
        SignalGroup { name: format!("Port {}", letter), prefix: Some(letter), channels: Vec::new(), items }
    }

    fn board() -> SignalGroup {
        SignalGroup {
            name: "Board".to_owned(),
            prefix: None,
            channels: Vec::new(),
            items: Registry::new(),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn prefix(&self) -> Option<char> { self.prefix }
    pub fn channels(&self) -> &[Channel] { &self.channels }
    pub fn channels_mut(&mut self) -> &mut [Channel] { self.channels.as_mut_slice() }
    pub fn items(&self) -> &Registry { &self.items }
    pub fn items_mut(&mut self) -> &mut Registry { &mut self.items }
    pub fn is_enabled(&self) -> bool {
        self.items.locate("portenabled").map(|i| i.as_bool()).unwrap_or(true)
    }

    pub fn num_channels_of_kind(&self, kind: SignalKind) -> usize {
        self.channels.iter().filter(|c| c.kind() == kind).count()
    }

    fn remove_all_channels(&mut self) { self.channels.clear(); }
}

/// A chip discovered on one port during a scan.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub port: usize,
    pub num_channels: usize,
}

#[derive(Debug, Clone)]
pub struct SignalModel {
    kind: ControllerKind,
    ports: Vec<SignalGroup>,
    board: SignalGroup,
    num_streams: usize,
    undo: UndoStack,
}

impl SignalModel {
    pub fn new(kind: ControllerKind) -> SignalModel {
        let ports = (0..kind.num_ports())
            .map(|i| SignalGroup::port((b'A' + i as u8) as char))
            .collect();
        let mut model = SignalModel {
            kind,
            ports,
            board: SignalGroup::board(),
            num_streams: 0,
            undo: UndoStack::default(),
        };
        model.populate_board_channels();
        model
    }

    pub fn controller_kind(&self) -> ControllerKind { self.kind }
    pub fn num_streams(&self) -> usize { self.num_streams }

    fn populate_board_channels(&mut self) {
        let stim = self.kind == ControllerKind::StimRecord;
        self.board.remove_all_channels();
        for i in 0..NUM_BOARD_ADCS {
            self.board.channels.push(Channel::board_channel(SignalKind::BoardAdc, i, false));
        }
        if stim {
            for i in 0..NUM_BOARD_DACS {
                self.board.channels.push(Channel::board_channel(SignalKind::BoardDac, i, true));
            }
        }
        for i in 0..NUM_DIGITAL_IN {
            self.board.channels.push(Channel::board_channel(SignalKind::BoardDigitalIn, i, false));
        }
        for i in 0..NUM_DIGITAL_OUT {
            self.board
                .channels
                .push(Channel::board_channel(SignalKind::BoardDigitalOut, i, stim));
        }
    }

    /// Rebuild the port groups from a fresh chip scan. Existing channels on
    /// every port are destroyed; board channels are preserved (their flags
    /// are user state, not scan results).
    pub fn rebuild_from_scan(&mut self, streams: &[StreamInfo]) {
        // the snapshots reference channels about to be destroyed
        self.undo.clear();
        let stim_capable = self.kind == ControllerKind::StimRecord;
        for port in self.ports.iter_mut() {
            port.remove_all_channels();
        }
        let mut channels_on_port = vec![0usize; self.ports.len()];
        let mut chips_on_port = vec![0usize; self.ports.len()];
        for (stream_index, stream) in streams.iter().enumerate() {
            let port = &mut self.ports[stream.port];
            let letter = port.prefix.unwrap();
            let base = channels_on_port[stream.port];
            let chip = chips_on_port[stream.port];
            for ch in 0..stream.num_channels {
                port.channels.push(Channel::amplifier(
                    letter,
                    base + ch,
                    stream_index,
                    ch,
                    stim_capable,
                ));
            }
            for slot in 0..AUX_PER_STREAM {
                port.channels.push(Channel::aux_input(
                    letter,
                    chip * AUX_PER_STREAM + slot,
                    stream_index,
                    slot,
                ));
            }
            port.channels.push(Channel::supply_voltage(letter, chip, stream_index));
            channels_on_port[stream.port] += stream.num_channels;
            chips_on_port[stream.port] += 1;
        }
        for (index, port) in self.ports.iter_mut().enumerate() {
            let enabled = channels_on_port[index] > 0;
            if let Some(item) = port.items.locate_mut("portenabled") {
                item.set_bool(enabled);
            }
        }
        self.num_streams = streams.len();
        log::info!(
            "signal model rebuilt: {} streams, {} amplifier channels",
            self.num_streams,
            self.num_amplifier_channels()
        );
    }

    pub fn ports(&self) -> &[SignalGroup] { &self.ports }
    pub fn ports_mut(&mut self) -> &mut [SignalGroup] { self.ports.as_mut_slice() }
    pub fn board_group(&self) -> &SignalGroup { &self.board }

    pub fn groups(&self) -> impl Iterator<Item = &SignalGroup> {
        self.ports.iter().chain(std::iter::once(&self.board))
    }

    fn groups_mut(&mut self) -> impl Iterator<Item = &mut SignalGroup> {
        self.ports.iter_mut().chain(std::iter::once(&mut self.board))
    }

    pub fn group_by_name(&self, name: &str) -> Option<&SignalGroup> {
        self.groups().find(|g| g.name.eq_ignore_ascii_case(name))
    }

    pub fn group_by_name_mut(&mut self, name: &str) -> Option<&mut SignalGroup> {
        let name = name.to_owned();
        self.groups_mut().find(|g| g.name.eq_ignore_ascii_case(&name))
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.groups().flat_map(|g| g.channels.iter()).find(|c| c.native_name.eq_ignore_ascii_case(name))
    }

    pub fn channel_by_name_mut(&mut self, name: &str) -> Option<&mut Channel> {
        let name = name.to_owned();
        self.groups_mut()
            .flat_map(|g| g.channels.iter_mut())
            .find(|c| c.native_name.eq_ignore_ascii_case(&name))
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.groups().flat_map(|g| g.channels.iter())
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.groups_mut().flat_map(|g| g.channels_mut().iter_mut())
    }

    pub fn amplifier_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels().filter(|c| c.kind() == SignalKind::Amplifier)
    }

    pub fn num_amplifier_channels(&self) -> usize { self.amplifier_channels().count() }

    /// Full ordered name list: amplifier ports (amp, aux, vdd per port),
    /// then board ADC, DAC, digital in, digital out.
    pub fn complete_channel_names(&self) -> Vec<String> {
        self.channels().map(|c| c.native_name.clone()).collect()
    }

    pub fn clear_tcp_outputs(&mut self) {
        for channel in self.channels_mut() {
            channel.clear_tcp_outputs();
        }
    }

    pub fn clear_stim_enables(&mut self) {
        for channel in self.channels_mut() {
            if let Some(item) = channel.items_mut().locate_mut("stimenabled") {
                item.set_bool(false);
            }
        }
    }

    pub fn undo_stack(&self) -> &UndoStack { &self.undo }

    /// Record a channel's pre-edit stimulation values for later undo.
    pub fn push_stim_undo(&mut self, snapshot: StimSnapshot) { self.undo.push(snapshot); }

    pub fn clear_undo_stack(&mut self) { self.undo.clear(); }

    /// Pop the most recent stimulation edit and restore the channel's prior
    /// values; returns the channel name. Snapshots whose channel no longer
    /// exists are discarded.
    pub fn undo_stim_change(&mut self) -> Option<String> {
        loop {
            let snapshot = self.undo.pop()?;
            if let Some(channel) = self.channel_by_name_mut(&snapshot.channel) {
                snapshot.params.write_to_registry(channel.items_mut());
                return Some(snapshot.channel);
            }
        }
    }

    /// True when any channel routes any band to TCP.
    pub fn any_tcp_output(&self) -> bool {
        self.channels().any(|c| match c.kind() {
            SignalKind::Amplifier => !c.tcp_bands().is_empty(),
            _ => c.output_to_tcp(),
        })
    }
}

fn auto_color(index: usize) -> &'static str {
    // 8-color cycle, matched to the display's default palette
    const PALETTE: [&str; 8] = [
        "#4a86c8", "#c84a4a", "#4ac86e", "#c8a14a", "#8e4ac8", "#4ac2c8", "#c84a9e", "#96c84a",
    ];
    PALETTE[index % PALETTE.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_32ch() -> SignalModel {
        let mut model = SignalModel::new(ControllerKind::RecordUsb3);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 32 }]);
        model
    }

    #[test]
    fn scan_creates_named_channels() {
        let model = model_32ch();
        assert_eq!(model.num_amplifier_channels(), 32);
        assert!(model.channel_by_name("A-000").is_some());
        assert!(model.channel_by_name("a-031").is_some());
        assert!(model.channel_by_name("A-AUX1").is_some());
        assert!(model.channel_by_name("A-VDD1").is_some());
        assert!(model.channel_by_name("ANALOG-IN-3").is_some());
        assert!(model.channel_by_name("DIGITAL-OUT-02").is_some());
        assert!(model.channel_by_name("B-000").is_none());
    }

    #[test]
    fn rescan_destroys_old_channels() {
        let mut model = model_32ch();
        model
            .channel_by_name_mut("A-000")
            .unwrap()
            .items_mut()
            .locate_mut("outputtotcp")
            .unwrap()
            .set_bool(true);
        model.rebuild_from_scan(&[StreamInfo { port: 1, num_channels: 16 }]);
        assert!(model.channel_by_name("A-000").is_none());
        assert_eq!(model.channel_by_name("B-015").unwrap().kind(), SignalKind::Amplifier);
        assert!(!model.group_by_name("Port A").unwrap().is_enabled());
        assert!(model.group_by_name("Port B").unwrap().is_enabled());
    }

    #[test]
    fn tcp_band_order_is_wire_order() {
        let mut model = model_32ch();
        let channel = model.channel_by_name_mut("A-005").unwrap();
        for flag in ["outputtotcphigh", "outputtotcp", "outputtotcpspike"] {
            channel.items_mut().locate_mut(flag).unwrap().set_bool(true);
        }
        assert_eq!(channel.tcp_bands(), vec![Band::Wide, Band::High, Band::Spike]);
    }

    #[test]
    fn stim_items_only_on_stim_controller() {
        let record = model_32ch();
        assert!(record.channel_by_name("A-000").unwrap().stim_parameters().is_none());

        let mut stim = SignalModel::new(ControllerKind::StimRecord);
        stim.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        let params = stim.channel_by_name("A-000").unwrap().stim_parameters().unwrap();
        assert!(!params.enabled);
        assert_eq!(params.shape, StimShape::Biphasic);
        assert!(stim.channel_by_name("ANALOG-OUT-1").unwrap().stim_capable());
        assert!(stim.channel_by_name("DIGITAL-OUT-01").unwrap().stim_capable());
        assert!(!stim.channel_by_name("ANALOG-IN-1").unwrap().stim_capable());
    }

    #[test]
    fn undo_restores_prior_stim_values() {
        let mut model = SignalModel::new(ControllerKind::StimRecord);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        let snapshot = StimSnapshot::capture(model.channel_by_name("A-003").unwrap()).unwrap();
        model.push_stim_undo(snapshot);
        {
            let items = model.channel_by_name_mut("A-003").unwrap().items_mut();
            items.locate_mut("shape").unwrap().set_from_str("Triphasic").unwrap();
            items.locate_mut("firstphaseamplitudemicroamps").unwrap().set_from_str("80").unwrap();
        }
        assert_eq!(model.undo_stim_change().as_deref(), Some("A-003"));
        let params = model.channel_by_name("A-003").unwrap().stim_parameters().unwrap();
        assert_eq!(params.shape, StimShape::Biphasic);
        assert_eq!(params.first_phase_amplitude_ua, 0.0);
        assert!(model.undo_stack().is_empty());
    }

    #[test]
    fn rescan_clears_undo_stack() {
        let mut model = SignalModel::new(ControllerKind::StimRecord);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        let snapshot = StimSnapshot::capture(model.channel_by_name("A-000").unwrap()).unwrap();
        model.push_stim_undo(snapshot);
        assert_eq!(model.undo_stack().len(), 1);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        assert!(model.undo_stack().is_empty());
    }

    #[test]
    fn stim_item_names_cover_the_registry() {
        let stim = SignalModel::new(ControllerKind::StimRecord);
        let channel = stim.board_group().channels().iter().find(|c| c.stim_capable()).unwrap();
        for name in STIM_ITEM_NAMES {
            // every undoable attribute is either present on this channel
            // kind or amplifier-only; nothing in the list is a typo
            assert!(
                channel.items().locate(name).is_some()
                    || matches!(name, "baselinevoltagevolts"),
                "{} missing from stim registry",
                name
            );
        }
        assert!(is_stim_item("Shape"));
        assert!(!is_stim_item("outputtotcp"));
    }

    #[test]
    fn clear_tcp_outputs_clears_every_flag() {
        let mut model = model_32ch();
        model
            .channel_by_name_mut("ANALOG-IN-1")
            .unwrap()
            .items_mut()
            .locate_mut("outputtotcp")
            .unwrap()
            .set_bool(true);
        assert!(model.any_tcp_output());
        model.clear_tcp_outputs();
        assert!(!model.any_tcp_output());
    }
}
