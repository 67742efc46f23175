//! Shared constants and types for the acquisition pipeline.
//!
//! Everything that crosses a module or thread boundary lives here: the USB
//! block contract, the TCP output framing constants, run modes, filter bands,
//! and the event type fanned out on the observer bus.

/// Samples carried by one data block, for every controller kind.
pub const FRAMES_PER_BLOCK: usize = 128;

/// Leads every data block coming off the USB endpoint.
pub const USB_BLOCK_MAGIC: u64 = 0xd7a2_2aa6_03b1_c2e5;

/// Leads every data block on the TCP waveform output stream.
pub const WAVEFORM_MAGIC: u32 = 0x2ef0_7a08;

/// Leads every 14-byte record on the TCP spike output stream.
pub const SPIKE_MAGIC: u32 = 0x3ae2_710f;

/// Stim event register sentinel for "this event never fires".
pub const NEVER: u16 = 65535;

/// Spike id sentinel for "no spike detected this sample".
pub const SPIKE_ID_NO_SPIKE: u8 = 0;

/// Amplifier channels carried per data stream.
pub const CHANNELS_PER_STREAM: usize = 32;

/// Auxiliary input slots per stream; sampled every 4th frame.
pub const AUX_PER_STREAM: usize = 3;

/// Board ADC / DAC channels.
pub const NUM_BOARD_ADCS: usize = 8;
pub const NUM_BOARD_DACS: usize = 8;

/// Board digital lines, one bit each in the digital in/out words.
pub const NUM_DIGITAL_IN: usize = 16;
pub const NUM_DIGITAL_OUT: usize = 16;

/// Upper bound on data blocks pulled from the board per USB read.
pub const MAX_BLOCKS_TO_READ: usize = 16;

/// AC amplifier LSB in microvolts.
pub const AMP_MICROVOLTS_PER_BIT: f32 = 0.195;

/// DC amplifier scale: volts = -0.01923 * (raw - 512).
pub const DC_AMP_VOLTS_PER_BIT: f32 = -0.01923;
pub const DC_AMP_OFFSET: f32 = 512.0;

/// Auxiliary input LSB in volts.
pub const AUX_VOLTS_PER_BIT: f32 = 37.4e-6;

/// Supply voltage LSB in volts.
pub const VDD_VOLTS_PER_BIT: f32 = 74.8e-6;

/// Board ADC/DAC LSB in volts (bipolar controllers), with 32768 midscale.
pub const ADC_VOLTS_PER_BIT: f32 = 312.5e-6;

/// Board ADC LSB in volts on the unipolar USB2 recording controller.
pub const ADC_USB2_VOLTS_PER_BIT: f32 = 50.354e-6;

/// The kind of acquisition controller on the other end of the USB cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum ControllerKind {
    RecordUsb2 = 0,
    RecordUsb3 = 1,
    StimRecord = 2,
}

impl ControllerKind {
    pub fn num_ports(&self) -> usize {
        match self {
            ControllerKind::RecordUsb3 => 8,
            _ => 4,
        }
    }

    pub fn max_streams(&self) -> usize {
        match self {
            ControllerKind::RecordUsb2 => 8,
            ControllerKind::RecordUsb3 => 32,
            ControllerKind::StimRecord => 8,
        }
    }

    pub fn has_dc_amplifiers(&self) -> bool { *self == ControllerKind::StimRecord }

    pub fn label(&self) -> &'static str {
        match self {
            ControllerKind::RecordUsb2 => "RecordUSB2",
            ControllerKind::RecordUsb3 => "RecordUSB3",
            ControllerKind::StimRecord => "StimRecord",
        }
    }
}

/// Filtered views of an amplifier channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Wide,
    Low,
    High,
    Spike,
    Dc,
    Stim,
}

impl Band {
    pub fn suffix(&self) -> &'static str {
        match self {
            Band::Wide => "WIDE",
            Band::Low => "LOW",
            Band::High => "HIGH",
            Band::Spike => "SPK",
            Band::Dc => "DC",
            Band::Stim => "STIM",
        }
    }
}

/// Run lifecycle, reported by `get runmode` in this priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Record,
    Trigger,
    Run,
    Stop,
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Record => "Record",
            RunMode::Trigger => "Trigger",
            RunMode::Run => "Run",
            RunMode::Stop => "Stop",
        }
    }
}

/// Independent read cursors on the waveform FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reader {
    Disk = 0,
    Display = 1,
    Audio = 2,
    Tcp = 3,
    Probe = 4,
}

pub const NUM_READERS: usize = 5;

impl Reader {
    pub fn index(&self) -> usize { *self as usize }
}

/// Connection lifecycle of a TCP data output endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Pending,
    Connected,
}

impl LinkStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "Disconnected",
            LinkStatus::Pending => "Pending",
            LinkStatus::Connected => "Connected",
        }
    }
}

/// Events fanned out on the observer bus.
///
/// Each observer gets its own bounded channel; publication never blocks the
/// notifying thread. See `bus.rs`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// One or more registry items changed value.
    StateChanged,
    /// Board hardware FIFO fill level, 0..=100.
    HardwareFifoReport(f64),
    /// Smoothed waveform-processor CPU load, 0..=100.
    CpuLoadReport(f64),
    /// A TCP data output endpoint changed connection status.
    TcpStatusChanged { spike_port: bool, status: LinkStatus },
    /// An annotation was inserted into the active recording.
    LiveNote { text: String, timestamp: u32 },
    /// Software or hardware FIFO filling past its comfort threshold.
    BackpressureWarning { hardware: bool, percent_full: f64 },
    /// A worker stage hit a non-recoverable fault; the run will stop.
    StageError(String),
    /// The run loop finished tearing everything down.
    Stopped,
}
