//! Real-time streaming core for multi-channel neural recording and
//! stimulation controllers.
//!
//! Data path: a USB reader pulls fixed-size sample blocks from the board
//! into a lock-free SPSC ring; the waveform processor decodes them, runs
//! the filter/spike-detection capability, and commits per-channel lanes
//! into a multi-reader waveform FIFO; disk, TCP, and audio stages drain
//! their own cursors. Control path: a line-oriented TCP command surface
//! mutates the typed parameter registry and drives the orchestrator's
//! run/record/trigger/stop state machine, with changes fanned out on an
//! observer bus.
//!
//! Board access, GPU filtering, and the on-disk format are capabilities
//! (`BoardDriver`, `XpuFilter`, `RecordSink`) injected at construction;
//! synthetic implementations back the tests and the `--synthetic` binary.

pub mod api;
pub mod block_fifo;
pub mod board;
pub mod bus;
pub mod cmds;
pub mod controller;
pub mod error;
pub mod signal;
pub mod sink;
pub mod stages;
pub mod state;
pub mod stim;
pub mod tcp;
pub mod usb_block;
pub mod wavefifo;
pub mod xpu;

pub use controller::{Controller, Sizing};
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
