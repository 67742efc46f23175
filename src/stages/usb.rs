//! USB reader stage: board → block FIFO.
//!
//! Pulls whole data blocks at the controller's burst cadence and pushes them
//! into the SPSC block ring. When the ring is full the reader holds the
//! block and retries; the board's hardware FIFO absorbs the backlog and its
//! fill level is reported on the observer bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::api::BusEvent;
use crate::block_fifo::BlockFifo;
use crate::board::BoardDriver;
use crate::bus::EventBus;
use crate::stages::{spawn_stage, Stage, StageControl};
use crate::state::{RunFlags, SystemState};
use crate::usb_block::BlockLayout;

const FIFO_REPORT_INTERVAL: Duration = Duration::from_millis(50);
const HARDWARE_FIFO_WARN_PERCENT: f64 = 95.0;

pub fn spawn_usb_reader(
    board: Arc<Mutex<Box<dyn BoardDriver>>>,
    fifo: Arc<BlockFifo>,
    state: Arc<RwLock<SystemState>>,
    flags: Arc<RunFlags>,
    bus: Arc<EventBus>,
) -> Stage {
    spawn_stage("usb-reader", move |control| {
        session(control, &board, &fifo, &state, &flags, &bus);
    })
}

fn session(
    control: &StageControl,
    board: &Mutex<Box<dyn BoardDriver>>,
    fifo: &BlockFifo,
    state: &RwLock<SystemState>,
    flags: &RunFlags,
    bus: &EventBus,
) {
    let block_bytes = {
        let mut board = board.lock();
        let layout = BlockLayout::new(board.controller_kind(), board.num_enabled_streams());
        if layout.bytes_per_block() > fifo.block_bytes() {
            log::error!(
                "usb-reader: {} byte blocks exceed the {} byte ring slots",
                layout.bytes_per_block(),
                fifo.block_bytes()
            );
            bus.publish(BusEvent::StageError(
                "stream count outgrew the USB ring, restart required".into(),
            ));
            flags.running.store(false, std::sync::atomic::Ordering::Release);
            return;
        }
        if let Err(err) = board.start_streaming() {
            log::error!("usb-reader: couldn't start streaming: {}", err);
            bus.publish(BusEvent::StageError(format!("USB streaming failed to start: {}", err)));
            flags.running.store(false, std::sync::atomic::Ordering::Release);
            return;
        }
        layout.bytes_per_block()
    };

    let mut scratch: Vec<u8> = Vec::with_capacity(block_bytes * crate::api::MAX_BLOCKS_TO_READ);
    let mut last_report = Instant::now() - FIFO_REPORT_INTERVAL;

    while control.keep_going() {
        let max_blocks =
            state.read().globals().locate("maxblockstoread").map(|i| i.as_int()).unwrap_or(16)
                as usize;

        scratch.clear();
        let blocks_read = match board.lock().read_blocks(max_blocks, &mut scratch) {
            Ok(n) => n,
            Err(err) => {
                log::error!("usb-reader: board read failed: {}", err);
                bus.publish(BusEvent::StageError(format!("USB read failed: {}", err)));
                flags.running.store(false, std::sync::atomic::Ordering::Release);
                break;
            }
        };

        for block in scratch.chunks_exact(block_bytes) {
            // never drop a block: spin against the ring until the processor
            // frees a slot or the run is cancelled
            while !fifo.try_push(block) {
                if !control.keep_going() {
                    break;
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        }

        if last_report.elapsed() >= FIFO_REPORT_INTERVAL {
            let percent = board.lock().hardware_fifo_percent();
            bus.publish(BusEvent::HardwareFifoReport(percent));
            if percent > HARDWARE_FIFO_WARN_PERCENT {
                log::warn!("hardware FIFO at {:.1}% - processing is not keeping up", percent);
                bus.publish(BusEvent::BackpressureWarning { hardware: true, percent_full: percent });
            }
            last_report = Instant::now();
        }

        if blocks_read == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    if let Err(err) = board.lock().stop_streaming() {
        log::warn!("usb-reader: stop streaming failed: {}", err);
    }
}
