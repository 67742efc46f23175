//! Multi-reader waveform FIFO.
//!
//! One writer (the waveform processor) advances every lane in lock step; up
//! to five named readers (disk, display, audio, tcp, probe) follow behind on
//! independent cursors. A reader requests a window of `n` committed samples,
//! addresses lanes inside that window without copying, then frees the window
//! to advance its cursor. The writer reclaims space only up to the slowest
//! active reader, minus a history allowance that keeps recently-consumed
//! samples addressable for pre-trigger recording and sweep playback.
//!
//! Cursor bookkeeping lives under a small mutex (requests and frees are a
//! few dozen instructions); lane payloads are accessed without locks. The
//! mutex acquire/release pairs on commit and request give the necessary
//! happens-before edge, and the cursor protocol guarantees the writer and
//! any live read window never alias the same samples.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::api::{Band, ControllerKind, Reader, FRAMES_PER_BLOCK, NUM_READERS};
use crate::signal::{SignalKind, SignalModel};

/// A borrowed view of `len` committed samples starting at ring index
/// `start`. Valid until the owning reader calls `free`.
#[derive(Debug, Clone, Copy)]
pub struct ReadWindow {
    pub start: usize,
    pub len: usize,
}

struct Cells<T> {
    data: UnsafeCell<Box<[T]>>,
}

// Lane payload safety: the writer only touches ring positions in
// [written, written + space) and readers only positions inside granted
// windows; the cursor protocol keeps those ranges disjoint.
unsafe impl<T: Send> Sync for Cells<T> {}
unsafe impl<T: Send> Send for Cells<T> {}

impl<T: Copy + Default> Cells<T> {
    fn new(len: usize) -> Cells<T> {
        Cells { data: UnsafeCell::new(vec![T::default(); len].into_boxed_slice()) }
    }

    #[inline]
    fn get(&self, index: usize) -> T {
        unsafe { (*self.data.get())[index] }
    }

    #[inline]
    fn set(&self, index: usize, value: T) {
        unsafe {
            (*self.data.get())[index] = value;
        }
    }

    fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }
}

pub struct AnalogLane {
    /// Samples per stored value: 1 for full-rate, 4 for aux, one block for
    /// supply voltage.
    rate: usize,
    cells: Cells<f32>,
}

/// All lane storage, rebuilt on rescan. Stages hold a read guard for the
/// duration of one block window; rescan takes the write side while every
/// stage is parked.
pub struct LaneStore {
    ring_len: usize,
    timestamps: Cells<u32>,
    analog: Vec<AnalogLane>,
    analog_by_name: HashMap<String, usize>,
    digital: Vec<Cells<u16>>,
    digital_by_name: HashMap<String, usize>,
    amp: Vec<Cells<u16>>,
    amp_by_name: HashMap<String, usize>,
    amp_by_address: HashMap<(usize, usize, u8), usize>,
}

fn band_code(band: Band) -> u8 {
    match band {
        Band::Wide => 0,
        Band::Low => 1,
        Band::High => 2,
        Band::Spike => 3,
        Band::Dc => 4,
        Band::Stim => 5,
    }
}

impl LaneStore {
    fn empty(ring_len: usize) -> LaneStore {
        LaneStore {
            ring_len,
            timestamps: Cells::new(ring_len),
            analog: Vec::new(),
            analog_by_name: HashMap::new(),
            digital: Vec::new(),
            digital_by_name: HashMap::new(),
            amp: Vec::new(),
            amp_by_name: HashMap::new(),
            amp_by_address: HashMap::new(),
        }
    }

    pub fn ring_len(&self) -> usize { self.ring_len }

    fn add_analog(&mut self, name: String, rate: usize) {
        debug_assert!(self.ring_len % rate == 0);
        let lane = AnalogLane { rate, cells: Cells::new(self.ring_len / rate) };
        self.analog_by_name.insert(name, self.analog.len());
        self.analog.push(lane);
    }

    fn add_digital(&mut self, name: String) {
        self.digital_by_name.insert(name, self.digital.len());
        self.digital.push(Cells::new(self.ring_len));
    }

    fn add_amp(&mut self, name: String, stream: usize, channel: usize, band: Band) {
        self.amp_by_name.insert(name, self.amp.len());
        self.amp_by_address.insert((stream, channel, band_code(band)), self.amp.len());
        self.amp.push(Cells::new(self.ring_len));
    }

    pub fn analog_index(&self, name: &str) -> Option<usize> {
        self.analog_by_name.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn digital_index(&self, name: &str) -> Option<usize> {
        self.digital_by_name.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn amp_index(&self, name: &str) -> Option<usize> {
        self.amp_by_name.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn amp_address(&self, stream: usize, channel: usize, band: Band) -> Option<usize> {
        self.amp_by_address.get(&(stream, channel, band_code(band))).copied()
    }

    #[inline]
    fn wrap(&self, window: ReadWindow, i: isize) -> usize {
        let pos = window.start as isize + i;
        pos.rem_euclid(self.ring_len as isize) as usize
    }

    // writer side: `pos` is a ring sample position previously granted by
    // `write_pos()`, already wrapped by the caller via `advance()`

    pub fn put_timestamp(&self, pos: usize, value: u32) { self.timestamps.set(pos, value); }

    pub fn put_analog(&self, lane: usize, pos: usize, value: f32) {
        let lane = &self.analog[lane];
        lane.cells.set(pos / lane.rate, value);
    }

    pub fn put_digital(&self, lane: usize, pos: usize, value: u16) {
        self.digital[lane].set(pos, value);
    }

    pub fn put_amp(&self, lane: usize, pos: usize, value: u16) {
        self.amp[lane].set(pos, value);
    }

    pub fn advance(&self, pos: usize, delta: usize) -> usize { (pos + delta) % self.ring_len }

    // reader side: `i` is a sample offset into the window; negative values
    // reach back into retained history

    pub fn timestamp(&self, window: ReadWindow, i: isize) -> u32 {
        self.timestamps.get(self.wrap(window, i))
    }

    pub fn analog(&self, lane: usize, window: ReadWindow, i: isize) -> f32 {
        let lane = &self.analog[lane];
        lane.cells.get(self.wrap(window, i) / lane.rate)
    }

    pub fn digital(&self, lane: usize, window: ReadWindow, i: isize) -> u16 {
        self.digital[lane].get(self.wrap(window, i))
    }

    pub fn amp(&self, lane: usize, window: ReadWindow, i: isize) -> u16 {
        self.amp[lane].get(self.wrap(window, i))
    }

    /// Thresholded analog sample viewed as a logic level.
    pub fn analog_as_digital(&self, lane: usize, window: ReadWindow, i: isize, threshold: f32) -> u16 {
        if self.analog(lane, window, i) >= threshold { 1 } else { 0 }
    }

    fn required_bytes(&self) -> usize {
        let mut bytes = self.timestamps.len() * 4;
        for lane in &self.analog {
            bytes += lane.cells.len() * 4;
        }
        for lane in &self.digital {
            bytes += lane.len() * 2;
        }
        for lane in &self.amp {
            bytes += lane.len() * 2;
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReaderState {
    active: bool,
    /// Committed samples not yet granted or freed.
    available: u64,
    /// Size of the currently granted window, zero when none.
    window: usize,
    /// Cumulative samples freed.
    total_read: u64,
}

#[derive(Debug, Default)]
struct Cursors {
    total_written: u64,
    paused: bool,
    readers: [ReaderState; NUM_READERS],
}

impl Cursors {
    fn max_lag(&self) -> u64 {
        self.readers
            .iter()
            .filter(|r| r.active)
            .map(|r| self.total_written - r.total_read)
            .max()
            .unwrap_or(0)
    }
}

pub struct WaveformFifo {
    ring_len: usize,
    memory_len: usize,
    lanes: RwLock<LaneStore>,
    cursors: Mutex<Cursors>,
    space_freed: Condvar,
}

impl WaveformFifo {
    /// `buffer_blocks` is the total ring capacity and `memory_blocks` the
    /// history section retained behind the slowest reader; the difference is
    /// the live headroom the writer can run ahead by.
    pub fn with_capacity_blocks(buffer_blocks: usize, memory_blocks: usize) -> WaveformFifo {
        assert!(buffer_blocks > memory_blocks);
        let ring_len = buffer_blocks * FRAMES_PER_BLOCK;
        WaveformFifo {
            ring_len,
            memory_len: memory_blocks * FRAMES_PER_BLOCK,
            lanes: RwLock::new(LaneStore::empty(ring_len)),
            cursors: Mutex::new(Cursors::default()),
            space_freed: Condvar::new(),
        }
    }

    /// Standard sizing: 30 s of addressable history plus 15 s of headroom.
    pub fn for_sample_rate(sample_rate: f64) -> WaveformFifo {
        let blocks_per_second = sample_rate / FRAMES_PER_BLOCK as f64;
        let memory_blocks = (30.0 * blocks_per_second).ceil() as usize;
        let buffer_blocks = (45.0 * blocks_per_second).ceil() as usize;
        Self::with_capacity_blocks(buffer_blocks, memory_blocks)
    }

    pub fn ring_len(&self) -> usize { self.ring_len }

    /// Samples the writer may run ahead of the slowest reader. Readers must
    /// keep their request windows below this or the pipeline stalls.
    pub fn live_len(&self) -> usize { self.ring_len - self.memory_len }

    /// Rebuild every lane to match a fresh signal model. Only legal while
    /// all stages are parked; takes the lane write lock.
    pub fn update_for_rescan(&self, model: &SignalModel) {
        let mut store = LaneStore::empty(self.ring_len);
        let stim = model.controller_kind() == ControllerKind::StimRecord;
        for channel in model.channels() {
            let name = channel.native_name().to_owned();
            match channel.kind() {
                SignalKind::Amplifier => {
                    let stream = channel.stream();
                    let chip_channel = channel.chip_channel();
                    for band in [Band::Wide, Band::Low, Band::High] {
                        store.add_amp(
                            format!("{}|{}", name, band.suffix()),
                            stream,
                            chip_channel,
                            band,
                        );
                    }
                    store.add_digital(format!("{}|{}", name, Band::Spike.suffix()));
                    if stim {
                        store.add_analog(format!("{}|{}", name, Band::Dc.suffix()), 1);
                        store.add_digital(format!("{}|{}", name, Band::Stim.suffix()));
                    }
                }
                SignalKind::AuxInput => store.add_analog(name, 4),
                SignalKind::SupplyVoltage => store.add_analog(name, FRAMES_PER_BLOCK),
                SignalKind::BoardAdc | SignalKind::BoardDac => store.add_analog(name, 1),
                // per-line digital channels read bits out of the shared words
                SignalKind::BoardDigitalIn | SignalKind::BoardDigitalOut => {}
            }
        }
        store.add_digital("DIGITAL-IN-WORD".to_owned());
        store.add_digital("DIGITAL-OUT-WORD".to_owned());
        log::info!(
            "waveform fifo lanes rebuilt: {} amp, {} analog, {} digital, {:.1} MB",
            store.amp.len(),
            store.analog.len(),
            store.digital.len(),
            store.required_bytes() as f64 / 1.0e6
        );
        *self.lanes.write() = store;
        self.reset();
    }

    pub fn lanes(&self) -> RwLockReadGuard<'_, LaneStore> { self.lanes.read() }

    // ---- writer side ----

    /// Ring position where the next sample will be written.
    pub fn write_pos(&self) -> usize {
        (self.cursors.lock().total_written % self.ring_len as u64) as usize
    }

    /// Block until the writer may advance by `samples` without destroying
    /// unread or retained data. Returns false on timeout, which the caller
    /// treats as backpressure (and re-checks its stop flag).
    pub fn wait_for_space(&self, samples: usize, timeout: Duration) -> bool {
        debug_assert!(samples <= self.ring_len - self.memory_len);
        let mut cursors = self.cursors.lock();
        loop {
            let used = cursors.max_lag() as usize + self.memory_len;
            if self.ring_len - used >= samples {
                return true;
            }
            if self.space_freed.wait_for(&mut cursors, timeout).timed_out() {
                return false;
            }
        }
    }

    /// Publish `samples` freshly written samples to every active reader in
    /// one logical advance.
    pub fn commit(&self, samples: usize) {
        let mut cursors = self.cursors.lock();
        cursors.total_written += samples as u64;
        for reader in cursors.readers.iter_mut() {
            if reader.active {
                reader.available += samples as u64;
            }
        }
    }

    /// Committed-but-unread backlog of the slowest reader, relative to the
    /// writer's usable headroom. This is the software FIFO fill gauge.
    pub fn percent_full(&self) -> f64 {
        let cursors = self.cursors.lock();
        100.0 * cursors.max_lag() as f64 / (self.ring_len - self.memory_len) as f64
    }

    // ---- reader side ----

    /// Grant a window of `samples` committed samples, or `None` if the
    /// reader has not accumulated that many (or the FIFO is paused).
    pub fn request_read(&self, reader: Reader, samples: usize) -> Option<ReadWindow> {
        let mut cursors = self.cursors.lock();
        if cursors.paused {
            return None;
        }
        let state = &mut cursors.readers[reader.index()];
        if !state.active || state.available < samples as u64 {
            return None;
        }
        state.window = samples;
        Some(ReadWindow { start: (state.total_read % self.ring_len as u64) as usize, len: samples })
    }

    /// Advance the reader's cursor past its current window.
    pub fn free(&self, reader: Reader) {
        let mut cursors = self.cursors.lock();
        let state = &mut cursors.readers[reader.index()];
        let window = state.window as u64;
        state.total_read += window;
        state.available -= window;
        state.window = 0;
        drop(cursors);
        self.space_freed.notify_all();
    }

    /// Samples behind the reader's cursor that are still addressable with
    /// negative window offsets.
    pub fn words_in_memory(&self, reader: Reader) -> usize {
        let cursors = self.cursors.lock();
        let state = &cursors.readers[reader.index()];
        state.total_read.min(self.memory_len as u64) as usize
    }

    // ---- control side ----

    /// Activate or park a reader. Activation snaps its cursor to the current
    /// write position so it begins with an empty backlog.
    pub fn set_reader_active(&self, reader: Reader, active: bool) {
        let mut cursors = self.cursors.lock();
        let written = cursors.total_written;
        let state = &mut cursors.readers[reader.index()];
        state.active = active;
        state.available = 0;
        state.window = 0;
        state.total_read = written;
        drop(cursors);
        self.space_freed.notify_all();
    }

    /// Freeze all readers; requests return `None` until `reset`.
    pub fn pause(&self) {
        self.cursors.lock().paused = true;
        self.space_freed.notify_all();
    }

    /// Clear all cursors and unpause. Reader activation is preserved.
    pub fn reset(&self) {
        let mut cursors = self.cursors.lock();
        cursors.total_written = 0;
        cursors.paused = false;
        for reader in cursors.readers.iter_mut() {
            reader.available = 0;
            reader.window = 0;
            reader.total_read = 0;
        }
        drop(cursors);
        self.space_freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::StreamInfo;
    use std::sync::Arc;

    fn small_fifo() -> WaveformFifo {
        let fifo = WaveformFifo::with_capacity_blocks(8, 2);
        let mut model = SignalModel::new(ControllerKind::RecordUsb3);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 32 }]);
        fifo.update_for_rescan(&model);
        fifo
    }

    fn write_block(fifo: &WaveformFifo, first_timestamp: u32) {
        let lanes = fifo.lanes();
        let wide = lanes.amp_address(0, 0, Band::Wide).unwrap();
        let mut pos = fifo.write_pos();
        for s in 0..FRAMES_PER_BLOCK {
            let t = first_timestamp + s as u32;
            lanes.put_timestamp(pos, t);
            lanes.put_amp(wide, pos, t as u16);
            pos = lanes.advance(pos, 1);
        }
        drop(lanes);
        fifo.commit(FRAMES_PER_BLOCK);
    }

    #[test]
    fn window_granted_only_after_commit() {
        let fifo = small_fifo();
        fifo.set_reader_active(Reader::Probe, true);
        assert!(fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK).is_none());
        write_block(&fifo, 0);
        let window = fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK).unwrap();
        let lanes = fifo.lanes();
        for i in 0..FRAMES_PER_BLOCK {
            assert_eq!(lanes.timestamp(window, i as isize), i as u32);
        }
        drop(lanes);
        fifo.free(Reader::Probe);
        assert!(fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK).is_none());
    }

    #[test]
    fn writer_blocks_until_reader_frees() {
        let fifo = Arc::new(small_fifo());
        fifo.set_reader_active(Reader::Probe, true);
        // headroom is 6 blocks (8 total minus 2 memory)
        for block in 0..6 {
            assert!(fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_millis(10)));
            write_block(&fifo, (block * FRAMES_PER_BLOCK) as u32);
        }
        assert!(
            !fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_millis(20)),
            "writer should be out of space while the reader lags"
        );
        assert!((fifo.percent_full() - 100.0).abs() < 1e-9);

        let freer = {
            let fifo = fifo.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK).unwrap();
                fifo.free(Reader::Probe);
            })
        };
        assert!(fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_secs(5)));
        freer.join().unwrap();
    }

    #[test]
    fn inactive_readers_do_not_hold_space() {
        let fifo = small_fifo();
        // no reader active at all
        for block in 0..20 {
            assert!(fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_millis(5)));
            write_block(&fifo, (block * FRAMES_PER_BLOCK) as u32);
        }
    }

    #[test]
    fn activation_snaps_cursor_to_present() {
        let fifo = small_fifo();
        write_block(&fifo, 0);
        write_block(&fifo, FRAMES_PER_BLOCK as u32);
        fifo.set_reader_active(Reader::Tcp, true);
        assert!(fifo.request_read(Reader::Tcp, FRAMES_PER_BLOCK).is_none());
        write_block(&fifo, 2 * FRAMES_PER_BLOCK as u32);
        let window = fifo.request_read(Reader::Tcp, FRAMES_PER_BLOCK).unwrap();
        assert_eq!(fifo.lanes().timestamp(window, 0), 2 * FRAMES_PER_BLOCK as u32);
    }

    #[test]
    fn pause_freezes_readers() {
        let fifo = small_fifo();
        fifo.set_reader_active(Reader::Probe, true);
        write_block(&fifo, 0);
        fifo.pause();
        assert!(fifo.request_read(Reader::Probe, 1).is_none());
        fifo.reset();
        assert!(fifo.request_read(Reader::Probe, 1).is_none(), "reset clears the backlog");
        write_block(&fifo, 0);
        assert!(fifo.request_read(Reader::Probe, 1).is_some());
    }

    #[test]
    fn history_stays_addressable_behind_cursor() {
        let fifo = small_fifo();
        fifo.set_reader_active(Reader::Disk, true);
        for block in 0..4 {
            write_block(&fifo, (block * FRAMES_PER_BLOCK) as u32);
        }
        // consume three blocks
        for _ in 0..3 {
            fifo.request_read(Reader::Disk, FRAMES_PER_BLOCK).unwrap();
            fifo.free(Reader::Disk);
        }
        assert_eq!(fifo.words_in_memory(Reader::Disk), 2 * FRAMES_PER_BLOCK);
        let window = fifo.request_read(Reader::Disk, FRAMES_PER_BLOCK).unwrap();
        let lanes = fifo.lanes();
        // window starts at sample 384; -256 reaches back to sample 128
        assert_eq!(lanes.timestamp(window, -256), FRAMES_PER_BLOCK as u32);
        assert_eq!(lanes.timestamp(window, 0), 3 * FRAMES_PER_BLOCK as u32);
    }

    #[test]
    fn sub_rate_lanes_repeat_last_value() {
        let fifo = small_fifo();
        fifo.set_reader_active(Reader::Probe, true);
        {
            let lanes = fifo.lanes();
            let aux = lanes.analog_index("A-AUX1").unwrap();
            let mut pos = fifo.write_pos();
            for s in 0..FRAMES_PER_BLOCK {
                lanes.put_timestamp(pos, s as u32);
                if s % 4 == 0 {
                    lanes.put_analog(aux, pos, s as f32);
                }
                pos = lanes.advance(pos, 1);
            }
        }
        fifo.commit(FRAMES_PER_BLOCK);
        let window = fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK).unwrap();
        let lanes = fifo.lanes();
        let aux = lanes.analog_index("A-AUX1").unwrap();
        assert_eq!(lanes.analog(aux, window, 0), 0.0);
        assert_eq!(lanes.analog(aux, window, 3), 0.0);
        assert_eq!(lanes.analog(aux, window, 4), 4.0);
        assert_eq!(lanes.analog(aux, window, 7), 4.0);
    }

    #[test]
    fn lanes_exist_per_model() {
        let fifo = WaveformFifo::with_capacity_blocks(4, 1);
        let mut model = SignalModel::new(ControllerKind::StimRecord);
        model.rebuild_from_scan(&[StreamInfo { port: 0, num_channels: 16 }]);
        fifo.update_for_rescan(&model);
        let lanes = fifo.lanes();
        assert!(lanes.amp_index("A-000|WIDE").is_some());
        assert!(lanes.amp_index("A-000|LOW").is_some());
        assert!(lanes.amp_index("A-000|HIGH").is_some());
        assert!(lanes.digital_index("A-000|SPK").is_some());
        assert!(lanes.digital_index("A-000|STIM").is_some());
        assert!(lanes.analog_index("A-000|DC").is_some());
        assert!(lanes.analog_index("ANALOG-OUT-1").is_some());
        assert!(lanes.digital_index("DIGITAL-IN-WORD").is_some());
        assert_eq!(lanes.amp_address(0, 0, Band::Wide), lanes.amp_index("A-000|WIDE"));
    }

    #[test]
    fn concurrent_writer_and_readers_see_monotonic_timestamps() {
        let fifo = Arc::new(small_fifo());
        fifo.set_reader_active(Reader::Tcp, true);
        fifo.set_reader_active(Reader::Disk, true);
        let writer = {
            let fifo = fifo.clone();
            std::thread::spawn(move || {
                for block in 0..200u32 {
                    while !fifo.wait_for_space(FRAMES_PER_BLOCK, Duration::from_millis(1)) {}
                    write_block(&fifo, block * FRAMES_PER_BLOCK as u32);
                }
            })
        };
        let mut handles = Vec::new();
        for reader in [Reader::Tcp, Reader::Disk] {
            let fifo = fifo.clone();
            handles.push(std::thread::spawn(move || {
                let mut expected = 0u32;
                while expected < 200 * FRAMES_PER_BLOCK as u32 {
                    if let Some(window) = fifo.request_read(reader, FRAMES_PER_BLOCK) {
                        let lanes = fifo.lanes();
                        for i in 0..FRAMES_PER_BLOCK {
                            assert_eq!(lanes.timestamp(window, i as isize), expected + i as u32);
                        }
                        drop(lanes);
                        fifo.free(reader);
                        expected += FRAMES_PER_BLOCK as u32;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        writer.join().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
