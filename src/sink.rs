//! Persistent-storage capability for the disk writer stage.
//!
//! The on-disk format itself is out of the core's hands: the stage hands
//! typed lane data to a `RecordSink` and the sink decides bytes. Two
//! implementations ship in-tree: a memory sink for tests and a flat binary
//! file set for the `--synthetic` binary mode.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::api::ControllerKind;
use crate::error::{Error, Result};

/// Everything a sink needs to reproduce the recording context.
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    pub sample_rate: f64,
    pub controller: ControllerKind,
    pub lower_bandwidth_hz: f64,
    pub upper_bandwidth_hz: f64,
    pub expander_present: bool,
    pub channels: Vec<String>,
    pub first_timestamp: u32,
}

pub trait RecordSink: Send {
    fn begin_segment(&mut self, header: &SegmentHeader) -> Result<()>;
    fn append_timestamps(&mut self, data: &[u32]) -> Result<()>;
    fn append_u16(&mut self, lane: &str, data: &[u16]) -> Result<()>;
    fn append_f32(&mut self, lane: &str, data: &[f32]) -> Result<()>;
    fn insert_live_note(&mut self, text: &str, timestamp: u32) -> Result<()>;
    fn end_segment(&mut self) -> Result<()>;

    /// Side listings (impedance reports and the like), outside any segment.
    fn write_listing(&mut self, name: &str, contents: &str) -> Result<()>;
}

/// Captures everything in memory; the handle stays readable after the stage
/// consumes the sink.
#[derive(Default)]
pub struct MemorySinkInner {
    pub segments_begun: usize,
    pub segments_ended: usize,
    pub header: Option<SegmentHeader>,
    pub timestamps: Vec<u32>,
    pub u16_lanes: HashMap<String, Vec<u16>>,
    pub f32_lanes: HashMap<String, Vec<f32>>,
    pub notes: Vec<(String, u32)>,
    pub listings: HashMap<String, String>,
}

pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

impl MemorySink {
    pub fn new() -> MemorySink { MemorySink { inner: Arc::new(Mutex::new(Default::default())) } }

    pub fn handle(&self) -> Arc<Mutex<MemorySinkInner>> { self.inner.clone() }
}

impl Default for MemorySink {
    fn default() -> Self { Self::new() }
}

impl RecordSink for MemorySink {
    fn begin_segment(&mut self, header: &SegmentHeader) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.segments_begun += 1;
        inner.header = Some(header.clone());
        Ok(())
    }

    fn append_timestamps(&mut self, data: &[u32]) -> Result<()> {
        self.inner.lock().timestamps.extend_from_slice(data);
        Ok(())
    }

    fn append_u16(&mut self, lane: &str, data: &[u16]) -> Result<()> {
        self.inner.lock().u16_lanes.entry(lane.to_owned()).or_default().extend_from_slice(data);
        Ok(())
    }

    fn append_f32(&mut self, lane: &str, data: &[f32]) -> Result<()> {
        self.inner.lock().f32_lanes.entry(lane.to_owned()).or_default().extend_from_slice(data);
        Ok(())
    }

    fn insert_live_note(&mut self, text: &str, timestamp: u32) -> Result<()> {
        self.inner.lock().notes.push((text.to_owned(), timestamp));
        Ok(())
    }

    fn end_segment(&mut self) -> Result<()> {
        self.inner.lock().segments_ended += 1;
        Ok(())
    }

    fn write_listing(&mut self, name: &str, contents: &str) -> Result<()> {
        self.inner.lock().listings.insert(name.to_owned(), contents.to_owned());
        Ok(())
    }
}

/// One directory per segment: a plain-text header, one little-endian `.dat`
/// file per lane, and a notes file.
pub struct FlatFileSink {
    base_dir: PathBuf,
    segment_index: usize,
    files: HashMap<String, BufWriter<File>>,
    notes: Option<BufWriter<File>>,
    segment_dir: Option<PathBuf>,
}

impl FlatFileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> FlatFileSink {
        FlatFileSink {
            base_dir: base_dir.into(),
            segment_index: 0,
            files: HashMap::new(),
            notes: None,
            segment_dir: None,
        }
    }

    fn lane_file(&mut self, lane: &str) -> Result<&mut BufWriter<File>> {
        if !self.files.contains_key(lane) {
            let dir = self
                .segment_dir
                .as_ref()
                .ok_or_else(|| Error::resource("append outside an open segment"))?;
            let path = dir.join(format!("{}.dat", lane.replace(['|', '/'], "_")));
            let file = File::create(&path)?;
            self.files.insert(lane.to_owned(), BufWriter::new(file));
        }
        Ok(self.files.get_mut(lane).unwrap())
    }
}

impl RecordSink for FlatFileSink {
    fn begin_segment(&mut self, header: &SegmentHeader) -> Result<()> {
        self.segment_index += 1;
        let dir = self.base_dir.join(format!("segment{:03}", self.segment_index));
        std::fs::create_dir_all(&dir)?;
        let mut text = String::new();
        text.push_str(&format!("controller: {}\n", header.controller.label()));
        text.push_str(&format!("sample_rate_hz: {}\n", header.sample_rate));
        text.push_str(&format!(
            "bandwidth_hz: {} - {}\n",
            header.lower_bandwidth_hz, header.upper_bandwidth_hz
        ));
        text.push_str(&format!("expander: {}\n", header.expander_present));
        text.push_str(&format!("first_timestamp: {}\n", header.first_timestamp));
        text.push_str(&format!("channels: {}\n", header.channels.join(",")));
        std::fs::write(dir.join("header.txt"), text)?;
        self.notes = Some(BufWriter::new(File::create(dir.join("notes.txt"))?));
        self.segment_dir = Some(dir);
        Ok(())
    }

    fn append_timestamps(&mut self, data: &[u32]) -> Result<()> {
        let file = self.lane_file("TIMESTAMPS")?;
        for &value in data {
            file.write_u32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    fn append_u16(&mut self, lane: &str, data: &[u16]) -> Result<()> {
        let file = self.lane_file(lane)?;
        for &value in data {
            file.write_u16::<LittleEndian>(value)?;
        }
        Ok(())
    }

    fn append_f32(&mut self, lane: &str, data: &[f32]) -> Result<()> {
        let file = self.lane_file(lane)?;
        for &value in data {
            file.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    fn insert_live_note(&mut self, text: &str, timestamp: u32) -> Result<()> {
        if let Some(notes) = self.notes.as_mut() {
            writeln!(notes, "{}\t{}", timestamp, text)?;
        }
        Ok(())
    }

    fn end_segment(&mut self) -> Result<()> {
        for (_, mut file) in self.files.drain() {
            file.flush()?;
        }
        if let Some(mut notes) = self.notes.take() {
            notes.flush()?;
        }
        self.segment_dir = None;
        Ok(())
    }

    fn write_listing(&mut self, name: &str, contents: &str) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::write(self.base_dir.join(name), contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SegmentHeader {
        SegmentHeader {
            sample_rate: 30000.0,
            controller: ControllerKind::RecordUsb3,
            lower_bandwidth_hz: 0.1,
            upper_bandwidth_hz: 7500.0,
            expander_present: false,
            channels: vec!["A-000".into()],
            first_timestamp: 0,
        }
    }

    #[test]
    fn memory_sink_accumulates() {
        let mut sink = MemorySink::new();
        let handle = sink.handle();
        sink.begin_segment(&header()).unwrap();
        sink.append_timestamps(&[0, 1, 2]).unwrap();
        sink.append_u16("A-000|WIDE", &[10, 20]).unwrap();
        sink.insert_live_note("stim artifact", 1).unwrap();
        sink.end_segment().unwrap();
        let inner = handle.lock();
        assert_eq!(inner.segments_begun, 1);
        assert_eq!(inner.segments_ended, 1);
        assert_eq!(inner.timestamps, vec![0, 1, 2]);
        assert_eq!(inner.u16_lanes["A-000|WIDE"], vec![10, 20]);
        assert_eq!(inner.notes, vec![("stim artifact".to_owned(), 1)]);
    }

    #[test]
    fn flat_sink_writes_files() {
        let dir = std::env::temp_dir().join(format!("neuracq-sink-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut sink = FlatFileSink::new(&dir);
        sink.begin_segment(&header()).unwrap();
        sink.append_timestamps(&[7]).unwrap();
        sink.append_u16("A-000|WIDE", &[0x1234]).unwrap();
        sink.end_segment().unwrap();
        let seg = dir.join("segment001");
        assert!(seg.join("header.txt").exists());
        assert_eq!(std::fs::read(seg.join("TIMESTAMPS.dat")).unwrap(), vec![7, 0, 0, 0]);
        assert_eq!(std::fs::read(seg.join("A-000_WIDE.dat")).unwrap(), vec![0x34, 0x12]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
