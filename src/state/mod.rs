//! Single source of truth for configuration and live status.
//!
//! All mutation happens on the control thread; worker stages either read a
//! snapshot between cycles (through the shared lock) or poll the atomic run
//! flags. Changes are announced on the observer bus as one coalesced
//! `StateChanged` per `hold_update`/`release_update` span.

pub mod item;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::{BusEvent, ControllerKind, RunMode};
use crate::bus::EventBus;
use crate::signal::{is_stim_item, SignalModel, StimSnapshot};
use item::{FilenameItem, Registry, StateItem};

/// Lock-free view of the run lifecycle for worker hot loops.
#[derive(Debug, Default)]
pub struct RunFlags {
    pub running: AtomicBool,
    pub recording: AtomicBool,
    pub trigger_set: AtomicBool,
    pub triggered: AtomicBool,
    pub sweeping: AtomicBool,
    pub upload_in_progress: AtomicBool,
}

impl RunFlags {
    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }
    pub fn is_recording(&self) -> bool { self.recording.load(Ordering::Acquire) }
    pub fn run_mode(&self) -> RunMode {
        if self.is_recording() {
            RunMode::Record
        } else if self.trigger_set.load(Ordering::Acquire) {
            RunMode::Trigger
        } else if self.is_running() {
            RunMode::Run
        } else {
            RunMode::Stop
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// Value accepted; `changed` is false when it equaled the stored value.
    Applied { changed: bool },
    /// Path resolved but the candidate value was rejected.
    Invalid { name: String, valid: String },
    /// Path resolved but the item cannot be set right now.
    Restricted(String),
    /// No item with this path.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GetOutcome {
    Found { name: String, value: String },
    /// Resolved, but the stored value is empty text.
    Empty { name: String },
    Unknown,
}

pub struct SystemState {
    globals: Registry,
    filenames: BTreeMap<String, FilenameItem>,
    pub signals: SignalModel,
    flags: Arc<RunFlags>,
    bus: Arc<EventBus>,
    hold_count: usize,
    dirty: bool,
    change_serial: u64,
}

fn build_globals(kind: ControllerKind) -> Registry {
    let mut globals = Registry::new();
    globals.insert(
        StateItem::discrete_double_item(
            "SampleRateHertz",
            30000.0,
            vec![10000.0, 20000.0, 25000.0, 30000.0],
        )
        .restricted_while_running(),
    );
    globals.insert(StateItem::enum_item("ControllerType", kind as usize, vec![
        "RecordUSB2",
        "RecordUSB3",
        "StimRecord",
    ])
    .read_only());
    globals.insert(StateItem::int_item("TCPNumDataBlocksWrite", 1, 1, 100));
    globals.insert(StateItem::enum_item("WriteToDiskLatency", 2, vec![
        "Highest", "High", "Medium", "Low", "Lowest",
    ]));
    globals.insert(StateItem::int_item("PreTriggerBufferSeconds", 2, 1, 30));
    globals.insert(StateItem::int_item("PostTriggerBufferSeconds", 1, 1, 9999));
    globals.insert(StateItem::enum_item("TriggerSource", 0, vec![
        "DIGITAL-IN-01", "DIGITAL-IN-02", "DIGITAL-IN-03", "DIGITAL-IN-04", "DIGITAL-IN-05",
        "DIGITAL-IN-06", "DIGITAL-IN-07", "DIGITAL-IN-08", "DIGITAL-IN-09", "DIGITAL-IN-10",
        "DIGITAL-IN-11", "DIGITAL-IN-12", "DIGITAL-IN-13", "DIGITAL-IN-14", "DIGITAL-IN-15",
        "DIGITAL-IN-16", "ANALOG-IN-1", "ANALOG-IN-2", "ANALOG-IN-3", "ANALOG-IN-4",
        "ANALOG-IN-5", "ANALOG-IN-6", "ANALOG-IN-7", "ANALOG-IN-8",
    ]));
    globals.insert(StateItem::enum_item("TriggerPolarity", 0, vec!["Rising", "Falling"]));
    globals.insert(StateItem::double_item("TriggerAnalogVoltageThreshold", 1.65, -10.0, 10.0, 0.01));
    globals.insert(StateItem::bool_item("AudioEnabled", false));
    globals.insert(StateItem::text_item("AudioChannel", ""));
    globals.insert(StateItem::int_item("AudioVolume", 50, 0, 100));
    globals.insert(StateItem::int_item("AudioThresholdMicroVolts", 0, 0, 200));
    globals.insert(
        StateItem::int_item("MaxBlocksToRead", 16, 1, 16).restricted_while_running(),
    );
    globals.insert(StateItem::double_item("DesiredLowerBandwidthHertz", 0.1, 0.1, 500.0, 0.1));
    globals.insert(
        StateItem::double_item("DesiredUpperBandwidthHertz", 7500.0, 100.0, 20000.0, 1.0),
    );
    globals.insert(StateItem::text_item("Note1", ""));
    globals.insert(StateItem::text_item("Note2", ""));
    globals.insert(StateItem::text_item("Note3", ""));
    if kind == ControllerKind::StimRecord {
        globals.insert(
            StateItem::discrete_double_item(
                "StimStepSizeMicroAmps",
                10.0,
                vec![0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0],
            )
            .restricted_while_running(),
        );
    }
    // live status mirrors; the orchestrator owns these
    globals.insert(StateItem::bool_item("Running", false).read_only());
    globals.insert(StateItem::bool_item("Recording", false).read_only());
    globals.insert(StateItem::bool_item("TriggerSet", false).read_only());
    globals.insert(StateItem::bool_item("Triggered", false).read_only());
    globals.insert(StateItem::bool_item("Sweeping", false).read_only());
    globals.insert(StateItem::bool_item("UploadInProgress", false).read_only());
    globals.insert(StateItem::bool_item("HeadstagePresent", false).read_only());
    globals
}

impl SystemState {
    pub fn new(kind: ControllerKind, bus: Arc<EventBus>) -> SystemState {
        let mut filenames = BTreeMap::new();
        filenames.insert("filename".to_owned(), FilenameItem::new("Filename"));
        filenames.insert("impedancefilename".to_owned(), FilenameItem::new("ImpedanceFilename"));
        SystemState {
            globals: build_globals(kind),
            filenames,
            signals: SignalModel::new(kind),
            flags: Arc::new(RunFlags::default()),
            bus,
            hold_count: 0,
            dirty: false,
            change_serial: 0,
        }
    }

    pub fn controller_kind(&self) -> ControllerKind { self.signals.controller_kind() }

    pub fn flags(&self) -> Arc<RunFlags> { self.flags.clone() }

    pub fn bus(&self) -> Arc<EventBus> { self.bus.clone() }

    pub fn sample_rate(&self) -> f64 { self.globals.locate("sampleratehertz").unwrap().as_double() }

    pub fn stim_step_size_ua(&self) -> f64 {
        self.globals.locate("stimstepsizemicroamps").map(|i| i.as_double()).unwrap_or(10.0)
    }

    pub fn globals(&self) -> &Registry { &self.globals }

    pub fn filename(&self, name: &str) -> Option<&FilenameItem> {
        self.filenames.get(&name.to_ascii_lowercase())
    }

    /// Monotonic count of emitted change events; stages use it to refresh
    /// cached configuration.
    pub fn change_serial(&self) -> u64 { self.change_serial }

    // ---- observer coalescing ----

    pub fn hold_update(&mut self) { self.hold_count += 1; }

    pub fn release_update(&mut self) {
        debug_assert!(self.hold_count > 0);
        self.hold_count -= 1;
        if self.hold_count == 0 && self.dirty {
            self.dirty = false;
            self.emit_change();
        }
    }

    pub fn force_update(&mut self) {
        self.dirty = false;
        self.emit_change();
    }

    fn emit_change(&mut self) {
        self.change_serial += 1;
        self.bus.publish(BusEvent::StateChanged);
    }

    fn queue_change(&mut self) {
        if self.hold_count > 0 {
            self.dirty = true;
        } else {
            self.dirty = false;
            self.emit_change();
        }
    }

    /// Announce a mutation made directly on the signal model (rescan,
    /// impedance results, cleared output flags).
    pub fn touch(&mut self) { self.queue_change(); }

    // ---- run flag transitions (control thread only) ----

    pub fn set_run_flags(
        &mut self,
        running: bool,
        recording: bool,
        trigger_set: bool,
        triggered: bool,
        sweeping: bool,
    ) {
        self.flags.running.store(running, Ordering::Release);
        self.flags.recording.store(recording, Ordering::Release);
        self.flags.trigger_set.store(trigger_set, Ordering::Release);
        self.flags.triggered.store(triggered, Ordering::Release);
        self.flags.sweeping.store(sweeping, Ordering::Release);
        for (name, value) in [
            ("running", running),
            ("recording", recording),
            ("triggerset", trigger_set),
            ("triggered", triggered),
            ("sweeping", sweeping),
        ] {
            if let Some(mirror) = self.globals.locate_mut(name) {
                mirror.set_bool(value);
            }
        }
        self.queue_change();
    }

    pub fn set_upload_in_progress(&mut self, value: bool) {
        self.flags.upload_in_progress.store(value, Ordering::Release);
        if let Some(mirror) = self.globals.locate_mut("uploadinprogress") {
            mirror.set_bool(value);
        }
        self.queue_change();
    }

    pub fn set_headstage_present(&mut self, value: bool) {
        if let Some(mirror) = self.globals.locate_mut("headstagepresent") {
            mirror.set_bool(value);
        }
        self.queue_change();
    }

    pub fn is_running(&self) -> bool { self.flags.is_running() }
    pub fn is_recording(&self) -> bool { self.flags.is_recording() }
    pub fn run_mode(&self) -> RunMode { self.flags.run_mode() }

    // ---- path resolution ----
    // order: filename items, channel items, port items, globals; all
    // comparisons case-insensitive

    fn split_filename_path<'a>(&self, path: &'a str) -> Option<(String, &'a str)> {
        let (head, tail) = path.split_once('.')?;
        let key = head.to_ascii_lowercase();
        if !self.filenames.contains_key(&key) {
            return None;
        }
        if tail.eq_ignore_ascii_case("path") || tail.eq_ignore_ascii_case("basefilename") {
            Some((key, tail))
        } else {
            None
        }
    }

    pub fn set_path(&mut self, path: &str, value: &str) -> SetOutcome {
        let running = self.is_running();

        if let Some((key, sub)) = self.split_filename_path(path) {
            if running {
                let name = self.filenames[&key].name().to_owned();
                return SetOutcome::Restricted(format!(
                    "{} cannot be set while the board is running",
                    name
                ));
            }
            let item = self.filenames.get_mut(&key).unwrap();
            let changed = if sub.eq_ignore_ascii_case("path") {
                item.set_path(value)
            } else {
                item.set_base_filename(value)
            };
            if changed {
                self.queue_change();
            }
            return SetOutcome::Applied { changed };
        }

        if let Some((head, attr)) = path.split_once('.') {
            // channel names embed a dash, port prefixes are one letter
            if self.signals.channel_by_name(head).is_some() {
                let head = head.to_owned();
                let attr = attr.to_owned();
                // stim edits are undoable; capture the prior values first
                let snapshot = {
                    let channel = self.signals.channel_by_name(&head).unwrap();
                    if channel.stim_capable() && is_stim_item(&attr) {
                        StimSnapshot::capture(channel)
                    } else {
                        None
                    }
                };
                let channel = self.signals.channel_by_name_mut(&head).unwrap();
                if let Some(item) = channel.items_mut().locate_mut(&attr) {
                    let outcome = Self::apply(item, value, running);
                    if matches!(outcome, SetOutcome::Applied { changed: true }) {
                        if let Some(snapshot) = snapshot {
                            self.signals.push_stim_undo(snapshot);
                        }
                    }
                    return outcome.finish(self);
                }
                return SetOutcome::Unknown;
            }
            if head.len() == 1 {
                let group_name = format!("Port {}", head.to_ascii_uppercase());
                if self.signals.group_by_name(&group_name).is_some() {
                    let attr = attr.to_owned();
                    let group = self.signals.group_by_name_mut(&group_name).unwrap();
                    if let Some(item) = group.items_mut().locate_mut(&attr) {
                        return Self::apply(item, value, running).finish(self);
                    }
                    return SetOutcome::Unknown;
                }
            }
            return SetOutcome::Unknown;
        }

        if let Some(item) = self.globals.locate_mut(path) {
            return Self::apply(item, value, running).finish(self);
        }
        SetOutcome::Unknown
    }

    fn apply(item: &mut StateItem, value: &str, running: bool) -> SetOutcome {
        if item.is_restricted(running) {
            return SetOutcome::Restricted(item.restrict_message());
        }
        match item.set_from_str(value) {
            Ok(changed) => SetOutcome::Applied { changed },
            Err(valid) => SetOutcome::Invalid { name: item.name().to_owned(), valid },
        }
    }

    pub fn get_path(&self, path: &str) -> GetOutcome {
        if let Some((key, sub)) = self.split_filename_path(path) {
            let item = &self.filenames[&key];
            let (name, value) = if sub.eq_ignore_ascii_case("path") {
                (format!("{}.Path", item.name()), item.path().to_owned())
            } else {
                (format!("{}.BaseFilename", item.name()), item.base_filename().to_owned())
            };
            return if value.is_empty() {
                GetOutcome::Empty { name }
            } else {
                GetOutcome::Found { name, value }
            };
        }

        if let Some((head, attr)) = path.split_once('.') {
            if let Some(channel) = self.signals.channel_by_name(head) {
                if let Some(item) = channel.items().locate(attr) {
                    return Self::found(
                        format!("{}.{}", channel.native_name(), item.name()),
                        item.value_string(),
                    );
                }
                return GetOutcome::Unknown;
            }
            if head.len() == 1 {
                let group_name = format!("Port {}", head.to_ascii_uppercase());
                if let Some(group) = self.signals.group_by_name(&group_name) {
                    if let Some(item) = group.items().locate(attr) {
                        return Self::found(
                            format!("{}.{}", head.to_ascii_uppercase(), item.name()),
                            item.value_string(),
                        );
                    }
                    return GetOutcome::Unknown;
                }
            }
            return GetOutcome::Unknown;
        }

        match self.globals.locate(path) {
            Some(item) => Self::found(item.name().to_owned(), item.value_string()),
            None => GetOutcome::Unknown,
        }
    }

    fn found(name: String, value: String) -> GetOutcome {
        if value.is_empty() {
            GetOutcome::Empty { name }
        } else {
            GetOutcome::Found { name, value }
        }
    }
}

/// Applies the change-event bookkeeping after a successful item mutation.
trait Finish {
    fn finish(self, state: &mut SystemState) -> SetOutcome;
}

impl Finish for SetOutcome {
    fn finish(self, state: &mut SystemState) -> SetOutcome {
        if let SetOutcome::Applied { changed: true } = self {
            state.queue_change();
        }
        self
    }
}
