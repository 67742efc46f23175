//! End-to-end pipeline scenarios against the synthetic board.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{BusEvent, ControllerKind, Reader, FRAMES_PER_BLOCK};
use crate::board::{DigitalInPlan, SyntheticBoard};
use crate::bus::EventBus;
use crate::cmds::CommandParser;
use crate::controller::{Controller, Sizing};
use crate::signal::StreamInfo;
use crate::sink::MemorySink;
use crate::xpu::CpuFilter;

fn commands(controller: &mut Controller, buffer: &str) -> Vec<String> {
    CommandParser::new(controller).execute_buffer(buffer)
}

fn build(
    board: SyntheticBoard,
    sizing: Sizing,
) -> (Controller, crossbeam_channel::Receiver<BusEvent>, Arc<parking_lot::Mutex<crate::sink::MemorySinkInner>>) {
    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe("test-observer");
    let record_sink = MemorySink::new();
    let sink_handle = record_sink.handle();
    let controller = Controller::new(
        Box::new(board),
        Box::new(CpuFilter::new()),
        Box::new(record_sink),
        Box::new(MemorySink::new()),
        bus,
        sizing,
    )
    .expect("pipeline construction");
    (controller, events, sink_handle)
}

#[test]
fn basic_run_streams_and_stops_cleanly() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        20000.0,
    );
    let sizing = Sizing {
        block_fifo_blocks: 64,
        block_slot_streams: 2,
        wave_buffer_blocks: 512,
        wave_memory_blocks: 64,
    };
    let (mut controller, events, _sink) = build(board, sizing);

    assert!(commands(&mut controller, "set runmode run;").is_empty());
    assert!(controller.is_running());

    // observe the stream through the probe cursor
    let fifo = controller.wave_fifo();
    fifo.set_reader_active(Reader::Probe, true);
    let mut samples_seen = 0usize;
    let mut last_timestamp: Option<u32> = None;
    let deadline = Instant::now() + Duration::from_secs(15);
    while samples_seen < 20_000 {
        assert!(Instant::now() < deadline, "only saw {} samples", samples_seen);
        match fifo.request_read(Reader::Probe, FRAMES_PER_BLOCK) {
            Some(window) => {
                let lanes = fifo.lanes();
                for i in 0..window.len {
                    let timestamp = lanes.timestamp(window, i as isize);
                    if let Some(last) = last_timestamp {
                        assert_eq!(timestamp, last + 1, "timestamps must be contiguous");
                    }
                    last_timestamp = Some(timestamp);
                }
                drop(lanes);
                fifo.free(Reader::Probe);
                samples_seen += window.len;
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    assert!(commands(&mut controller, "set runmode stop;").is_empty());
    assert!(!controller.is_running());
    assert!(!controller.any_stage_active(), "every worker must be parked after stop");
    assert!(controller.block_fifo().is_empty(), "block ring must be reset after stop");

    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            BusEvent::HardwareFifoReport(percent) => {
                assert!(percent <= 50.0, "hardware FIFO climbed to {:.1}%", percent)
            }
            BusEvent::Stopped => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_stopped, "teardown must announce itself");
}

#[test]
fn restart_after_stop_works() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        30000.0,
    )
    .unpaced(None);
    let (mut controller, _events, _sink) = build(board, Sizing::compact());

    for _ in 0..2 {
        assert!(commands(&mut controller, "set runmode run;").is_empty());
        std::thread::sleep(Duration::from_millis(50));
        assert!(commands(&mut controller, "set runmode stop;").is_empty());
        assert!(!controller.any_stage_active());
    }
}

#[test]
fn run_refused_while_upload_in_progress() {
    let board = SyntheticBoard::new(
        ControllerKind::StimRecord,
        vec![StreamInfo { port: 0, num_channels: 16 }],
        30000.0,
    )
    .unpaced(Some(0));
    let (mut controller, _events, _sink) = build(board, Sizing::compact());
    controller.state().write().set_upload_in_progress(true);
    let responses = commands(&mut controller, "set runmode run;");
    assert_eq!(responses.len(), 1);
    assert!(responses[0].contains("cannot start running until previously started upload"));
    assert!(!controller.is_running());
}

#[test]
fn tcp_waveform_stream_end_to_end() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        30000.0,
    )
    .unpaced(None);
    let (mut controller, _events, _sink) = build(board, Sizing::compact());

    assert!(commands(
        &mut controller,
        "set a-000.outputtotcp true; set tcpnumdatablockswrite 1; \
         set tcpwaveformdataoutputhost 127.0.0.1; set tcpwaveformdataoutputport 0; \
         execute connecttcpwaveformdataoutput;",
    )
    .is_empty());

    let endpoint = controller.wave_endpoint();
    let port = endpoint.port();
    assert_ne!(port, 0, "listener should have picked an ephemeral port");
    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("client connect");
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !endpoint.is_connected() {
        assert!(Instant::now() < deadline, "endpoint never accepted");
        controller.service();
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(commands(&mut controller, "set runmode run;").is_empty());

    // one data block with a single WIDE band: magic + 128 * (timestamp + sample)
    let mut frame = vec![0u8; 4 + FRAMES_PER_BLOCK * 6];
    client.read_exact(&mut frame).expect("first TCP flush");
    assert_eq!(&frame[0..4], &crate::api::WAVEFORM_MAGIC.to_le_bytes());
    let mut previous: Option<u32> = None;
    for i in 0..FRAMES_PER_BLOCK {
        let offset = 4 + i * 6;
        let timestamp = u32::from_le_bytes(frame[offset..offset + 4].try_into().unwrap());
        if let Some(previous) = previous {
            assert_eq!(timestamp, previous + 1);
        }
        previous = Some(timestamp);
    }

    assert!(commands(&mut controller, "set runmode stop;").is_empty());
    assert!(!controller.any_stage_active());
}

#[test]
fn plain_recording_reaches_the_sink() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        30000.0,
    )
    .unpaced(None);
    let (mut controller, _events, sink) = build(board, Sizing::compact());

    assert!(commands(
        &mut controller,
        "set filename.path /tmp/neuracq-test; set filename.basefilename session1; \
         set writetodisklatency Highest; set runmode record;",
    )
    .is_empty());
    assert!(controller.flags().is_recording());

    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.lock().timestamps.len() < 4 * FRAMES_PER_BLOCK {
        assert!(Instant::now() < deadline, "recording never reached the sink");
        std::thread::sleep(Duration::from_millis(5));
    }

    // a live note lands while recording and carries a sample timestamp
    assert!(commands(&mut controller, "livenotes stim artifact check;").is_empty());
    let note_deadline = Instant::now() + Duration::from_secs(5);
    while sink.lock().notes.is_empty() {
        assert!(Instant::now() < note_deadline, "note never reached the sink");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(commands(&mut controller, "set runmode stop;").is_empty());
    let inner = sink.lock();
    assert_eq!(inner.segments_begun, 1);
    assert_eq!(inner.segments_ended, 1);
    assert_eq!(inner.timestamps[0], 0);
    let wide = &inner.u16_lanes["A-000|WIDE"];
    assert_eq!(wide.len(), inner.timestamps.len());
    let (note, note_timestamp) = &inner.notes[0];
    assert_eq!(note, "stim artifact check");
    assert!(inner.timestamps.contains(note_timestamp));
}

#[test]
fn triggered_recording_keeps_pre_trigger_buffer() {
    let sample_rate = 30000.0;
    let trigger_timestamp = 40_000u32;
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        sample_rate,
    )
    .unpaced(Some(500))
    .with_digital_in_plan(vec![DigitalInPlan { from_timestamp: trigger_timestamp, word: 0x0001 }]);
    // history must cover the full pre-trigger window
    let sizing = Sizing {
        block_fifo_blocks: 64,
        block_slot_streams: 2,
        wave_buffer_blocks: 600,
        wave_memory_blocks: 300,
    };
    let (mut controller, _events, sink) = build(board, sizing);

    assert!(commands(
        &mut controller,
        "set filename.path /tmp/neuracq-test; set filename.basefilename trig1; \
         set writetodisklatency Highest; set pretriggerbufferseconds 1; \
         set triggersource DIGITAL-IN-01; set triggerpolarity Rising; \
         set runmode trigger;",
    )
    .is_empty());

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(Instant::now() < deadline, "trigger never fired");
        {
            let inner = sink.lock();
            if inner.timestamps.iter().any(|&t| t > trigger_timestamp + 2048) {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(controller.flags().triggered.load(std::sync::atomic::Ordering::Acquire));

    assert!(commands(&mut controller, "set runmode stop;").is_empty());
    let inner = sink.lock();
    assert_eq!(inner.segments_begun, 1);
    let first = *inner.timestamps.first().unwrap();
    let pre_samples = sample_rate as u32; // one second
    assert_eq!(first, trigger_timestamp - pre_samples, "pre-trigger window must be flushed");
    assert!(inner.timestamps.contains(&trigger_timestamp));
    // contiguous from the pre-trigger start onwards
    for (index, &timestamp) in inner.timestamps.iter().enumerate() {
        assert_eq!(timestamp, first + index as u32);
    }
}

#[test]
fn impedance_measure_and_save() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        30000.0,
    )
    .unpaced(Some(0));
    let bus = Arc::new(EventBus::new());
    let listing_sink = MemorySink::new();
    let listings = listing_sink.handle();
    let mut controller = Controller::new(
        Box::new(board),
        Box::new(CpuFilter::new()),
        Box::new(MemorySink::new()),
        Box::new(listing_sink),
        bus,
        Sizing::compact(),
    )
    .unwrap();

    // saving before a filename is configured is a config error
    let responses = commands(&mut controller, "execute saveimpedance;");
    assert!(responses[0].starts_with("Error: ImpedanceFilename"));

    assert!(commands(
        &mut controller,
        "execute measureimpedance; set impedancefilename.path /tmp; \
         set impedancefilename.basefilename z.csv; execute saveimpedance;",
    )
    .is_empty());
    let listings = listings.lock();
    let text = listings.listings.get("/tmp/z.csv").expect("impedance listing");
    assert!(text.starts_with("Channel,Magnitude(ohms),Phase(degrees)"));
    assert!(text.contains("A-000,"));
    assert_eq!(text.lines().count(), 1 + 32);
}

#[test]
fn rescan_is_refused_while_running_and_rebuilds_when_stopped() {
    let board = SyntheticBoard::new(
        ControllerKind::RecordUsb3,
        vec![StreamInfo { port: 0, num_channels: 32 }],
        30000.0,
    )
    .unpaced(None);
    let (mut controller, _events, _sink) = build(board, Sizing::compact());

    assert!(commands(&mut controller, "set runmode run;").is_empty());
    assert_eq!(
        commands(&mut controller, "execute rescanports;"),
        vec!["Error: RescanPorts cannot be executed while the board is running"]
    );
    assert!(commands(&mut controller, "set runmode stop;").is_empty());

    // stim enables are cleared by a rescan
    assert!(commands(&mut controller, "execute rescanports;").is_empty());
    assert!(controller.state().read().signals.channel_by_name("A-000").is_some());
}
