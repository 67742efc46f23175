//! Acquisition daemon.
//!
//! Opens a board (the synthetic implementation, until a hardware driver is
//! linked in), starts the streaming pipeline, and serves the text command
//! protocol on a TCP socket. One command client at a time; commands are
//! `;`-separated, responses are newline-terminated.
//!
//!     neuracq [--listen HOST:PORT] [--controller record-usb3|record-usb2|stim]
//!             [--channels N] [--sample-rate HZ] [--data-dir PATH]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

use neuracq::api::{BusEvent, ControllerKind};
use neuracq::board::SyntheticBoard;
use neuracq::bus::EventBus;
use neuracq::cmds::CommandParser;
use neuracq::controller::Sizing;
use neuracq::signal::StreamInfo;
use neuracq::sink::FlatFileSink;
use neuracq::xpu::CpuFilter;
use neuracq::Controller;

struct Options {
    listen: String,
    kind: ControllerKind,
    channels: usize,
    sample_rate: f64,
    data_dir: String,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options {
        listen: "127.0.0.1:5000".to_owned(),
        kind: ControllerKind::RecordUsb3,
        channels: 32,
        sample_rate: 30000.0,
        data_dir: "./neuracq-data".to_owned(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next().with_context(|| format!("{} requires a value", name))
        };
        match arg.as_str() {
            "--listen" => options.listen = value("--listen")?,
            "--controller" => {
                options.kind = match value("--controller")?.as_str() {
                    "record-usb2" => ControllerKind::RecordUsb2,
                    "record-usb3" => ControllerKind::RecordUsb3,
                    "stim" => ControllerKind::StimRecord,
                    other => bail!("unknown controller type '{}'", other),
                }
            }
            "--channels" => options.channels = value("--channels")?.parse()?,
            "--sample-rate" => options.sample_rate = value("--sample-rate")?.parse()?,
            "--data-dir" => options.data_dir = value("--data-dir")?,
            "--help" | "-h" => {
                println!(
                    "usage: neuracq [--listen HOST:PORT] [--controller record-usb3|record-usb2|stim] \
                     [--channels N] [--sample-rate HZ] [--data-dir PATH]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(options)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = parse_args()?;

    let board = SyntheticBoard::new(
        options.kind,
        vec![StreamInfo { port: 0, num_channels: options.channels }],
        options.sample_rate,
    );
    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe("control-loop");
    let sizing = Sizing::for_rate(options.sample_rate, options.kind, 1);
    let mut controller = Controller::new(
        Box::new(board),
        Box::new(CpuFilter::new()),
        Box::new(FlatFileSink::new(&options.data_dir)),
        Box::new(FlatFileSink::new(&options.data_dir)),
        bus,
        sizing,
    )
    .context("pipeline startup failed")?;

    let listener = TcpListener::bind(&options.listen)
        .with_context(|| format!("couldn't listen on {}", options.listen))?;
    listener.set_nonblocking(true)?;
    log::info!("command socket listening on {}", options.listen);

    let mut client: Option<TcpStream> = None;
    let mut pending = String::new();
    let mut read_buf = [0u8; 4096];

    loop {
        // one command client at a time, like the board itself
        if client.is_none() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("command client connected from {}", peer);
                    stream.set_read_timeout(Some(Duration::from_millis(10)))?;
                    client = Some(stream);
                    pending.clear();
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => log::warn!("command accept failed: {}", err),
            }
        }

        if let Some(stream) = client.as_mut() {
            match stream.read(&mut read_buf) {
                Ok(0) => {
                    log::info!("command client disconnected");
                    client = None;
                }
                Ok(n) => {
                    pending.push_str(&String::from_utf8_lossy(&read_buf[..n]));
                    // process complete (';'-terminated) commands, keep the tail
                    if let Some(end) = pending.rfind(';') {
                        let complete = pending[..=end].to_owned();
                        pending.drain(..=end);
                        let responses =
                            CommandParser::new(&mut controller).execute_buffer(&complete);
                        for response in responses {
                            log::info!("{}", response);
                            if stream.write_all(response.as_bytes()).is_err()
                                || stream.write_all(b"\n").is_err()
                            {
                                client = None;
                                break;
                            }
                        }
                    }
                }
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                Err(err) => {
                    log::warn!("command read failed: {}", err);
                    client = None;
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(10));
        }

        while let Ok(event) = events.try_recv() {
            match event {
                BusEvent::Stopped => controller.on_stopped_event(),
                BusEvent::StageError(message) => log::error!("stage error: {}", message),
                BusEvent::BackpressureWarning { hardware, percent_full } => log::warn!(
                    "{} FIFO at {:.1}%",
                    if hardware { "hardware" } else { "software" },
                    percent_full
                ),
                _ => {}
            }
        }
        controller.service();
    }
}
