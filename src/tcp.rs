//! TCP data output endpoints (waveform stream and spike stream).
//!
//! Each endpoint splits in two: a shared `EndpointConfig` the command parser
//! mutates from the control thread (host, port, connect/disconnect
//! requests), and a `DataOutputSocket` owning the actual listener and
//! connection. The socket half is moved into the TCP output worker while a
//! run is active and moved back when it parks, so no two threads ever touch
//! the sockets concurrently.
//!
//! The endpoint is the listening side: a remote analysis client connects to
//! us once `connect` has armed the listener.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{BusEvent, LinkStatus};
use crate::bus::EventBus;

pub struct EndpointConfig {
    name: &'static str,
    spike: bool,
    host: Mutex<String>,
    port: AtomicU16,
    status: AtomicU8,
    connect_requested: AtomicBool,
    disconnect_requested: AtomicBool,
}

fn status_from_u8(value: u8) -> LinkStatus {
    match value {
        2 => LinkStatus::Connected,
        1 => LinkStatus::Pending,
        _ => LinkStatus::Disconnected,
    }
}

fn status_to_u8(status: LinkStatus) -> u8 {
    match status {
        LinkStatus::Disconnected => 0,
        LinkStatus::Pending => 1,
        LinkStatus::Connected => 2,
    }
}

impl EndpointConfig {
    pub fn new(name: &'static str, spike: bool) -> Arc<EndpointConfig> {
        Arc::new(EndpointConfig {
            name,
            spike,
            host: Mutex::new(String::new()),
            port: AtomicU16::new(0),
            status: AtomicU8::new(0),
            connect_requested: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str { self.name }
    pub fn is_spike(&self) -> bool { self.spike }

    pub fn host(&self) -> String { self.host.lock().clone() }
    pub fn set_host(&self, host: &str) { *self.host.lock() = host.to_owned(); }

    pub fn port(&self) -> u16 { self.port.load(Ordering::Acquire) }
    pub fn set_port(&self, port: u16) { self.port.store(port, Ordering::Release); }

    pub fn status(&self) -> LinkStatus { status_from_u8(self.status.load(Ordering::Acquire)) }

    pub fn is_connected(&self) -> bool { self.status() == LinkStatus::Connected }

    /// Queued for whichever thread currently owns the socket half.
    pub fn request_connect(&self) { self.connect_requested.store(true, Ordering::Release); }

    pub fn request_disconnect(&self) { self.disconnect_requested.store(true, Ordering::Release); }
}

pub struct DataOutputSocket {
    config: Arc<EndpointConfig>,
    bus: Arc<EventBus>,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
}

impl DataOutputSocket {
    pub fn new(config: Arc<EndpointConfig>, bus: Arc<EventBus>) -> DataOutputSocket {
        DataOutputSocket { config, bus, listener: None, stream: None }
    }

    pub fn config(&self) -> &EndpointConfig { &self.config }

    fn set_status(&self, status: LinkStatus) {
        let prior = status_from_u8(self.config.status.swap(status_to_u8(status), Ordering::AcqRel));
        if prior != status {
            log::info!("{}: {}", self.config.name, status.label());
            self.bus
                .publish(BusEvent::TcpStatusChanged { spike_port: self.config.spike, status });
        }
    }

    /// Handle queued connect/disconnect requests and poll the listener.
    /// Called from whichever thread owns the socket, between data writes.
    pub fn service(&mut self) {
        if self.config.disconnect_requested.swap(false, Ordering::AcqRel) {
            self.drop_connection();
        }
        if self.config.connect_requested.swap(false, Ordering::AcqRel) {
            self.arm_listener();
        }
        self.poll_accept();
    }

    fn arm_listener(&mut self) {
        self.drop_connection();
        let host = self.config.host();
        let port = self.config.port();
        let addr = if host.is_empty() { format!("0.0.0.0:{}", port) } else { format!("{}:{}", host, port) };
        match TcpListener::bind(&addr) {
            Ok(listener) => {
                if let Err(err) = listener.set_nonblocking(true) {
                    log::error!("{}: couldn't make listener nonblocking: {}", self.config.name, err);
                    return;
                }
                // remember the ephemeral port when 0 was requested
                if let Ok(local) = listener.local_addr() {
                    self.config.set_port(local.port());
                }
                self.listener = Some(listener);
                self.set_status(LinkStatus::Pending);
            }
            Err(err) => {
                log::error!("{}: bind {} failed: {}", self.config.name, addr, err);
                self.bus.publish(BusEvent::StageError(format!(
                    "{} could not listen on {}: {}",
                    self.config.name, addr, err
                )));
            }
        }
    }

    fn poll_accept(&mut self) {
        if self.stream.is_some() {
            return;
        }
        let accepted = match self.listener.as_ref() {
            Some(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("{}: peer connected from {}", self.config.name, peer);
                    Some(stream)
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(err) => {
                    log::warn!("{}: accept failed: {}", self.config.name, err);
                    None
                }
            },
            None => None,
        };
        if let Some(stream) = accepted {
            // blocking stream: a stalled peer is backpressure, not data loss
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_nodelay(true);
            self.stream = Some(stream);
            self.set_status(LinkStatus::Connected);
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.listener = None;
        self.set_status(LinkStatus::Disconnected);
    }

    /// Blocking write of one flush's worth of frames. A peer error tears
    /// down the connection and reports Disconnected; data already handed to
    /// the kernel is gone with the peer.
    pub fn write_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let result = match self.stream.as_mut() {
            Some(stream) => stream.write_all(data),
            None => return,
        };
        if let Err(err) = result {
            log::warn!("{}: peer write failed: {}", self.config.name, err);
            self.drop_connection();
        }
    }
}
