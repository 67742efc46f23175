//! Long-lived worker stages.
//!
//! Every stage runs on its own OS thread for the life of the process and
//! parks between runs. The orchestrator activates a stage with
//! `start_running`, asks it to finish with `stop_running` (cooperative, no
//! deadline), and observes completion through `is_active`. `close` ends the
//! thread itself at process shutdown.

pub mod audio;
pub mod disk;
pub mod processor;
pub mod tcp_output;
pub mod usb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct StageControl {
    keep_going: AtomicBool,
    stop_thread: AtomicBool,
    active: AtomicBool,
}

impl StageControl {
    fn new() -> StageControl {
        StageControl {
            keep_going: AtomicBool::new(false),
            stop_thread: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// True while the current session should keep iterating.
    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::Acquire) && !self.stop_thread()
    }

    pub fn stop_thread(&self) -> bool { self.stop_thread.load(Ordering::Acquire) }
}

pub struct Stage {
    name: &'static str,
    control: Arc<StageControl>,
    join: Option<JoinHandle<()>>,
}

impl Stage {
    pub fn name(&self) -> &'static str { self.name }

    /// Unpark the worker; it enters its session body.
    pub fn start_running(&self) {
        self.control.keep_going.store(true, Ordering::Release);
    }

    /// Ask the session to wind down after its current iteration.
    pub fn stop_running(&self) {
        self.control.keep_going.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool { self.control.active.load(Ordering::Acquire) }

    /// Block until the session has parked. The caller is expected to have
    /// called `stop_running` first; this only polls.
    pub fn wait_until_parked(&self) {
        while self.is_active() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Terminate the worker thread. Only at process shutdown.
    pub fn close(&mut self) {
        self.control.keep_going.store(false, Ordering::Release);
        self.control.stop_thread.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) { self.close(); }
}

/// Spawn a parked worker. `session` is invoked each time the stage is
/// activated and returns when `control.keep_going()` goes false.
pub fn spawn_stage(
    name: &'static str,
    mut session: impl FnMut(&StageControl) + Send + 'static,
) -> Stage {
    let control = Arc::new(StageControl::new());
    let thread_control = control.clone();
    let join = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            log::debug!("{} worker started", name);
            while !thread_control.stop_thread() {
                if thread_control.keep_going.load(Ordering::Acquire) {
                    thread_control.active.store(true, Ordering::Release);
                    log::info!("{} session begins", name);
                    session(&thread_control);
                    log::info!("{} session ends", name);
                    thread_control.keep_going.store(false, Ordering::Release);
                    thread_control.active.store(false, Ordering::Release);
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            log::debug!("{} worker exited", name);
        })
        .expect("couldn't spawn worker thread");
    Stage { name, control, join: Some(join) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stage_lifecycle() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = sessions.clone();
        let mut stage = spawn_stage("test-stage", move |control| {
            counter.fetch_add(1, Ordering::SeqCst);
            while control.keep_going() {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        assert!(!stage.is_active());

        stage.start_running();
        while !stage.is_active() {
            std::thread::yield_now();
        }
        stage.stop_running();
        stage.wait_until_parked();
        assert_eq!(sessions.load(Ordering::SeqCst), 1);

        // restartable
        stage.start_running();
        while !stage.is_active() {
            std::thread::yield_now();
        }
        stage.stop_running();
        stage.wait_until_parked();
        assert_eq!(sessions.load(Ordering::SeqCst), 2);

        stage.close();
    }
}
