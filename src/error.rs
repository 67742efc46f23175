//! Crate-wide error taxonomy.
//!
//! Worker stages convert everything into `Error` and report it on the
//! observer bus; only startup-time resource failures are allowed to abort
//! the process (by bubbling out of `main`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid value or unknown parameter path; returned to the sender,
    /// never propagated further.
    #[error("{0}")]
    Config(String),

    /// Legal value, but the item cannot be changed in the current run state.
    #[error("{0}")]
    Restricted(String),

    /// Allocation, file, or device acquisition failure. Fatal at startup.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// USB read or register write failure; halts the run.
    #[error("hardware fault: {0}")]
    Hardware(String),

    /// Malformed command text on the control socket.
    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Error { Error::Config(msg.into()) }

    pub fn restricted(msg: impl Into<String>) -> Error { Error::Restricted(msg.into()) }

    pub fn hardware(msg: impl Into<String>) -> Error { Error::Hardware(msg.into()) }

    pub fn resource(msg: impl Into<String>) -> Error { Error::Resource(msg.into()) }
}
