use std::io;
use std::path::PathBuf;

use nix::unistd::Pid;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Intel PT is not available on this system")]
    Unsupported { source: io::Error },

    #[error("Malformed Intel PT event type attribute = {value:?}")]
    PmuType { value: String },

    #[error("Invalid trace configuration: {reason}")]
    Config { reason: &'static str },

    #[error("Could not snapshot memory map of pid = {pid}")]
    MapSnapshot {
        pid: Pid,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Could not open trace event for pid = {pid}")]
    EventOpen { pid: Pid, source: nix::Error },

    #[error("Could not {op} the trace event")]
    EventControl {
        op: &'static str,
        source: nix::Error,
    },

    #[error("Could not create trace output file = {path}")]
    Output { path: PathBuf, source: io::Error },

    #[error("Could not create cancellation pipe")]
    CancelPipe { source: nix::Error },

    #[error("Could not spawn drain thread")]
    Spawn { source: io::Error },

    #[error("Could not map trace ring buffer")]
    RingMap { source: nix::Error },

    #[error("Error waiting for trace data")]
    Wait { source: nix::Error },

    #[error("Error writing trace data")]
    Write { source: io::Error },

    #[error("Drain thread panicked")]
    DrainPanicked,

    #[error("Could not close {what}")]
    Close {
        what: &'static str,
        source: nix::Error,
    },

    #[error("Trace teardown failed with {} error(s)", errors.len())]
    Teardown { errors: Vec<Error> },
}
