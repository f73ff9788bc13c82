//! Daemon-wide error type.
//!
//! One enum per failure kind so callers can tell retry exhaustion and
//! monitor unreachability apart from plain I/O errors.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("qemu: config: failed to find configuration file for virtual machine: {0}")]
    ConfigNotFound(String),

    #[error("qemu: config: {name}: {source}")]
    ConfigInvalid {
        name: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    /// Descriptor validation failure from the argv builder. The message is
    /// the complete user-facing text.
    #[error("{0}")]
    Config(String),

    #[error("monitor: {0}: already running")]
    AlreadyRunning(String),

    #[error("monitor: {0:?} not running")]
    NotRunning(String),

    #[error("netdev: {0}")]
    NetDev(String),

    #[error("netdev: failed ioctl {op}: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Accumulated NIC allocation/release failures, one message per line.
    #[error("{0}")]
    NicCleanup(String),

    #[error("qemu: {name}: {binary:?} failed to start: {detail}")]
    LaunchFailed {
        name: String,
        binary: String,
        detail: String,
    },

    #[error("monitor: {name}: maximum number of retries exceeded ({max})")]
    RetryExhausted { name: String, max: u32 },

    #[error("qmp: monitor socket unreachable: {0}")]
    MonitorUnreachable(#[source] io::Error),

    #[error("qmp: invalid handshake")]
    MonitorHandshake,

    #[error("qmp: {class}: {desc}")]
    MonitorCommand { class: String, desc: String },

    #[error("qmp: invalid response: {0}")]
    MonitorResponse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
