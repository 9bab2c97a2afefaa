//! Error types shared across the channel pipeline.

use std::fmt;
use std::time::Duration;

use crate::packet::Protocol;

/// Classification attached to every failure surfaced through the
/// on-error callback. The pipeline decides what happens next (retry,
/// stop, or nothing) based on where the failure occurred, not on the
/// underlying error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Start,
    Stop,
    Read,
    Message,
    Write,
    Register,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Start => "START",
            ErrorKind::Stop => "STOP",
            ErrorKind::Read => "READ",
            ErrorKind::Message => "MESSAGE",
            ErrorKind::Write => "WRITE",
            ErrorKind::Register => "REGISTER",
        };
        f.write_str(name)
    }
}

/// Unified error type for channels, straps and the read pool.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("kcp: {0}")]
    Kcp(String),

    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    #[error("invalid config, field {field}: {reason}")]
    Config {
        field: &'static str,
        reason: String,
    },

    #[error("already started, id: {0}")]
    AlreadyStarted(String),

    #[error("channel is closed, id: {0}")]
    ChannelClosed(String),

    #[error("packet is not prepared")]
    NotPrepared,

    #[error("packet is already prepared")]
    AlreadyPrepared,

    #[error("packet protocol mismatch: channel {channel:?}, packet {packet:?}")]
    ProtocolMismatch { channel: Protocol, packet: Protocol },

    #[error("max channels reached on {id}: {current}/{limit}")]
    AtCapacity {
        id: String,
        current: usize,
        limit: usize,
    },

    #[error("read pool is closed")]
    PoolClosed,

    #[error("message handler panicked: {0}")]
    Handler(String),

    #[error("frame codec: {0}")]
    Frame(String),
}

impl ChannelError {
    /// Config-error shorthand used by the validation paths.
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        ChannelError::Config {
            field,
            reason: reason.into(),
        }
    }
}
