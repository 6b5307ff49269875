//! Error kinds for a transfer session

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which of the two connections an error happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Data,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => f.write_str("control"),
            Channel::Data => f.write_str("data"),
        }
    }
}

/// Point in the protocol where an acknowledgment was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStage {
    /// Listener is ready, peer should connect back
    Ready,
    /// Whole payload arrived
    Received,
}

impl fmt::Display for AckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStage::Ready => f.write_str("listen-ready"),
            AckStage::Received => f.write_str("receipt"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    // OS error lives in the message only, not as a source
    #[error("connect {host}:{port}: {cause}")]
    Connect {
        host: String,
        port: u16,
        cause: std::io::Error,
    },

    #[error("{host}:{port} says {message}")]
    Server {
        host: String,
        port: u16,
        message: String,
    },

    #[error("bind: no valid address found for port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("accept: {0}")]
    Accept(std::io::Error),

    #[error("no connection on data port {port} after {waited:?}")]
    AcceptTimeout { port: u16, waited: Duration },

    #[error("{channel} channel closed early: received {received} of {expected} bytes")]
    PeerClosedEarly {
        channel: Channel,
        expected: u64,
        received: u64,
    },

    #[error("control channel closed while sending {stage} acknowledgment")]
    Ack { stage: AckStage },

    #[error("transfer aborted")]
    Aborted,

    #[error("write {}: {cause}", path.display())]
    Output { path: PathBuf, cause: std::io::Error },

    #[error("no free name for {}", candidate.display())]
    NoFreeName { candidate: PathBuf },

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether re-running the same invocation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::AcceptTimeout { .. })
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TransferError::Aborted => 130,
            // EX_TEMPFAIL
            e if e.is_retryable() => 75,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
