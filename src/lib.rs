//! ftlink: file transfer over a control channel plus a connect-back data
//! channel
//!
//! The client sends one command (`LIST`, `GET name`, `CD dir`) with the port
//! it will listen on, the server answers with a byte count or an error text,
//! and after the client's `ACK` the server connects back and writes exactly
//! that many bytes.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod logger;
pub mod net;
pub mod protocol;
pub mod resolver;
pub mod serve;
pub mod session;

pub use cancel::CancelFlag;
pub use config::ClientConfig;
pub use error::{Result, TransferError};
pub use protocol::{Command, Response};
pub use resolver::unique_name;
pub use session::{Outcome, Report, SessionOptions, State, TransferSession};
