//! Wire contract shared by ftclient and ftserve
//!
//! Control channel: one command line from the client, one response line from
//! the server (a decimal byte count or free-text error), then `ACK` tokens.
//! Data channel: the server connects back and writes exactly the announced
//! number of bytes.

use std::fmt;

// Read/write granularity on both channels
pub const CHUNK_SIZE: usize = 500;

// Acknowledgment token, sent after listen-ready and after full receipt
pub const ACK: &str = "ACK";

pub mod command {
    pub const LIST: &str = "LIST";
    pub const GET: &str = "GET";
    pub const CD: &str = "CD";
}

// Error texts the reference server sends on the control channel
pub mod server_errors {
    pub const INVALID_COMMAND: &str = "INVALID COMMAND";
    pub const INVALID_RESPONSE: &str = "INVALID RESPONSE";
    pub const FILE_NOT_FOUND: &str = "FILE NOT FOUND";
    pub const DIRECTORY_NOT_FOUND: &str = "DIRECTORY NOT FOUND";
    pub const NOT_A_DIRECTORY: &str = "NOT A DIRECTORY";
    pub const ACCESS_DENIED: &str = "ACCESS DENIED";
    pub const CANNOT_TRANSFER_DIRECTORY: &str = "CANNOT TRANSFER DIRECTORY";
    pub const FILE_READ_ERROR: &str = "FILE READ ERROR";
    pub const ERROR_OCCURRED: &str = "ERROR OCCURRED";
}

pub mod timeouts {
    // Wake-up interval for blocked reads and accepts (ms)
    pub const POLL_INTERVAL_MS: u64 = 250;

    // Default wait for the peer to connect back (s); 0 waits forever
    pub const ACCEPT_SECS: u64 = 30;

    // Default control connect timeout (ms); 0 uses the OS default
    pub const CONNECT_MS: u64 = 10_000;
}

/// A request issued on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Get(String),
    Cd(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::List => command::LIST,
            Command::Get(_) => command::GET,
            Command::Cd(_) => command::CD,
        }
    }

    pub fn argument(&self) -> &str {
        match self {
            Command::List => "",
            Command::Get(name) | Command::Cd(name) => name,
        }
    }

    /// Encode as `<COMMAND> <data_port> <arg-or-empty>`.
    /// LIST keeps the trailing separator, the server trims it.
    pub fn to_line(&self, data_port: u16) -> String {
        format!("{} {} {}", self.name(), data_port, self.argument())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => f.write_str(command::LIST),
            other => write!(f, "{} {}", other.name(), other.argument()),
        }
    }
}

/// A command line as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub data_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// First token is not a known command
    UnknownCommand(String),
    /// Data port missing or not a port number
    BadPort,
}

/// Parse a received command line. Leading and trailing whitespace around the
/// argument is dropped, inner spaces are kept.
pub fn parse_request(line: &str) -> std::result::Result<Request, RequestError> {
    let line = line.trim_start();
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let name = name.trim_end();
    if ![command::LIST, command::GET, command::CD].contains(&name) {
        return Err(RequestError::UnknownCommand(name.to_string()));
    }
    let rest = rest.trim_start();
    let (port, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let data_port: u16 = port.parse().map_err(|_| RequestError::BadPort)?;
    if data_port == 0 {
        return Err(RequestError::BadPort);
    }
    let arg = arg.trim_matches(|c: char| c == '\r' || c == '\n' || c == '\t' || c == ' ');
    let command = match name {
        command::GET => Command::Get(arg.to_string()),
        command::CD => Command::Cd(arg.to_string()),
        _ => Command::List,
    };
    Ok(Request { command, data_port })
}

/// The server's reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Payload length to expect on the data channel
    Size(u64),
    /// Free-text error from the server
    Error(String),
}

impl Response {
    /// Classify a raw response. Only a run of ASCII digits (surrounding
    /// whitespace allowed) is a size; everything else is the error message.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = trimmed.parse::<u64>() {
                return Response::Size(n);
            }
        }
        Response::Error(trimmed.to_string())
    }

    pub fn to_line(&self) -> String {
        match self {
            Response::Size(n) => n.to_string(),
            Response::Error(msg) => msg.clone(),
        }
    }
}

/// True when a control message is the acknowledgment token
pub fn is_ack(raw: &[u8]) -> bool {
    String::from_utf8_lossy(raw).trim() == ACK
}
