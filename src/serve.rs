//! Reference `ftserve` peer
//!
//! Serves one control connection at a time. For each: read the command line,
//! answer with a size or an error text, wait for `ACK`, connect back to the
//! client's data port, stream the payload, wait for the receipt `ACK`.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::net::{recv_line_with, send_all, tune_socket};
use crate::protocol::{is_ack, parse_request, server_errors, Command, CHUNK_SIZE};

// How long to wait on a client that went quiet mid-exchange
const CLIENT_IDLE: Duration = Duration::from_secs(60);

/// Bytes about to go out on the data channel
enum Payload {
    Text(Vec<u8>),
    File { file: File, len: u64 },
}

impl Payload {
    fn len(&self) -> u64 {
        match self {
            Payload::Text(b) => b.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }
}

pub struct FileServer {
    cwd: PathBuf,
}

impl FileServer {
    pub fn new(start_dir: &Path) -> Result<Self> {
        let cwd = fs::canonicalize(start_dir)?;
        Ok(Self { cwd })
    }

    /// Current directory; `CD` moves it and it stays moved for later clients
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Accept and handle connections one after another, forever
    pub fn run(&mut self, listener: TcpListener) -> Result<()> {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    info!(%peer, "connection");
                    if let Err(e) = self.handle_conn(stream) {
                        warn!(%peer, error = %e, "connection error during handling");
                    }
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
        Ok(())
    }

    pub fn handle_conn(&mut self, mut stream: TcpStream) -> Result<()> {
        tune_socket(&stream, None);
        let _ = stream.set_read_timeout(Some(CLIENT_IDLE));
        let peer = stream.peer_addr()?;

        let (open, raw) = read_message(&mut stream)?;
        if !open {
            info!(%peer, "disconnected");
            return Ok(());
        }
        let line = String::from_utf8_lossy(&raw);
        let request = match parse_request(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(%peer, ?e, line = %line.trim(), "invalid command");
                reply_and_close(stream, server_errors::INVALID_COMMAND);
                return Ok(());
            }
        };
        info!(%peer, command = %request.command, data_port = request.data_port, "request");

        let payload = match self.prepare(&request.command) {
            Ok(p) => p,
            Err(msg) => {
                info!(%peer, reply = msg, "sending error message");
                reply_and_close(stream, msg);
                return Ok(());
            }
        };

        if !send_all(&mut stream, payload.len().to_string().as_bytes())? {
            info!(%peer, "disconnected");
            return Ok(());
        }
        let (open, raw) = read_message(&mut stream)?;
        if !open {
            info!(%peer, "disconnected before acknowledging size");
            return Ok(());
        }
        if !is_ack(&raw) {
            warn!(%peer, "invalid response");
            reply_and_close(stream, server_errors::INVALID_RESPONSE);
            return Ok(());
        }

        let data_addr = SocketAddr::new(peer.ip(), request.data_port);
        let mut data = match TcpStream::connect(data_addr) {
            Ok(s) => s,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(TransferError::Connect {
                    host: peer.ip().to_string(),
                    port: request.data_port,
                    cause: e,
                });
            }
        };
        tune_socket(&data, None);
        info!(%data_addr, bytes = payload.len(), "sending payload");
        if !send_payload(&mut data, payload)? {
            warn!(%peer, "client disconnected before transfer was complete");
        }

        match read_message(&mut stream) {
            Ok((true, raw)) if is_ack(&raw) => info!(%peer, "transfer acknowledged"),
            Ok((true, _)) => warn!(%peer, "invalid response, transfer might not be complete"),
            _ => warn!(%peer, "disconnected before acknowledging receipt"),
        }
        let _ = data.shutdown(Shutdown::Both);
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    /// Build the payload for `cmd`, or the error text to send instead
    fn prepare(&mut self, cmd: &Command) -> std::result::Result<Payload, &'static str> {
        match cmd {
            Command::List => {
                let listing = list_dir(&self.cwd).map_err(|_| server_errors::ERROR_OCCURRED)?;
                Ok(Payload::Text(listing.into_bytes()))
            }
            Command::Get(name) => {
                let path = self.cwd.join(name);
                let md = fs::metadata(&path).map_err(|e| match e.kind() {
                    ErrorKind::NotFound => server_errors::FILE_NOT_FOUND,
                    ErrorKind::PermissionDenied => server_errors::ACCESS_DENIED,
                    _ => server_errors::ERROR_OCCURRED,
                })?;
                if md.is_dir() {
                    return Err(server_errors::CANNOT_TRANSFER_DIRECTORY);
                }
                let file = File::open(&path).map_err(|_| server_errors::FILE_READ_ERROR)?;
                Ok(Payload::File { file, len: md.len() })
            }
            Command::Cd(dir) => {
                let target = self.cwd.join(dir);
                let md = fs::metadata(&target).map_err(|e| match e.kind() {
                    ErrorKind::NotFound => server_errors::DIRECTORY_NOT_FOUND,
                    ErrorKind::PermissionDenied => server_errors::ACCESS_DENIED,
                    _ => server_errors::ERROR_OCCURRED,
                })?;
                if !md.is_dir() {
                    return Err(server_errors::NOT_A_DIRECTORY);
                }
                fs::read_dir(&target).map_err(|e| match e.kind() {
                    ErrorKind::PermissionDenied => server_errors::ACCESS_DENIED,
                    _ => server_errors::ERROR_OCCURRED,
                })?;
                self.cwd = fs::canonicalize(&target).map_err(|_| server_errors::ERROR_OCCURRED)?;
                info!(cwd = %self.cwd.display(), "changed directory");
                Ok(Payload::Text(self.cwd.to_string_lossy().into_owned().into_bytes()))
            }
        }
    }
}

/// Bind `bind` and serve from `start_dir`
pub fn serve(bind: &str, start_dir: &Path) -> Result<()> {
    let listener = TcpListener::bind(bind)?;
    let mut server = FileServer::new(start_dir)?;
    info!(%bind, dir = %server.cwd().display(), "ftserve listening");
    server.run(listener)
}

/// Names in `dir` (without `.`/`..`), sorted, one per line
pub fn list_dir(dir: &Path) -> std::io::Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    let mut out = String::new();
    for n in names {
        out.push_str(&n);
        out.push('\n');
    }
    Ok(out)
}

/// One control message; a client idle past `CLIENT_IDLE` is dropped
fn read_message(stream: &mut TcpStream) -> Result<(bool, Vec<u8>)> {
    recv_line_with(stream, || Err(std::io::Error::from(ErrorKind::TimedOut).into()))
}

fn reply_and_close(mut stream: TcpStream, msg: &str) {
    let _ = send_all(&mut stream, msg.as_bytes());
    let _ = stream.shutdown(Shutdown::Both);
}

fn send_payload(data: &mut TcpStream, payload: Payload) -> Result<bool> {
    match payload {
        Payload::Text(bytes) => {
            for chunk in bytes.chunks(CHUNK_SIZE) {
                if !send_all(data, chunk)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Payload::File { mut file, len } => {
            let mut buf = [0u8; CHUNK_SIZE];
            let mut sent = 0u64;
            while sent < len {
                let want = (len - sent).min(CHUNK_SIZE as u64) as usize;
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    // File shrank; the client sees an early close
                    break;
                }
                if !send_all(data, &buf[..n])? {
                    return Ok(false);
                }
                sent += n as u64;
            }
            Ok(sent == len)
        }
    }
}
