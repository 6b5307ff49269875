//! One command/response/transfer cycle, driven as an explicit state machine
//!
//! ```text
//! Connecting → CommandSent → AwaitingResponse ─┬─ ErrorTerminal
//!                                               └─ Listening → AckSent → Accepted
//!                                                  → Receiving → AckSent2 → Complete
//! ```
//!
//! Each state performs the work needed to leave it and names its successor.
//! Every state entered is recorded so callers and tests can see exactly which
//! path a session took.

use std::fmt;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::config::ClientConfig;
use crate::control::{ControlChannel, ControlOptions};
use crate::data::{passive_addrs, DataConnection, DataListener};
use crate::error::{AckStage, Channel, Result, TransferError};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{Command, Response};
use crate::resolver::unique_name;

// Name races with another writer before giving up
const PERSIST_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    CommandSent,
    AwaitingResponse,
    ErrorTerminal,
    Listening,
    AckSent,
    Accepted,
    Receiving,
    AckSent2,
    Complete,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub control: ControlOptions,
    /// `None` waits for the connect-back forever
    pub accept_deadline: Option<Duration>,
    pub output_dir: PathBuf,
    pub progress: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            control: ControlOptions {
                connect_timeout: cfg.connect_timeout(),
                poll_interval: cfg.poll_interval(),
            },
            accept_deadline: cfg.accept_deadline(),
            output_dir: cfg.output_dir.clone(),
            progress: cfg.progress,
        }
    }
}

/// What a completed session produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// LIST: the server's directory listing
    Listing(String),
    /// CD: the server's new working directory
    Directory(String),
    /// GET: payload written to `path`
    Saved {
        requested: String,
        path: PathBuf,
        bytes: u64,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Listing(text) => f.write_str(text),
            Outcome::Directory(dir) => write!(f, "Remote directory is now {}", dir),
            Outcome::Saved {
                requested,
                path,
                bytes,
            } => write!(
                f,
                "File \"{}\" saved as {} ({} bytes)",
                requested,
                path.display(),
                bytes
            ),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub outcome: Outcome,
    /// Non-fatal problems, e.g. the receipt ACK could not be delivered
    pub warnings: Vec<String>,
    /// Every state the session entered, in order
    pub states: Vec<State>,
}

pub struct TransferSession {
    host: String,
    port: u16,
    command: Command,
    data_port: u16,
    opts: SessionOptions,
    cancel: CancelFlag,
    logger: Arc<dyn Logger + Send + Sync>,

    state: State,
    history: Vec<State>,
    control: Option<ControlChannel>,
    response: Option<Response>,
    listener: Option<DataListener>,
    ready_acked: bool,
    data: Option<DataConnection>,
    payload: Vec<u8>,
    outcome: Option<Outcome>,
    warnings: Vec<String>,
}

impl TransferSession {
    pub fn new(host: &str, port: u16, command: Command, data_port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            command,
            data_port,
            opts: SessionOptions::default(),
            cancel: CancelFlag::new(),
            logger: Arc::new(NoopLogger),
            state: State::Connecting,
            history: Vec::new(),
            control: None,
            response: None,
            listener: None,
            ready_acked: false,
            data: None,
            payload: Vec::new(),
            outcome: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_options(mut self, opts: SessionOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger + Send + Sync>) -> Self {
        self.logger = logger;
        self
    }

    /// Use an already connected control channel instead of dialing
    /// `host:port` in `Connecting`
    pub fn with_control(mut self, control: ControlChannel) -> Self {
        self.control = Some(control);
        self
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Run to completion. On failure every open channel is closed and the
    /// received payload, if any, is discarded.
    pub fn run(mut self) -> Result<Report> {
        let started = Instant::now();
        self.logger.start(&self.peer(), &self.command, self.data_port);
        loop {
            self.history.push(self.state);
            debug!(state = ?self.state, "session state");
            if self.state == State::Complete {
                break;
            }
            match self.step() {
                Ok(next) => self.state = next,
                Err(e) => {
                    self.logger.error(&format!("{:?}", self.state), &e.to_string());
                    self.teardown();
                    return Err(e);
                }
            }
        }
        let bytes = self.payload.len() as u64;
        self.logger.done(bytes, started.elapsed().as_secs_f64());
        let outcome = self
            .outcome
            .take()
            .ok_or_else(|| TransferError::Io(std::io::Error::other("session ended without output")))?;
        Ok(Report {
            outcome,
            warnings: self.warnings,
            states: self.history,
        })
    }

    fn control(&mut self) -> Result<&mut ControlChannel> {
        self.control
            .as_mut()
            .ok_or_else(not_connected)
    }

    fn step(&mut self) -> Result<State> {
        match self.state {
            State::Connecting => {
                let mut control = match self.control.take() {
                    Some(control) => control,
                    None => ControlChannel::connect(&self.host, self.port, &self.opts.control, &self.cancel)?,
                };
                control.send_command(&self.command, self.data_port)?;
                self.control = Some(control);
                Ok(State::CommandSent)
            }
            State::CommandSent => {
                let response = self.control()?.receive_response()?;
                self.logger.response(&self.peer(), &response);
                self.response = Some(response);
                Ok(State::AwaitingResponse)
            }
            State::AwaitingResponse => match &self.response {
                Some(Response::Size(n)) => {
                    debug!(bytes = n, "server accepted command");
                    Ok(State::Listening)
                }
                _ => Ok(State::ErrorTerminal),
            },
            State::ErrorTerminal => {
                if let Some(control) = self.control.take() {
                    control.close();
                }
                let message = match self.response.take() {
                    Some(Response::Error(msg)) => msg,
                    Some(other) => other.to_line(),
                    None => String::new(),
                };
                Err(TransferError::Server {
                    host: self.host.clone(),
                    port: self.port,
                    message,
                })
            }
            State::Listening => {
                let listener = DataListener::listen_on(self.data_port, &self.listen_addrs())?;
                if listener.port() != self.data_port {
                    return Err(TransferError::Bind {
                        port: self.data_port,
                        reason: format!("bound {} instead of advertised port", listener.port()),
                    });
                }
                self.listener = Some(listener);
                // The peer connects back as soon as it sees this
                self.ready_acked = self.control()?.ack()?;
                Ok(State::AckSent)
            }
            State::AckSent => {
                if !self.ready_acked {
                    return Err(TransferError::Ack { stage: AckStage::Ready });
                }
                let listener = self
                    .listener
                    .take()
                    .ok_or_else(not_connected)?;
                let conn = listener.accept_once(
                    self.opts.accept_deadline,
                    self.opts.control.poll_interval,
                    &self.cancel,
                )?;
                info!(peer = %conn.peer(), "peer connected back");
                self.data = Some(conn);
                Ok(State::Accepted)
            }
            State::Accepted => {
                self.receive_payload()?;
                Ok(State::Receiving)
            }
            State::Receiving => {
                // The payload is complete; a lost receipt ACK only warrants a warning
                let delivered = match self.control()?.ack() {
                    Ok(sent) => sent,
                    Err(e) => {
                        debug!(error = %e, "receipt ACK failed");
                        false
                    }
                };
                if !delivered {
                    let msg = TransferError::Ack { stage: AckStage::Received }.to_string();
                    warn!("{}", msg);
                    self.logger.warning(&msg);
                    self.warnings.push(msg);
                }
                Ok(State::AckSent2)
            }
            State::AckSent2 => {
                if let Some(conn) = self.data.take() {
                    conn.close();
                }
                if let Some(control) = self.control.take() {
                    control.close();
                }
                self.outcome = Some(self.finish()?);
                Ok(State::Complete)
            }
            State::Complete => Ok(State::Complete),
        }
    }

    /// Passive addresses ordered so the control connection's family is
    /// tried first; the peer connects back to that address.
    fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = passive_addrs(self.data_port);
        let local_is_v6 = self
            .control
            .as_ref()
            .and_then(|c| c.local_addr().ok())
            .map(|a| matches!(a.ip(), IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none()))
            .unwrap_or(false);
        if local_is_v6 {
            addrs.reverse();
        }
        addrs
    }

    fn receive_payload(&mut self) -> Result<()> {
        let expected = match self.response {
            Some(Response::Size(n)) => n,
            _ => 0,
        };
        let length = usize::try_from(expected).map_err(|_| {
            TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("announced size {} does not fit in memory", expected),
            ))
        })?;

        let bar = (self.opts.progress && matches!(self.command, Command::Get(_)))
            .then(|| progress_bar(expected));
        let cancel = self.cancel.clone();
        let conn = self
            .data
            .as_mut()
            .ok_or_else(not_connected)?;
        let result = conn.receive(length, |received| {
            if let Some(pb) = &bar {
                pb.set_position(received as u64);
            }
            cancel.check()
        });
        if let Some(pb) = bar {
            pb.finish_and_clear();
        }
        let (open, data) = result?;
        if !open {
            return Err(TransferError::PeerClosedEarly {
                channel: Channel::Data,
                expected,
                received: data.len() as u64,
            });
        }
        self.payload = data;
        Ok(())
    }

    fn finish(&self) -> Result<Outcome> {
        let text = || String::from_utf8_lossy(&self.payload).into_owned();
        match &self.command {
            Command::List => Ok(Outcome::Listing(text())),
            Command::Cd(_) => Ok(Outcome::Directory(text())),
            Command::Get(name) => {
                let path = save_payload(&self.opts.output_dir, name, &self.payload)?;
                self.logger.saved(&path, self.payload.len() as u64);
                Ok(Outcome::Saved {
                    requested: name.clone(),
                    path,
                    bytes: self.payload.len() as u64,
                })
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(conn) = self.data.take() {
            conn.close();
        }
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.payload.clear();
    }
}

fn not_connected() -> TransferError {
    TransferError::Io(std::io::Error::from(std::io::ErrorKind::NotConnected))
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

/// Write `payload` under a collision-free name derived from `requested`.
/// The bytes land in a temp file first and are moved into place without
/// overwriting anything, so a partially written file is never visible under
/// the final name.
pub fn save_payload(dir: &Path, requested: &str, payload: &[u8]) -> Result<PathBuf> {
    let file_name = Path::new(requested).file_name().ok_or_else(|| TransferError::Output {
        path: dir.join(requested),
        cause: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
    })?;
    let candidate = dir.join(file_name);
    let output_err = |path: &Path, cause| TransferError::Output {
        path: path.to_path_buf(),
        cause,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| output_err(dir, e))?;
    tmp.write_all(payload).map_err(|e| output_err(tmp.path(), e))?;
    tmp.flush().map_err(|e| output_err(tmp.path(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644));
    }

    let mut attempts = 0;
    loop {
        let target = unique_name(&candidate)?;
        match tmp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists && attempts < PERSIST_ATTEMPTS => {
                attempts += 1;
                tmp = e.file;
            }
            Err(e) => return Err(output_err(&target, e.error)),
        }
    }
}
