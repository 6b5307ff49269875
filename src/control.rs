//! Client side of the control channel

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelFlag;
use crate::error::{Channel, Result, TransferError};
use crate::net::{recv_line_with, send_all, tune_socket};
use crate::protocol::{Command, Response, ACK};

/// Timing knobs for the control connection
#[derive(Debug, Clone, Copy)]
pub struct ControlOptions {
    /// Per-address connect timeout; `None` blocks until the OS gives up
    pub connect_timeout: Option<Duration>,
    /// Read timeout used to poll for cancellation
    pub poll_interval: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_millis(
                crate::protocol::timeouts::CONNECT_MS,
            )),
            poll_interval: Duration::from_millis(crate::protocol::timeouts::POLL_INTERVAL_MS),
        }
    }
}

/// Byte stream carrying the control conversation
pub trait ControlStream: Read + Write + Send {
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
    fn shutdown(&self) -> std::io::Result<()>;
}

impl ControlStream for TcpStream {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// One client-initiated connection, used for a single command/response
/// exchange and its acknowledgments
pub struct ControlChannel {
    stream: Box<dyn ControlStream>,
    host: String,
    port: u16,
    cancel: CancelFlag,
}

impl ControlChannel {
    /// Resolve `host` and try each address in order until one connects
    pub fn connect(host: &str, port: u16, opts: &ControlOptions, cancel: &CancelFlag) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|cause| TransferError::Connect {
                host: host.to_string(),
                port,
                cause,
            })?
            .collect();

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no valid address found",
        );
        for addr in addrs {
            cancel.check()?;
            let attempt = match opts.connect_timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    debug!(%addr, "control channel connected");
                    tune_socket(&stream, Some(opts.poll_interval));
                    return Ok(Self::from_stream(stream, host, port, cancel));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(TransferError::Connect {
            host: host.to_string(),
            port,
            cause: last_err,
        })
    }

    /// Wrap an already connected stream; `host`/`port` only label errors
    pub fn from_stream<S>(stream: S, host: &str, port: u16, cancel: &CancelFlag) -> Self
    where
        S: ControlStream + 'static,
    {
        Self {
            stream: Box::new(stream),
            host: host.to_string(),
            port,
            cancel: cancel.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local end of the connection; the peer connects back to this host
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Send the command line. A closed stream is fatal for the session.
    pub fn send_command(&mut self, cmd: &Command, data_port: u16) -> Result<()> {
        self.cancel.check()?;
        let line = cmd.to_line(data_port);
        debug!(%line, "sending command");
        if !send_all(&mut *self.stream, line.as_bytes())? {
            return Err(TransferError::PeerClosedEarly {
                channel: Channel::Control,
                expected: line.len() as u64,
                received: 0,
            });
        }
        Ok(())
    }

    /// Wait for the single response line and classify it
    pub fn receive_response(&mut self) -> Result<Response> {
        let cancel = self.cancel.clone();
        let (open, raw) = recv_line_with(&mut *self.stream, || cancel.check())?;
        if !open {
            return Err(TransferError::PeerClosedEarly {
                channel: Channel::Control,
                expected: 1,
                received: 0,
            });
        }
        let response = Response::parse(&raw);
        debug!(?response, "response received");
        Ok(response)
    }

    /// Send the `ACK` token; `false` means the peer has gone away
    pub fn ack(&mut self) -> Result<bool> {
        send_all(&mut *self.stream, ACK.as_bytes())
    }

    pub fn close(self) {
        let _ = self.stream.shutdown();
    }
}
