//! Data channel rendezvous: listen, let the peer connect back once, read the
//! announced payload

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::error::{Result, TransferError};
use crate::net::{recv_exact_with, tune_socket};

/// Passive (wildcard) addresses for `port`, IPv4 first then IPv6.
///
/// This is the fixed set a passive `getaddrinfo(NULL, port)` yields on a
/// dual-stack host. std exposes no passive lookup, and resolving the
/// unspecified addresses returns them unchanged, so the list is built
/// directly. A family the host lacks fails in `bind_one` and is skipped.
pub fn passive_addrs(port: u16) -> Vec<SocketAddr> {
    vec![
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    ]
}

fn bind_one(addr: &SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    // One transfer per session
    socket.listen(1)?;
    Ok(socket.into())
}

/// Listening endpoint waiting for the peer's single connect-back
pub struct DataListener {
    listener: TcpListener,
    port: u16,
}

impl DataListener {
    /// Bind the first passive address that accepts `port`
    pub fn listen(port: u16) -> Result<Self> {
        Self::listen_on(port, &passive_addrs(port))
    }

    /// Try `addrs` in order; the first successful bind wins
    pub fn listen_on(port: u16, addrs: &[SocketAddr]) -> Result<Self> {
        let mut reasons = Vec::new();
        for addr in addrs {
            match bind_one(addr) {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    debug!(%addr, port, "data channel listening");
                    return Ok(Self { listener, port });
                }
                Err(e) => {
                    debug!(%addr, error = %e, "bind attempt failed");
                    reasons.push(format!("{}: {}", addr, e));
                }
            }
        }
        Err(TransferError::Bind {
            port,
            reason: if reasons.is_empty() {
                "no candidate addresses".to_string()
            } else {
                reasons.join("; ")
            },
        })
    }

    /// Port actually bound; the command line must have advertised this one
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the peer to connect. With `deadline` set, expiry gives the
    /// retryable `AcceptTimeout`; the cancellation flag is polled every
    /// `poll` interval. Consumes the listener.
    pub fn accept_once(
        self,
        deadline: Option<Duration>,
        poll: Duration,
        cancel: &CancelFlag,
    ) -> Result<DataConnection> {
        self.listener.set_nonblocking(true).map_err(TransferError::Accept)?;
        let started = Instant::now();
        loop {
            cancel.check()?;
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false).map_err(TransferError::Accept)?;
                    tune_socket(&stream, Some(poll));
                    debug!(%peer, "data channel accepted");
                    return Ok(DataConnection { stream, peer });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(limit) = deadline {
                        let waited = started.elapsed();
                        if waited >= limit {
                            return Err(TransferError::AcceptTimeout {
                                port: self.port,
                                waited,
                            });
                        }
                    }
                    thread::sleep(poll.min(Duration::from_millis(50)));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::Accept(e)),
            }
        }
    }

    pub fn close(self) {
        drop(self.listener);
    }
}

/// The accepted connect-back connection
pub struct DataConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl DataConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read exactly `length` bytes; see [`crate::net::recv_exact_with`]
    pub fn receive<F>(&mut self, length: usize, on_wait: F) -> Result<(bool, Vec<u8>)>
    where
        F: FnMut(usize) -> Result<()>,
    {
        recv_exact_with(&mut self.stream, length, on_wait)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn free_port() -> u16 {
        let sock = TcpListener::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    }

    #[test]
    fn passive_addrs_cover_both_families_on_the_port() {
        let addrs = passive_addrs(30020);
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.ip().is_unspecified() && a.port() == 30020));
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }

    #[test]
    fn listen_accept_receive() {
        let port = free_port();
        let listener = DataListener::listen(port).unwrap();
        assert_eq!(listener.port(), port);

        let sender = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&[5u8; 1200]).unwrap();
        });
        let cancel = CancelFlag::new();
        let mut conn = listener
            .accept_once(Some(Duration::from_secs(5)), Duration::from_millis(20), &cancel)
            .unwrap();
        assert!(conn.peer().ip().is_loopback());
        let (open, data) = conn.receive(1200, |_| Ok(())).unwrap();
        assert!(open);
        assert_eq!(data, vec![5u8; 1200]);
        conn.close();
        sender.join().unwrap();
    }

    #[test]
    fn port_is_reusable_right_after_a_session() {
        let port = free_port();
        for _ in 0..2 {
            let listener = DataListener::listen(port).unwrap();
            let t = thread::spawn(move || {
                let _ = TcpStream::connect(("127.0.0.1", port)).unwrap();
            });
            let conn = listener
                .accept_once(Some(Duration::from_secs(5)), Duration::from_millis(20), &CancelFlag::new())
                .unwrap();
            conn.close();
            t.join().unwrap();
        }
    }

    #[test]
    fn bind_conflict_is_bind_failure() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let addrs = [SocketAddr::from((Ipv4Addr::LOCALHOST, port))];
        let err = DataListener::listen_on(port, &addrs).err().unwrap();
        assert!(matches!(err, TransferError::Bind { port: p, .. } if p == port));
    }

    #[test]
    fn falls_through_to_next_address() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let addrs = [
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        ];
        let listener = DataListener::listen_on(port, &addrs).unwrap();
        assert_ne!(listener.port(), port);
    }

    #[test]
    fn accept_deadline_expires() {
        let listener = DataListener::listen_on(0, &[SocketAddr::from((Ipv4Addr::LOCALHOST, 0))]).unwrap();
        let err = listener
            .accept_once(Some(Duration::from_millis(100)), Duration::from_millis(10), &CancelFlag::new())
            .err()
            .unwrap();
        assert!(err.is_retryable());
        assert!(matches!(err, TransferError::AcceptTimeout { waited, .. } if waited >= Duration::from_millis(100)));
    }

    #[test]
    fn accept_observes_cancellation() {
        let listener = DataListener::listen_on(0, &[SocketAddr::from((Ipv4Addr::LOCALHOST, 0))]).unwrap();
        let cancel = CancelFlag::new();
        let trip = cancel.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            trip.cancel();
        });
        let err = listener
            .accept_once(None, Duration::from_millis(10), &cancel)
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Aborted));
        t.join().unwrap();
    }
}
