//! Byte-stream primitives used on both channels
//!
//! Every helper reports "peer closed" as a `false` flag instead of an error so
//! callers decide which error kind a dead channel maps to. Partial reads and
//! writes are looped over; `Interrupted` is retried. A read that times out
//! (sockets carry a short read timeout) calls the caller's `on_wait` hook,
//! which is where cancellation is observed.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use socket2::SockRef;

use crate::error::Result;
use crate::protocol::CHUNK_SIZE;

// Upper bound for the up-front allocation of an announced payload
const MAX_PREALLOC: usize = 4 * 1024 * 1024;

fn is_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Write the whole buffer. Returns `Ok(false)` if the peer closed before
/// everything was written; what part of the buffer made it out is undefined.
pub fn send_all<W: Write + ?Sized>(stream: &mut W, mut bytes: &[u8]) -> Result<bool> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Ok(false),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_closed(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    match stream.flush() {
        Ok(()) => Ok(true),
        Err(e) if is_closed(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read exactly `length` bytes in chunks of at most `CHUNK_SIZE`.
/// On early close returns `(false, partial)`; the partial bytes are not valid
/// payload.
pub fn recv_exact<R: Read + ?Sized>(stream: &mut R, length: usize) -> Result<(bool, Vec<u8>)> {
    recv_exact_with(stream, length, |_| Ok(()))
}

/// `recv_exact` with a hook called after every chunk and on every read
/// timeout, with the number of bytes collected so far. An error from the hook
/// ends the read.
pub fn recv_exact_with<R, F>(stream: &mut R, length: usize, mut on_wait: F) -> Result<(bool, Vec<u8>)>
where
    R: Read + ?Sized,
    F: FnMut(usize) -> Result<()>,
{
    let mut data = Vec::with_capacity(length.min(MAX_PREALLOC));
    let mut chunk = [0u8; CHUNK_SIZE];
    while data.len() < length {
        let want = (length - data.len()).min(CHUNK_SIZE);
        match stream.read(&mut chunk[..want]) {
            Ok(0) => return Ok((false, data)),
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                on_wait(data.len())?;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => on_wait(data.len())?,
            Err(e) if is_closed(&e) => return Ok((false, data)),
            Err(e) => return Err(e.into()),
        }
    }
    Ok((true, data))
}

/// One bounded read for a short control message. A single message is assumed
/// to arrive in one segment.
pub fn recv_line<R: Read + ?Sized>(stream: &mut R) -> Result<(bool, Vec<u8>)> {
    recv_line_with(stream, || Ok(()))
}

pub fn recv_line_with<R, F>(stream: &mut R, mut on_wait: F) -> Result<(bool, Vec<u8>)>
where
    R: Read + ?Sized,
    F: FnMut() -> Result<()>,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok((false, Vec::new())),
            Ok(n) => return Ok((true, buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => on_wait()?,
            Err(e) if is_closed(&e) => return Ok((false, Vec::new())),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Disable Nagle (control messages are tiny and latency bound), enable
/// keepalive, and set the read timeout used as the cancellation poll interval.
pub fn tune_socket(stream: &TcpStream, poll: Option<Duration>) {
    let _ = stream.set_nodelay(true);
    let _ = SockRef::from(stream).set_keepalive(true);
    if let Some(d) = poll {
        let _ = stream.set_read_timeout(Some(d));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::collections::VecDeque;
    use std::io;

    /// Replays scripted read results, then reports EOF
    struct Scripted {
        steps: VecDeque<io::Result<Vec<u8>>>,
        reads: usize,
    }

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self { steps: steps.into(), reads: 0 }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Ok(bytes.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    /// Accepts at most `limit` bytes per write; `closed_after` simulates a
    /// peer that goes away
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
        closed_after: Option<usize>,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(max) = self.closed_after {
                if self.out.len() >= max {
                    return Ok(0);
                }
            }
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn send_all_single_write() {
        let mut sink: Vec<u8> = Vec::new();
        assert!(send_all(&mut sink, b"GET 30021 secret.txt").unwrap());
        assert_eq!(sink, b"GET 30021 secret.txt");
    }

    #[test]
    fn send_all_loops_over_partial_writes() {
        let payload: Vec<u8> = (0..1234u32).map(|i| (i % 251) as u8).collect();
        let mut w = Trickle { out: Vec::new(), limit: 7, closed_after: None };
        assert!(send_all(&mut w, &payload).unwrap());
        assert_eq!(w.out, payload);
    }

    #[test]
    fn send_all_zero_write_means_closed() {
        let mut w = Trickle { out: Vec::new(), limit: 10, closed_after: Some(20) };
        assert!(!send_all(&mut w, &[1u8; 100]).unwrap());
        assert_eq!(w.out.len(), 20);
    }

    #[test]
    fn send_all_broken_pipe_means_closed() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        assert!(!send_all(&mut Broken, b"ACK").unwrap());
    }

    #[test]
    fn recv_exact_joins_reads_in_order() {
        let first = vec![b'a'; 200];
        let second = vec![b'b'; 300];
        let mut s = Scripted::new(vec![Ok(first.clone()), Ok(second.clone())]);
        let (open, data) = recv_exact(&mut s, 500).unwrap();
        assert!(open);
        assert_eq!(data.len(), 500);
        assert_eq!(&data[..200], &first[..]);
        assert_eq!(&data[200..], &second[..]);
    }

    #[test]
    fn recv_exact_reports_partial_on_early_close() {
        let mut s = Scripted::new(vec![Ok(vec![7u8; 100])]);
        let (open, data) = recv_exact(&mut s, 500).unwrap();
        assert!(!open);
        assert_eq!(data, vec![7u8; 100]);
    }

    #[test]
    fn recv_exact_never_reads_past_length() {
        // Peer sends more than announced; the extra stays in the stream
        let mut s = Scripted::new(vec![Ok(vec![1u8; 800])]);
        let (open, data) = recv_exact(&mut s, 600).unwrap();
        assert!(open);
        assert_eq!(data.len(), 600);
        assert_eq!(s.steps.front().map(|r| r.as_ref().map(|b| b.len()).ok()), Some(Some(200)));
    }

    #[test]
    fn recv_exact_reads_in_bounded_chunks() {
        let mut s = Scripted::new(vec![Ok(vec![0u8; 1500])]);
        let (open, _) = recv_exact(&mut s, 1500).unwrap();
        assert!(open);
        assert_eq!(s.reads, 3);
    }

    #[test]
    fn recv_exact_zero_length_reads_nothing() {
        let mut s = Scripted::new(vec![]);
        let (open, data) = recv_exact(&mut s, 0).unwrap();
        assert!(open);
        assert!(data.is_empty());
        assert_eq!(s.reads, 0);
    }

    #[test]
    fn recv_exact_retries_interrupts_and_timeouts() {
        let mut s = Scripted::new(vec![
            Err(io::Error::from(ErrorKind::Interrupted)),
            Ok(vec![1u8; 4]),
            Err(io::Error::from(ErrorKind::WouldBlock)),
            Ok(vec![2u8; 4]),
        ]);
        let mut waits = Vec::new();
        let (open, data) = recv_exact_with(&mut s, 8, |n| {
            waits.push(n);
            Ok(())
        })
        .unwrap();
        assert!(open);
        assert_eq!(data, [1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(waits, vec![4, 4, 8]);
    }

    #[test]
    fn recv_exact_hook_error_aborts() {
        let mut s = Scripted::new(vec![
            Ok(vec![1u8; 4]),
            Err(io::Error::from(ErrorKind::TimedOut)),
            Ok(vec![2u8; 4]),
        ]);
        let mut timeouts = 0;
        let err = recv_exact_with(&mut s, 8, |n| {
            if n == 4 {
                timeouts += 1;
                if timeouts == 2 {
                    return Err(TransferError::Aborted);
                }
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
    }

    #[test]
    fn recv_exact_connection_reset_is_close() {
        let mut s = Scripted::new(vec![
            Ok(vec![9u8; 10]),
            Err(io::Error::from(ErrorKind::ConnectionReset)),
        ]);
        let (open, data) = recv_exact(&mut s, 50).unwrap();
        assert!(!open);
        assert_eq!(data.len(), 10);
    }

    #[test]
    fn recv_line_is_one_bounded_read() {
        let mut s = Scripted::new(vec![Ok(b"42".to_vec()), Ok(b"ignored".to_vec())]);
        let (open, data) = recv_line(&mut s).unwrap();
        assert!(open);
        assert_eq!(data, b"42");
        assert_eq!(s.reads, 1);

        let mut long = Scripted::new(vec![Ok(vec![b'x'; 2000])]);
        let (_, data) = recv_line(&mut long).unwrap();
        assert_eq!(data.len(), CHUNK_SIZE);
    }

    #[test]
    fn recv_line_closed_stream() {
        let mut s = Scripted::new(vec![]);
        let (open, data) = recv_line(&mut s).unwrap();
        assert!(!open);
        assert!(data.is_empty());
    }

    #[test]
    fn recv_line_waits_through_timeouts() {
        let mut s = Scripted::new(vec![
            Err(io::Error::from(ErrorKind::WouldBlock)),
            Err(io::Error::from(ErrorKind::WouldBlock)),
            Ok(b"ACK".to_vec()),
        ]);
        let mut waits = 0;
        let (open, data) = recv_line_with(&mut s, || {
            waits += 1;
            Ok(())
        })
        .unwrap();
        assert!(open);
        assert_eq!(data, b"ACK");
        assert_eq!(waits, 2);
    }
}
