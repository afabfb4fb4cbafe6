//! Framed I/O over one connected socket.
//!
//! A `Connection` reads and writes whole frames (see `frame`) with deadline
//! semantics. Reads and writes each have their own lock, so one reader and
//! one writer may work on the same socket at the same time while two readers
//! (or two writers) are serialized.
//!
//! ## Deadlines
//!
//! One logical wait is made of many short OS waits: before every attempt the
//! socket timeout is re-armed to `min(attempt_interval, time left)`. When an
//! attempt times out the loop checks the caller's deadline and either tries
//! again, keeping all progress, or gives up with `TimedOut`. The read path
//! only touches `SO_RCVTIMEO` and the write path only `SO_SNDTIMEO`, so the
//! two never disturb each other.
//!
//! A read that times out part way through a frame leaves its progress on the
//! connection and the next read picks up from there. A write cannot be
//! resumed that way, so a write that times out after sending part of a frame
//! fails with a connection-ending error and the write side is unusable
//! afterwards.

use crate::error::{Error, Result};
use crate::runtime::frame::{encode_header, HeaderScanner, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Default per-attempt OS wait.
pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(10);

/// Default upper bound on a declared body size accepted by the read path.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Bytes inspected per header attempt.
const PEEK_LEN: usize = 64;

/// A connected byte stream that exposes its native descriptor.
///
/// All methods take `&self`: the read and write halves are used from
/// different threads at once. Implementations must be in blocking mode; the
/// connection bounds every wait through the timeout setters.
pub trait Transport: Send + Sync {
    /// Native descriptor used as the reactor registration key.
    fn raw_fd(&self) -> RawFd;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read without consuming.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions so blocked calls return.
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Tuning for the framed I/O loops.
#[derive(Debug, Clone, Copy)]
pub struct IoConfig {
    /// Upper bound on a single OS-level wait.
    pub attempt_interval: Duration,
    /// Largest declared body size the read path accepts.
    pub max_message_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Progress of a frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Looking for the header end marker.
    ReadingHeader,
    /// Header decoded; accumulating the body.
    ReadingBody {
        /// Bytes received so far.
        filled: usize,
        /// Declared body size.
        total: usize,
    },
    /// Whole body received.
    Done,
}

/// Absolute expiry of one logical operation.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// `None` or a zero timeout means wait forever.
    fn after(timeout: Option<Duration>) -> Self {
        Self {
            expires_at: timeout
                .filter(|t| !t.is_zero())
                .map(|t| Instant::now() + t),
        }
    }

    /// OS timeout for the next attempt, or `TimedOut` once expired.
    fn next_attempt(&self, interval: Duration) -> Result<Option<Duration>> {
        let Some(expires_at) = self.expires_at else {
            return Ok(None);
        };

        let remaining = expires_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TimedOut);
        }

        // The OS rejects a zero timeout
        Ok(Some(
            remaining
                .min(interval)
                .max(Duration::from_micros(100)),
        ))
    }
}

/// Frame read in progress, carried across timed-out calls.
#[derive(Debug)]
struct PartialRead {
    phase: ReadPhase,
    scanner: HeaderScanner,
    body: BytesMut,
}

impl Default for PartialRead {
    fn default() -> Self {
        Self {
            phase: ReadPhase::ReadingHeader,
            scanner: HeaderScanner::new(),
            body: BytesMut::new(),
        }
    }
}

#[derive(Debug, Default)]
struct WriteState {
    /// Part of a frame went out and the rest never will.
    torn: bool,
}

/// One connected socket with framed, deadline-bounded reads and writes.
pub struct Connection {
    transport: Box<dyn Transport>,
    fd: RawFd,
    peer: Option<SocketAddr>,
    config: IoConfig,
    read_state: Mutex<PartialRead>,
    write_state: Mutex<WriteState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected transport with default tuning.
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_config(transport, IoConfig::default())
    }

    /// Wrap a connected transport.
    ///
    /// The descriptor is resolved once here and never changes.
    pub fn with_config<T: Transport + 'static>(transport: T, config: IoConfig) -> Self {
        let fd = transport.raw_fd();
        let peer = transport.peer_addr().ok();
        Self {
            transport: Box::new(transport),
            fd,
            peer,
            config,
            read_state: Mutex::new(PartialRead::default()),
            write_state: Mutex::new(WriteState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Native descriptor of the underlying socket.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Remote address, if the transport reported one at wrap time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read one whole frame and return its body.
    ///
    /// Blocks until the frame is complete, the deadline passes, or the
    /// connection fails. Concurrent readers queue on the read lock; the
    /// deadline starts counting before the lock is taken.
    ///
    /// On `TimedOut` the bytes already consumed stay with the connection and
    /// the next call continues the same frame.
    pub fn read_message(&self, timeout: Option<Duration>) -> Result<Bytes> {
        self.ensure_open()?;
        let deadline = Deadline::after(timeout);

        let mut partial = lock(&self.read_state);
        self.read_locked(&mut partial, &deadline)
    }

    /// Like `read_message`, but returns `Ok(None)` at once if another thread
    /// is already reading from this connection.
    pub fn try_read_message(&self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let deadline = Deadline::after(timeout);

        let mut partial = match self.read_state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        self.read_locked(&mut partial, &deadline).map(Some)
    }

    /// Write one whole frame carrying `payload`.
    ///
    /// Returns the number of body bytes written. A `TimedOut` means nothing
    /// was sent. If the deadline passes after part of the frame went out the
    /// call fails with `Io` (kind `TimedOut`) and every later write fails
    /// with `InvalidState`.
    pub fn write_message(&self, payload: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.ensure_open()?;
        let header = encode_header(payload.len())?;
        let deadline = Deadline::after(timeout);

        let mut state = lock(&self.write_state);
        if state.torn {
            return Err(Error::InvalidState("previous write left a partial frame"));
        }

        let mut sent = 0;
        let result = self
            .write_all(&header, &deadline, &mut sent)
            .and_then(|()| self.write_all(payload, &deadline, &mut sent));

        match result {
            Ok(()) => {
                trace!(fd = self.fd, msg_size = payload.len(), "Wrote message");
                Ok(payload.len())
            }
            Err(e) if sent == 0 => Err(e),
            Err(Error::TimedOut) => {
                state.torn = true;
                warn!(
                    fd = self.fd,
                    sent,
                    frame_len = HEADER_LEN + payload.len(),
                    "Write deadline passed mid-frame"
                );
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline passed mid-frame",
                )))
            }
            Err(e) => {
                state.torn = true;
                Err(e)
            }
        }
    }

    /// Shut the socket down.
    ///
    /// Later calls fail with `InvalidState`; calls already blocked fail on
    /// their next attempt. The descriptor itself is released when the last
    /// handle is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.transport.shutdown() {
            debug!(fd = self.fd, error = %e, "Shutdown failed");
        }
        debug!(fd = self.fd, peer = ?self.peer, "Connection closed");
    }

    fn read_locked(&self, partial: &mut PartialRead, deadline: &Deadline) -> Result<Bytes> {
        let result = self.read_frame(partial, deadline);
        match &result {
            Ok(_) => {}
            Err(Error::TimedOut) => {
                trace!(fd = self.fd, phase = ?partial.phase, "Read paused, progress kept");
            }
            Err(e) => {
                trace!(fd = self.fd, phase = ?partial.phase, error = %e, "Read aborted");
                *partial = PartialRead::default();
            }
        }
        result
    }

    fn read_frame(&self, partial: &mut PartialRead, deadline: &Deadline) -> Result<Bytes> {
        if matches!(partial.phase, ReadPhase::ReadingHeader) {
            let msg_size = self.read_header(&mut partial.scanner, deadline)?;
            partial.scanner = HeaderScanner::new();

            if msg_size > self.config.max_message_size {
                warn!(
                    fd = self.fd,
                    msg_size,
                    max = self.config.max_message_size,
                    "Declared message size over limit"
                );
                return Err(Error::Protocol(format!(
                    "declared size {} exceeds limit {}",
                    msg_size, self.config.max_message_size
                )));
            }

            partial.body = BytesMut::zeroed(msg_size);
            partial.phase = ReadPhase::ReadingBody {
                filled: 0,
                total: msg_size,
            };
        }

        self.read_body(&mut partial.body, &mut partial.phase, deadline)?;

        let body = std::mem::take(&mut partial.body).freeze();
        partial.phase = ReadPhase::ReadingHeader;
        trace!(fd = self.fd, msg_size = body.len(), "Read message");
        Ok(body)
    }

    fn read_header(&self, scanner: &mut HeaderScanner, deadline: &Deadline) -> Result<usize> {
        let mut buf = [0u8; PEEK_LEN];

        loop {
            self.arm_read(deadline)?;

            let available = match self.transport.peek(&mut buf) {
                Ok(0) => return Err(self.disconnected("header")),
                Ok(n) => n,
                Err(ref e) if is_retryable(e) => continue,
                Err(ref e) if is_peer_gone(e) => return Err(self.disconnected("header")),
                Err(e) => return Err(self.io_failure(e)),
            };

            // Consume only header bytes, leaving the body in the socket
            let wanted = scanner.wanted(&buf[..available]);
            let n = match self.transport.read(&mut buf[..wanted]) {
                Ok(0) => return Err(self.disconnected("header")),
                Ok(n) => n,
                Err(ref e) if is_retryable(e) => continue,
                Err(ref e) if is_peer_gone(e) => return Err(self.disconnected("header")),
                Err(e) => return Err(self.io_failure(e)),
            };

            match scanner.push(&buf[..n]) {
                Ok(Some(msg_size)) => return Ok(msg_size),
                Ok(None) => {}
                Err(e) => {
                    warn!(fd = self.fd, peer = ?self.peer, error = %e, "Bad frame header");
                    return Err(e);
                }
            }
        }
    }

    fn read_body(&self, body: &mut [u8], phase: &mut ReadPhase, deadline: &Deadline) -> Result<()> {
        while let ReadPhase::ReadingBody { filled, total } = *phase {
            if filled == total {
                *phase = ReadPhase::Done;
                break;
            }

            self.arm_read(deadline)?;

            match self.transport.read(&mut body[filled..]) {
                Ok(0) => return Err(self.disconnected("body")),
                Ok(n) => {
                    *phase = ReadPhase::ReadingBody {
                        filled: filled + n,
                        total,
                    }
                }
                Err(ref e) if is_retryable(e) => {}
                Err(ref e) if is_peer_gone(e) => return Err(self.disconnected("body")),
                Err(e) => return Err(self.io_failure(e)),
            }
        }
        Ok(())
    }

    /// Send all of `buf`, adding each chunk to `sent` as it goes out.
    fn write_all(&self, buf: &[u8], deadline: &Deadline, sent: &mut usize) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            self.arm_write(deadline)?;

            match self.transport.write(&buf[offset..]) {
                Ok(0) => return Err(self.disconnected("write")),
                Ok(n) => {
                    offset += n;
                    *sent += n;
                }
                Err(ref e) if is_retryable(e) => {}
                Err(ref e) if is_peer_gone(e) => return Err(self.disconnected("write")),
                Err(e) => return Err(self.io_failure(e)),
            }
        }
        Ok(())
    }

    fn arm_read(&self, deadline: &Deadline) -> Result<()> {
        self.check_live()?;
        let timeout = deadline
            .next_attempt(self.config.attempt_interval)
            .inspect_err(|_| debug!(fd = self.fd, "Read timeout"))?;
        self.transport
            .set_read_timeout(timeout)
            .map_err(|e| self.io_failure(e))
    }

    fn arm_write(&self, deadline: &Deadline) -> Result<()> {
        self.check_live()?;
        let timeout = deadline
            .next_attempt(self.config.attempt_interval)
            .inspect_err(|_| debug!(fd = self.fd, "Write timeout"))?;
        self.transport
            .set_write_timeout(timeout)
            .map_err(|e| self.io_failure(e))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState("connection is closed"));
        }
        Ok(())
    }

    /// Closed while an operation was in flight.
    fn check_live(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed during operation",
            )));
        }
        Ok(())
    }

    fn disconnected(&self, during: &'static str) -> Error {
        // Our own shutdown also surfaces as end-of-stream
        if let Err(e) = self.check_live() {
            return e;
        }
        debug!(fd = self.fd, peer = ?self.peer, during, "Connection closed by peer");
        Error::Disconnected
    }

    fn io_failure(&self, e: io::Error) -> Error {
        if let Err(closed) = self.check_live() {
            return closed;
        }
        error!(fd = self.fd, peer = ?self.peer, error = %e, "Socket I/O failed");
        Error::Io(e)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State is only updated between I/O calls, so a poisoned lock is still usable
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Attempt-level outcomes that just mean "try again".
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::frame::HEADER_LEN;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn conn_pair() -> (Connection, Connection) {
        let (a, b) = tcp_pair();
        (Connection::new(a), Connection::new(b))
    }

    #[test]
    fn test_hello_wire_format() {
        let (client, mut server) = tcp_pair();
        let conn = Connection::new(client);

        assert_eq!(conn.write_message(b"hello", None).unwrap(), 5);

        let mut wire = [0u8; HEADER_LEN + 5];
        server.read_exact(&mut wire).unwrap();

        let mut expected = br#"{"msgSize":5}"#.to_vec();
        expected.extend_from_slice(&[b' '; 9]);
        expected.extend_from_slice(b"\r\nhello");
        assert_eq!(&wire[..], &expected[..]);
    }

    #[test]
    fn test_round_trip_sizes() {
        let (writer, reader) = conn_pair();
        let writer = Arc::new(writer);

        for size in [1usize, 2, 1000, 65_537, 1_000_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

            let w = Arc::clone(&writer);
            let sent = payload.clone();
            let handle = thread::spawn(move || w.write_message(&sent, Some(Duration::from_secs(5))));

            let body = reader.read_message(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(handle.join().unwrap().unwrap(), size);
            assert_eq!(body.len(), size);
            assert_eq!(&body[..], &payload[..]);
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let (writer, reader) = conn_pair();

        writer.write_message(b"first", None).unwrap();
        writer.write_message(b"second frame", None).unwrap();

        let timeout = Some(Duration::from_secs(1));
        assert_eq!(&reader.read_message(timeout).unwrap()[..], b"first");
        assert_eq!(&reader.read_message(timeout).unwrap()[..], b"second frame");
    }

    #[test]
    fn test_read_timeout() {
        let (_silent, reader) = conn_pair();

        let start = Instant::now();
        let result = reader.read_message(Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::TimedOut)), "got {:?}", result);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let (writer, reader) = conn_pair();

        let result = reader.read_message(Some(Duration::from_millis(20)));
        assert!(result.as_ref().is_err_and(|e| e.is_recoverable()));

        writer.write_message(b"late", None).unwrap();
        let body = reader.read_message(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&body[..], b"late");
    }

    #[test]
    fn test_disconnect_during_header() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(b"{\"msgS").unwrap();
        drop(client);

        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Disconnected)), "got {:?}", result);
    }

    #[test]
    fn test_disconnect_during_body() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(&encode_header(10).unwrap()).unwrap();
        client.write_all(b"abc").unwrap();
        drop(client);

        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Disconnected)), "got {:?}", result);
    }

    #[test]
    fn test_malformed_header() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(b"not json at all\r\n").unwrap();
        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Protocol(_))), "got {:?}", result);
    }

    #[test]
    fn test_zero_size_header() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(b"{\"msgSize\":0}         \r\n").unwrap();
        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Protocol(_))), "got {:?}", result);
    }

    #[test]
    fn test_header_bound() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(&vec![b' '; 2048]).unwrap();
        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Protocol(_))), "got {:?}", result);
    }

    #[test]
    fn test_max_message_size() {
        let (client, server) = tcp_pair();
        let writer = Connection::new(client);
        let reader = Connection::with_config(
            server,
            IoConfig {
                max_message_size: 8,
                ..IoConfig::default()
            },
        );

        writer.write_message(b"0123456789", None).unwrap();
        let result = reader.read_message(Some(Duration::from_secs(1)));
        assert!(matches!(result, Err(Error::Protocol(_))), "got {:?}", result);
    }

    #[test]
    fn test_write_empty_rejected() {
        let (writer, _reader) = conn_pair();
        assert!(matches!(writer.write_message(b"", None), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_closed_connection_is_invalid() {
        let (conn, _peer) = conn_pair();
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(conn.read_message(None), Err(Error::InvalidState(_))));
        assert!(matches!(conn.write_message(b"x", None), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (conn, _peer) = conn_pair();
        let conn = Arc::new(conn);

        let c = Arc::clone(&conn);
        let handle = thread::spawn(move || c.read_message(None));

        thread::sleep(Duration::from_millis(50));
        conn.close();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Io(_))), "got {:?}", result);
    }

    #[test]
    fn test_duplex_on_one_connection() {
        let (local, remote) = conn_pair();
        let local = Arc::new(local);

        // Reader blocks on `local` while we write through it
        let l = Arc::clone(&local);
        let reader = thread::spawn(move || l.read_message(Some(Duration::from_secs(5))));

        thread::sleep(Duration::from_millis(20));
        local.write_message(b"ping", Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&remote.read_message(Some(Duration::from_secs(1))).unwrap()[..], b"ping");

        remote.write_message(b"pong", None).unwrap();
        assert_eq!(&reader.join().unwrap().unwrap()[..], b"pong");
    }

    #[test]
    fn test_stalled_write_does_not_delay_other_connection() {
        let (a_writer, _a_peer_never_reads) = conn_pair();
        let (b_writer, b_reader) = conn_pair();

        // Large enough to fill both socket buffers
        let stalled = thread::spawn(move || {
            let payload = vec![7u8; 64 * 1024 * 1024];
            a_writer.write_message(&payload, Some(Duration::from_millis(500)))
        });

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        b_writer.write_message(b"quick", None).unwrap();
        let body = b_reader.read_message(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&body[..], b"quick");
        assert!(start.elapsed() < Duration::from_millis(200));

        // Part of the frame went out before the deadline
        let result = stalled.join().unwrap();
        assert!(
            matches!(result, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::TimedOut),
            "got {:?}",
            result
        );
    }

    #[test]
    fn test_timed_out_read_resumes_body() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        client.write_all(&encode_header(10).unwrap()).unwrap();
        client.write_all(b"abc").unwrap();

        let result = reader.read_message(Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::TimedOut)), "got {:?}", result);

        client.write_all(b"defghij").unwrap();
        let body = reader.read_message(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(&body[..], b"abcdefghij");

        // Stream is still aligned on frame boundaries
        client.write_all(&encode_header(2).unwrap()).unwrap();
        client.write_all(b"ok").unwrap();
        let body = reader.read_message(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn test_timed_out_read_resumes_header() {
        let (mut client, server) = tcp_pair();
        let reader = Connection::new(server);

        let header = encode_header(3).unwrap();
        client.write_all(&header[..8]).unwrap();

        let result = reader.read_message(Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::TimedOut)), "got {:?}", result);

        client.write_all(&header[8..]).unwrap();
        client.write_all(b"xyz").unwrap();
        let body = reader.read_message(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(&body[..], b"xyz");
    }

    #[test]
    fn test_partial_write_timeout_disables_writes() {
        let (writer, _peer_never_reads) = conn_pair();

        let payload = vec![1u8; 64 * 1024 * 1024];
        let result = writer.write_message(&payload, Some(Duration::from_millis(200)));
        let err = result.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(err.is_connection_ending());

        let result = writer.write_message(b"x", Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(Error::InvalidState(_))), "got {:?}", result);
    }

    #[test]
    fn test_try_read_skips_busy_connection() {
        let (writer, reader) = conn_pair();
        let reader = Arc::new(reader);

        let r = Arc::clone(&reader);
        let busy = thread::spawn(move || r.read_message(Some(Duration::from_millis(300))));

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        let result = reader.try_read_message(None);
        assert!(matches!(result, Ok(None)), "got {:?}", result);
        assert!(start.elapsed() < Duration::from_millis(50));

        assert!(matches!(busy.join().unwrap(), Err(Error::TimedOut)));

        writer.write_message(b"free", None).unwrap();
        let body = reader.try_read_message(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(body.as_deref(), Some(&b"free"[..]));
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::after(None).next_attempt(DEFAULT_ATTEMPT_INTERVAL).unwrap().is_none());
        assert!(Deadline::after(Some(Duration::ZERO))
            .next_attempt(DEFAULT_ATTEMPT_INTERVAL)
            .unwrap()
            .is_none());

        let attempt = Deadline::after(Some(Duration::from_secs(10)))
            .next_attempt(DEFAULT_ATTEMPT_INTERVAL)
            .unwrap();
        assert_eq!(attempt, Some(DEFAULT_ATTEMPT_INTERVAL));

        let expired = Deadline {
            expires_at: Some(Instant::now()),
        };
        assert!(matches!(
            expired.next_attempt(DEFAULT_ATTEMPT_INTERVAL),
            Err(Error::TimedOut)
        ));
    }
}
