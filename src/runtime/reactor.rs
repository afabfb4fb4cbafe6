//! epoll reactor.
//!
//! Watches many connections for read readiness and hangup through one epoll
//! instance and reports which of them have pending activity. The reactor
//! does no data transfer itself: callers take the ready connections from
//! `wait` and call `read_message`/`write_message` on them.
//!
//! Registrations are level-triggered, so a connection stays ready for as
//! long as unread bytes remain in its socket buffer.
//!
//! ## Locking
//!
//! The descriptor map is behind a `RwLock`. `add` and `remove` hold the
//! write lock across both the `epoll_ctl` call and the map update, so a
//! descriptor is mapped exactly when it is registered. `wait` blocks in
//! `epoll_wait` with no lock held and only takes the read lock to resolve
//! descriptors; descriptors removed in the meantime are skipped.

use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, IoConfig, Transport};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Default maximum number of ready connections returned per `wait`.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default connection-count interval between milestone log events.
pub const DEFAULT_MILESTONE_INTERVAL: usize = 100;

/// Readiness interest for every registration.
const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;

/// Reactor tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    /// Upper bound on connections returned by one `wait`.
    pub batch_size: usize,
    /// Log the live connection count whenever it is a multiple of this.
    /// Zero disables milestone events.
    pub milestone_interval: usize,
    /// Tuning for connections created by `add`.
    pub io: IoConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            milestone_interval: DEFAULT_MILESTONE_INTERVAL,
            io: IoConfig::default(),
        }
    }
}

/// Owned epoll descriptor, closed on drop.
struct EpollFd(RawFd);

impl Drop for EpollFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Readiness multiplexer over many framed connections.
pub struct Reactor {
    epoll: EpollFd,
    connections: RwLock<HashMap<RawFd, Arc<Connection>>>,
    config: ReactorConfig,
}

impl Reactor {
    /// Create a reactor with default tuning.
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    /// Create a reactor, allocating its epoll instance.
    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Setup(io::Error::last_os_error()));
        }

        // epoll_wait takes the event count as a c_int
        let config = ReactorConfig {
            batch_size: config.batch_size.clamp(1, libc::c_int::MAX as usize),
            ..config
        };
        debug!(epoll_fd = fd, batch_size = config.batch_size, "Reactor created");

        Ok(Self {
            epoll: EpollFd(fd),
            connections: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Wrap a connected transport and register it.
    pub fn add<T: Transport + 'static>(&self, transport: T) -> Result<Arc<Connection>> {
        let conn = Arc::new(Connection::with_config(transport, self.config.io));
        self.add_connection(Arc::clone(&conn))?;
        Ok(conn)
    }

    /// Register an existing connection for read readiness and hangup.
    pub fn add_connection(&self, conn: Arc<Connection>) -> Result<()> {
        let fd = conn.raw_fd();
        let mut event = libc::epoll_event {
            events: INTEREST,
            u64: fd as u64,
        };

        let count = {
            let mut connections = self.write_map();
            let rc = unsafe { libc::epoll_ctl(self.epoll.0, libc::EPOLL_CTL_ADD, fd, &mut event) };
            if rc < 0 {
                return Err(Error::Registration(io::Error::last_os_error()));
            }
            connections.insert(fd, conn);
            connections.len()
        };

        trace!(fd, count, "Connection registered");
        self.report_milestone(count);
        Ok(())
    }

    /// Deregister a connection.
    ///
    /// Does not close it; callers usually follow up with `close`.
    pub fn remove(&self, conn: &Connection) -> Result<()> {
        self.remove_fd(conn.raw_fd()).map(|_| ())
    }

    /// Deregister by descriptor.
    ///
    /// The epoll deregistration is attempted even when the descriptor is not
    /// mapped, and its OS error is returned as-is.
    pub fn remove_fd(&self, fd: RawFd) -> Result<Option<Arc<Connection>>> {
        let (removed, count) = {
            let mut connections = self.write_map();
            let rc = unsafe {
                libc::epoll_ctl(self.epoll.0, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc < 0 {
                return Err(Error::Registration(io::Error::last_os_error()));
            }
            let removed = connections.remove(&fd);
            (removed, connections.len())
        };

        trace!(fd, count, "Connection deregistered");
        self.report_milestone(count);
        Ok(removed)
    }

    /// Block until at least one registered connection is ready or `timeout`
    /// elapses (`None` waits forever).
    ///
    /// Returns at most `batch_size` connections. An empty result means the
    /// timeout elapsed. Interrupted waits are resumed with the time left.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Arc<Connection>>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.config.batch_size];
        let expires_at = timeout.map(|t| Instant::now() + t);

        let ready = loop {
            let timeout_ms = match expires_at {
                Some(at) => duration_to_ms(at.saturating_duration_since(Instant::now())),
                None => -1,
            };

            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.0,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };

            if n >= 0 {
                break n as usize;
            }

            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted, retrying");
                continue;
            }
            return Err(Error::Io(err));
        };

        let connections = self.read_map();
        let ready_conns: Vec<Arc<Connection>> = events[..ready]
            .iter()
            .filter_map(|ev| {
                let fd = ev.u64 as RawFd;
                connections.get(&fd).map(Arc::clone)
            })
            .collect();

        Ok(ready_conns)
    }

    /// Look up a registered connection.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.read_map().get(&fd).map(Arc::clone)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Maximum number of connections `wait` returns.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn report_milestone(&self, count: usize) {
        if is_milestone(count, self.config.milestone_interval) {
            info!(connections = count, "Live connection milestone");
        }
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        // Map updates are single statements, a poisoned map is still consistent
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A zero interval never fires.
fn is_milestone(count: usize, interval: usize) -> bool {
    interval > 0 && count > 0 && count % interval == 0
}

/// Round up so a sub-millisecond remainder still waits.
fn duration_to_ms(d: Duration) -> libc::c_int {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
