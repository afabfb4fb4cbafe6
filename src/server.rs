//! Framed echo server.
//!
//! Plays the acceptor role for the reactor: the listener thread accepts TCP
//! connections and hands them to `Reactor::add`, while worker threads loop
//! on `Reactor::wait` and echo every frame they read back to its sender.
//!
//! Workers share one reactor. Because registrations are level-triggered two
//! workers can be handed the same connection; the second one finds the read
//! already in progress and moves on to the rest of its batch.

use crate::config::Config;
use crate::error::Error;
use crate::runtime::{Connection, Reactor};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Stops a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    /// Ask the acceptor and all workers to stop.
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the acceptor blocked in accept()
        if let Err(e) = TcpStream::connect(self.addr) {
            debug!(error = %e, "Shutdown wake-up connect failed");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Server instance
pub struct Server {
    config: Config,
    reactor: Arc<Reactor>,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener and create the reactor.
    pub fn bind(config: Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        let reactor = Reactor::with_config(config.reactor_config())?;

        Ok(Server {
            config,
            reactor: Arc::new(reactor),
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            addr: self.local_addr()?,
        })
    }

    /// Shared reactor, for inspection.
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Run until shut down.
    pub fn run(&self) -> io::Result<()> {
        let num_workers = if self.config.workers == 0 {
            num_cpus()
        } else {
            self.config.workers
        };

        info!(
            addr = %self.local_addr()?,
            workers = num_workers,
            batch_size = self.reactor.batch_size(),
            "Starting framed echo server"
        );

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let reactor = Arc::clone(&self.reactor);
            let shutdown = Arc::clone(&self.shutdown);
            let config = self.config.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, &reactor, &shutdown, &config) {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;
            handles.push(handle);
        }

        self.accept_loop();

        // Wait for all workers
        for handle in handles {
            let _ = handle.join();
        }

        info!("Server stopped");
        Ok(())
    }

    fn accept_loop(&self) {
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let peer = stream.peer_addr().ok();
                    // Header and body go out as separate writes
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = ?peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    match self.reactor.add(stream) {
                        Ok(conn) => debug!(fd = conn.raw_fd(), peer = ?peer, "Accepted connection"),
                        Err(e) => warn!(peer = ?peer, error = %e, "Failed to register connection"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

fn worker_loop(
    worker_id: usize,
    reactor: &Reactor,
    shutdown: &AtomicBool,
    config: &Config,
) -> Result<(), Error> {
    debug!(worker = worker_id, "Worker started");

    while !shutdown.load(Ordering::Acquire) {
        let ready = reactor.wait(Some(config.wait_timeout()))?;

        for conn in ready {
            echo_one(reactor, &conn, config);
        }
    }

    debug!(worker = worker_id, "Worker stopped");
    Ok(())
}

/// Read one frame from a ready connection and send it back.
fn echo_one(reactor: &Reactor, conn: &Connection, config: &Config) {
    let result = match conn.try_read_message(config.read_timeout()) {
        Ok(Some(body)) => conn.write_message(&body, config.write_timeout()),
        Ok(None) => {
            trace!(fd = conn.raw_fd(), "Read already in progress, skipping");
            return;
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(n) => debug!(fd = conn.raw_fd(), bytes = n, "Echoed message"),
        Err(e) if e.is_recoverable() => {
            debug!(fd = conn.raw_fd(), error = %e, "Echo timed out, keeping connection");
        }
        Err(e) => {
            match e {
                Error::Disconnected => debug!(fd = conn.raw_fd(), "Peer disconnected"),
                _ => warn!(fd = conn.raw_fd(), peer = ?conn.peer_addr(), error = %e, "Dropping connection"),
            }
            drop_connection(reactor, conn);
        }
    }
}

fn drop_connection(reactor: &Reactor, conn: &Connection) {
    // Another worker may have dropped it already
    if let Err(e) = reactor.remove(conn) {
        debug!(fd = conn.raw_fd(), error = %e, "Deregistration failed");
    }
    conn.close();
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
