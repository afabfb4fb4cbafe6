//! frame-reactor: many TCP connections, few threads.
//!
//! An epoll reactor reports which connections are readable; each connection
//! then reads or writes whole length-framed messages with deadlines:
//!
//! ```text
//! {"msgSize":N}<spaces to 22 bytes>\r\n<N body bytes>
//! ```
//!
//! The library never accepts connections itself. Hand it connected sockets
//! with `Reactor::add`, poll `Reactor::wait`, and call
//! `Connection::read_message` / `Connection::write_message` on what it
//! returns. `server` is a small acceptor built on top of this, used by the
//! `frame-reactor` binary.

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
pub use runtime::{Connection, IoConfig, Reactor, ReactorConfig, Transport};
