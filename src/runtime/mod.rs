//! Reactor and framed connection I/O.
//!
//! - `frame`: header encode/decode, no I/O
//! - `connection`: one socket, whole-frame reads and writes with deadlines
//! - `reactor`: epoll registration and readiness wait over many connections
//!
//! The reactor only reports readiness. Data moves when the caller invokes
//! `read_message`/`write_message` on a connection that `wait` returned.

pub mod connection;
pub mod frame;
pub mod reactor;

pub use connection::{Connection, IoConfig, ReadPhase, Transport};
pub use frame::{decode_header, encode_header, HeaderScanner, HEADER_LEN};
pub use reactor::{Reactor, ReactorConfig};
