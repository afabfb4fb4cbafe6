//! Error type shared by the codec, connection and reactor layers.
//!
//! Every failure kind is a distinct variant so callers can pick a policy per
//! kind: reschedule on `TimedOut`, drop the connection on `Disconnected` or
//! `Protocol`, alert on `Setup` or `Registration`.

use std::io;

/// Errors produced by the framed I/O layer and the reactor.
#[derive(Debug)]
pub enum Error {
    /// The epoll instance could not be created.
    Setup(io::Error),
    /// Adding or removing a descriptor from epoll failed.
    Registration(io::Error),
    /// The caller's deadline passed before the operation completed.
    TimedOut,
    /// The peer closed the stream in the middle of a frame.
    Disconnected,
    /// Malformed header, invalid declared size, or header bound exceeded.
    Protocol(String),
    /// Any other transport failure.
    Io(io::Error),
    /// Operation on a connection that no longer has a live socket.
    InvalidState(&'static str),
    /// The body size does not fit into the fixed-width header.
    FrameTooLarge(usize),
}

impl Error {
    /// Whether the same logical operation may simply be retried.
    ///
    /// A timed-out read keeps its partial frame for the next call, and a
    /// write only reports `TimedOut` when none of its frame was sent.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Whether the caller should deregister and close the connection.
    pub fn is_connection_ending(&self) -> bool {
        matches!(
            self,
            Error::Disconnected | Error::Protocol(_) | Error::Io(_) | Error::InvalidState(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Setup(e) => write!(f, "Failed to create readiness context: {}", e),
            Error::Registration(e) => write!(f, "Failed to update readiness registration: {}", e),
            Error::TimedOut => write!(f, "Operation timed out"),
            Error::Disconnected => write!(f, "Connection closed by peer"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidState(msg) => write!(f, "Invalid connection state: {}", msg),
            Error::FrameTooLarge(size) => {
                write!(f, "Message size {} does not fit in the frame header", size)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Setup(e) | Error::Registration(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_policy_helpers() {
        assert!(Error::TimedOut.is_recoverable());
        assert!(!Error::TimedOut.is_connection_ending());

        assert!(Error::Disconnected.is_connection_ending());
        assert!(Error::Protocol("bad".into()).is_connection_ending());
        assert!(Error::Io(io::Error::from(io::ErrorKind::Other)).is_connection_ending());
        assert!(!Error::Setup(io::Error::from(io::ErrorKind::Other)).is_connection_ending());
    }

    #[test]
    fn test_source_preserved() {
        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "nope");
        assert!(Error::TimedOut.source().is_none());
    }
}
