//! Frame header codec.
//!
//! Every message on the wire is a fixed 24-byte textual header followed by
//! exactly `msgSize` raw body bytes:
//!
//! ```text
//! {"msgSize":5}         \r\nhello
//! |<------ 22 -------->|2 |<-5->|
//! ```
//!
//! The header text is a small JSON record, left-justified and padded with
//! ASCII spaces to 22 bytes, then terminated by `\r\n`. Sizes whose record
//! does not fit into 22 bytes are rejected with `FrameTooLarge` instead of
//! producing a longer header.
//!
//! The decoder is more lenient than the encoder: it accepts any header up to
//! `MAX_HEADER_SCAN` bytes that ends in the end marker.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Total length of an encoded header, end marker included.
pub const HEADER_LEN: usize = 24;

/// Length of the padded header text, end marker excluded.
pub const HEADER_TEXT_LEN: usize = HEADER_LEN - END_MARKER.len();

/// Terminates every header.
pub const END_MARKER: &[u8; 2] = b"\r\n";

/// Upper bound on bytes consumed while looking for the end marker.
pub const MAX_HEADER_SCAN: usize = 1024;

/// The header record.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "msgSize")]
    msg_size: i64,
}

/// Encode the fixed-width header for a body of `msg_size` bytes.
pub fn encode_header(msg_size: usize) -> Result<[u8; HEADER_LEN]> {
    if msg_size == 0 {
        return Err(Error::Protocol("message body must not be empty".into()));
    }

    let msg_size_i64 = i64::try_from(msg_size).map_err(|_| Error::FrameTooLarge(msg_size))?;
    let text = serde_json::to_vec(&Header {
        msg_size: msg_size_i64,
    })
    .map_err(|e| Error::Protocol(format!("header encoding failed: {e}")))?;

    if text.len() > HEADER_TEXT_LEN {
        return Err(Error::FrameTooLarge(msg_size));
    }

    let mut header = [b' '; HEADER_LEN];
    header[..text.len()].copy_from_slice(&text);
    header[HEADER_TEXT_LEN..].copy_from_slice(END_MARKER);
    Ok(header)
}

/// Decode a header, with or without its trailing end marker, into the
/// declared body size.
pub fn decode_header(raw: &[u8]) -> Result<usize> {
    let text = raw.strip_suffix(END_MARKER.as_slice()).unwrap_or(raw);

    let header: Header = serde_json::from_slice(text)
        .map_err(|e| Error::Protocol(format!("malformed header: {e}")))?;

    if header.msg_size <= 0 {
        return Err(Error::Protocol(format!(
            "invalid declared size {}",
            header.msg_size
        )));
    }

    usize::try_from(header.msg_size)
        .map_err(|_| Error::Protocol(format!("declared size {} out of range", header.msg_size)))
}

/// Position one past the end marker, if `buf` contains one.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    find_crlf(buf).map(|pos| pos + END_MARKER.len())
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Incremental header decoder.
///
/// The caller shows the scanner bytes that are available on the socket
/// (without consuming them), asks how many of those belong to the header,
/// consumes exactly that many and pushes them back in. This never reads past
/// the end marker, so body bytes stay in the socket buffer.
#[derive(Debug, Default)]
pub struct HeaderScanner {
    buf: Vec<u8>,
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(HEADER_LEN),
        }
    }

    /// How many leading bytes of `available` are still part of the header.
    pub fn wanted(&self, available: &[u8]) -> usize {
        let room = MAX_HEADER_SCAN.saturating_sub(self.buf.len());
        let window = &available[..available.len().min(room)];

        // Marker split across two reads
        if self.buf.last() == Some(&b'\r') && window.first() == Some(&b'\n') {
            return 1;
        }

        find_header_end(window).unwrap_or(window.len())
    }

    /// Append consumed header bytes.
    ///
    /// Returns the declared body size once the end marker has been pushed,
    /// `None` while more bytes are needed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<usize>> {
        self.buf.extend_from_slice(bytes);

        if self.buf.ends_with(END_MARKER) {
            return decode_header(&self.buf).map(Some);
        }

        if self.buf.len() >= MAX_HEADER_SCAN {
            return Err(Error::Protocol(format!(
                "no header end marker within {} bytes",
                MAX_HEADER_SCAN
            )));
        }

        Ok(None)
    }

    /// Number of header bytes consumed so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
