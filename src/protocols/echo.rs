//! Echo protocol.
//!
//! Length-prefixed framing, useful for throughput testing and for checking
//! that payloads survive reassembly intact:
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` is answered with `OK\r\n`; the client closes afterwards.
//! A payload above the size limit is answered with an error and skipped.

use crate::runtime::{Connection, ConnectionHandler, ConnectionId};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One decoded request.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A complete payload to echo back.
    Payload(&'a [u8]),
    Quit,
    /// Header announced more than the handler accepts.
    TooLarge(usize),
    /// Header line that is not a length.
    BadLength,
}

/// Decode the frame at the start of `input`.
///
/// Returns the frame and the bytes it spans, or `None` until the header and
/// the whole payload have arrived. Rejected headers span only their line.
pub fn decode(input: &[u8], max_payload: usize) -> Option<(Frame<'_>, usize)> {
    let line_end = input.windows(2).position(|w| w == b"\r\n")?;
    let line = &input[..line_end];
    let header_len = line_end + 2;

    if line.eq_ignore_ascii_case(b"QUIT") {
        return Some((Frame::Quit, header_len));
    }

    let length = match std::str::from_utf8(line).ok().and_then(|s| s.parse::<usize>().ok()) {
        Some(length) => length,
        None => return Some((Frame::BadLength, header_len)),
    };
    if length > max_payload {
        return Some((Frame::TooLarge(length), header_len));
    }

    let end = header_len + length;
    if input.len() < end {
        return None;
    }
    Some((Frame::Payload(&input[header_len..end]), end))
}

/// Echoes every complete frame back to its sender.
pub struct EchoHandler {
    max_payload: usize,
    /// Bytes of rejected payloads still to be dropped, per connection.
    skipping: Mutex<HashMap<ConnectionId, usize>>,
}

impl EchoHandler {
    /// `max_payload` must leave room for the header within the receive cache
    /// limit, otherwise oversized frames end in a cache overflow.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            skipping: Mutex::new(HashMap::new()),
        }
    }

    /// Drop up to `remaining` leading bytes of `data`. Returns how many were
    /// dropped and how many are still owed.
    fn skip(data: &[u8], remaining: usize) -> (usize, usize) {
        let n = remaining.min(data.len());
        (n, remaining - n)
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_receive(&self, conn: &Arc<Connection>, data: &[u8]) -> usize {
        let mut consumed = 0;
        let mut skipping = self.skipping.lock();
        if let Some(remaining) = skipping.remove(&conn.id()) {
            let (n, left) = Self::skip(data, remaining);
            if left > 0 {
                skipping.insert(conn.id(), left);
                return n;
            }
            consumed = n;
        }

        let mut reply = BytesMut::new();
        while let Some((frame, len)) = decode(&data[consumed..], self.max_payload) {
            consumed += len;
            match frame {
                Frame::Payload(payload) => {
                    reply.extend_from_slice(format!("{}\r\n", payload.len()).as_bytes());
                    reply.extend_from_slice(payload);
                }
                Frame::Quit => reply.extend_from_slice(b"OK\r\n"),
                Frame::TooLarge(length) => {
                    debug!(conn_id = %conn.id(), length, "Echo payload too large");
                    reply.extend_from_slice(b"ERROR payload too large\r\n");
                    let (n, left) = Self::skip(&data[consumed..], length);
                    consumed += n;
                    if left > 0 {
                        skipping.insert(conn.id(), left);
                        break;
                    }
                }
                Frame::BadLength => reply.extend_from_slice(b"ERROR invalid length\r\n"),
            }
        }
        drop(skipping);

        if !reply.is_empty() {
            if let Err(e) = conn.send(&reply) {
                debug!(conn_id = %conn.id(), error = %e, "Echo reply dropped");
            }
        }
        consumed
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        self.skipping.lock().remove(&conn.id());
        debug!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Echo client disconnected");
    }
}
