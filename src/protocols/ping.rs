//! Ping protocol.
//!
//! Line-based health check:
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//! ```

use crate::runtime::{Connection, ConnectionHandler};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::debug;

/// Longest request line accepted before the client is answered with an error.
const MAX_LINE_LENGTH: usize = 1024;

/// One request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Ping(Option<&'a [u8]>),
    Quit,
    Unknown,
}

/// Split the first line off `input`. Returns the request and the bytes the
/// line spans including its `\r\n`, or `None` until the line is complete.
pub fn next_request(input: &[u8]) -> Option<(Request<'_>, usize)> {
    let line_end = input.windows(2).position(|w| w == b"\r\n")?;
    let line = &input[..line_end];

    let request = if line.eq_ignore_ascii_case(b"PING") {
        Request::Ping(None)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        Request::Quit
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        Request::Ping(Some(&line[5..]))
    } else {
        Request::Unknown
    };
    Some((request, line_end + 2))
}

/// Answers every `PING` with a `PONG`.
#[derive(Debug, Default)]
pub struct PingHandler;

impl ConnectionHandler for PingHandler {
    fn on_receive(&self, conn: &Arc<Connection>, data: &[u8]) -> usize {
        let mut consumed = 0;
        let mut reply = BytesMut::new();

        while let Some((request, len)) = next_request(&data[consumed..]) {
            consumed += len;
            match request {
                Request::Ping(None) => reply.extend_from_slice(b"PONG\r\n"),
                Request::Ping(Some(msg)) => {
                    reply.extend_from_slice(b"PONG ");
                    reply.extend_from_slice(msg);
                    reply.extend_from_slice(b"\r\n");
                }
                Request::Quit => reply.extend_from_slice(b"OK\r\n"),
                Request::Unknown => reply.extend_from_slice(b"ERROR unknown command\r\n"),
            }
        }

        // A line that never ends is dropped rather than cached forever.
        if data.len() - consumed > MAX_LINE_LENGTH {
            consumed = data.len();
            reply.extend_from_slice(b"ERROR line too long\r\n");
        }

        if !reply.is_empty() {
            if let Err(e) = conn.send(&reply) {
                debug!(conn_id = %conn.id(), error = %e, "Ping reply dropped");
            }
        }
        consumed
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        debug!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Ping client disconnected");
    }
}
