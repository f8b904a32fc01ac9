//! Per-connection byte buffering.
//!
//! Two structures, each guarded by its own connection lock:
//!
//! - [`ReceiveCache`]: bytes received but not yet consumed by the handler.
//!   The network delivers a stream without message boundaries; the handler
//!   reports how many bytes it consumed and the cache redelivers the rest,
//!   in order and without gaps, together with the next receive.
//! - [`OutboundBuffer`]: the active transmission plus a FIFO of queued
//!   payloads. Each completion copies at most one I/O buffer's worth of bytes,
//!   so arbitrarily large or numerous sends are accepted without blocking.

use crate::error::CacheOverflow;
use crate::runtime::connection::SendOutcome;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Reassembly cache for received bytes.
#[derive(Debug)]
pub struct ReceiveCache {
    bytes: BytesMut,
    limit: usize,
}

impl ReceiveCache {
    /// Create an empty cache that may hold at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hand freshly received `data` to `consume`, together with anything
    /// still cached.
    ///
    /// `consume` returns how many leading bytes it used; values larger than
    /// the slice count as full consumption. Whatever is left is kept for the
    /// next call. Returns the number of bytes consumed.
    ///
    /// Fails without calling `consume` when appending `data` to a non-empty
    /// cache would exceed the limit.
    pub fn deliver<F>(&mut self, data: &[u8], consume: F) -> Result<usize, CacheOverflow>
    where
        F: FnOnce(&[u8]) -> usize,
    {
        if self.bytes.is_empty() {
            let consumed = consume(data).min(data.len());
            let rest = &data[consumed..];
            if rest.len() > self.limit {
                return Err(self.overflow(rest.len()));
            }
            self.bytes.extend_from_slice(rest);
            return Ok(consumed);
        }

        if self.bytes.len() + data.len() > self.limit {
            return Err(self.overflow(data.len()));
        }

        self.bytes.extend_from_slice(data);
        let total = self.bytes.len();
        let consumed = consume(&self.bytes).min(total);
        if consumed == total {
            self.bytes.clear();
        } else if consumed > 0 {
            self.bytes.advance(consumed);
        }
        Ok(consumed)
    }

    fn overflow(&self, incoming: usize) -> CacheOverflow {
        CacheOverflow {
            cached: self.bytes.len(),
            incoming,
            limit: self.limit,
        }
    }
}

/// Outbound data of one connection.
///
/// `active` holds the bytes of the current payload that have not yet been
/// copied into the I/O buffer; `queue` holds whole payloads submitted while
/// a transmission was in progress.
#[derive(Debug)]
pub struct OutboundBuffer {
    active: BytesMut,
    queue: VecDeque<Bytes>,
    in_flight: bool,
    chunk_size: usize,
}

impl OutboundBuffer {
    /// Create an idle buffer transmitting at most `chunk_size` bytes at a time.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            active: BytesMut::new(),
            queue: VecDeque::new(),
            in_flight: false,
            chunk_size,
        }
    }

    /// Whether a transmission is in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Bytes of the current payload not yet handed to a transmission.
    #[cfg(test)]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Number of whole payloads waiting behind the active one.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Accept a payload.
    ///
    /// While busy the payload is queued whole. Otherwise its first chunk is
    /// copied into `io`, which the caller must transmit, and the remainder
    /// stays active.
    pub fn push(&mut self, data: &[u8], io: &mut BytesMut) -> SendOutcome {
        if self.in_flight || !self.active.is_empty() {
            self.queue.push_back(Bytes::copy_from_slice(data));
            return SendOutcome::Queued;
        }

        self.active.extend_from_slice(data);
        self.fill(io);
        SendOutcome::Sent
    }

    /// The in-flight transmission finished.
    ///
    /// Returns `true` when `io` now holds the next chunk to transmit, `false`
    /// when there is nothing left and the buffer went idle.
    pub fn complete(&mut self, io: &mut BytesMut) -> bool {
        self.in_flight = false;

        if self.active.is_empty() {
            match self.queue.pop_front() {
                Some(next) => self.active.extend_from_slice(&next),
                None => return false,
            }
        }

        self.fill(io);

        // Stage the next payload for the following completion.
        if self.active.is_empty() {
            if let Some(next) = self.queue.pop_front() {
                self.active.extend_from_slice(&next);
            }
        }
        true
    }

    /// Forget everything after a transmission could not be issued.
    pub fn abort(&mut self) {
        self.in_flight = false;
        self.active.clear();
        self.queue.clear();
    }

    fn fill(&mut self, io: &mut BytesMut) {
        let n = self.active.len().min(self.chunk_size);
        io.clear();
        io.extend_from_slice(&self.active[..n]);
        self.active.advance(n);
        self.in_flight = true;
    }
}
