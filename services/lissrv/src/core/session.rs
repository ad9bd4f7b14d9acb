//! Per-connection session state
//!
//! Owned exclusively by one connection handler task, never shared across
//! connections. Reset on every completed message, on every guard
//! violation, and discarded with the connection.

use bytes::BytesMut;
use tokio::time::Instant;

use crate::config::EngineLimits;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Outcome of the pre-dispatch guard checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Ok,
    TimedOut,
    Oversized,
}

/// Mutable state of one connection's in-progress message exchange
pub struct ConnectionSession {
    limits: EngineLimits,
    /// Raw bytes not yet consumed by the protocol handler
    pub buffer: BytesMut,
    /// Bytes contributed to the current message attempt
    total_bytes: usize,
    /// When the first byte of the current message attempt was observed
    started_at: Option<Instant>,
}

impl ConnectionSession {
    pub fn new(limits: EngineLimits) -> Self {
        Self {
            limits,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            total_bytes: 0,
            started_at: None,
        }
    }

    /// Guard check for `incoming` new bytes, run before they are
    /// accumulated so the buffer can never exceed the size limit.
    pub fn guard(&self, incoming: usize, now: Instant) -> GuardVerdict {
        if self.timed_out(now) {
            return GuardVerdict::TimedOut;
        }
        if self.total_bytes + incoming > self.limits.max_message_bytes {
            return GuardVerdict::Oversized;
        }
        GuardVerdict::Ok
    }

    /// Timeout re-check for the idle path (read timeout with no bytes).
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.started_at {
            Some(t0) => now.duration_since(t0) > self.limits.message_timeout(),
            None => false,
        }
    }

    /// Accept new bytes into the session.
    pub fn push(&mut self, data: &[u8], now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.total_bytes += data.len();
        self.buffer.extend_from_slice(data);
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// A fresh session has seen no bytes of a message attempt yet; only a
    /// fresh session is eligible for protocol auto-detection.
    pub fn is_fresh(&self) -> bool {
        self.started_at.is_none() && self.buffer.is_empty()
    }

    /// Discard the current message attempt entirely.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total_bytes = 0;
        self.started_at = None;
    }

    /// A message completed: restart the guards. Unconsumed buffered bytes
    /// belong to the next attempt and are re-counted against it.
    pub fn rearm(&mut self, now: Instant) {
        self.total_bytes = self.buffer.len();
        self.started_at = if self.buffer.is_empty() {
            None
        } else {
            Some(now)
        };
    }
}
