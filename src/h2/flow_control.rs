//! HTTP/2 flow control (RFC 9113 Section 5.2).
//!
//! The same two counters are used at stream and connection level: a
//! [`SendWindow`] for credit the peer granted us, and a [`RecvWindow`] for
//! credit we granted the peer.

use crate::error::{Error, Result};
use crate::h2::frame::{ErrorCode, MAX_WINDOW_SIZE};

/// Credit available for sending DATA.
///
/// Signed: a SETTINGS_INITIAL_WINDOW_SIZE decrease can push it below zero.
#[derive(Debug, Clone)]
pub struct SendWindow {
    window: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> u32 {
        self.window.clamp(0, MAX_WINDOW_SIZE as i64) as u32
    }

    /// Spend `n` bytes. Callers size frames with [`available`](Self::available) first.
    pub fn consume(&mut self, n: u32) {
        debug_assert!(n as i64 <= self.window, "send window overdrawn");
        self.window -= n as i64;
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn replenish(&mut self, increment: u32) -> Result<()> {
        let next = self.window + increment as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Error::protocol(
                ErrorCode::FlowControlError,
                format!("window update of {} overflows send window", increment),
            ));
        }
        self.window = next;
        Ok(())
    }

    /// Apply a change of the peer's initial window size.
    pub fn adjust(&mut self, delta: i64) -> Result<()> {
        let next = self.window + delta;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Error::protocol(
                ErrorCode::FlowControlError,
                "initial window change overflows send window",
            ));
        }
        self.window = next;
        Ok(())
    }
}

/// Credit we advertised for receiving DATA, plus the consumed-but-unacked
/// byte count that drives WINDOW_UPDATE emission.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    window: i64,
    initial: u32,
    unacked: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
            initial,
            unacked: 0,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// Account for `n` bytes of inbound DATA (padding included).
    ///
    /// Returns false if the peer exceeded the advertised window. The bytes
    /// are still deducted so later acknowledgements stay balanced.
    pub fn recv(&mut self, n: u32) -> bool {
        let within = n as i64 <= self.window;
        self.window -= n as i64;
        within
    }

    /// Record `n` bytes as consumed by the application.
    ///
    /// Once the unacknowledged total reaches half the initial window, returns
    /// the increment to advertise in a WINDOW_UPDATE and credits it back.
    pub fn consume(&mut self, n: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(n);
        if self.unacked == 0 || self.unacked < self.initial / 2 {
            return None;
        }
        let increment = self.unacked;
        self.unacked = 0;
        self.window += increment as i64;
        Some(increment)
    }

    /// Acknowledge bytes that will never be consumed (reset or unknown stream).
    ///
    /// Unlike [`consume`](Self::consume) this returns everything pending at once.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        let increment = self.unacked.saturating_add(n);
        self.unacked = 0;
        if increment == 0 {
            return None;
        }
        self.window += increment as i64;
        Some(increment)
    }
}
