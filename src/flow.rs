//! Per-stream flow control.
//!
//! Each side may only send as many bytes as the receiver has advertised. The
//! receiver advertises its whole buffer when the stream opens, then hands
//! space back with WINDOW_UPDATE frames as the application drains it.
//! Updates are batched: nothing is advertised until at least half the buffer
//! has been reclaimed.
//!
//! On the receive side `buffered + recv_granted + recv_unacked` always equals
//! the buffer size, so unread data can never outgrow the buffer.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("peer sent {received} bytes with only {granted} granted")]
    WindowExceeded { received: u32, granted: u32 },
    #[error("send credit overflow: {credit} + {increment}")]
    CreditOverflow { credit: u32, increment: u32 },
}

/// Send credit and receive grant for one stream.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    /// Bytes we may still send before the peer must grant more.
    send_credit: u32,
    /// Bytes the peer may still send us.
    recv_granted: u32,
    /// Bytes consumed locally but not yet advertised to the peer.
    recv_unacked: u32,
    /// Receive buffer size; `recv_granted` never exceeds it.
    ceiling: u32,
}

impl FlowWindow {
    /// `buffer_size` is our receive buffer; `peer_window` is what the peer
    /// let us send before its first update.
    pub fn new(buffer_size: u32, peer_window: u32) -> Self {
        Self {
            send_credit: peer_window,
            recv_granted: buffer_size,
            recv_unacked: 0,
            ceiling: buffer_size,
        }
    }

    pub fn send_credit(&self) -> u32 {
        self.send_credit
    }

    pub fn recv_granted(&self) -> u32 {
        self.recv_granted
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Reclaimed bytes needed before a WINDOW_UPDATE goes out.
    pub fn update_threshold(&self) -> u32 {
        (self.ceiling / 2).max(1)
    }

    /// Take `n` bytes of send credit. Callers clamp `n` to `send_credit()`.
    pub fn consume_send(&mut self, n: u32) {
        debug_assert!(n <= self.send_credit);
        self.send_credit -= n.min(self.send_credit);
    }

    /// Apply a WINDOW_UPDATE from the peer.
    pub fn replenish(&mut self, increment: u32) -> Result<(), FlowError> {
        self.send_credit = self
            .send_credit
            .checked_add(increment)
            .ok_or(FlowError::CreditOverflow {
                credit: self.send_credit,
                increment,
            })?;
        Ok(())
    }

    /// Account for `n` bytes arriving from the peer.
    pub fn on_receive(&mut self, n: u32) -> Result<(), FlowError> {
        if n > self.recv_granted {
            return Err(FlowError::WindowExceeded {
                received: n,
                granted: self.recv_granted,
            });
        }
        self.recv_granted -= n;
        Ok(())
    }

    /// Account for `n` buffered bytes read by the application. Returns the
    /// increment to advertise once enough space has been reclaimed.
    pub fn on_consume(&mut self, n: u32) -> Option<u32> {
        self.recv_unacked += n;
        if self.recv_unacked >= self.update_threshold() {
            Some(self.take_unacked())
        } else {
            None
        }
    }

    /// Advertise everything reclaimed so far, regardless of the threshold.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        self.recv_unacked += n;
        if self.recv_unacked == 0 {
            None
        } else {
            Some(self.take_unacked())
        }
    }

    fn take_unacked(&mut self) -> u32 {
        let increment = self.recv_unacked;
        self.recv_granted += increment;
        self.recv_unacked = 0;
        increment
    }
}
