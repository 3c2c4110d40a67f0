//! Outbound frame queue
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use heapless::Deque;

use crate::packet::Psdu;
use super::tag::FrameKind;

/// Transmit queue capacity
pub const TX_QUEUE_LEN: usize = 16;

/// Serialized frame awaiting transmission
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// Upper layer handle used to correlate confirmations
    pub handle: u8,

    /// Frame sequence number
    pub seq: u8,

    /// Whether the frame requests an acknowledgement
    pub ack_request: bool,

    /// Whether the frame is sent to the broadcast short address
    pub broadcast: bool,

    /// Out-of-band frame purpose
    pub kind: FrameKind,

    /// Encoded PSDU including FCS
    pub psdu: Psdu,
}

/// Retransmission bookkeeping for the head frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryCounters {
    /// Data-layer retransmissions
    pub retries: u8,

    /// Cumulative channel access attempts, for diagnostics
    pub csma_attempts: u32,
}

/// FIFO of outbound frames, the head stays queued while in flight
pub struct TxQueue {
    frames: Deque<OutboundFrame, TX_QUEUE_LEN>,
    counters: RetryCounters,
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TxQueue {
    pub fn new() -> Self {
        Self {
            frames: Deque::new(),
            counters: RetryCounters::default(),
        }
    }

    /// Append a frame, handing it back if the queue is full
    pub fn push(&mut self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        self.frames.push_back(frame)
    }

    /// Head-of-line frame
    pub fn head(&self) -> Option<&OutboundFrame> {
        self.frames.front()
    }

    /// Remove the head frame, resetting the retry counters.
    ///
    /// Returns the frame with the counters it accumulated.
    pub fn pop(&mut self) -> Option<(OutboundFrame, RetryCounters)> {
        let f = self.frames.pop_front()?;
        let c = core::mem::take(&mut self.counters);

        Some((f, c))
    }

    pub fn counters(&self) -> RetryCounters {
        self.counters
    }

    /// Count a retransmission of the head frame along with the channel
    /// access attempts used by the previous one
    pub fn retry(&mut self, backoffs: u8) {
        self.counters.retries = self.counters.retries.saturating_add(1);
        self.add_csma_attempts(backoffs);
    }

    /// Add the attempts used by a channel access procedure
    pub fn add_csma_attempts(&mut self, backoffs: u8) {
        self.counters.csma_attempts = self.counters.csma_attempts.saturating_add(backoffs as u32 + 1);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
