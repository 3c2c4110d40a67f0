//! MAC data service primitives and observer interface
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::{Address, AddressMode};

use super::{MacState, tag::FrameKind, filter::Rule, phy::PhyStatus};

bitflags::bitflags! {
    /// Transmission options for data requests
    pub struct TxOptions: u8 {
        /// Acknowledged transmission
        const ACK       = 0b0000_0001;
        /// GTS transmission, unsupported in non-beacon PANs
        const GTS       = 0b0000_0010;
        /// Indirect transmission, sent directly
        const INDIRECT  = 0b0000_0100;
    }
}

/// Data request parameters
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    /// Source addressing mode
    pub src_addr_mode: AddressMode,

    /// Destination address and PAN
    pub dst: Address,

    /// Handle returned in the matching confirmation
    pub handle: u8,

    /// Raw transmission option bits, see [`TxOptions`]
    pub tx_options: u8,
}

/// Data service status codes
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum Status {
    Success,
    FrameTooLong,
    InvalidAddress,
    InvalidParameter,
    ChannelAccessFailure,
    NoAck,
    TransactionOverflow,
}

/// Confirmation of a data request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataConfirm {
    pub handle: u8,
    pub status: Status,
}

/// Received data frame parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataIndication {
    pub seq: u8,
    pub lqi: u8,
    pub src: Address,
    pub dst: Address,
}

/// Reason a received frame was discarded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RxDropReason {
    /// Received while transmitting
    Busy,
    /// FCS mismatch
    Checksum,
    /// Frame could not be parsed
    Malformed,
    /// Rejected by the acceptance filter
    Filtered(Rule),
    /// Handshake frame not applicable to this role or state
    Role,
}

/// Observable MAC events for tracing and test harnesses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacTrace<'a> {
    /// Frame added to the transmit queue
    TxEnqueue { handle: u8, seq: u8 },
    /// Frame removed from the transmit queue
    TxDequeue { handle: u8, seq: u8 },
    /// Frame handed to the PHY
    Tx { psdu: &'a [u8], kind: FrameKind },
    /// Frame delivered successfully
    TxOk { seq: u8 },
    /// Frame dropped before delivery
    TxDrop { seq: u8, kind: FrameKind },
    /// Frame accepted
    Rx { psdu: &'a [u8], kind: Option<FrameKind> },
    /// Received frame dropped
    RxDrop { psdu: &'a [u8], reason: RxDropReason },
    /// Any successfully checksummed frame, sent or received
    Sniffer { psdu: &'a [u8] },
    /// Frame delivered in promiscuous mode
    PromiscRx { psdu: &'a [u8] },
    /// MAC state transition
    StateChange { from: MacState, to: MacState },
    /// Non-broadcast frame left the queue
    SentPkt { seq: u8, retries: u8, csma_attempts: u32 },
    /// Handshake reply did not arrive in time
    HandshakeTimeout { state: MacState },
    /// Handshake abandoned without usable energy samples
    HandshakeAbort { state: MacState },
    /// Radio reported an unexpected state
    Fault { state: MacState, status: PhyStatus },
}

/// Upper layer hooks, all methods default to no-ops
pub trait MacListener {
    /// Completion of a data request
    fn data_confirm(&mut self, _confirm: DataConfirm) {}

    /// Reception of a data frame
    fn data_indication(&mut self, _ind: &DataIndication, _payload: &[u8]) {}

    /// Energy harvested by a completed handshake
    fn energy_indication(&mut self, _energy: f64) {}

    /// Trace event
    fn trace(&mut self, _event: &MacTrace<'_>) {}
}

impl MacListener for () {}

impl <L: MacListener> MacListener for &mut L {
    fn data_confirm(&mut self, confirm: DataConfirm) {
        (**self).data_confirm(confirm)
    }

    fn data_indication(&mut self, ind: &DataIndication, payload: &[u8]) {
        (**self).data_indication(ind, payload)
    }

    fn energy_indication(&mut self, energy: f64) {
        (**self).energy_indication(energy)
    }

    fn trace(&mut self, event: &MacTrace<'_>) {
        (**self).trace(event)
    }
}
