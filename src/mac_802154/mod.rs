//! 802.15.4 MAC Implementation
//!
//! Unslotted CSMA/CA MAC with acknowledged delivery and the RFE / CFE /
//! CFE-ACK / ENERGY handshake used to request and deliver wireless energy.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::{Address, AddressMode, FrameType, ShortAddress};

use log::{trace, debug, info, warn, error};

use crate::{Ts, error::CoreError, timer::{Deadline, Timer}};
use crate::packet::{self, Packet, MAX_MAC_PAYLOAD};

pub mod config;
pub use config::{Config, DeviceRole, Identity};

pub mod csma;
pub use csma::{ChannelAccess, ChannelStatus, Csma, CsmaConfig};

pub mod energy;
pub use energy::HandshakeContext;

pub mod events;
pub use events::{DataConfirm, DataIndication, DataRequest, MacListener, MacTrace, RxDropReason, Status, TxOptions};

pub mod filter;

pub mod phy;
pub use phy::{Phy, PhyEvent, PhyStatus, TrxState};

pub mod queue;
pub use queue::{OutboundFrame, RetryCounters, TxQueue};

pub mod tag;
pub use tag::FrameKind;

/// Receive buffer length, fits a PSDU plus side-channel metadata
const RX_BUFF_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum MacState {
    Idle,
    ChannelAccess,
    Sending,
    AckPending,
    CfePending,
    CfeAckPending,
    EnergyPending,
}

impl MacState {
    /// Whether the state waits on the energy handshake
    pub fn is_handshake(&self) -> bool {
        matches!(self, MacState::CfePending | MacState::CfeAckPending | MacState::EnergyPending)
    }
}

/// Deferred state transitions, at most one is pending
#[derive(Debug, Clone, Copy, PartialEq)]
enum Deferred {
    Enter(MacState),
    SendAck(u8),
    SendCfe,
    SendCfeAck(u64),
    SendEnergy(u64),
}

/// Frame currently owned by the transmit path
#[derive(Debug, Clone, PartialEq)]
enum Outgoing {
    /// Head of the transmit queue
    Queued,
    /// Immediate acknowledgement, never retried
    Ack(OutboundFrame),
    /// Energy handshake frame
    Handshake(OutboundFrame),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacStats {
    pub tx_ok: u32,
    pub tx_no_ack: u32,
    pub tx_channel_fail: u32,
    pub tx_too_long: u32,
    pub rx_ok: u32,
    pub rx_drop: u32,
    pub desync: u32,
}

pub struct Mac<P, C, T, L> {
    identity: Identity,
    role: DeviceRole,
    config: Config,

    phy: P,
    csma: C,
    timer: T,
    listener: L,

    state: MacState,
    seq: u8,

    /// Radio state requests awaiting confirmation
    trx_pending: u8,

    queue: TxQueue,
    outgoing: Option<Outgoing>,
    handshake: Option<HandshakeContext>,

    /// CFE-ACK duration held until the current transmission completes
    held_cfe_ack: Option<u64>,

    ack_wait: Deadline<()>,
    deferred: Deadline<Deferred>,
    handshake_timeout: Deadline<()>,

    stats: MacStats,
}

impl <P, C, T, L> Mac<P, C, T, L>
where
    P: Phy,
    C: ChannelAccess,
    T: Timer,
    L: MacListener,
{
    pub fn new(identity: Identity, role: DeviceRole, config: Config, phy: P, mut csma: C, timer: T, listener: L) -> Result<Self, CoreError<P::Error>> {
        csma.set_symbol_rate(config.symbol_rate);

        let mut s = Self {
            identity,
            role,
            config,

            phy,
            csma,
            timer,
            listener,

            state: MacState::Idle,
            seq: 1,

            trx_pending: 0,

            queue: TxQueue::new(),
            outgoing: None,
            handshake: None,
            held_cfe_ack: None,

            ack_wait: Deadline::new(),
            deferred: Deadline::new(),
            handshake_timeout: Deadline::new(),

            stats: MacStats::default(),
        };

        debug!("Setup {} MAC with address {:?} at {} us", s.role, s.identity.short(), s.timer.ticks_us());

        s.idle_radio()?;

        Ok(s)
    }

    /// Fetch MAC state
    pub fn state(&self) -> MacState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Reconfigure device addressing
    pub fn set_identity(&mut self, identity: Identity) {
        debug!("Set identity {:?}", identity);
        self.identity = identity;
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_promiscuous(&mut self, enabled: bool) {
        self.config.promiscuous = enabled;
    }

    /// Enable or disable the receiver while idle, applied immediately when idle
    pub fn set_rx_on_when_idle(&mut self, enabled: bool) -> Result<(), CoreError<P::Error>> {
        self.config.rx_on_when_idle = enabled;

        if self.state == MacState::Idle {
            self.idle_radio()?;
        }

        Ok(())
    }

    /// Fetch MAC layer statistics
    pub fn stats(&self) -> MacStats {
        self.stats.clone()
    }

    /// Number of frames awaiting transmission (including the in-flight head)
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Retry counters for the head frame
    pub fn counters(&self) -> RetryCounters {
        self.queue.counters()
    }

    /// Current handshake context, if any
    pub fn handshake(&self) -> Option<&HandshakeContext> {
        self.handshake.as_ref()
    }

    /// Whether the MAC has work in progress
    pub fn is_busy(&self) -> bool {
        self.state != MacState::Idle || self.outgoing.is_some() || !self.queue.is_empty()
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Fetch and increment TX sequence number
    fn seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Mark `seq` as used once its frame has been accepted
    fn commit_seq(&mut self, seq: u8) {
        self.seq = seq.wrapping_add(1);
    }

    /// Submit an MSDU for transmission.
    ///
    /// The outcome is always reported through [`MacListener::data_confirm`],
    /// invalid requests are confirmed before this returns.
    pub fn submit(&mut self, req: &DataRequest, payload: &[u8]) {
        if let Err(status) = self.validate(req, payload) {
            warn!("Rejected data request {} ({})", req.handle, status);
            self.confirm(req.handle, status);
            return;
        }

        let options = TxOptions::from_bits_truncate(req.tx_options);
        if options.contains(TxOptions::INDIRECT) {
            debug!("Indirect transmission unsupported, sending {} directly", req.handle);
        }

        let broadcast = is_broadcast(&req.dst);
        let ack_request = options.contains(TxOptions::ACK) && !broadcast;

        let source = match req.src_addr_mode {
            AddressMode::None => Address::None,
            AddressMode::Short => self.identity.short(),
            AddressMode::Extended => self.identity.extended(),
        };

        let seq = self.seq;

        // Long addressing can still overrun the PSDU
        let psdu = match Packet::data(req.dst, source, seq, payload, ack_request).and_then(|p| p.to_psdu()) {
            Some(p) => p,
            None => {
                warn!("Data request {} exceeds PSDU size", req.handle);
                self.confirm(req.handle, Status::FrameTooLong);
                return;
            }
        };

        let frame = OutboundFrame {
            handle: req.handle,
            seq,
            ack_request,
            broadcast,
            kind: FrameKind::Data,
            psdu,
        };

        if let Err(f) = self.queue.push(frame) {
            warn!("TX queue full, dropping request {}", f.handle);
            self.confirm(f.handle, Status::TransactionOverflow);
            return;
        }

        self.commit_seq(seq);

        debug!("Enqueued frame {} (handle {}) to {:?}", seq, req.handle, req.dst);
        self.listener.trace(&MacTrace::TxEnqueue{ handle: req.handle, seq });

        self.check_queue();
    }

    fn validate(&self, req: &DataRequest, payload: &[u8]) -> Result<(), Status> {
        if payload.len() > MAX_MAC_PAYLOAD {
            return Err(Status::FrameTooLong);
        }

        match (&req.src_addr_mode, &req.dst) {
            (AddressMode::None, Address::None) => return Err(Status::InvalidAddress),
            (AddressMode::Short, _) if !self.identity.has_short_addr() => return Err(Status::InvalidAddress),
            _ => (),
        }

        let options = TxOptions::from_bits(req.tx_options).ok_or(Status::InvalidParameter)?;

        // Non-beacon PAN, no GTS available
        if options.contains(TxOptions::GTS) {
            return Err(Status::InvalidParameter);
        }

        Ok(())
    }

    /// Request energy from any listening donor
    pub fn request_energy(&mut self) -> Result<(), CoreError<P::Error>> {
        self.request_energy_from(Address::broadcast(&AddressMode::Short))
    }

    /// Request energy when the store `voltage` has dropped below the configured threshold,
    /// returning whether an RFE was started
    pub fn request_energy_if_low(&mut self, voltage: f64) -> Result<bool, CoreError<P::Error>> {
        if !energy::needs_energy(&self.config, voltage) {
            trace!("Store at {} V, no energy needed", voltage);
            return Ok(false);
        }

        self.request_energy()?;

        Ok(true)
    }

    /// Send an RFE to `dest` using channel access.
    ///
    /// A unicast RFE names `dest` as the charging target.
    pub fn request_energy_from(&mut self, dest: Address) -> Result<(), CoreError<P::Error>> {
        if self.state != MacState::Idle || self.outgoing.is_some() || self.deferred.is_armed() {
            return Err(CoreError::Busy);
        }

        let p = Packet::handshake(dest, self.identity.short(), self.seq);
        let frame = match outbound(&p, FrameKind::Rfe{ group: self.config.rfe_group }) {
            Some(f) => f,
            None => return Err(CoreError::Busy),
        };
        self.commit_seq(frame.seq);

        info!("Requesting energy from {:?} (group {})", dest, self.config.rfe_group);

        self.outgoing = Some(Outgoing::Handshake(frame));
        self.schedule(0, Deferred::Enter(MacState::ChannelAccess));

        Ok(())
    }

    /// Poll the PHY, channel access and timers
    pub fn tick(&mut self) -> Result<(), CoreError<P::Error>> {
        let now = self.timer.ticks_us();

        trace!("Tick at {} us in state {}", now, self.state);

        // Drain radio events
        let mut buff = [0u8; RX_BUFF_LEN];
        while let Some(ev) = self.phy.poll(&mut buff).map_err(CoreError::Radio)? {
            self.handle_phy_event(ev, &buff)?;
        }

        // Start clear channel assessments when backoffs expire
        if self.csma.poll(now) {
            self.phy.request_cca().map_err(CoreError::Radio)?;
        }

        if self.ack_wait.poll(now).is_some() {
            self.ack_timeout()?;
        }

        if self.handshake_timeout.poll(now).is_some() {
            self.handshake_expired()?;
        }

        if let Some(d) = self.deferred.poll(now) {
            self.run_deferred(d)?;
        }

        Ok(())
    }

    fn handle_phy_event(&mut self, ev: PhyEvent, buff: &[u8]) -> Result<(), CoreError<P::Error>> {
        match ev {
            PhyEvent::TrxState(status) => self.handle_trx_state_confirm(status),
            PhyEvent::DataConfirm(status) => self.handle_data_confirm(status),
            PhyEvent::Cca(status) => self.handle_cca_confirm(status),
            PhyEvent::Received{ len, lqi, kind } => {
                let len = len.min(buff.len());
                self.handle_frame_received(&buff[..len], lqi, kind)
            },
            PhyEvent::EnergySample{ energy, slot } => self.handle_energy_sample(energy, slot),
        }
    }

    /// Handle completion of a transceiver state request
    pub fn handle_trx_state_confirm(&mut self, status: PhyStatus) -> Result<(), CoreError<P::Error>> {
        use MacState::*;
        use PhyStatus::{RxOn, TxOn, TrxOff, Success};

        trace!("Radio state {} confirmed in {}", status, self.state);

        // Superseded by a later request, only the latest confirmation counts
        if self.trx_pending > 1 {
            self.trx_pending -= 1;
            debug!("Ignoring superseded radio state {} in {}", status, self.state);
            return Ok(());
        }
        self.trx_pending = self.trx_pending.saturating_sub(1);

        match (self.state, status) {
            (Sending, TxOn | Success) => self.transmit_outgoing(),
            (ChannelAccess, RxOn | Success) => {
                let now = self.timer.ticks_us();
                self.csma.start(now);
                Ok(())
            },
            (Idle, RxOn | Success | TrxOff) => Ok(()),
            (AckPending | CfePending | CfeAckPending | EnergyPending, RxOn | Success) => Ok(()),
            (state, status) => self.desync(state, status),
        }
    }

    /// Handle completion of a transmission
    pub fn handle_data_confirm(&mut self, status: PhyStatus) -> Result<(), CoreError<P::Error>> {
        if self.state != MacState::Sending {
            return self.desync(self.state, status);
        }

        self.complete_tx(status)?;

        if let Some(duration_us) = self.held_cfe_ack.take() {
            debug!("Sending held CFE-ACK for {} us", duration_us);

            // A frame awaiting its ACK is retried after the handshake
            if let Some(Outgoing::Queued) = self.outgoing {
                let _ = self.prepare_retransmission();
            }
            self.outgoing = None;

            self.change_state(MacState::Idle);
            self.schedule(0, Deferred::SendCfeAck(duration_us));
        }

        Ok(())
    }

    fn complete_tx(&mut self, status: PhyStatus) -> Result<(), CoreError<P::Error>> {
        let outgoing = self.outgoing.take();

        match (status, outgoing) {
            (PhyStatus::Success, Some(Outgoing::Queued)) => {
                let head = self.queue.head().map(|f| (f.handle, f.seq, f.ack_request));

                match head {
                    Some((_handle, seq, true)) => {
                        debug!("Frame {} sent, awaiting ACK", seq);
                        self.outgoing = Some(Outgoing::Queued);
                        self.schedule(0, Deferred::Enter(MacState::AckPending));
                        return Ok(());
                    },
                    Some((handle, seq, false)) => {
                        debug!("Frame {} sent", seq);
                        self.listener.trace(&MacTrace::TxOk{ seq });
                        self.stats.tx_ok = self.stats.tx_ok.saturating_add(1);
                        self.confirm(handle, Status::Success);
                        self.remove_head();
                    },
                    None => warn!("Transmit confirmed with empty queue"),
                }
            },
            (PhyStatus::Success, Some(Outgoing::Ack(f))) => {
                trace!("ACK {} sent", f.seq);
            },
            (PhyStatus::Success, Some(Outgoing::Handshake(f))) => {
                let next = match f.kind {
                    FrameKind::Rfe{..} => Some(MacState::CfePending),
                    FrameKind::Cfe{..} => Some(MacState::CfeAckPending),
                    FrameKind::CfeAck{..} => Some(MacState::EnergyPending),
                    FrameKind::Energy{ duration_us } => {
                        info!("Energy pulse of {} us sent", duration_us);
                        self.handshake = None;
                        None
                    },
                    FrameKind::Data | FrameKind::Ack => None,
                };

                if let Some(next) = next {
                    debug!("{} frame sent, entering {}", f.kind, next);
                    self.outgoing = Some(Outgoing::Handshake(f));
                    self.schedule(0, Deferred::Enter(next));
                    return Ok(());
                }
            },
            (PhyStatus::Unspecified, Some(Outgoing::Queued)) => {
                if let Some((handle, seq, kind)) = self.queue.head().map(|f| (f.handle, f.seq, f.kind)) {
                    warn!("PHY rejected frame {}, dropping", seq);
                    self.listener.trace(&MacTrace::TxDrop{ seq, kind });
                    self.stats.tx_too_long = self.stats.tx_too_long.saturating_add(1);
                    self.confirm(handle, Status::FrameTooLong);
                }
                self.remove_head();
            },
            (PhyStatus::Unspecified, Some(Outgoing::Ack(f))) | (PhyStatus::Unspecified, Some(Outgoing::Handshake(f))) => {
                warn!("PHY rejected {} frame {}", f.kind, f.seq);
                self.listener.trace(&MacTrace::TxDrop{ seq: f.seq, kind: f.kind });
            },
            (PhyStatus::Success, None) | (PhyStatus::Unspecified, None) => {
                warn!("Transmit confirmed with nothing in flight");
            },
            (status, outgoing) => {
                self.outgoing = outgoing;
                return self.desync(self.state, status);
            },
        }

        self.schedule(0, Deferred::Enter(MacState::Idle));

        Ok(())
    }

    /// Relay a clear channel assessment result to the arbiter
    pub fn handle_cca_confirm(&mut self, status: PhyStatus) -> Result<(), CoreError<P::Error>> {
        let now = self.timer.ticks_us();

        match self.csma.cca_confirm(status == PhyStatus::Idle, now) {
            Some(ChannelStatus::Idle) => self.channel_idle(),
            Some(ChannelStatus::AccessFailure) => self.channel_access_failure(),
            None => Ok(()),
        }
    }

    /// Handle a received PSDU (including FCS) with optional out-of-band purpose
    pub fn handle_frame_received(&mut self, psdu: &[u8], lqi: u8, kind: Option<FrameKind>) -> Result<(), CoreError<P::Error>> {
        // Half duplex, nothing can be received mid transmission
        if self.state == MacState::Sending {
            return Ok(self.drop_rx(psdu, RxDropReason::Busy));
        }

        if self.config.checksum && !packet::fcs_valid(psdu) {
            debug!("FCS mismatch, dropped {} byte frame", psdu.len());
            return Ok(self.drop_rx(psdu, RxDropReason::Checksum));
        }

        self.listener.trace(&MacTrace::Sniffer{ psdu });

        let p = match Packet::decode(psdu, true) {
            Ok(p) => p,
            Err(e) => {
                debug!("Error decoding received frame: {:?}", e);
                return Ok(self.drop_rx(psdu, RxDropReason::Malformed));
            }
        };

        let ind = DataIndication {
            seq: p.header.seq,
            lqi,
            src: p.header.source,
            dst: p.header.destination,
        };

        if self.config.promiscuous {
            trace!("Promiscuous RX of frame {} from {:?}", p.header.seq, p.header.source);
            self.listener.trace(&MacTrace::PromiscRx{ psdu });
            self.listener.data_indication(&ind, p.payload());
            return Ok(());
        }

        if let Err(rule) = filter::accept(&p.header, &self.identity) {
            debug!("Filtered frame {} for {:?} ({})", p.header.seq, p.header.destination, rule);
            return Ok(self.drop_rx(psdu, RxDropReason::Filtered(rule)));
        }

        self.listener.trace(&MacTrace::Rx{ psdu, kind });
        self.stats.rx_ok = self.stats.rx_ok.saturating_add(1);

        if let Some(k) = kind {
            if k.is_handshake() {
                return self.handle_handshake_frame(&p, k, psdu);
            }
        }

        let wants_ack = matches!(p.header.frame_type, FrameType::Data | FrameType::MacCommand)
            && p.header.ack_request
            && !is_broadcast(&p.header.destination);

        if wants_ack {
            self.reply_ack(p.header.seq);
        }

        match p.header.frame_type {
            FrameType::Data => {
                debug!("Received {} bytes of data from {:?}", p.payload().len(), p.header.source);
                self.listener.data_indication(&ind, p.payload());
            },
            FrameType::Acknowledgement => self.handle_ack(&p),
            t => trace!("Ignoring {:?} frame {}", t, p.header.seq),
        }

        Ok(())
    }

    /// Handle a sensed energy sample for handshake `slot`
    pub fn handle_energy_sample(&mut self, energy: f64, slot: u8) -> Result<(), CoreError<P::Error>> {
        match (slot, self.role) {
            (0, _) if self.state == MacState::EnergyPending => {
                info!("Energy indication: {}", energy);

                self.listener.energy_indication(energy);

                self.outgoing = None;
                self.handshake = None;
                self.schedule(0, Deferred::Enter(MacState::Idle));
            },
            (1, DeviceRole::Sensor) => {
                let ctx = self.handshake.get_or_insert_with(HandshakeContext::default);
                ctx.first_sample = Some(energy);
            },
            (2, DeviceRole::Sensor) => {
                let ctx = self.handshake.get_or_insert_with(HandshakeContext::default);
                ctx.second_sample = Some(energy);

                if !ctx.is_target(self.identity.short_addr) {
                    trace!("Not the charging target, ignoring slot 2 sample");
                    return Ok(());
                }

                match ctx.charging_duration_us(&self.config) {
                    Some(duration_us) if self.state == MacState::Sending => {
                        debug!("Charging target, CFE-ACK for {} us held until TX completes", duration_us);
                        self.held_cfe_ack = Some(duration_us);
                    },
                    Some(duration_us) => {
                        debug!("Charging target, requesting {} us of energy", duration_us);

                        self.preempt();
                        self.change_state(MacState::Idle);
                        self.schedule(0, Deferred::SendCfeAck(duration_us));
                    },
                    None => {
                        warn!("No usable energy samples, aborting handshake");

                        self.handshake = None;
                        self.outgoing = None;
                        self.listener.trace(&MacTrace::HandshakeAbort{ state: self.state });
                        self.schedule(0, Deferred::Enter(MacState::Idle));
                    },
                }
            },
            _ => trace!("Ignoring energy sample {} for slot {} in {}", energy, slot, self.state),
        }

        Ok(())
    }

    fn handle_handshake_frame(&mut self, p: &Packet, kind: FrameKind, psdu: &[u8]) -> Result<(), CoreError<P::Error>> {
        match (self.role, kind) {
            (DeviceRole::EnergyDonor, FrameKind::Rfe{ group }) => {
                let delay = self.config.group_delay_us(group);
                info!("RFE from {:?} (group {}), replying in {} us", p.header.source, group, delay);

                self.preempt();
                self.change_state(MacState::Idle);

                self.handshake = Some(HandshakeContext::from_rfe(p.header.source, p.header.destination, group));
                self.schedule(delay, Deferred::SendCfe);
            },
            (DeviceRole::EnergyDonor, FrameKind::CfeAck{ duration_us })
                    if matches!(self.state, MacState::CfePending | MacState::CfeAckPending) => {
                info!("CFE-ACK from {:?}, sending energy for {} us", p.header.source, duration_us);

                self.change_state(MacState::Idle);
                self.schedule(0, Deferred::SendEnergy(duration_us));
            },
            (DeviceRole::Sensor, FrameKind::Rfe{ group }) => {
                info!("RFE from {:?}, holding for energy", p.header.source);

                self.preempt();
                self.handshake = Some(HandshakeContext::from_rfe(p.header.source, p.header.destination, group));
                self.change_state(MacState::EnergyPending);
            },
            (DeviceRole::Sensor, FrameKind::Cfe{ .. }) => {
                let target = match p.header.destination {
                    Address::Short(pan, addr) => Some((pan, addr)),
                    _ => None,
                };

                debug!("CFE from {:?} announces target {:?}", p.header.source, target);

                let ctx = self.handshake.get_or_insert_with(HandshakeContext::default);
                ctx.target = target;
            },
            (role, kind) => {
                debug!("Dropping {} frame for {} in {}", kind, role, self.state);
                self.drop_rx(psdu, RxDropReason::Role);
            },
        }

        Ok(())
    }

    fn handle_ack(&mut self, p: &Packet) {
        if self.state != MacState::AckPending {
            debug!("ACK {} with no pending operation", p.header.seq);
            return;
        }

        let head = match (&self.outgoing, self.queue.head()) {
            (Some(Outgoing::Queued), Some(f)) => (f.handle, f.seq),
            _ => {
                warn!("ACK pending without queued frame");
                return;
            },
        };

        self.ack_wait.cancel();

        let (handle, seq) = head;
        if p.is_ack_for(seq) {
            debug!("ACK rx for frame {}", seq);

            self.listener.trace(&MacTrace::TxOk{ seq });
            self.stats.tx_ok = self.stats.tx_ok.saturating_add(1);
            self.confirm(handle, Status::Success);
            self.remove_head();

            self.schedule(0, Deferred::Enter(MacState::Idle));

        } else {
            warn!("ACK sequence mismatch (expected {} got {})", seq, p.header.seq);

            match self.prepare_retransmission() {
                true => self.schedule(0, Deferred::Enter(MacState::ChannelAccess)),
                false => self.schedule(0, Deferred::Enter(MacState::Idle)),
            }
        }
    }

    /// Abandon local waits and reply to a frame requesting acknowledgement
    fn reply_ack(&mut self, seq: u8) {
        debug!("Scheduling ACK for frame {} in {}", seq, self.state);

        self.preempt();

        if let Some(Outgoing::Handshake(f)) = &self.outgoing {
            warn!("{} frame preempted by ACK", f.kind);
            self.listener.trace(&MacTrace::TxDrop{ seq: f.seq, kind: f.kind });
        }

        self.change_state(MacState::Idle);
        self.schedule(0, Deferred::SendAck(seq));
    }

    /// Stop channel access or ACK waits so another operation can take priority.
    ///
    /// A pending ACK wait counts as a failed attempt and the frame is retried later.
    fn preempt(&mut self) {
        match self.state {
            MacState::ChannelAccess => self.csma.stop(),
            MacState::AckPending => {
                self.ack_wait.cancel();
                let _ = self.prepare_retransmission();
            },
            _ => (),
        }

        self.deferred.cancel();
    }

    fn channel_idle(&mut self) -> Result<(), CoreError<P::Error>> {
        if self.state != MacState::ChannelAccess {
            debug!("Channel idle reported in {}, ignoring", self.state);
            return Ok(());
        }

        self.set_mac_state(MacState::Sending)
    }

    fn channel_access_failure(&mut self) -> Result<(), CoreError<P::Error>> {
        if self.state != MacState::ChannelAccess {
            debug!("Channel access failure reported in {}, ignoring", self.state);
            return Ok(());
        }

        match self.outgoing.take() {
            Some(Outgoing::Queued) => {
                if let Some((handle, seq, kind)) = self.queue.head().map(|f| (f.handle, f.seq, f.kind)) {
                    warn!("Channel access failure for frame {}", seq);
                    self.listener.trace(&MacTrace::TxDrop{ seq, kind });
                    self.stats.tx_channel_fail = self.stats.tx_channel_fail.saturating_add(1);
                    self.confirm(handle, Status::ChannelAccessFailure);
                }
                self.remove_head();
            },
            Some(Outgoing::Ack(f)) | Some(Outgoing::Handshake(f)) => {
                warn!("Channel access failure for {} frame {}", f.kind, f.seq);
                self.listener.trace(&MacTrace::TxDrop{ seq: f.seq, kind: f.kind });
            },
            None => (),
        }

        self.set_mac_state(MacState::Idle)
    }

    fn ack_timeout(&mut self) -> Result<(), CoreError<P::Error>> {
        if self.state != MacState::AckPending {
            return Ok(());
        }

        warn!("ACK timeout (retries: {})", self.queue.counters().retries);

        match self.prepare_retransmission() {
            true => self.set_mac_state(MacState::ChannelAccess),
            false => self.set_mac_state(MacState::Idle),
        }
    }

    fn handshake_expired(&mut self) -> Result<(), CoreError<P::Error>> {
        if !self.state.is_handshake() {
            return Ok(());
        }

        warn!("Handshake timeout in {}", self.state);
        self.listener.trace(&MacTrace::HandshakeTimeout{ state: self.state });

        self.handshake = None;
        self.held_cfe_ack = None;
        self.outgoing = None;
        self.deferred.cancel();

        self.set_mac_state(MacState::Idle)
    }

    /// Retry the head frame if permitted, otherwise drop it with NoAck
    fn prepare_retransmission(&mut self) -> bool {
        let retries = self.queue.counters().retries;

        if retries >= self.config.max_frame_retries {
            if let Some((handle, seq, kind)) = self.queue.head().map(|f| (f.handle, f.seq, f.kind)) {
                warn!("Frame {} not acknowledged after {} retries", seq, retries);
                self.listener.trace(&MacTrace::TxDrop{ seq, kind });
                self.stats.tx_no_ack = self.stats.tx_no_ack.saturating_add(1);
                self.confirm(handle, Status::NoAck);
            }
            self.remove_head();
            return false;
        }

        self.queue.retry(self.csma.backoff_count());
        debug!("Retransmission {} of {}", retries + 1, self.config.max_frame_retries);

        true
    }

    /// Release the head frame
    fn remove_head(&mut self) {
        self.queue.add_csma_attempts(self.csma.backoff_count());

        if let Some((f, c)) = self.queue.pop() {
            self.listener.trace(&MacTrace::TxDequeue{ handle: f.handle, seq: f.seq });

            if !f.broadcast {
                self.listener.trace(&MacTrace::SentPkt{
                    seq: f.seq,
                    retries: c.retries.saturating_add(1),
                    csma_attempts: c.csma_attempts,
                });
            }
        }

        if let Some(Outgoing::Queued) = self.outgoing {
            self.outgoing = None;
        }
    }

    /// Begin channel access for the head frame when possible
    fn check_queue(&mut self) {
        if self.state == MacState::Idle
                && !self.queue.is_empty()
                && self.outgoing.is_none()
                && !self.deferred.is_armed() {
            self.outgoing = Some(Outgoing::Queued);
            self.schedule(0, Deferred::Enter(MacState::ChannelAccess));
        }
    }

    fn run_deferred(&mut self, d: Deferred) -> Result<(), CoreError<P::Error>> {
        trace!("Running deferred {:?}", d);

        match d {
            Deferred::Enter(s) => self.set_mac_state(s),
            Deferred::SendAck(seq) => {
                self.send_now(&Packet::ack(seq), FrameKind::Ack)
            },
            Deferred::SendCfe => {
                let requester = self.handshake.as_ref().and_then(|c| c.requester);
                let dest = match requester {
                    Some(a) => a,
                    None => {
                        warn!("No RFE requester to answer");
                        return self.set_mac_state(MacState::Idle);
                    },
                };

                let p = Packet::handshake(dest, self.identity.short(), self.seq());
                self.send_now(&p, FrameKind::Cfe{ duration_us: self.config.cfe_duration_us })
            },
            Deferred::SendCfeAck(duration_us) => {
                let p = Packet::handshake(Address::broadcast(&AddressMode::Short), self.identity.short(), self.seq());
                self.send_now(&p, FrameKind::CfeAck{ duration_us })
            },
            Deferred::SendEnergy(duration_us) => {
                let p = Packet::handshake(Address::broadcast(&AddressMode::Short), self.identity.short(), self.seq());
                self.send_now(&p, FrameKind::Energy{ duration_us })
            },
        }
    }

    /// Transmit a locally generated frame without channel access
    fn send_now(&mut self, p: &Packet, kind: FrameKind) -> Result<(), CoreError<P::Error>> {
        let frame = match outbound(p, kind) {
            Some(f) => f,
            None => {
                error!("Failed to encode {} frame", kind);
                return self.set_mac_state(MacState::Idle);
            },
        };

        self.outgoing = Some(match kind {
            FrameKind::Ack => Outgoing::Ack(frame),
            _ => Outgoing::Handshake(frame),
        });

        self.set_mac_state(MacState::Sending)
    }

    /// Hand the in-flight frame to the PHY
    fn transmit_outgoing(&mut self) -> Result<(), CoreError<P::Error>> {
        let frame = match &self.outgoing {
            Some(Outgoing::Queued) => self.queue.head(),
            Some(Outgoing::Ack(f)) | Some(Outgoing::Handshake(f)) => Some(f),
            None => None,
        };

        let f = match frame {
            Some(f) => f,
            None => {
                warn!("TX on with nothing to send");
                return self.set_mac_state(MacState::Idle);
            },
        };

        debug!("Transmit {} frame {} ({} bytes) at {} us", f.kind, f.seq, f.psdu.len(), self.timer.ticks_us());

        self.listener.trace(&MacTrace::Sniffer{ psdu: &f.psdu });
        self.listener.trace(&MacTrace::Tx{ psdu: &f.psdu, kind: f.kind });

        self.phy.transmit(&f.psdu, f.kind).map_err(CoreError::Radio)
    }

    /// Enter a state and request the matching radio state
    fn set_mac_state(&mut self, to: MacState) -> Result<(), CoreError<P::Error>> {
        self.change_state(to);

        match to {
            MacState::Idle => {
                self.idle_radio()?;
                self.check_queue();
            },
            MacState::AckPending => {
                let wait = self.config.ack_wait_us(self.csma.unit_backoff_symbols());
                let now = self.timer.ticks_us();
                self.ack_wait.arm(now + wait, ());

                self.radio_state(TrxState::RxOn)?;
            },
            MacState::ChannelAccess | MacState::CfePending | MacState::CfeAckPending | MacState::EnergyPending => {
                self.radio_state(TrxState::RxOn)?;
            },
            MacState::Sending => {
                self.radio_state(TrxState::TxOn)?;
            },
        }

        Ok(())
    }

    /// Update the logical state without touching the radio
    fn change_state(&mut self, to: MacState) {
        let from = self.state;
        if from != to {
            debug!("MAC state {} -> {}", from, to);
            self.listener.trace(&MacTrace::StateChange{ from, to });
        }

        self.state = to;

        if to.is_handshake() {
            self.arm_handshake_timeout();
        } else {
            self.handshake_timeout.cancel();
        }
    }

    fn arm_handshake_timeout(&mut self) {
        let timeout = match self.config.handshake_timeout_us {
            Some(t) => t,
            None => return,
        };

        // Allow for the requested energy transfer after a CFE-ACK
        let extra = match (&self.outgoing, self.state) {
            (Some(Outgoing::Handshake(f)), MacState::EnergyPending) => match f.kind {
                FrameKind::CfeAck{ duration_us } => duration_us,
                _ => 0,
            },
            _ => 0,
        };

        let now = self.timer.ticks_us();
        self.handshake_timeout.arm(now + timeout + extra, ());
    }

    /// Schedule the next deferred transition, replacing any pending one
    fn schedule(&mut self, delay_us: Ts, action: Deferred) {
        let now = self.timer.ticks_us();
        self.deferred.arm(now + delay_us, action);
    }

    fn radio_state(&mut self, state: TrxState) -> Result<(), CoreError<P::Error>> {
        self.phy.set_trx_state(state).map_err(CoreError::Radio)?;
        self.trx_pending = self.trx_pending.saturating_add(1);
        Ok(())
    }

    fn idle_radio(&mut self) -> Result<(), CoreError<P::Error>> {
        match self.config.rx_on_when_idle {
            true => self.radio_state(TrxState::RxOn),
            false => self.radio_state(TrxState::TrxOff),
        }
    }

    /// Force a safe receive-on idle state after the radio desynchronised
    fn desync(&mut self, state: MacState, status: PhyStatus) -> Result<(), CoreError<P::Error>> {
        error!("Radio reported {} in MAC state {}, resetting", status, state);

        self.ack_wait.cancel();
        self.deferred.cancel();
        self.csma.stop();

        self.outgoing = None;
        self.handshake = None;
        self.held_cfe_ack = None;
        self.stats.desync = self.stats.desync.saturating_add(1);

        self.change_state(MacState::Idle);
        self.listener.trace(&MacTrace::Fault{ state, status });

        self.radio_state(TrxState::RxOn)?;

        // Queued frames, including an interrupted head, go out again
        self.check_queue();

        Err(CoreError::Desync{ state, status })
    }

    fn confirm(&mut self, handle: u8, status: Status) {
        self.listener.data_confirm(DataConfirm{ handle, status });
    }

    fn drop_rx(&mut self, psdu: &[u8], reason: RxDropReason) {
        self.stats.rx_drop = self.stats.rx_drop.saturating_add(1);
        self.listener.trace(&MacTrace::RxDrop{ psdu, reason });
    }
}

fn is_broadcast(a: &Address) -> bool {
    matches!(a, Address::Short(_, s) if *s == ShortAddress::broadcast())
}

/// Encode a locally generated frame
fn outbound(p: &Packet, kind: FrameKind) -> Option<OutboundFrame> {
    Some(OutboundFrame {
        handle: 0,
        seq: p.header.seq,
        ack_request: p.header.ack_request,
        broadcast: is_broadcast(&p.header.destination),
        kind,
        psdu: p.to_psdu()?,
    })
}
