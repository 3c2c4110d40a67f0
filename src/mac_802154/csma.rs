//! Unslotted CSMA/CA channel access
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{debug, trace};

use rand_core::RngCore;

use crate::Ts;
use super::config::DEFAULT_SYMBOL_RATE;

/// Outcome of a channel access procedure
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum ChannelStatus {
    /// Channel found idle, transmission may proceed
    Idle,
    /// Maximum number of backoffs exceeded
    AccessFailure,
}

/// Channel access arbiter driven by the MAC.
///
/// The MAC starts the arbiter, polls it for due clear channel assessments,
/// and relays CCA results back until an outcome is reported.
pub trait ChannelAccess {
    /// Begin a new channel access procedure
    fn start(&mut self, now_us: Ts);

    /// Abort the running procedure, no outcome will be reported
    fn stop(&mut self);

    /// Returns true when a clear channel assessment should be requested
    fn poll(&mut self, now_us: Ts) -> bool;

    /// Handle a CCA result, returning the outcome once the procedure completes
    fn cca_confirm(&mut self, idle: bool, now_us: Ts) -> Option<ChannelStatus>;

    /// Unit backoff period in symbols
    fn unit_backoff_symbols(&self) -> u32;

    /// Set the PHY symbol rate used to time backoff periods
    fn set_symbol_rate(&mut self, symbols_per_second: u32);

    /// Busy assessments seen by the current (or last) procedure
    fn backoff_count(&self) -> u8;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsmaConfig {
    /// Minimum backoff exponent (macMinBE)
    pub min_be: u8,

    /// Maximum backoff exponent (macMaxBE)
    pub max_be: u8,

    /// Maximum number of busy assessments before failure (macMaxCSMABackoffs)
    pub max_backoffs: u8,

    /// Unit backoff period in symbols (aUnitBackoffPeriod)
    pub unit_backoff_symbols: u32,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            min_be: 3,
            max_be: 5,
            max_backoffs: 4,
            unit_backoff_symbols: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CsmaState {
    Idle,
    Backoff(Ts),
    CcaPending,
}

/// Unslotted CSMA/CA using random exponential backoff
pub struct Csma<G> {
    config: CsmaConfig,
    rng: G,
    symbol_rate: u32,
    state: CsmaState,
    nb: u8,
    be: u8,
}

impl <G: RngCore> Csma<G> {
    pub fn new(config: CsmaConfig, rng: G) -> Self {
        let be = config.min_be;
        Self {
            config,
            rng,
            symbol_rate: DEFAULT_SYMBOL_RATE,
            state: CsmaState::Idle,
            nb: 0,
            be,
        }
    }

    /// Whether a procedure is in progress
    pub fn is_active(&self) -> bool {
        self.state != CsmaState::Idle
    }

    /// Unit backoff period in microseconds
    pub fn unit_backoff_us(&self) -> Ts {
        self.config.unit_backoff_symbols as Ts * 1_000_000 / self.symbol_rate.max(1) as Ts
    }

    /// Generate a new random backoff from the current exponent
    fn backoff(&mut self, now_us: Ts) {
        let window = 1u32 << self.be.min(31);
        let slots = self.rng.next_u32() % window;

        let until = now_us + slots as Ts * self.unit_backoff_us();

        trace!("CSMA backoff {} slots (NB: {} BE: {}) until {} us", slots, self.nb, self.be, until);

        self.state = CsmaState::Backoff(until);
    }
}

impl <G: RngCore> ChannelAccess for Csma<G> {
    fn start(&mut self, now_us: Ts) {
        self.nb = 0;
        self.be = self.config.min_be;

        self.backoff(now_us);
    }

    fn stop(&mut self) {
        if self.state != CsmaState::Idle {
            debug!("CSMA stopped (NB: {})", self.nb);
        }
        self.state = CsmaState::Idle;
    }

    fn poll(&mut self, now_us: Ts) -> bool {
        match self.state {
            CsmaState::Backoff(until) if now_us >= until => {
                self.state = CsmaState::CcaPending;
                true
            },
            _ => false,
        }
    }

    fn cca_confirm(&mut self, idle: bool, now_us: Ts) -> Option<ChannelStatus> {
        // Ignore stale results from stopped procedures
        if self.state != CsmaState::CcaPending {
            return None;
        }

        if idle {
            self.state = CsmaState::Idle;
            return Some(ChannelStatus::Idle);
        }

        self.nb = self.nb.saturating_add(1);
        self.be = (self.be + 1).min(self.config.max_be);

        if self.nb > self.config.max_backoffs {
            debug!("CSMA failed after {} backoffs", self.nb);
            self.state = CsmaState::Idle;
            return Some(ChannelStatus::AccessFailure);
        }

        self.backoff(now_us);
        None
    }

    fn unit_backoff_symbols(&self) -> u32 {
        self.config.unit_backoff_symbols
    }

    fn set_symbol_rate(&mut self, symbols_per_second: u32) {
        self.symbol_rate = symbols_per_second;
    }

    fn backoff_count(&self) -> u8 {
        self.nb
    }
}
