//! Energy handshake context and charging maths
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::{Address, PanId, ShortAddress};

use super::config::Config;

/// State of an in-progress RFE / CFE / CFE-ACK / ENERGY exchange
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandshakeContext {
    /// Originator of the RFE being answered
    pub requester: Option<Address>,

    /// Stagger group carried by the RFE
    pub group: u8,

    /// Charging target announced by the CFE (or a unicast RFE)
    pub target: Option<(PanId, ShortAddress)>,

    /// First-slot energy sample
    pub first_sample: Option<f64>,

    /// Second-slot energy sample
    pub second_sample: Option<f64>,
}

impl HandshakeContext {
    /// Context for a received RFE
    pub fn from_rfe(requester: Address, destination: Address, group: u8) -> Self {
        let target = match destination {
            Address::Short(pan, addr) if addr != ShortAddress::broadcast() => Some((pan, addr)),
            _ => None,
        };

        Self {
            requester: Some(requester),
            group,
            target,
            ..Default::default()
        }
    }

    /// Whether `addr` is the announced charging target
    pub fn is_target(&self, addr: ShortAddress) -> bool {
        matches!(self.target, Some((_, a)) if a == addr)
    }

    /// Charging duration from the recorded samples, `None` until both
    /// samples are present or if they carry no usable energy
    pub fn charging_duration_us(&self, config: &Config) -> Option<u64> {
        let total = self.first_sample? + self.second_sample?;
        if !(total > 0.0) {
            return None;
        }

        let seconds = required_energy(config) / total;

        // Round to the nearest microsecond
        Some((seconds * 1_000_000.0 + 0.5) as u64)
    }
}

/// Energy in Joules needed to take the store from minimum to maximum voltage
pub fn required_energy(config: &Config) -> f64 {
    let (max, min) = (config.max_voltage, config.min_voltage);

    0.5 * config.capacitance_f * (max * max - min * min)
}

/// Whether a store at `voltage` has dropped below the request threshold
pub fn needs_energy(config: &Config, voltage: f64) -> bool {
    voltage < config.min_threshold_voltage
}
