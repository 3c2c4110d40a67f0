//! MAC configuration, identity and role
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::{Address, ExtendedAddress, PanId, ShortAddress};

/// Energy slot length in microseconds
pub const ENERGY_SLOT_US: u64 = 10;

/// O-QPSK 2.4 GHz PHY symbol rate in symbols per second
pub const DEFAULT_SYMBOL_RATE: u32 = 62_500;

/// Short address value indicating no short address has been allocated
pub const SHORT_ADDR_UNALLOCATED: ShortAddress = ShortAddress(0xfffe);

/// Device addressing used for frame filtering and source fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Identity {
    pub pan_id: PanId,
    pub short_addr: ShortAddress,
    pub ext_addr: ExtendedAddress,
}

impl Identity {
    pub fn new(pan_id: PanId, short_addr: ShortAddress, ext_addr: ExtendedAddress) -> Self {
        Self { pan_id, short_addr, ext_addr }
    }

    /// Whether a usable short address is assigned
    pub fn has_short_addr(&self) -> bool {
        self.short_addr != SHORT_ADDR_UNALLOCATED && self.short_addr != ShortAddress::broadcast()
    }

    /// Own short address form
    pub fn short(&self) -> Address {
        Address::Short(self.pan_id, self.short_addr)
    }

    /// Own extended address form
    pub fn extended(&self) -> Address {
        Address::Extended(self.pan_id, self.ext_addr)
    }
}

/// Role in the energy handshake
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum DeviceRole {
    /// Energy seeking device
    Sensor,
    /// Energy transmitter answering requests for energy
    EnergyDonor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of retransmissions for acknowledged frames
    pub max_frame_retries: u8,

    /// Keep the receiver enabled while idle
    pub rx_on_when_idle: bool,

    /// Deliver every checksummed frame without filtering or replies
    pub promiscuous: bool,

    /// Verify the FCS of received frames
    pub checksum: bool,

    /// PHY symbol rate in symbols per second, also applied to channel access backoffs
    pub symbol_rate: u32,

    /// RX-to-TX or TX-to-RX turnaround time in symbols (aTurnaroundTime)
    pub turnaround_symbols: u32,

    /// Synchronisation header length in symbols
    pub shr_symbols: u32,

    /// Symbols used to transmit one octet
    pub symbols_per_octet: u32,

    /// Group carried by locally originated RFE frames
    pub rfe_group: u8,

    /// Delay before a group 2 responder answers an RFE
    pub group_stagger_us: u64,

    /// Duration carried by CFE frames
    pub cfe_duration_us: u64,

    /// Time allowed for a handshake reply before returning to idle,
    /// `None` waits indefinitely
    pub handshake_timeout_us: Option<u64>,

    /// Storage capacitance in Farads
    pub capacitance_f: f64,

    /// Voltage to charge the store to
    pub max_voltage: f64,

    /// Voltage of a depleted store
    pub min_voltage: f64,

    /// Voltage below which the sensor should request energy
    pub min_threshold_voltage: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_retries: 3,
            rx_on_when_idle: true,
            promiscuous: false,
            checksum: true,

            symbol_rate: DEFAULT_SYMBOL_RATE,
            turnaround_symbols: 12,
            shr_symbols: 10,
            symbols_per_octet: 2,

            rfe_group: 1,
            group_stagger_us: ENERGY_SLOT_US,
            cfe_duration_us: ENERGY_SLOT_US,
            handshake_timeout_us: Some(50_000),

            capacitance_f: 36.0,
            max_voltage: 3.0,
            min_voltage: 1.8,
            min_threshold_voltage: 2.3,
        }
    }
}

impl Config {
    /// Convert a symbol count to microseconds
    pub fn symbols_to_us(&self, symbols: u32) -> u64 {
        symbols as u64 * 1_000_000 / self.symbol_rate.max(1) as u64
    }

    /// Time to wait for an ACK after transmission completes
    ///
    /// Unit backoff + turnaround + SHR + the 6 octet ACK frame
    pub fn ack_wait_us(&self, unit_backoff_symbols: u32) -> u64 {
        let symbols = unit_backoff_symbols
            + self.turnaround_symbols
            + self.shr_symbols
            + 6 * self.symbols_per_octet;

        self.symbols_to_us(symbols)
    }

    /// Responder delay for an RFE group
    pub fn group_delay_us(&self, group: u8) -> u64 {
        match group {
            2 => self.group_stagger_us,
            _ => 0,
        }
    }
}
