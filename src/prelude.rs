//! LPWAN crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::Radio;

pub use crate::error::CoreError;
pub use crate::timer::{Timer as MacTimer};

pub use crate::base::{RadioPhy, RadioPhyConfig};

pub use crate::mac_802154::{
    self, Mac as Mac802154, MacState, MacListener, MacTrace,
    Config as MacConfig, DeviceRole, Identity,
    DataRequest, DataConfirm, DataIndication, Status, TxOptions,
    Csma, CsmaConfig, Phy, PhyEvent, FrameKind,
};

pub use ieee802154::mac::{Address as MacAddress, PanId, AddressMode, ShortAddress, ExtendedAddress};
