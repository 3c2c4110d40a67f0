//! Frame acceptance filtering (IEEE 802.15.4-2006 7.5.6.2, third level)
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::{Address, FrameType, FrameVersion, Header, PanId, ShortAddress};

use super::config::Identity;

/// Acceptance rule a frame failed
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum Rule {
    /// Reserved frame type or unsupported frame version
    FrameType,
    /// Destination PAN is neither ours nor broadcast
    DstPan,
    /// Short destination is neither ours nor broadcast
    DstShort,
    /// Extended destination is not ours
    DstExtended,
    /// Beacon from a foreign PAN
    BeaconPan,
    /// Data or command frame from a foreign PAN
    SrcPan,
}

fn pan_of(a: &Address) -> Option<PanId> {
    match a {
        Address::Short(pan, _) | Address::Extended(pan, _) => Some(*pan),
        Address::None => None,
    }
}

/// Apply the acceptance rules in order, returning the first that fails
pub fn accept(header: &Header, id: &Identity) -> Result<(), Rule> {
    // Frame versions beyond 2006 are not supported
    if let FrameVersion::Ieee802154 = header.version {
        return Err(Rule::FrameType);
    }

    if let Some(pan) = pan_of(&header.destination) {
        if pan != id.pan_id && pan != PanId::broadcast() {
            return Err(Rule::DstPan);
        }
    }

    match header.destination {
        Address::Short(_, a) if a != id.short_addr && a != ShortAddress::broadcast() => {
            return Err(Rule::DstShort);
        },
        Address::Extended(_, a) if a != id.ext_addr => {
            return Err(Rule::DstExtended);
        },
        _ => (),
    }

    match header.frame_type {
        FrameType::Beacon => {
            if id.pan_id != PanId::broadcast() && pan_of(&header.source) != Some(id.pan_id) {
                return Err(Rule::BeaconPan);
            }
        },
        FrameType::Data | FrameType::MacCommand => {
            if let Some(pan) = pan_of(&header.source) {
                if pan != id.pan_id {
                    return Err(Rule::SrcPan);
                }
            }
        },
        _ => (),
    }

    Ok(())
}
