//! MAC error types
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::DecodeError;

use crate::mac_802154::{MacState, phy::PhyStatus};

/// Basic MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Operation not possible in the current MAC state
    Busy,

    /// Radio reported a transceiver state the MAC did not expect.
    ///
    /// The MAC has been forced back to receive-on idle when this is returned.
    Desync {
        state: MacState,
        status: PhyStatus,
    },

    /// Decoding error
    DecodeError(DecodeError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl <E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        CoreError::DecodeError(e)
    }
}
