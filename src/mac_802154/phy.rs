//! Radio control interface consumed by the MAC
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use log::debug;
use rand_core::RngCore;

use super::tag::FrameKind;

/// Requested transceiver state
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum TrxState {
    RxOn,
    TxOn,
    TrxOff,
}

/// Status reported in PHY confirmations
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum PhyStatus {
    Success,
    RxOn,
    TxOn,
    TrxOff,
    Busy,
    Idle,
    /// Transmission rejected by the PHY (ie. PSDU too long)
    Unspecified,
}

/// Events reported by the PHY to the MAC
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhyEvent {
    /// Completion of a `set_trx_state` request
    TrxState(PhyStatus),
    /// Completion of a `transmit` request
    DataConfirm(PhyStatus),
    /// Clear channel assessment result, `Idle` or `Busy`
    Cca(PhyStatus),
    /// Frame of `len` bytes received into the poll buffer
    Received {
        len: usize,
        lqi: u8,
        kind: Option<FrameKind>,
    },
    /// Sensed received-power sample for the energy handshake
    EnergySample {
        energy: f64,
        slot: u8,
    },
}

/// Radio control interface.
///
/// Requests are asynchronous, completion is reported through [`PhyEvent`]s
/// returned from `poll`.
pub trait Phy {
    type Error: Debug;

    /// Request a transceiver state change, each accepted request is
    /// confirmed by exactly one [`PhyEvent::TrxState`] in request order
    fn set_trx_state(&mut self, state: TrxState) -> Result<(), Self::Error>;

    /// Start transmission of a serialized PSDU with out-of-band purpose metadata
    fn transmit(&mut self, psdu: &[u8], kind: FrameKind) -> Result<(), Self::Error>;

    /// Request a clear channel assessment
    fn request_cca(&mut self) -> Result<(), Self::Error>;

    /// Fetch the next pending event, received frames are written to `buff`
    fn poll(&mut self, buff: &mut [u8]) -> Result<Option<PhyEvent>, Self::Error>;
}

/// Channel-error injection, drops received data frames with a fixed probability
pub struct LossyPhy<P, G> {
    inner: P,
    rng: G,
    /// Drop probability scaled to `u32::MAX`
    threshold: u32,
    dropped: u32,
}

impl <P: Phy, G: RngCore> LossyPhy<P, G> {
    /// Wrap `inner`, dropping received data frames with `drop_probability` (0.0..=1.0)
    pub fn new(inner: P, rng: G, drop_probability: f32) -> Self {
        let p = drop_probability.max(0.0).min(1.0);

        Self {
            inner,
            rng,
            threshold: (p as f64 * u32::MAX as f64) as u32,
            dropped: 0,
        }
    }

    /// Number of frames dropped so far
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.inner
    }

    fn should_drop(&mut self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        self.rng.next_u32() <= self.threshold
    }
}

impl <P: Phy, G: RngCore> Phy for LossyPhy<P, G> {
    type Error = P::Error;

    fn set_trx_state(&mut self, state: TrxState) -> Result<(), Self::Error> {
        self.inner.set_trx_state(state)
    }

    fn transmit(&mut self, psdu: &[u8], kind: FrameKind) -> Result<(), Self::Error> {
        self.inner.transmit(psdu, kind)
    }

    fn request_cca(&mut self) -> Result<(), Self::Error> {
        self.inner.request_cca()
    }

    fn poll(&mut self, buff: &mut [u8]) -> Result<Option<PhyEvent>, Self::Error> {
        loop {
            match self.inner.poll(buff)? {
                Some(PhyEvent::Received{ len, kind: Some(FrameKind::Data), .. }) if self.should_drop() => {
                    debug!("Injected loss of {} byte data frame", len);
                    self.dropped = self.dropped.saturating_add(1);
                },
                ev => return Ok(ev),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;
    use std::collections::VecDeque;

    use rand::rngs::mock::StepRng;

    use super::*;

    /// Scripted PHY returning queued events
    #[derive(Default)]
    struct Script {
        events: VecDeque<PhyEvent>,
        sent: Vec<FrameKind>,
    }

    impl Phy for Script {
        type Error = ();

        fn set_trx_state(&mut self, _state: TrxState) -> Result<(), ()> { Ok(()) }

        fn transmit(&mut self, _psdu: &[u8], kind: FrameKind) -> Result<(), ()> {
            self.sent.push(kind);
            Ok(())
        }

        fn request_cca(&mut self) -> Result<(), ()> { Ok(()) }

        fn poll(&mut self, _buff: &mut [u8]) -> Result<Option<PhyEvent>, ()> {
            Ok(self.events.pop_front())
        }
    }

    fn rx(kind: Option<FrameKind>) -> PhyEvent {
        PhyEvent::Received{ len: 10, lqi: 255, kind }
    }

    #[test]
    fn drops_only_data_frames() {
        let mut s = Script::default();
        s.events.push_back(rx(Some(FrameKind::Data)));
        s.events.push_back(rx(Some(FrameKind::Ack)));
        s.events.push_back(rx(Some(FrameKind::Rfe{ group: 1 })));
        s.events.push_back(PhyEvent::DataConfirm(PhyStatus::Success));

        // Zero output always falls under the threshold
        let mut p = LossyPhy::new(s, StepRng::new(0, 0), 0.5);
        let mut buff = [0u8; 128];

        assert_eq!(p.poll(&mut buff), Ok(Some(rx(Some(FrameKind::Ack)))));
        assert_eq!(p.poll(&mut buff), Ok(Some(rx(Some(FrameKind::Rfe{ group: 1 })))));
        assert_eq!(p.poll(&mut buff), Ok(Some(PhyEvent::DataConfirm(PhyStatus::Success))));
        assert_eq!(p.poll(&mut buff), Ok(None));
        assert_eq!(p.dropped(), 1);
    }

    #[test]
    fn zero_probability_is_transparent() {
        let mut s = Script::default();
        s.events.push_back(rx(Some(FrameKind::Data)));

        let mut p = LossyPhy::new(s, StepRng::new(0, 0), 0.0);
        let mut buff = [0u8; 128];

        assert_eq!(p.poll(&mut buff), Ok(Some(rx(Some(FrameKind::Data)))));
        assert_eq!(p.dropped(), 0);

        p.transmit(&[0u8; 4], FrameKind::Energy{ duration_us: 5 }).unwrap();
        assert_eq!(p.inner().sent, &[FrameKind::Energy{ duration_us: 5 }]);
    }
}
