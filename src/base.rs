//! Radio-backed PHY adaptor
//!
//! Drives a `radio` HAL device through the asynchronous [`Phy`] interface,
//! queueing state and CCA confirmations and polling the device for
//! transmit and receive completion.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::{fmt::Debug, marker::PhantomData};

use byteorder::{ByteOrder, LittleEndian};
use heapless::Deque;
use log::{debug, trace, warn};

use radio::ReceiveInfo;

use crate::Radio;
use crate::packet::MAX_PHY_PACKET_SIZE;
use crate::mac_802154::{FrameKind, Phy, PhyEvent, PhyStatus, TrxState};

/// Length of the frame metadata trailer appended after the FCS
pub const META_LEN: usize = 11;

/// Trailer terminator
const META_MAGIC: u8 = 0xEF;

/// Pending confirmation capacity
const CONFIRM_QUEUE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct RadioPhyConfig {
    /// RSSI threshold for clear channel assessment in dBm
    pub cca_threshold: i16,

    /// RSSI mapped to the lowest LQI
    pub lqi_rssi_min: i16,

    /// RSSI mapped to the highest LQI
    pub lqi_rssi_max: i16,
}

impl Default for RadioPhyConfig {
    fn default() -> Self {
        Self {
            cca_threshold: -90,
            lqi_rssi_min: -100,
            lqi_rssi_max: -20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum RadioMode {
    Idle,
    Receiving,
    Transmitting,
    Sleeping,
}

/// [`Phy`] implementation over a `radio` device
pub struct RadioPhy<R, S, I, E> {
    radio: R,
    config: RadioPhyConfig,
    mode: RadioMode,
    pending: Deque<PhyEvent, CONFIRM_QUEUE_LEN>,
    _state: PhantomData<S>,
    _info: PhantomData<I>,
    _err: PhantomData<E>,
}

impl <R, S, I, E> RadioPhy<R, S, I, E>
where
    R: Radio<S, I, E>,
    S: radio::RadioState,
    I: ReceiveInfo + Default + Debug,
    E: Debug,
{
    pub fn new(radio: R, config: RadioPhyConfig) -> Self {
        Self {
            radio,
            config,
            mode: RadioMode::Idle,
            pending: Deque::new(),
            _state: PhantomData,
            _info: PhantomData,
            _err: PhantomData,
        }
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Map an RSSI reading onto the 0-255 LQI range
    pub fn lqi(&self, rssi: i16) -> u8 {
        let (min, max) = (self.config.lqi_rssi_min as i32, self.config.lqi_rssi_max as i32);
        if max <= min {
            return 0;
        }

        let clamped = (rssi as i32).max(min).min(max);

        ((clamped - min) * 255 / (max - min)) as u8
    }

    fn confirm(&mut self, ev: PhyEvent) {
        if let Err(ev) = self.pending.push_back(ev) {
            warn!("PHY confirmation queue full, dropping {:?}", ev);
        }
    }
}

impl <R, S, I, E> Phy for RadioPhy<R, S, I, E>
where
    R: Radio<S, I, E>,
    S: radio::RadioState,
    I: ReceiveInfo + Default + Debug,
    E: Debug,
{
    type Error = E;

    fn set_trx_state(&mut self, state: TrxState) -> Result<(), Self::Error> {
        trace!("Set radio {} (was {})", state, self.mode);

        let status = match state {
            TrxState::RxOn => {
                self.radio.start_receive()?;
                self.mode = RadioMode::Receiving;
                PhyStatus::RxOn
            },
            TrxState::TxOn => {
                self.radio.set_state(S::idle())?;
                self.mode = RadioMode::Idle;
                PhyStatus::TxOn
            },
            TrxState::TrxOff => {
                self.radio.set_state(S::sleep())?;
                self.mode = RadioMode::Sleeping;
                PhyStatus::TrxOff
            },
        };

        self.confirm(PhyEvent::TrxState(status));

        Ok(())
    }

    fn transmit(&mut self, psdu: &[u8], kind: FrameKind) -> Result<(), Self::Error> {
        if psdu.len() > MAX_PHY_PACKET_SIZE {
            warn!("PSDU of {} bytes exceeds PHY limit", psdu.len());
            self.confirm(PhyEvent::DataConfirm(PhyStatus::Unspecified));
            return Ok(());
        }

        let mut buff = [0u8; MAX_PHY_PACKET_SIZE + META_LEN];
        buff[..psdu.len()].copy_from_slice(psdu);

        let n = psdu.len() + encode_meta(&kind, &mut buff[psdu.len()..]);

        debug!("Transmit {} frame ({} bytes)", kind, psdu.len());

        self.radio.start_transmit(&buff[..n])?;
        self.mode = RadioMode::Transmitting;

        Ok(())
    }

    fn request_cca(&mut self) -> Result<(), Self::Error> {
        let rssi = self.radio.poll_rssi()?;

        let status = match rssi < self.config.cca_threshold {
            true => PhyStatus::Idle,
            false => PhyStatus::Busy,
        };

        trace!("CCA RSSI {} dBm: {}", rssi, status);

        self.confirm(PhyEvent::Cca(status));

        Ok(())
    }

    fn poll(&mut self, buff: &mut [u8]) -> Result<Option<PhyEvent>, Self::Error> {
        if let Some(ev) = self.pending.pop_front() {
            return Ok(Some(ev));
        }

        match self.mode {
            RadioMode::Transmitting => {
                if !self.radio.check_transmit()? {
                    return Ok(None);
                }

                // Radio returns to idle on completion
                self.mode = RadioMode::Idle;

                Ok(Some(PhyEvent::DataConfirm(PhyStatus::Success)))
            },
            RadioMode::Receiving => {
                if !self.radio.check_receive(true)? {
                    return Ok(None);
                }

                let (n, info) = self.radio.get_received(buff)?;
                let lqi = self.lqi(info.rssi());

                let (len, kind) = match decode_meta(&buff[..n]) {
                    Some((len, kind)) => (len, Some(kind)),
                    None => (n, None),
                };

                debug!("Received {} bytes (RSSI: {} LQI: {} kind: {:?})", len, info.rssi(), lqi, kind);

                // Restart reception for the next frame
                self.radio.start_receive()?;

                Ok(Some(PhyEvent::Received{ len, lqi, kind }))
            },
            RadioMode::Idle | RadioMode::Sleeping => Ok(None),
        }
    }
}

/// Write the frame purpose trailer, returning the bytes written
fn encode_meta(kind: &FrameKind, buff: &mut [u8]) -> usize {
    buff[0] = kind.id();
    buff[1] = kind.group().unwrap_or(0);
    LittleEndian::write_u64(&mut buff[2..10], kind.duration_us().unwrap_or(0));
    buff[10] = META_MAGIC;

    META_LEN
}

/// Split a received buffer into the PSDU length and frame purpose
fn decode_meta(buff: &[u8]) -> Option<(usize, FrameKind)> {
    if buff.len() < META_LEN || buff[buff.len() - 1] != META_MAGIC {
        return None;
    }

    let meta = &buff[buff.len() - META_LEN..];
    let duration = LittleEndian::read_u64(&meta[2..10]);
    let kind = FrameKind::from_parts(meta[0], meta[1], duration)?;

    Some((buff.len() - META_LEN, kind))
}
