//! Owned IEEE 802.15.4 frames with FCS handling
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use ieee802154::mac::*;

use heapless::Vec;

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_16_KERMIT};

/// Maximum PSDU size (aMaxPHYPacketSize)
pub const MAX_PHY_PACKET_SIZE: usize = 127;

/// Minimum MPDU overhead (aMinMPDUOverhead), short addressing with FCS
pub const MIN_MPDU_OVERHEAD: usize = 9;

/// Largest MSDU accepted for transmission
pub const MAX_MAC_PAYLOAD: usize = MAX_PHY_PACKET_SIZE - MIN_MPDU_OVERHEAD;

/// Length of the frame check sequence trailer
pub const FCS_LEN: usize = 2;

/// Serialized frame storage
pub type Psdu = Vec<u8, MAX_PHY_PACKET_SIZE>;

/// Packet object represents an IEEE 802.15.4 object with owned storage.
///
/// Based on https://docs.rs/ieee802154/0.3.0/ieee802154/mac/frame/struct.Frame.html
/// altered for static / owned storage via heapless
#[derive(Clone, Debug)]
pub struct Packet {
    pub header: Header,

    pub content: FrameContent,

    payload: Vec<u8, MAX_PHY_PACKET_SIZE>,

    pub footer: [u8; 2],
}

impl PartialEq for Packet {
    fn eq(&self, o: &Self) -> bool {
        self.header == o.header &&
        self.content == o.content &&
        self.payload() == o.payload() &&
        self.footer == o.footer
    }
}

impl Packet {
    /// Build a data frame, returns `None` if the payload does not fit
    pub fn data(dest: Address, source: Address, seq: u8, data: &[u8], ack: bool) -> Option<Packet> {
        let payload = Vec::from_slice(data).ok()?;

        Some(Packet {
            header: Header {
                frame_type: FrameType::Data,
                frame_pending: false,
                security: Security::None,
                ack_request: ack,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: dest,
                source,
                seq,
            },
            content: FrameContent::Data,
            payload,
            footer: [0u8; 2],
        })
    }

    /// Build an empty, unacknowledged frame used by the energy handshake.
    ///
    /// Handshake purpose travels out-of-band so on air these are plain data frames.
    pub fn handshake(dest: Address, source: Address, seq: u8) -> Packet {
        Packet {
            header: Header {
                frame_type: FrameType::Data,
                frame_pending: false,
                security: Security::None,
                ack_request: false,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: dest,
                source,
                seq,
            },
            content: FrameContent::Data,
            payload: Vec::new(),
            footer: [0u8; 2],
        }
    }

    /// Generate an immediate ACK for the provided sequence number
    pub fn ack(seq: u8) -> Packet {
        Packet {
            header: Header {
                frame_type: FrameType::Acknowledgement,
                frame_pending: false,
                security: Security::None,
                ack_request: false,
                pan_id_compress: false,
                version: FrameVersion::Ieee802154_2006,
                destination: Address::None,
                source: Address::None,
                seq,
            },
            content: FrameContent::Acknowledgement,
            payload: Vec::new(),
            footer: [0u8; 2],
        }
    }

    /// Check whether this packet is an ack for the provided sequence number
    pub fn is_ack_for(&self, seq: u8) -> bool {
        self.header.frame_type == FrameType::Acknowledgement &&
        self.content == FrameContent::Acknowledgement &&
        self.header.seq == seq
    }

    // Based on https://docs.rs/ieee802154/0.3.0/ieee802154/mac/frame/struct.Frame.html#method.encode
    /// Encode the packet into `buf` including the FCS trailer, returning the PSDU length
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut len = 0;

        // Write header
        len += self.header.encode(&mut buf[len..]);

        // Write content
        len += self.content.encode(&mut buf[len..]);

        // Write payload
        buf[len .. len+self.payload.len()].copy_from_slice(&self.payload);

        len += self.payload.len();

        // Write footer
        let fcs = fcs(&buf[..len]);
        LittleEndian::write_u16(&mut buf[len..len+FCS_LEN], fcs);

        len + FCS_LEN
    }

    /// Encode into owned PSDU storage
    pub fn to_psdu(&self) -> Option<Psdu> {
        let mut buff = [0u8; 256];
        let n = self.encode(&mut buff);

        Vec::from_slice(&buff[..n]).ok()
    }

    // Based on https://docs.rs/ieee802154/0.3.0/ieee802154/mac/frame/struct.Frame.html#method.decode
    pub fn decode(buf: &[u8], contains_footer: bool) -> Result<Self, DecodeError> {
        let mut remaining = buf.len();

        // First decode header
        let (header, header_len) = Header::decode(buf)?;
        remaining -= header_len;

        // If there's a footer, decode this
        let mut footer = [0; 2];
        if contains_footer {
            if remaining < FCS_LEN {
                return Err(DecodeError::NotEnoughBytes);
            }

            let footer_pos = buf.len() - FCS_LEN;
            footer.copy_from_slice(&buf[footer_pos..]);

            remaining -= FCS_LEN;
        }

        // Fetch the body subslice
        let body = &buf[header_len..header_len+remaining];

        // Decode the FrameContent
        let (content, used) = FrameContent::decode(body, &header)?;

        // Copy out the payload
        let payload = Vec::from_slice(&body[used..]).map_err(|_e| DecodeError::NotEnoughBytes)?;

        Ok(Packet {
            header,
            content,
            payload,
            footer,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// 16-bit ITU-T CRC (CRC-16/KERMIT) used for the 802.15.4 FCS
const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Compute the frame check sequence over `data`
pub fn fcs(data: &[u8]) -> u16 {
    FCS.checksum(data)
}

/// Check the trailing FCS of a complete PSDU
pub fn fcs_valid(psdu: &[u8]) -> bool {
    if psdu.len() < FCS_LEN {
        return false;
    }

    let (body, footer) = psdu.split_at(psdu.len() - FCS_LEN);
    fcs(body) == LittleEndian::read_u16(footer)
}
