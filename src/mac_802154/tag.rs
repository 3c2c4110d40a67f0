//! Frame purpose classification
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

/// Purpose of a frame, carried alongside the serialized PSDU.
///
/// Handshake frames are plain data frames on air, the purpose and its
/// duration / group parameters only exist as out-of-band metadata.
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum FrameKind {
    /// Upper layer data
    Data,
    /// Immediate acknowledgement
    Ack,
    /// Request for energy, `group` selects the responder stagger
    Rfe {
        group: u8,
    },
    /// Confirm for energy
    Cfe {
        duration_us: u64,
    },
    /// Acknowledgement of a CFE, carries the requested charging time
    CfeAck {
        duration_us: u64,
    },
    /// Energy pulse
    Energy {
        duration_us: u64,
    },
}

impl FrameKind {
    /// Whether this frame belongs to the energy handshake
    pub fn is_handshake(&self) -> bool {
        !matches!(self, FrameKind::Data | FrameKind::Ack)
    }

    /// Duration tag, if any
    pub fn duration_us(&self) -> Option<u64> {
        match self {
            FrameKind::Cfe{ duration_us }
            | FrameKind::CfeAck{ duration_us }
            | FrameKind::Energy{ duration_us } => Some(*duration_us),
            _ => None,
        }
    }

    /// Group tag, if any
    pub fn group(&self) -> Option<u8> {
        match self {
            FrameKind::Rfe{ group } => Some(*group),
            _ => None,
        }
    }

    /// Compact wire identifier used by side-channel encodings
    pub fn id(&self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ack => 1,
            FrameKind::Rfe{..} => 2,
            FrameKind::Cfe{..} => 3,
            FrameKind::CfeAck{..} => 4,
            FrameKind::Energy{..} => 5,
        }
    }

    /// Rebuild a kind from its identifier and parameters
    pub fn from_parts(id: u8, group: u8, duration_us: u64) -> Option<Self> {
        let k = match id {
            0 => FrameKind::Data,
            1 => FrameKind::Ack,
            2 => FrameKind::Rfe{ group },
            3 => FrameKind::Cfe{ duration_us },
            4 => FrameKind::CfeAck{ duration_us },
            5 => FrameKind::Energy{ duration_us },
            _ => return None,
        };
        Some(k)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handshake_kinds() {
        assert!(!FrameKind::Data.is_handshake());
        assert!(!FrameKind::Ack.is_handshake());
        assert!(FrameKind::Rfe{ group: 2 }.is_handshake());
        assert!(FrameKind::Energy{ duration_us: 1 }.is_handshake());
    }

    #[test]
    fn parts_rebuild_kind() {
        let k = FrameKind::CfeAck{ duration_us: 1_234_567 };
        let r = FrameKind::from_parts(k.id(), 0, k.duration_us().unwrap());

        assert_eq!(r, Some(k));
        assert_eq!(FrameKind::from_parts(9, 0, 0), None);
    }
}
