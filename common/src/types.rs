//! Common Types for the NR MAC Scheduling Subsystem
//!
//! Defines fundamental identifier types used throughout the protocol stack.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Rnti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Operation band identity, assigned by the spectrum factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BandId(pub u8);

/// Component carrier identity, assigned by the spectrum factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CcId(pub u8);

/// Bandwidth part identity, assigned by the spectrum factory.
///
/// Note that this is the *creation-time* id; the positional index obtained
/// by flattening bands into a BWP sequence is a plain `usize` and is what
/// the scheduler and BWP manager use for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BwpId(pub u8);

impl std::fmt::Display for BwpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modulation and Coding Scheme index
pub type Mcs = u8;

/// A transmit/receive beam direction, quantized for use as a map key.
///
/// The elevation is stored in centi-degrees so the type can derive `Eq`,
/// `Ord` and `Hash` and be used as a deterministic grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeamId {
    /// Sector index within the azimuth scan
    pub sector: u16,
    /// Elevation in centi-degrees
    pub elevation_cdeg: i16,
}

impl BeamId {
    /// Create a new beam id
    pub fn new(sector: u16, elevation_cdeg: i16) -> Self {
        Self {
            sector,
            elevation_cdeg,
        }
    }

    /// Beam id used before any beamforming has run (quasi-omni)
    pub const QUASI_OMNI: Self = Self {
        sector: u16::MAX,
        elevation_cdeg: 0,
    };
}

/// Beam configuration of a UE: the TX/RX beam pairing per stream.
///
/// Used by the OFDMA schedulers as the grouping key when partitioning
/// frequency per beam. A single-stream UE leaves the secondary beam unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BeamConfId {
    /// Beam of the first stream
    pub primary: BeamId,
    /// Beam of the second stream, for rank-2 UEs
    pub secondary: Option<BeamId>,
}

impl BeamConfId {
    /// Create a beam configuration id
    pub fn new(primary: BeamId, secondary: Option<BeamId>) -> Self {
        Self { primary, secondary }
    }
}

impl std::fmt::Display for BeamConfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.secondary {
            Some(s) => write!(
                f,
                "({},{})+({},{})",
                self.primary.sector, self.primary.elevation_cdeg, s.sector, s.elevation_cdeg
            ),
            None => write!(f, "({},{})", self.primary.sector, self.primary.elevation_cdeg),
        }
    }
}

/// QoS Class Identifier (5QI), the standard traffic classes used by the
/// BWP manager to route bearer traffic to a bandwidth part.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Qci {
    /// GBR conversational voice
    GbrConvVoice = 1,
    /// GBR conversational video (live streaming)
    GbrConvVideo = 2,
    /// GBR real time gaming
    GbrGaming = 3,
    /// GBR non-conversational video (buffered streaming)
    GbrNonConvVideo = 4,
    /// GBR mission critical user plane push to talk
    GbrMcPushToTalk = 65,
    /// GBR non-mission-critical user plane push to talk
    GbrNmcPushToTalk = 66,
    /// GBR mission critical video user plane
    GbrMcVideo = 67,
    /// GBR V2X messages
    GbrV2x = 75,
    /// Non-GBR IMS signalling
    NgbrImsSignalling = 5,
    /// Non-GBR video (buffered streaming), TCP based traffic
    NgbrVideoTcpOperator = 6,
    /// Non-GBR voice, video, interactive gaming
    NgbrVoiceVideoGaming = 7,
    /// Non-GBR video (buffered streaming), premium bearer
    NgbrVideoTcpPremium = 8,
    /// Non-GBR video (buffered streaming), default bearer
    NgbrVideoTcpDefault = 9,
    /// Non-GBR mission critical delay sensitive signalling
    NgbrMcDelaySignalling = 69,
    /// Non-GBR mission critical data
    NgbrMcData = 70,
    /// Non-GBR V2X messages
    NgbrV2x = 79,
    /// Non-GBR low latency eMBB applications
    NgbrLowLatEmbb = 80,
    /// Delay critical GBR discrete automation (small packets)
    DcGbrDiscreteAutSmall = 82,
    /// Delay critical GBR discrete automation (large packets)
    DcGbrDiscreteAutLarge = 83,
    /// Delay critical GBR intelligent transport systems
    DcGbrIts = 84,
    /// Delay critical GBR electricity distribution
    DcGbrElectricity = 85,
}

impl Qci {
    /// Default bearer QCI
    pub const DEFAULT: Self = Qci::NgbrVideoTcpDefault;

    /// Whether this class has a guaranteed bit rate
    pub fn is_gbr(&self) -> bool {
        matches!(
            self,
            Qci::GbrConvVoice
                | Qci::GbrConvVideo
                | Qci::GbrGaming
                | Qci::GbrNonConvVideo
                | Qci::GbrMcPushToTalk
                | Qci::GbrNmcPushToTalk
                | Qci::GbrMcVideo
                | Qci::GbrV2x
                | Qci::DcGbrDiscreteAutSmall
                | Qci::DcGbrDiscreteAutLarge
                | Qci::DcGbrIts
                | Qci::DcGbrElectricity
        )
    }

    /// All standard classes, in numeric order
    pub fn all() -> &'static [Qci] {
        &[
            Qci::GbrConvVoice,
            Qci::GbrConvVideo,
            Qci::GbrGaming,
            Qci::GbrNonConvVideo,
            Qci::NgbrImsSignalling,
            Qci::NgbrVideoTcpOperator,
            Qci::NgbrVoiceVideoGaming,
            Qci::NgbrVideoTcpPremium,
            Qci::NgbrVideoTcpDefault,
            Qci::GbrMcPushToTalk,
            Qci::GbrNmcPushToTalk,
            Qci::GbrMcVideo,
            Qci::NgbrMcDelaySignalling,
            Qci::NgbrMcData,
            Qci::GbrV2x,
            Qci::NgbrV2x,
            Qci::NgbrLowLatEmbb,
            Qci::DcGbrDiscreteAutSmall,
            Qci::DcGbrDiscreteAutLarge,
            Qci::DcGbrIts,
            Qci::DcGbrElectricity,
        ]
    }
}

/// Link direction of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Downlink
    Dl,
    /// Uplink
    Ul,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Dl => write!(f, "DL"),
            Direction::Ul => write!(f, "UL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_qci_gbr_classification() {
        assert!(Qci::GbrConvVoice.is_gbr());
        assert!(Qci::GbrV2x.is_gbr());
        assert!(!Qci::NgbrVideoTcpDefault.is_gbr());
        assert!(!Qci::NgbrLowLatEmbb.is_gbr());
    }

    #[test]
    fn test_qci_from_primitive() {
        assert_eq!(Qci::from_u8(1), Some(Qci::GbrConvVoice));
        assert_eq!(Qci::from_u8(9), Some(Qci::NgbrVideoTcpDefault));
        assert_eq!(Qci::from_u8(80), Some(Qci::NgbrLowLatEmbb));
        assert_eq!(Qci::from_u8(200), None);
    }

    #[test]
    fn test_beam_conf_id_ordering() {
        let a = BeamConfId::new(BeamId::new(0, 0), None);
        let b = BeamConfId::new(BeamId::new(1, 0), None);
        assert!(a < b);

        let c = BeamConfId::new(BeamId::new(0, 0), Some(BeamId::new(2, 0)));
        assert!(a < c);
    }
}
