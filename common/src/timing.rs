//! Frame Timing
//!
//! Slot-level timing arithmetic for the 10 ms radio frame. The numerology
//! determines how many slots fit in a 1 ms subframe.

use serde::{Deserialize, Serialize};

/// Number of subframes in a radio frame (10 ms)
pub const SUBFRAMES_PER_FRAME: u8 = 10;

/// Number of OFDM symbols in a slot with normal cyclic prefix
pub const SYMBOLS_PER_SLOT: u8 = 14;

/// A point in time expressed as (system frame number, subframe, slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SfnSf {
    /// System frame number
    pub frame: u32,
    /// Subframe within the frame (0..10)
    pub subframe: u8,
    /// Slot within the subframe (0..slots_per_subframe)
    pub slot: u8,
    /// Numerology (mu); slots per subframe = 2^mu
    pub numerology: u8,
}

impl SfnSf {
    /// Create a new timing point
    pub fn new(frame: u32, subframe: u8, slot: u8, numerology: u8) -> Self {
        debug_assert!(subframe < SUBFRAMES_PER_FRAME);
        debug_assert!(slot < (1 << numerology));
        Self {
            frame,
            subframe,
            slot,
            numerology,
        }
    }

    /// Slots per subframe for this numerology
    pub fn slots_per_subframe(&self) -> u8 {
        1 << self.numerology
    }

    /// Slots per 10 ms frame for this numerology
    pub fn slots_per_frame(&self) -> u16 {
        SUBFRAMES_PER_FRAME as u16 * self.slots_per_subframe() as u16
    }

    /// Absolute slot number since frame 0
    pub fn normalize(&self) -> u64 {
        let per_sf = self.slots_per_subframe() as u64;
        self.frame as u64 * SUBFRAMES_PER_FRAME as u64 * per_sf
            + self.subframe as u64 * per_sf
            + self.slot as u64
    }

    /// Advance by a number of slots, carrying into subframe/frame
    pub fn add_slots(&self, slots: u32) -> Self {
        let per_sf = self.slots_per_subframe() as u64;
        let total = self.normalize() + slots as u64;
        let frame = total / (SUBFRAMES_PER_FRAME as u64 * per_sf);
        let rem = total % (SUBFRAMES_PER_FRAME as u64 * per_sf);
        Self {
            frame: frame as u32,
            subframe: (rem / per_sf) as u8,
            slot: (rem % per_sf) as u8,
            numerology: self.numerology,
        }
    }

    /// Slot duration in seconds for this numerology
    pub fn slot_duration_secs(&self) -> f64 {
        1e-3 / self.slots_per_subframe() as f64
    }

    /// Simulated time of this slot's start, in seconds
    pub fn to_secs(&self) -> f64 {
        self.normalize() as f64 * self.slot_duration_secs()
    }
}

impl std::fmt::Display for SfnSf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.frame, self.subframe, self.slot)
    }
}
