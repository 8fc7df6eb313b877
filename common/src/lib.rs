//! Common Types for the NR RAN Simulation Stack
//!
//! Defines fundamental identifiers, frame timing and bit-mask helpers used
//! throughout the MAC scheduling subsystem.

pub mod timing;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use timing::SfnSf;
pub use types::{BandId, BeamConfId, BeamId, BwpId, CcId, CellId, Direction, Mcs, Qci, Rnti};
