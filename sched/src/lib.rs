//! NR MAC Scheduling Subsystem
//!
//! Implements the slot-based resource allocation core of a 5G-NR RAN
//! simulation: spectrum partitioning (band / component carrier / bandwidth
//! part), adaptive modulation and coding contracts, beamforming vector
//! assignment, the TDMA/OFDMA schedulers with round-robin, proportional
//! fair and maximum rate policies, DCI construction and BWP traffic
//! routing.
//!
//! The whole crate is single-threaded and synchronous: every entry point
//! is meant to be invoked from the surrounding discrete-event engine at
//! the current simulated time, once per slot per bandwidth part.

pub mod amc;
pub mod beamforming;
pub mod bwp_manager;
pub mod channel;
pub mod config;
pub mod dci;
pub mod harq;
pub mod ofdma;
pub mod policy;
pub mod scheduler;
pub mod spectrum;
pub mod stats;
pub mod tdma;
pub mod ue_info;

use thiserror::Error;

/// Errors surfaced by the scheduling subsystem.
///
/// Fatal configuration errors abort setup synchronously; they represent a
/// mistake in describing the scenario, not a runtime condition to recover
/// from.
#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unknown UE with RNTI {0}")]
    UnknownUe(u16),

    #[error("Unknown logical channel {lcid} of UE {rnti}")]
    UnknownLogicalChannel { rnti: u16, lcid: u8 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SchedError>;

pub use amc::{Amc, NrAmc};
pub use bwp_manager::BwpManagerGnb;
pub use channel::{ChannelModel, ChannelModelArena};
pub use config::SchedConfig;
pub use dci::{DciFormat, DciInfoElementTdma, VarTtiType};
pub use harq::{HarqVector, MAX_HARQ_RETX, NUM_HARQ_PROCESSES};
pub use scheduler::{MacScheduler, SlotAllocation, SlotRequest, Topology};
pub use spectrum::{
    BandwidthPartInfo, CcBwpCreator, ComponentCarrierInfo, OperationBandInfo, Scenario,
};
pub use stats::{SchedTraceSink, SchedulingRecord, TsvTraceWriter};
pub use ue_info::{FtResources, UeInfo};
