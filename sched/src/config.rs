//! TOML Configuration Structures for the scheduling subsystem
//!
//! Everything a scenario needs to stand up one per-BWP scheduler: the
//! topology × policy combination, the bandwidth geometry, the AMC model
//! and the beamforming driver.

use serde::{Deserialize, Serialize};

use common::CellId;

use crate::amc::{AmcModel, McsTable, NrAmc};
use crate::beamforming::BeamformingMethod;
use crate::policy::{MaxRate, ProportionalFair, RoundRobin, SchedPolicy};
use crate::scheduler::{MacScheduler, SchedulerParams, Topology};
use crate::{Result, SchedError};

/// Top-level configuration of one scheduler instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedConfig {
    /// Cell this scheduler belongs to
    #[serde(default = "default_cell_id")]
    pub cell_id: u16,
    /// Positional BWP index served
    #[serde(default)]
    pub bwp_index: u8,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// AMC configuration
    #[serde(default)]
    pub amc: AmcConfig,
    /// Beamforming configuration
    #[serde(default)]
    pub beamforming: BeamformingConfig,
}

fn default_cell_id() -> u16 {
    1
}

/// Topology × policy combination of the allocation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    TdmaRr,
    TdmaPf,
    TdmaMr,
    OfdmaRr,
    OfdmaPf,
    OfdmaMr,
}

impl SchedulerKind {
    pub fn topology(&self) -> Topology {
        match self {
            Self::TdmaRr | Self::TdmaPf | Self::TdmaMr => Topology::Tdma,
            Self::OfdmaRr | Self::OfdmaPf | Self::OfdmaMr => Topology::Ofdma,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Allocation engine to use
    #[serde(default = "default_scheduler_kind")]
    pub kind: SchedulerKind,
    /// Bandwidth of the BWP in RBGs
    #[serde(default = "default_bandwidth_rbg")]
    pub bandwidth_rbg: u32,
    /// Resource blocks per RBG
    #[serde(default = "default_rb_per_rbg")]
    pub rb_per_rbg: u32,
    /// Symbols reserved for DL control at the slot start
    #[serde(default = "default_ctrl_syms")]
    pub dl_ctrl_syms: u8,
    /// Symbols reserved for UL control at the slot end
    #[serde(default = "default_ctrl_syms")]
    pub ul_ctrl_syms: u8,
    /// MCS used until the first CQI report arrives
    #[serde(default)]
    pub starting_mcs: u8,
    /// PF fairness exponent alpha, in [0, 1]
    #[serde(default = "default_fairness_index")]
    pub fairness_index: f64,
    /// PF average-throughput time window, in slots
    #[serde(default = "default_time_window")]
    pub last_avg_tput_weight: f64,
    /// DL notched-RBG mask, empty = no notching
    #[serde(default)]
    pub dl_notch_mask: Vec<bool>,
    /// UL notched-RBG mask, empty = no notching
    #[serde(default)]
    pub ul_notch_mask: Vec<bool>,
}

fn default_scheduler_kind() -> SchedulerKind {
    SchedulerKind::TdmaRr
}

fn default_bandwidth_rbg() -> u32 {
    25
}

fn default_rb_per_rbg() -> u32 {
    1
}

fn default_ctrl_syms() -> u8 {
    1
}

fn default_fairness_index() -> f64 {
    1.0
}

fn default_time_window() -> f64 {
    99.0
}

/// AMC configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct AmcConfig {
    /// CQI generation model
    #[serde(default = "default_amc_model")]
    pub model: AmcModel,
    /// MCS table version (Table2 enables 256QAM)
    #[serde(default = "default_mcs_table")]
    pub table: McsTable,
}

impl Default for AmcConfig {
    fn default() -> Self {
        Self {
            model: default_amc_model(),
            table: default_mcs_table(),
        }
    }
}

fn default_amc_model() -> AmcModel {
    AmcModel::ErrorModel
}

fn default_mcs_table() -> McsTable {
    McsTable::Table1
}

/// Beamforming configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BeamformingConfig {
    /// Vector computation method
    #[serde(default = "default_beamforming_method")]
    pub method: BeamformingMethod,
    /// Period of the ideal helper, milliseconds
    #[serde(default = "default_beamforming_periodicity")]
    pub periodicity_ms: u64,
    /// SRS reports that trigger the realistic helper
    #[serde(default = "default_srs_reports_to_trigger")]
    pub srs_reports_to_trigger: u32,
}

impl Default for BeamformingConfig {
    fn default() -> Self {
        Self {
            method: default_beamforming_method(),
            periodicity_ms: default_beamforming_periodicity(),
            srs_reports_to_trigger: default_srs_reports_to_trigger(),
        }
    }
}

fn default_beamforming_method() -> BeamformingMethod {
    BeamformingMethod::CellScan
}

fn default_beamforming_periodicity() -> u64 {
    100
}

fn default_srs_reports_to_trigger() -> u32 {
    3
}

impl SchedulerConfig {
    fn policy(&self) -> Box<dyn SchedPolicy> {
        match self.kind {
            SchedulerKind::TdmaRr | SchedulerKind::OfdmaRr => Box::new(RoundRobin),
            SchedulerKind::TdmaPf | SchedulerKind::OfdmaPf => Box::new(ProportionalFair {
                alpha: self.fairness_index,
                time_window: self.last_avg_tput_weight,
            }),
            SchedulerKind::TdmaMr | SchedulerKind::OfdmaMr => Box::new(MaxRate),
        }
    }
}

impl SchedConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SchedError::ConfigurationError(e.to_string()))
    }

    /// Build the configured scheduler instance.
    pub fn build_scheduler(&self) -> Result<MacScheduler> {
        let amc = || NrAmc::new(self.amc.model, self.amc.table);
        let mut sched = MacScheduler::new(SchedulerParams {
            cell_id: CellId(self.cell_id),
            bwp_index: self.bwp_index,
            topology: self.scheduler.kind.topology(),
            policy: self.scheduler.policy(),
            dl_amc: Box::new(amc()),
            ul_amc: Box::new(amc()),
            bandwidth_in_rbg: self.scheduler.bandwidth_rbg,
            rb_per_rbg: self.scheduler.rb_per_rbg,
            dl_ctrl_syms: self.scheduler.dl_ctrl_syms,
            ul_ctrl_syms: self.scheduler.ul_ctrl_syms,
            starting_mcs: self.scheduler.starting_mcs,
        })?;
        sched.set_dl_notch_mask(self.scheduler.dl_notch_mask.clone())?;
        sched.set_ul_notch_mask(self.scheduler.ul_notch_mask.clone())?;
        Ok(sched)
    }
}
