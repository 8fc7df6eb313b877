//! BWP Traffic Routing
//!
//! The gNB-side demultiplexer in front of the per-BWP schedulers: bearer
//! traffic is routed by QoS class through a configurable algorithm,
//! control messages follow an explicit output-link table with an identity
//! fallback.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tracing::{debug, info};

use common::{BeamConfId, Qci, Rnti};

use crate::scheduler::MacScheduler;
use crate::{Result, SchedError};

/// Picks the BWP serving a bearer's QoS class.
pub trait BwpAlgorithm: std::fmt::Debug {
    fn bwp_for_qci(&self, qci: Qci) -> u8;
}

/// Static QCI to BWP-index table, configured once per simulation.
///
/// Classes without an explicit entry go to BWP 0.
#[derive(Debug, Default)]
pub struct StaticBwpAlgorithm {
    map: HashMap<Qci, u8>,
}

impl StaticBwpAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bwp_for_qci(&mut self, qci: Qci, bwp_index: u8) {
        self.map.insert(qci, bwp_index);
    }
}

impl BwpAlgorithm for StaticBwpAlgorithm {
    fn bwp_for_qci(&self, qci: Qci) -> u8 {
        self.map.get(&qci).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct LcInfo {
    qci: Qci,
    lcg_id: u8,
}

/// gNB-side BWP manager: one per cell, in front of every per-BWP
/// scheduler instance.
#[derive(Debug)]
pub struct BwpManagerGnb {
    algorithm: Box<dyn BwpAlgorithm>,
    schedulers: BTreeMap<u8, Rc<RefCell<MacScheduler>>>,
    lcs: HashMap<(Rnti, u8), LcInfo>,
    output_links: HashMap<u8, u8>,
}

impl BwpManagerGnb {
    pub fn new(algorithm: Box<dyn BwpAlgorithm>) -> Self {
        Self {
            algorithm,
            schedulers: BTreeMap::new(),
            lcs: HashMap::new(),
            output_links: HashMap::new(),
        }
    }

    /// Attach the scheduler serving one BWP index.
    pub fn add_bwp(&mut self, bwp_index: u8, scheduler: Rc<RefCell<MacScheduler>>) -> Result<()> {
        if self.schedulers.contains_key(&bwp_index) {
            return Err(SchedError::ConfigurationError(format!(
                "BWP index {} already has a scheduler",
                bwp_index
            )));
        }
        self.schedulers.insert(bwp_index, scheduler);
        Ok(())
    }

    pub fn num_bwps(&self) -> usize {
        self.schedulers.len()
    }

    /// Reroute outgoing control traffic of one BWP to another, e.g. an
    /// FDD uplink-only BWP paired with its downlink twin.
    pub fn set_output_link(&mut self, source_bwp: u8, output_bwp: u8) {
        self.output_links.insert(source_bwp, output_bwp);
    }

    /// Register a UE on every BWP's scheduler; its bearers decide which
    /// schedulers actually see traffic.
    pub fn add_ue(&mut self, rnti: Rnti, beam_conf_id: BeamConfId) -> Result<()> {
        for sched in self.schedulers.values() {
            sched.borrow_mut().add_ue(rnti, beam_conf_id)?;
        }
        Ok(())
    }

    pub fn release_ue(&mut self, rnti: Rnti) -> Result<()> {
        for sched in self.schedulers.values() {
            sched.borrow_mut().release_ue(rnti)?;
        }
        self.lcs.retain(|(r, _), _| *r != rnti);
        Ok(())
    }

    /// Propagate an updated beam pairing to every scheduler.
    pub fn update_ue_beam(&mut self, rnti: Rnti, beam_conf_id: BeamConfId) -> Result<()> {
        for sched in self.schedulers.values() {
            sched.borrow_mut().update_ue_beam(rnti, beam_conf_id)?;
        }
        Ok(())
    }

    /// Set up a data radio bearer: remember its QoS class and configure
    /// the logical channel at the BWP the algorithm picks for it.
    pub fn setup_bearer(&mut self, rnti: Rnti, lcid: u8, lcg_id: u8, qci: Qci) -> Result<()> {
        let bwp_index = self.algorithm.bwp_for_qci(qci);
        info!(
            "Bearer {:?} (lcid {}) of UE {} goes to BWP {}",
            qci, lcid, rnti, bwp_index
        );
        self.scheduler(bwp_index)?
            .borrow_mut()
            .configure_logical_channel(rnti, lcg_id, lcid)?;
        self.lcs.insert((rnti, lcid), LcInfo { qci, lcg_id });
        Ok(())
    }

    /// BWP index serving a logical channel.
    pub fn bwp_index(&self, rnti: Rnti, lcid: u8) -> Result<u8> {
        let lc = self.lc(rnti, lcid)?;
        Ok(self.algorithm.bwp_for_qci(lc.qci))
    }

    /// Whether a logical channel belongs to a guaranteed-bit-rate class.
    pub fn is_gbr(&self, rnti: Rnti, lcid: u8) -> Result<bool> {
        Ok(self.lc(rnti, lcid)?.qci.is_gbr())
    }

    /// Route a DL RLC buffer report to the scheduler of the bearer's BWP.
    pub fn dl_buffer_report(&self, rnti: Rnti, lcid: u8, bytes: u32) -> Result<()> {
        let lc = self.lc(rnti, lcid)?;
        let bwp_index = self.algorithm.bwp_for_qci(lc.qci);
        debug!(
            "Routing DL buffer report for UE {} lcid {} to BWP {}",
            rnti, lcid, bwp_index
        );
        self.scheduler(bwp_index)?
            .borrow_mut()
            .dl_buffer_report(rnti, lc.lcg_id, lcid, bytes)
    }

    /// Route an UL BSR to the scheduler of the bearer's BWP.
    pub fn ul_bsr(&self, rnti: Rnti, lcid: u8, bytes: u32) -> Result<()> {
        let lc = self.lc(rnti, lcid)?;
        let bwp_index = self.algorithm.bwp_for_qci(lc.qci);
        debug!(
            "Routing BSR for UE {} lcid {} to BWP {}",
            rnti, lcid, bwp_index
        );
        self.scheduler(bwp_index)?
            .borrow_mut()
            .ul_bsr(rnti, lc.lcg_id, bytes)
    }

    /// Route a scheduling request to the BWP it physically arrived on.
    pub fn ul_sr(&self, rnti: Rnti, source_bwp: u8) -> Result<()> {
        debug!("Routing SR for UE {} to source BWP {}", rnti, source_bwp);
        self.scheduler(source_bwp)?.borrow_mut().ul_sr(rnti)
    }

    /// Route a DL CQI report to the BWP it was measured on.
    pub fn dl_cqi_report(&self, rnti: Rnti, source_bwp: u8, ri: u8, wb_cqi: Vec<u8>) -> Result<()> {
        self.scheduler(source_bwp)?
            .borrow_mut()
            .dl_cqi_report(rnti, ri, wb_cqi)
    }

    /// Route an UL CQI report to the BWP it was measured on.
    pub fn ul_cqi_report(&self, rnti: Rnti, source_bwp: u8, cqi: u8) -> Result<()> {
        self.scheduler(source_bwp)?
            .borrow_mut()
            .ul_cqi_report(rnti, cqi)
    }

    /// BWP an outgoing control message leaves on: the linked BWP when a
    /// link exists, the originating BWP otherwise.
    pub fn route_outgoing_ctrl_msg(&self, source_bwp: u8) -> u8 {
        match self.output_links.get(&source_bwp) {
            Some(output) => {
                debug!("Routing outgoing msg from BWP {} to BWP {}", source_bwp, output);
                *output
            }
            None => {
                debug!(
                    "No linked BWP, routing outgoing msg to the source: {}",
                    source_bwp
                );
                source_bwp
            }
        }
    }

    /// Incoming control messages always return to the BWP that generated
    /// them.
    pub fn route_ingoing_ctrl_msg(&self, msg_source_bwp: u8) -> u8 {
        msg_source_bwp
    }

    fn lc(&self, rnti: Rnti, lcid: u8) -> Result<&LcInfo> {
        self.lcs
            .get(&(rnti, lcid))
            .ok_or(SchedError::UnknownLogicalChannel {
                rnti: rnti.value(),
                lcid,
            })
    }

    fn scheduler(&self, bwp_index: u8) -> Result<&Rc<RefCell<MacScheduler>>> {
        self.schedulers.get(&bwp_index).ok_or_else(|| {
            SchedError::InvalidState(format!("BWP index {} not valid", bwp_index))
        })
    }
}
