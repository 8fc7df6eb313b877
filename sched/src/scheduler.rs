//! MAC Scheduler
//!
//! One scheduler instance exists per bandwidth part. The surrounding MAC
//! invokes it once per slot, never concurrently for the same BWP: slot
//! state is reset, the active UE set is grouped by beam, NACKed HARQ
//! processes are replayed as retransmission grants, the DL and UL
//! allocation engines fill the remaining symbols with new data, and the
//! final tallies are turned into DCIs and trace records.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::timing::SYMBOLS_PER_SLOT;
use common::utils;
use common::{BeamConfId, CellId, Direction, Mcs, Rnti, SfnSf};

use crate::amc::Amc;
use crate::dci::{DciFormat, DciInfoElementTdma};
use crate::policy::SchedPolicy;
use crate::stats::{SchedTraceSink, SchedulingRecord};
use crate::ue_info::{DlCqiInfo, UeInfo, INVALID_MCS};
use crate::{ofdma, tdma, Result, SchedError};

/// Minimum useful transport block: 3 bytes MAC header, 2 bytes RLC
/// header and at least 2 bytes of payload.
pub const MIN_TB_SIZE_BYTES: u32 = 7;

/// Active UEs grouped by beam: per beam, (index into the slot's UE list,
/// pending bytes).
pub(crate) type ActiveUeMap = BTreeMap<BeamConfId, Vec<(usize, u32)>>;

/// Symbols granted per beam in one slot.
pub type BeamSymbolMap = BTreeMap<BeamConfId, u32>;

/// Cursor in the frequency × time plane used while converting tallies
/// into DCIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointInFtPlane {
    /// Frequency position, in RBGs
    pub rbg: u32,
    /// Time position, in symbols
    pub sym: u8,
}

/// Everything the allocation engines need for one direction of one slot.
pub(crate) struct AllocCtx<'a> {
    pub policy: &'a dyn SchedPolicy,
    pub amc: &'a dyn Amc,
    pub rb_per_rbg: u32,
    pub bandwidth_in_rbg: u32,
    /// Per-RBG allowed mask; empty means no notching
    pub notched_mask: &'a [bool],
    pub bwp_index: u8,
}

impl AllocCtx<'_> {
    /// RBGs usable for scheduling: the bandwidth minus the notched
    /// positions.
    pub fn assignable_rbgs(&self) -> u32 {
        if self.notched_mask.is_empty() {
            self.bandwidth_in_rbg
        } else {
            utils::mask_popcount(self.notched_mask) as u32
        }
    }

    /// The allowed-RBG mask at full bandwidth length.
    pub fn full_mask(&self) -> Vec<bool> {
        if self.notched_mask.is_empty() {
            vec![true; self.bandwidth_in_rbg as usize]
        } else {
            self.notched_mask.to_vec()
        }
    }
}

/// How the frequency × time plane is carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Whole bandwidth per symbol
    Tdma,
    /// Frequency divided per beam, then per UE
    Ofdma,
}

/// Scheduler construction parameters.
pub struct SchedulerParams {
    pub cell_id: CellId,
    /// Positional BWP index this scheduler serves
    pub bwp_index: u8,
    pub topology: Topology,
    pub policy: Box<dyn SchedPolicy>,
    pub dl_amc: Box<dyn Amc>,
    pub ul_amc: Box<dyn Amc>,
    /// Bandwidth of the BWP in RBGs
    pub bandwidth_in_rbg: u32,
    /// Resource blocks per RBG
    pub rb_per_rbg: u32,
    /// Symbols reserved for DL control at the slot start
    pub dl_ctrl_syms: u8,
    /// Symbols reserved for UL control at the slot end
    pub ul_ctrl_syms: u8,
    /// MCS used until the first CQI report arrives
    pub starting_mcs: Mcs,
}

/// What the MAC asks the scheduler to fill in one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotRequest {
    pub sfn_sf: SfnSf,
    /// Symbols available for DL data
    pub dl_sym_avail: u32,
    /// Symbols available for UL data
    pub ul_sym_avail: u32,
}

/// The scheduler's output for one slot.
#[derive(Debug, Clone)]
pub struct SlotAllocation {
    pub sfn_sf: SfnSf,
    pub dl_dcis: Vec<DciInfoElementTdma>,
    pub ul_dcis: Vec<DciInfoElementTdma>,
    pub dl_sym_per_beam: BeamSymbolMap,
    pub ul_sym_per_beam: BeamSymbolMap,
}

/// The per-BWP MAC scheduler.
pub struct MacScheduler {
    cell_id: CellId,
    bwp_index: u8,
    topology: Topology,
    policy: Box<dyn SchedPolicy>,
    dl_amc: Box<dyn Amc>,
    ul_amc: Box<dyn Amc>,
    bandwidth_in_rbg: u32,
    rb_per_rbg: u32,
    dl_ctrl_syms: u8,
    ul_ctrl_syms: u8,
    starting_mcs: Mcs,
    dl_notched_mask: Vec<bool>,
    ul_notched_mask: Vec<bool>,
    ues: HashMap<Rnti, UeInfo>,
    sinks: Vec<Rc<RefCell<dyn SchedTraceSink>>>,
}

impl std::fmt::Debug for MacScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacScheduler")
            .field("cell_id", &self.cell_id.0)
            .field("bwp_index", &self.bwp_index)
            .field("topology", &self.topology)
            .field("policy", &self.policy.name())
            .field("bandwidth_in_rbg", &self.bandwidth_in_rbg)
            .field("ues", &self.ues.len())
            .finish()
    }
}

impl MacScheduler {
    pub fn new(params: SchedulerParams) -> Result<Self> {
        if params.bandwidth_in_rbg == 0 {
            return Err(SchedError::ConfigurationError(
                "bandwidth of zero RBGs".into(),
            ));
        }
        if params.rb_per_rbg == 0 {
            return Err(SchedError::ConfigurationError("zero RBs per RBG".into()));
        }
        if params.dl_ctrl_syms as u16 + params.ul_ctrl_syms as u16 >= SYMBOLS_PER_SLOT as u16 {
            return Err(SchedError::ConfigurationError(format!(
                "control symbols ({} DL + {} UL) leave no room for data",
                params.dl_ctrl_syms, params.ul_ctrl_syms
            )));
        }
        info!(
            "Creating {:?} {} scheduler for cell {} BWP {}, {} RBG",
            params.topology,
            params.policy.name(),
            params.cell_id.0,
            params.bwp_index,
            params.bandwidth_in_rbg
        );
        Ok(Self {
            cell_id: params.cell_id,
            bwp_index: params.bwp_index,
            topology: params.topology,
            policy: params.policy,
            dl_amc: params.dl_amc,
            ul_amc: params.ul_amc,
            bandwidth_in_rbg: params.bandwidth_in_rbg,
            rb_per_rbg: params.rb_per_rbg,
            dl_ctrl_syms: params.dl_ctrl_syms,
            ul_ctrl_syms: params.ul_ctrl_syms,
            starting_mcs: params.starting_mcs,
            dl_notched_mask: Vec::new(),
            ul_notched_mask: Vec::new(),
            ues: HashMap::new(),
            sinks: Vec::new(),
        })
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn bwp_index(&self) -> u8 {
        self.bwp_index
    }

    pub fn num_ues(&self) -> usize {
        self.ues.len()
    }

    /// Subscribe a trace collector to the scheduling records.
    pub fn add_trace_sink(&mut self, sink: Rc<RefCell<dyn SchedTraceSink>>) {
        self.sinks.push(sink);
    }

    /// Configure a new UE. Its MCS starts at the configured default until
    /// CQI reports arrive.
    pub fn add_ue(&mut self, rnti: Rnti, beam_conf_id: BeamConfId) -> Result<()> {
        if self.ues.contains_key(&rnti) {
            return Err(SchedError::ConfigurationError(format!(
                "UE {} already configured",
                rnti
            )));
        }
        debug!("Adding UE {} on beam {}", rnti, beam_conf_id);
        let mut ue = UeInfo::new(rnti, beam_conf_id);
        ue.dl_mcs = vec![self.starting_mcs];
        ue.ul_mcs = self.starting_mcs;
        self.ues.insert(rnti, ue);
        Ok(())
    }

    pub fn release_ue(&mut self, rnti: Rnti) -> Result<()> {
        debug!("Releasing UE {}", rnti);
        self.ues
            .remove(&rnti)
            .map(|_| ())
            .ok_or(SchedError::UnknownUe(rnti.value()))
    }

    /// Update a UE's beam pairing after a beamforming run.
    pub fn update_ue_beam(&mut self, rnti: Rnti, beam_conf_id: BeamConfId) -> Result<()> {
        self.ue_mut(rnti)?.beam_conf_id = beam_conf_id;
        Ok(())
    }

    pub fn set_ue_imsi(&mut self, rnti: Rnti, imsi: u64) -> Result<()> {
        self.ue_mut(rnti)?.imsi = imsi;
        Ok(())
    }

    /// Attach a logical channel to a UE, in both directions.
    pub fn configure_logical_channel(&mut self, rnti: Rnti, lcg_id: u8, lcid: u8) -> Result<()> {
        let ue = self.ue_mut(rnti)?;
        ue.dl_lcg.entry(lcg_id).or_default().update_queue(lcid, 0);
        ue.ul_lcg.entry(lcg_id).or_insert(0);
        Ok(())
    }

    /// RLC queue estimate for one DL logical channel.
    pub fn dl_buffer_report(
        &mut self,
        rnti: Rnti,
        lcg_id: u8,
        lcid: u8,
        bytes: u32,
    ) -> Result<()> {
        let ue = self.ue_mut(rnti)?;
        match ue.dl_lcg.get_mut(&lcg_id) {
            Some(group) if group.contains(lcid) => {
                group.update_queue(lcid, bytes);
                Ok(())
            }
            _ => Err(SchedError::UnknownLogicalChannel {
                rnti: rnti.value(),
                lcid,
            }),
        }
    }

    /// Buffer status report for one UL LCG.
    pub fn ul_bsr(&mut self, rnti: Rnti, lcg_id: u8, bytes: u32) -> Result<()> {
        let ue = self.ue_mut(rnti)?;
        ue.ul_lcg.insert(lcg_id, bytes);
        Ok(())
    }

    /// Scheduling request: the UE wants UL resources but the scheduler
    /// has no buffer estimate yet.
    pub fn ul_sr(&mut self, rnti: Rnti) -> Result<()> {
        self.ue_mut(rnti)?.sr_pending = true;
        Ok(())
    }

    /// DL CQI report: rank indicator plus one wideband CQI per stream.
    pub fn dl_cqi_report(&mut self, rnti: Rnti, ri: u8, wb_cqi: Vec<u8>) -> Result<()> {
        if !(1..=2).contains(&ri) || wb_cqi.is_empty() || (ri as usize) > wb_cqi.len() {
            return Err(SchedError::InvalidState(format!(
                "malformed CQI report for UE {}: ri {} over {} streams",
                rnti,
                ri,
                wb_cqi.len()
            )));
        }
        let mcs: Vec<Mcs> = wb_cqi
            .iter()
            .map(|cqi| self.dl_amc.get_mcs_from_cqi(*cqi))
            .collect();
        let ue = self.ue_mut(rnti)?;
        ue.dl_mcs = mcs;
        ue.dl_tb_size.resize(wb_cqi.len(), 0);
        ue.dl_cqi = DlCqiInfo { ri, wb_cqi };
        debug!("UE {} DL MCS now {:?} (ri {})", rnti, ue.dl_mcs, ri);
        Ok(())
    }

    /// UL CQI report (wideband).
    pub fn ul_cqi_report(&mut self, rnti: Rnti, cqi: u8) -> Result<()> {
        let mcs = self.ul_amc.get_mcs_from_cqi(cqi);
        let ue = self.ue_mut(rnti)?;
        ue.ul_mcs = mcs;
        Ok(())
    }

    /// HARQ feedback for a DL grant: the list of NACKed streams, empty
    /// for an ACK. An ACK frees the process; a NACK queues it for
    /// retransmission ahead of new data in a following slot.
    pub fn dl_harq_feedback(
        &mut self,
        rnti: Rnti,
        harq_id: u8,
        nacked_streams: &[u8],
    ) -> Result<()> {
        debug!(
            "UE {} DL HARQ feedback on process {}: NACKed streams {:?}",
            rnti, harq_id, nacked_streams
        );
        self.ue_mut(rnti)?.dl_harq.feedback(harq_id, nacked_streams)
    }

    /// HARQ feedback for an UL grant (single stream).
    pub fn ul_harq_feedback(&mut self, rnti: Rnti, harq_id: u8, ack: bool) -> Result<()> {
        debug!(
            "UE {} UL HARQ feedback on process {}: {}",
            rnti,
            harq_id,
            if ack { "ACK" } else { "NACK" }
        );
        let nacked: &[u8] = if ack { &[] } else { &[0] };
        self.ue_mut(rnti)?.ul_harq.feedback(harq_id, nacked)
    }

    /// Forbid RBG positions for DL scheduling. An empty mask re-enables
    /// the full bandwidth.
    pub fn set_dl_notch_mask(&mut self, mask: Vec<bool>) -> Result<()> {
        Self::validate_mask(&mask, self.bandwidth_in_rbg)?;
        self.dl_notched_mask = mask;
        Ok(())
    }

    /// Forbid RBG positions for UL scheduling.
    pub fn set_ul_notch_mask(&mut self, mask: Vec<bool>) -> Result<()> {
        Self::validate_mask(&mask, self.bandwidth_in_rbg)?;
        self.ul_notched_mask = mask;
        Ok(())
    }

    fn validate_mask(mask: &[bool], bandwidth_in_rbg: u32) -> Result<()> {
        if mask.is_empty() {
            return Ok(());
        }
        if mask.len() != bandwidth_in_rbg as usize {
            return Err(SchedError::ConfigurationError(format!(
                "notch mask of {} bits over a bandwidth of {} RBGs",
                mask.len(),
                bandwidth_in_rbg
            )));
        }
        if utils::mask_popcount(mask) == 0 {
            return Err(SchedError::ConfigurationError(
                "notch mask leaves no assignable RBGs".into(),
            ));
        }
        Ok(())
    }

    fn ue_mut(&mut self, rnti: Rnti) -> Result<&mut UeInfo> {
        self.ues
            .get_mut(&rnti)
            .ok_or(SchedError::UnknownUe(rnti.value()))
    }

    /// Run one scheduling slot and emit the resulting grants.
    pub fn schedule_slot(&mut self, req: &SlotRequest) -> SlotAllocation {
        debug!(
            "Scheduling slot {}: {} DL sym, {} UL sym, {} UEs",
            req.sfn_sf,
            req.dl_sym_avail,
            req.ul_sym_avail,
            self.ues.len()
        );

        // Symbols beyond the data region of the slot cannot be granted
        let data_syms = (SYMBOLS_PER_SLOT - self.dl_ctrl_syms - self.ul_ctrl_syms) as u32;
        let mut dl_sym_avail = req.dl_sym_avail.min(data_syms);
        let mut ul_sym_avail = req.ul_sym_avail.min(data_syms);
        if dl_sym_avail < req.dl_sym_avail || ul_sym_avail < req.ul_sym_avail {
            warn!(
                "Slot {} request of {} DL / {} UL symbols exceeds the {}-symbol data region, clamping",
                req.sfn_sf, req.dl_sym_avail, req.ul_sym_avail, data_syms
            );
        }

        for ue in self.ues.values_mut() {
            ue.reset_dl_sched_info();
            ue.reset_ul_sched_info();
            ue.dl_harq.tick();
            ue.ul_harq.tick();
        }

        // A deterministic UE ordering; the hash map iteration order must
        // not leak into tie-breaking.
        let mut ue_refs: Vec<&mut UeInfo> = self.ues.values_mut().collect();
        ue_refs.sort_by_key(|ue| ue.rnti);

        let mut active_dl = ActiveUeMap::new();
        let mut active_ul = ActiveUeMap::new();
        for (idx, ue) in ue_refs.iter().enumerate() {
            // each direction waits for its own first CQI and needs an
            // idle HARQ process to carry new data
            if ue.dl_mcs[0] != INVALID_MCS && ue.dl_harq.first_idle().is_some() {
                let dl_buf = ue.total_dl_buffer();
                if dl_buf > 0 {
                    active_dl
                        .entry(ue.beam_conf_id)
                        .or_default()
                        .push((idx, dl_buf));
                }
            }
            if ue.ul_mcs != INVALID_MCS && ue.ul_harq.first_idle().is_some() {
                let mut ul_buf = ue.total_ul_buffer();
                if ul_buf == 0 && ue.sr_pending {
                    // grant the minimum so the UE can send a real BSR
                    ul_buf = MIN_TB_SIZE_BYTES;
                }
                if ul_buf > 0 {
                    active_ul
                        .entry(ue.beam_conf_id)
                        .or_default()
                        .push((idx, ul_buf));
                }
            }
        }

        let dl_ctx = AllocCtx {
            policy: self.policy.as_ref(),
            amc: self.dl_amc.as_ref(),
            rb_per_rbg: self.rb_per_rbg,
            bandwidth_in_rbg: self.bandwidth_in_rbg,
            notched_mask: &self.dl_notched_mask,
            bwp_index: self.bwp_index,
        };
        // NACKed grants are replayed first, growing forward from the end
        // of the DL control region; new data starts after them
        let mut dl_dcis = Vec::new();
        let mut dl_spoint = PointInFtPlane {
            rbg: 0,
            sym: self.dl_ctrl_syms,
        };
        let mut dl_retx_per_beam = BeamSymbolMap::new();
        for ue in ue_refs.iter_mut() {
            // at most one retransmission per UE per slot
            let harq_id = match ue.dl_harq.retx_ready().first().copied() {
                Some(id) => id,
                None => continue,
            };
            let num_sym = match ue.dl_harq.get(harq_id) {
                Some(proc) => proc.num_sym,
                None => continue,
            };
            if num_sym as u32 > dl_sym_avail {
                // not enough symbols left, the process stays queued
                continue;
            }
            let grant = match ue.dl_harq.begin_retx(harq_id) {
                Some(grant) => grant,
                None => continue,
            };
            debug!(
                "UE {} DL HARQ retx on process {}: {} sym from {}",
                ue.rnti, harq_id, num_sym, dl_spoint.sym
            );
            dl_dcis.push(DciInfoElementTdma::new(
                ue.rnti,
                DciFormat::Dl,
                dl_spoint.sym,
                grant.num_sym,
                grant.mcs,
                grant.tb_size,
                grant.ndi,
                grant.rv,
                self.bwp_index,
                harq_id,
                dl_ctx.full_mask(),
            ));
            dl_spoint.sym += num_sym;
            dl_sym_avail -= num_sym as u32;
            *dl_retx_per_beam.entry(ue.beam_conf_id).or_default() += num_sym as u32;
        }

        let mut dl_sym_per_beam = match self.topology {
            Topology::Tdma => tdma::assign_rbg_tdma(
                Direction::Dl,
                dl_sym_avail,
                &active_dl,
                &mut ue_refs,
                &dl_ctx,
            ),
            Topology::Ofdma => ofdma::assign_rbg_ofdma(
                Direction::Dl,
                dl_sym_avail,
                &active_dl,
                &mut ue_refs,
                &dl_ctx,
            ),
        };

        let ul_ctx = AllocCtx {
            policy: self.policy.as_ref(),
            amc: self.ul_amc.as_ref(),
            rb_per_rbg: self.rb_per_rbg,
            bandwidth_in_rbg: self.bandwidth_in_rbg,
            notched_mask: &self.ul_notched_mask,
            bwp_index: self.bwp_index,
        };
        // UL retransmissions are packed backward from the UL control
        // region at the slot end; new data packs behind them
        let mut ul_dcis = Vec::new();
        let mut ul_spoint = PointInFtPlane {
            rbg: 0,
            sym: SYMBOLS_PER_SLOT - self.ul_ctrl_syms,
        };
        let mut ul_retx_per_beam = BeamSymbolMap::new();
        for ue in ue_refs.iter_mut() {
            let harq_id = match ue.ul_harq.retx_ready().first().copied() {
                Some(id) => id,
                None => continue,
            };
            let num_sym = match ue.ul_harq.get(harq_id) {
                Some(proc) => proc.num_sym,
                None => continue,
            };
            if num_sym as u32 > ul_sym_avail {
                continue;
            }
            let grant = match ue.ul_harq.begin_retx(harq_id) {
                Some(grant) => grant,
                None => continue,
            };
            ul_spoint.sym -= num_sym;
            debug!(
                "UE {} UL HARQ retx on process {}: {} sym from {}",
                ue.rnti, harq_id, num_sym, ul_spoint.sym
            );
            ul_dcis.push(DciInfoElementTdma::new(
                ue.rnti,
                DciFormat::Ul,
                ul_spoint.sym,
                grant.num_sym,
                grant.mcs,
                grant.tb_size,
                grant.ndi,
                grant.rv,
                self.bwp_index,
                harq_id,
                ul_ctx.full_mask(),
            ));
            ul_sym_avail -= num_sym as u32;
            *ul_retx_per_beam.entry(ue.beam_conf_id).or_default() += num_sym as u32;
        }

        let mut ul_sym_per_beam = match self.topology {
            Topology::Tdma => tdma::assign_rbg_tdma(
                Direction::Ul,
                ul_sym_avail,
                &active_ul,
                &mut ue_refs,
                &ul_ctx,
            ),
            Topology::Ofdma => ofdma::assign_rbg_ofdma(
                Direction::Ul,
                ul_sym_avail,
                &active_ul,
                &mut ue_refs,
                &ul_ctx,
            ),
        };

        // New-data DL DCIs continue forward from where the
        // retransmissions stopped
        for (beam, beam_sym) in &dl_sym_per_beam {
            if let Some(beam_ues) = active_dl.get(beam) {
                for &(idx, _) in beam_ues {
                    let ue = &mut *ue_refs[idx];
                    if ue.dl_rbg == 0 {
                        continue;
                    }
                    let dci = match self.topology {
                        Topology::Tdma => tdma::create_dl_dci(&mut dl_spoint, ue, &dl_ctx),
                        Topology::Ofdma => {
                            ofdma::create_dl_dci(&mut dl_spoint, ue, *beam_sym, &dl_ctx)
                        }
                    };
                    match dci {
                        Some(dci) => dl_dcis.push(dci),
                        None => ue.reset_metric(Direction::Dl),
                    }
                }
            }
            if self.topology == Topology::Ofdma {
                ofdma::change_dl_beam(&mut dl_spoint, *beam_sym);
            }
        }

        // New-data UL DCIs keep packing backward behind the
        // retransmissions
        for (beam, beam_sym) in &ul_sym_per_beam {
            if let Some(beam_ues) = active_ul.get(beam) {
                for &(idx, _) in beam_ues {
                    let ue = &mut *ue_refs[idx];
                    if ue.ul_rbg == 0 {
                        continue;
                    }
                    let dci = match self.topology {
                        Topology::Tdma => {
                            tdma::create_ul_dci(&mut ul_spoint, ue, *beam_sym, &ul_ctx)
                        }
                        Topology::Ofdma => {
                            ofdma::create_ul_dci(&mut ul_spoint, ue, *beam_sym, &ul_ctx)
                        }
                    };
                    match dci {
                        Some(dci) => {
                            ue.sr_pending = false;
                            ul_dcis.push(dci);
                        }
                        None => ue.reset_metric(Direction::Ul),
                    }
                }
            }
            if self.topology == Topology::Ofdma {
                ofdma::change_ul_beam(&mut ul_spoint, *beam_sym);
            }
        }

        for (beam, sym) in dl_retx_per_beam {
            *dl_sym_per_beam.entry(beam).or_default() += sym;
        }
        for (beam, sym) in ul_retx_per_beam {
            *ul_sym_per_beam.entry(beam).or_default() += sym;
        }

        let imsi_of: HashMap<Rnti, u64> = ue_refs.iter().map(|ue| (ue.rnti, ue.imsi)).collect();
        drop(ue_refs);

        self.fire_traces(Direction::Dl, &dl_dcis, &req.sfn_sf, &imsi_of);
        self.fire_traces(Direction::Ul, &ul_dcis, &req.sfn_sf, &imsi_of);

        debug!(
            "Slot {} done: {} DL DCIs, {} UL DCIs",
            req.sfn_sf,
            dl_dcis.len(),
            ul_dcis.len()
        );

        SlotAllocation {
            sfn_sf: req.sfn_sf,
            dl_dcis,
            ul_dcis,
            dl_sym_per_beam,
            ul_sym_per_beam,
        }
    }

    fn fire_traces(
        &self,
        dir: Direction,
        dcis: &[DciInfoElementTdma],
        sfn_sf: &SfnSf,
        imsi_of: &HashMap<Rnti, u64>,
    ) {
        for dci in dcis {
            let imsi = imsi_of
                .get(&dci.rnti)
                .copied()
                .unwrap_or(dci.rnti.value() as u64);
            for record in SchedulingRecord::from_dci(dci, sfn_sf, self.cell_id.0, imsi) {
                for sink in &self.sinks {
                    sink.borrow_mut().on_scheduling(dir, &record);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::BeamId;

    use crate::amc::{AmcModel, McsTable, NrAmc};
    use crate::policy::RoundRobin;
    use crate::ue_info::LcGroup;

    /// Deterministic AMC for unit tests: TBS grows linearly with MCS and
    /// RB count.
    #[derive(Debug)]
    pub(crate) struct LinearAmc;

    impl Amc for LinearAmc {
        fn calculate_tb_size(&self, mcs: Mcs, num_rb: u32) -> u32 {
            (mcs as u32 + 1) * num_rb * 10
        }

        fn max_mcs(&self) -> Mcs {
            28
        }

        fn get_mcs_from_cqi(&self, cqi: u8) -> Mcs {
            (cqi * 2).min(self.max_mcs())
        }
    }

    pub(crate) fn linear_amc() -> LinearAmc {
        LinearAmc
    }

    pub(crate) fn ue_with_buffer(rnti: u16, bytes: u32) -> UeInfo {
        let mut ue = UeInfo::new(Rnti(rnti), BeamConfId::new(BeamId::new(0, 0), None));
        ue.dl_mcs = vec![10];
        ue.ul_mcs = 10;
        let mut lcg = LcGroup::default();
        lcg.update_queue(1, bytes);
        ue.dl_lcg.insert(0, lcg);
        ue
    }

    pub(crate) fn active_map(ues: &[&mut UeInfo]) -> ActiveUeMap {
        let mut map = ActiveUeMap::new();
        for (idx, ue) in ues.iter().enumerate() {
            map.entry(ue.beam_conf_id)
                .or_default()
                .push((idx, ue.total_dl_buffer()));
        }
        map
    }

    fn init_logs() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn scheduler(topology: Topology, bandwidth_in_rbg: u32) -> MacScheduler {
        init_logs();
        MacScheduler::new(SchedulerParams {
            cell_id: CellId(1),
            bwp_index: 0,
            topology,
            policy: Box::new(RoundRobin),
            dl_amc: Box::new(NrAmc::new(AmcModel::ErrorModel, McsTable::Table1)),
            ul_amc: Box::new(NrAmc::new(AmcModel::ErrorModel, McsTable::Table1)),
            bandwidth_in_rbg,
            rb_per_rbg: 1,
            dl_ctrl_syms: 1,
            ul_ctrl_syms: 1,
            starting_mcs: 4,
        })
        .unwrap()
    }

    fn beam0() -> BeamConfId {
        BeamConfId::new(BeamId::new(0, 0), None)
    }

    fn slot(dl: u32, ul: u32) -> SlotRequest {
        SlotRequest {
            sfn_sf: SfnSf::new(0, 0, 0, 0),
            dl_sym_avail: dl,
            ul_sym_avail: ul,
        }
    }

    #[test]
    fn test_single_ue_tdma_rr_takes_every_symbol() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();

        let alloc = sched.schedule_slot(&slot(12, 0));

        assert_eq!(alloc.dl_dcis.len(), 1);
        let dci = &alloc.dl_dcis[0];
        assert_eq!(dci.num_sym, 12);
        assert_eq!(dci.sym_start, 1);
        assert_eq!(dci.rbg_bitmask, vec![true; 25]);
        assert_eq!(alloc.dl_sym_per_beam[&beam0()], 12);
        assert!(alloc.ul_dcis.is_empty());
    }

    #[test]
    fn test_notching_reduces_assignable_rbgs() {
        let mut sched = scheduler(Topology::Tdma, 25);
        // notch RBGs 12..=17
        let mask: Vec<bool> = (0..25).map(|i| !(12..=17).contains(&i)).collect();
        sched.set_dl_notch_mask(mask.clone()).unwrap();

        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();

        let alloc = sched.schedule_slot(&slot(12, 0));

        assert_eq!(alloc.dl_dcis.len(), 1);
        let dci = &alloc.dl_dcis[0];
        assert_eq!(dci.num_sym, 12);
        assert_eq!(dci.rbg_bitmask, mask);
        assert_eq!(dci.allocated_rbgs(), 19);
    }

    #[test]
    fn test_invalid_notch_masks_rejected() {
        let mut sched = scheduler(Topology::Tdma, 25);
        let err = sched.set_dl_notch_mask(vec![true; 10]);
        assert!(matches!(err, Err(SchedError::ConfigurationError(_))));

        let err = sched.set_ul_notch_mask(vec![false; 25]);
        assert!(matches!(err, Err(SchedError::ConfigurationError(_))));

        sched.set_dl_notch_mask(Vec::new()).unwrap();
    }

    #[test]
    fn test_sr_grants_minimum_ul() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.ul_cqi_report(Rnti(1), 10).unwrap();
        sched.ul_sr(Rnti(1)).unwrap();

        let alloc = sched.schedule_slot(&slot(0, 6));
        assert_eq!(alloc.ul_dcis.len(), 1);
        let dci = &alloc.ul_dcis[0];
        assert!(dci.tb_size[0] >= MIN_TB_SIZE_BYTES);
        // packed backward: ends right before the UL control symbol
        assert_eq!(dci.sym_start + dci.num_sym, 13);

        // the SR is consumed by the grant
        let alloc = sched.schedule_slot(&slot(0, 6));
        assert!(alloc.ul_dcis.is_empty());
    }

    #[test]
    fn test_bsr_drives_ul_allocation() {
        let mut sched = scheduler(Topology::Tdma, 25);
        for rnti in [1u16, 2] {
            sched.add_ue(Rnti(rnti), beam0()).unwrap();
            sched.configure_logical_channel(Rnti(rnti), 0, 1).unwrap();
            sched.ul_cqi_report(Rnti(rnti), 12).unwrap();
            sched.ul_bsr(Rnti(rnti), 0, 50_000).unwrap();
        }

        let alloc = sched.schedule_slot(&slot(0, 8));
        assert_eq!(alloc.ul_dcis.len(), 2);
        let total_sym: u8 = alloc.ul_dcis.iter().map(|d| d.num_sym).sum();
        assert_eq!(total_sym, 8);
        // UL grants must not overlap
        let mut spans: Vec<(u8, u8)> = alloc
            .ul_dcis
            .iter()
            .map(|d| (d.sym_start, d.sym_start + d.num_sym))
            .collect();
        spans.sort();
        assert!(spans[0].1 <= spans[1].0);
    }

    #[test]
    fn test_mimo_ue_gets_two_stream_dci() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 2, vec![14, 12]).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 500_000).unwrap();

        let alloc = sched.schedule_slot(&slot(10, 0));
        assert_eq!(alloc.dl_dcis.len(), 1);
        let dci = &alloc.dl_dcis[0];
        assert_eq!(dci.tb_size.len(), 2);
        assert_eq!(dci.ndi, vec![1, 1]);
        assert!(dci.tb_size[0] > dci.tb_size[1]);
    }

    #[test]
    fn test_mimo_surplus_stream_suppressed() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 2, vec![15, 15]).unwrap();
        // small buffer: the first stream of the first symbol already
        // covers it
        sched.dl_buffer_report(Rnti(1), 0, 1, 100).unwrap();

        let alloc = sched.schedule_slot(&slot(12, 0));
        assert_eq!(alloc.dl_dcis.len(), 1);
        let dci = &alloc.dl_dcis[0];
        assert_eq!(dci.tb_size[1], 0);
        assert_eq!(dci.ndi[1], 0);
        assert!(dci.tb_size[0] > 0);
    }

    #[test]
    fn test_two_ues_share_slot_evenly() {
        let mut sched = scheduler(Topology::Tdma, 25);
        for rnti in [1u16, 2] {
            sched.add_ue(Rnti(rnti), beam0()).unwrap();
            sched.configure_logical_channel(Rnti(rnti), 0, 1).unwrap();
            sched.dl_cqi_report(Rnti(rnti), 1, vec![15]).unwrap();
            sched.dl_buffer_report(Rnti(rnti), 0, 1, 100_000).unwrap();
        }

        let alloc = sched.schedule_slot(&slot(12, 0));
        assert_eq!(alloc.dl_dcis.len(), 2);
        assert_eq!(alloc.dl_dcis[0].num_sym, 6);
        assert_eq!(alloc.dl_dcis[1].num_sym, 6);
        // consecutive, non-overlapping spans
        assert_eq!(alloc.dl_dcis[0].sym_start, 1);
        assert_eq!(alloc.dl_dcis[1].sym_start, 7);
    }

    #[test]
    fn test_ofdma_two_beams_split_symbols() {
        let mut sched = scheduler(Topology::Ofdma, 20);
        let beam_a = BeamConfId::new(BeamId::new(0, 0), None);
        let beam_b = BeamConfId::new(BeamId::new(1, 0), None);
        for (rnti, beam) in [(1u16, beam_a), (2, beam_b)] {
            sched.add_ue(Rnti(rnti), beam).unwrap();
            sched.configure_logical_channel(Rnti(rnti), 0, 1).unwrap();
            sched.dl_cqi_report(Rnti(rnti), 1, vec![15]).unwrap();
            sched.dl_buffer_report(Rnti(rnti), 0, 1, 100_000).unwrap();
        }

        let alloc = sched.schedule_slot(&slot(12, 0));
        assert_eq!(alloc.dl_sym_per_beam.values().sum::<u32>(), 12);
        assert_eq!(alloc.dl_sym_per_beam[&beam_a], 6);
        assert_eq!(alloc.dl_sym_per_beam[&beam_b], 6);
        assert_eq!(alloc.dl_dcis.len(), 2);
        // beam A occupies the first span, beam B follows
        assert_eq!(alloc.dl_dcis[0].sym_start, 1);
        assert_eq!(alloc.dl_dcis[1].sym_start, 7);
        for dci in &alloc.dl_dcis {
            assert_eq!(dci.num_sym, 6);
            assert_eq!(dci.allocated_rbgs(), 20);
        }
    }

    #[test]
    fn test_trace_fanout() {
        use crate::stats::VecTraceSink;

        let mut sched = scheduler(Topology::Tdma, 25);
        let sink = Rc::new(RefCell::new(VecTraceSink::new()));
        sched.add_trace_sink(sink.clone());

        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.set_ue_imsi(Rnti(1), 42).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();

        sched.schedule_slot(&slot(12, 0));

        let sink = sink.borrow();
        let recs: Vec<_> = sink.dl_records().collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].imsi, 42);
        assert_eq!(recs[0].rnti, 1);
        assert_eq!(recs[0].cell_id, 1);
        assert_eq!(recs[0].num_sym, 12);
        assert_eq!(recs[0].ndi, 1);
        assert!(sink.ul_records().next().is_none());
    }

    #[test]
    fn test_unknown_ue_is_an_error() {
        let mut sched = scheduler(Topology::Tdma, 25);
        assert!(matches!(
            sched.ul_sr(Rnti(9)),
            Err(SchedError::UnknownUe(9))
        ));
        assert!(matches!(
            sched.release_ue(Rnti(9)),
            Err(SchedError::UnknownUe(9))
        ));
        sched.add_ue(Rnti(9), beam0()).unwrap();
        assert!(matches!(
            sched.add_ue(Rnti(9), beam0()),
            Err(SchedError::ConfigurationError(_))
        ));
        sched.release_ue(Rnti(9)).unwrap();
    }

    #[test]
    fn test_unknown_logical_channel_is_an_error() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        assert!(matches!(
            sched.dl_buffer_report(Rnti(1), 0, 3, 100),
            Err(SchedError::UnknownLogicalChannel { rnti: 1, lcid: 3 })
        ));
    }

    #[test]
    fn test_nacked_grant_retransmitted_before_new_data() {
        let mut sched = scheduler(Topology::Tdma, 25);
        for rnti in [1u16, 2] {
            sched.add_ue(Rnti(rnti), beam0()).unwrap();
            sched.configure_logical_channel(Rnti(rnti), 0, 1).unwrap();
            sched.dl_cqi_report(Rnti(rnti), 1, vec![15]).unwrap();
        }
        sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();

        let alloc = sched.schedule_slot(&slot(12, 0));
        assert_eq!(alloc.dl_dcis.len(), 1);
        let first = alloc.dl_dcis[0].clone();
        assert_eq!(first.ndi, vec![1]);
        assert_eq!(first.harq_process, 0);

        sched.dl_harq_feedback(Rnti(1), first.harq_process, &[0]).unwrap();
        sched.dl_buffer_report(Rnti(2), 0, 1, 100_000).unwrap();

        // the retransmission fills the slot ahead of UE 2's new data
        let mut req = slot(12, 0);
        req.sfn_sf = req.sfn_sf.add_slots(1);
        let alloc = sched.schedule_slot(&req);
        assert_eq!(alloc.dl_dcis.len(), 1);
        let retx = &alloc.dl_dcis[0];
        assert_eq!(retx.rnti, Rnti(1));
        assert_eq!(retx.harq_process, first.harq_process);
        assert_eq!(retx.ndi, vec![0]);
        assert_eq!(retx.rv, vec![1]);
        assert_eq!(retx.mcs, first.mcs);
        assert_eq!(retx.tb_size, first.tb_size);
        assert_eq!(retx.num_sym, 12);
        assert_eq!(retx.sym_start, 1);
        assert_eq!(alloc.dl_sym_per_beam[&beam0()], 12);

        // once the retx is acknowledged, new data flows again
        sched
            .dl_harq_feedback(Rnti(1), first.harq_process, &[])
            .unwrap();
        req.sfn_sf = req.sfn_sf.add_slots(1);
        let alloc = sched.schedule_slot(&req);
        assert!(alloc
            .dl_dcis
            .iter()
            .any(|d| d.rnti == Rnti(2) && d.ndi == vec![1]));
    }

    #[test]
    fn test_ul_retx_packed_at_slot_end() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.ul_cqi_report(Rnti(1), 12).unwrap();
        sched.ul_bsr(Rnti(1), 0, 50_000).unwrap();

        let alloc = sched.schedule_slot(&slot(0, 12));
        assert_eq!(alloc.ul_dcis.len(), 1);
        let first = alloc.ul_dcis[0].clone();
        assert_eq!(first.ndi, vec![1]);

        sched
            .ul_harq_feedback(Rnti(1), first.harq_process, false)
            .unwrap();

        let mut req = slot(0, 12);
        req.sfn_sf = req.sfn_sf.add_slots(1);
        let alloc = sched.schedule_slot(&req);
        assert_eq!(alloc.ul_dcis.len(), 1);
        let retx = &alloc.ul_dcis[0];
        assert_eq!(retx.harq_process, first.harq_process);
        assert_eq!(retx.ndi, vec![0]);
        assert_eq!(retx.rv, vec![1]);
        assert_eq!(retx.tb_size, first.tb_size);
        // still ends right before the UL control symbol
        assert_eq!(retx.sym_start + retx.num_sym, 13);
        assert_eq!(alloc.ul_sym_per_beam[&beam0()], 12);
    }

    #[test]
    fn test_acked_process_is_reused() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();

        let alloc = sched.schedule_slot(&slot(12, 0));
        assert_eq!(alloc.dl_dcis[0].harq_process, 0);
        sched.dl_harq_feedback(Rnti(1), 0, &[]).unwrap();

        let mut req = slot(12, 0);
        req.sfn_sf = req.sfn_sf.add_slots(1);
        let alloc = sched.schedule_slot(&req);
        assert_eq!(alloc.dl_dcis[0].harq_process, 0);
        assert_eq!(alloc.dl_dcis[0].ndi, vec![1]);
    }

    #[test]
    fn test_harq_feedback_validation() {
        let mut sched = scheduler(Topology::Tdma, 25);
        assert!(matches!(
            sched.dl_harq_feedback(Rnti(1), 0, &[]),
            Err(SchedError::UnknownUe(1))
        ));
        sched.add_ue(Rnti(1), beam0()).unwrap();
        assert!(matches!(
            sched.dl_harq_feedback(Rnti(1), 0, &[0]),
            Err(SchedError::InvalidState(_))
        ));
        assert!(matches!(
            sched.ul_harq_feedback(Rnti(1), 5, true),
            Err(SchedError::InvalidState(_))
        ));
    }

    #[test]
    fn test_oversized_slot_request_clamped() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();
        sched.ul_cqi_report(Rnti(1), 12).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 1_000_000).unwrap();

        // far more symbols than a slot holds: clamped to the data region
        let alloc = sched.schedule_slot(&slot(100, 0));
        assert_eq!(alloc.dl_dcis.len(), 1);
        assert_eq!(alloc.dl_dcis[0].num_sym, 12);

        sched.ul_bsr(Rnti(1), 0, 1_000_000).unwrap();
        let mut req = slot(0, 100);
        req.sfn_sf = req.sfn_sf.add_slots(1);
        let alloc = sched.schedule_slot(&req);
        assert_eq!(alloc.ul_dcis.len(), 1);
        let dci = &alloc.ul_dcis[0];
        assert_eq!(dci.num_sym, 12);
        assert_eq!(dci.sym_start + dci.num_sym, 13);
    }

    #[test]
    fn test_ul_scheduled_before_first_dl_cqi() {
        init_logs();
        let mut sched = MacScheduler::new(SchedulerParams {
            cell_id: CellId(1),
            bwp_index: 0,
            topology: Topology::Tdma,
            policy: Box::new(RoundRobin),
            dl_amc: Box::new(NrAmc::new(AmcModel::ErrorModel, McsTable::Table1)),
            ul_amc: Box::new(NrAmc::new(AmcModel::ErrorModel, McsTable::Table1)),
            bandwidth_in_rbg: 25,
            rb_per_rbg: 1,
            dl_ctrl_syms: 1,
            ul_ctrl_syms: 1,
            starting_mcs: INVALID_MCS,
        })
        .unwrap();
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.ul_cqi_report(Rnti(1), 12).unwrap();
        sched.ul_bsr(Rnti(1), 0, 10_000).unwrap();
        sched.dl_buffer_report(Rnti(1), 0, 1, 10_000).unwrap();

        // no DL CQI yet: DL waits, UL must still run
        let alloc = sched.schedule_slot(&slot(6, 6));
        assert!(alloc.dl_dcis.is_empty());
        assert_eq!(alloc.ul_dcis.len(), 1);
    }

    #[test]
    fn test_harq_process_rotates() {
        let mut sched = scheduler(Topology::Tdma, 25);
        sched.add_ue(Rnti(1), beam0()).unwrap();
        sched.configure_logical_channel(Rnti(1), 0, 1).unwrap();
        sched.dl_cqi_report(Rnti(1), 1, vec![15]).unwrap();

        let mut seen = Vec::new();
        for i in 0..3 {
            sched.dl_buffer_report(Rnti(1), 0, 1, 100_000).unwrap();
            let mut req = slot(12, 0);
            req.sfn_sf = SfnSf::new(0, 0, 0, 0).add_slots(i);
            let alloc = sched.schedule_slot(&req);
            seen.push(alloc.dl_dcis[0].harq_process);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
