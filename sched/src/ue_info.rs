//! Per-UE Scheduling State
//!
//! One [`UeInfo`] exists per RNTI per scheduler instance. It is created
//! when the UE's first logical channel is configured, mutated every slot
//! (reset at slot start, incremented additively during the allocation
//! loop) and destroyed when the UE is released.

use std::collections::BTreeMap;

use tracing::debug;

use common::{BeamConfId, Direction, Mcs, Rnti};

use crate::amc::Amc;
use crate::harq::HarqVector;

/// MCS value meaning "no valid CQI received yet for this stream"
pub const INVALID_MCS: Mcs = u8::MAX;

/// A frequency × time resource quantity: the unit of "how much was
/// given/requested/available" threaded through every allocation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FtResources {
    /// Resource block groups (RBG × symbol units)
    pub rbg: u32,
    /// OFDM symbols
    pub sym: u32,
}

impl FtResources {
    pub fn new(rbg: u32, sym: u32) -> Self {
        Self { rbg, sym }
    }
}

impl std::ops::AddAssign for FtResources {
    fn add_assign(&mut self, rhs: Self) {
        self.rbg += rhs.rbg;
        self.sym += rhs.sym;
    }
}

/// Byte queues of the logical channels belonging to one LCG.
#[derive(Debug, Clone, Default)]
pub struct LcGroup {
    channels: BTreeMap<u8, u32>,
}

impl LcGroup {
    /// Update the queue estimate of one logical channel.
    pub fn update_queue(&mut self, lcid: u8, bytes: u32) {
        self.channels.insert(lcid, bytes);
    }

    /// Total bytes queued across the group's channels.
    pub fn total_queue(&self) -> u32 {
        self.channels.values().sum()
    }

    /// Logical channel ids configured in this group.
    pub fn lcids(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.keys().copied()
    }

    pub fn contains(&self, lcid: u8) -> bool {
        self.channels.contains_key(&lcid)
    }
}

/// Downlink CQI report state: rank indicator plus one wideband CQI per
/// stream.
#[derive(Debug, Clone)]
pub struct DlCqiInfo {
    /// Rank indicator (1 or 2)
    pub ri: u8,
    /// Wideband CQI per stream
    pub wb_cqi: Vec<u8>,
}

impl Default for DlCqiInfo {
    fn default() -> Self {
        Self {
            ri: 1,
            wb_cqi: vec![0],
        }
    }
}

/// Proportional-fair throughput tracking for one direction.
///
/// Throughput is tracked in bytes per symbol; only the ratio between
/// potential and average matters for the comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct PfMetric {
    pub curr_tput: f64,
    pub avg_tput: f64,
    pub last_avg_tput: f64,
    pub potential_tput: f64,
}

/// Per-UE mutable scheduling record.
#[derive(Debug, Clone)]
pub struct UeInfo {
    pub rnti: Rnti,
    /// IMSI used only for trace output
    pub imsi: u64,
    /// TX/RX beam pairing, the OFDMA per-beam grouping key
    pub beam_conf_id: BeamConfId,

    /// DL MCS per stream (up to 2 for rank-2 MIMO)
    pub dl_mcs: Vec<Mcs>,
    pub ul_mcs: Mcs,
    /// DL transport block size per stream, bytes
    pub dl_tb_size: Vec<u32>,
    pub ul_tb_size: u32,

    /// RBG × symbol units assigned this slot
    pub dl_rbg: u32,
    pub ul_rbg: u32,
    /// Symbols assigned this slot
    pub dl_sym: u32,
    pub ul_sym: u32,

    /// DL RLC queues grouped by LCG
    pub dl_lcg: BTreeMap<u8, LcGroup>,
    /// UL buffer status per LCG, from BSRs
    pub ul_lcg: BTreeMap<u8, u32>,
    /// Pending scheduling request without a BSR yet
    pub sr_pending: bool,

    pub dl_cqi: DlCqiInfo,

    /// In-flight HARQ processes, per direction
    pub dl_harq: HarqVector,
    pub ul_harq: HarqVector,

    pub dl_pf: PfMetric,
    pub ul_pf: PfMetric,
}

impl UeInfo {
    pub fn new(rnti: Rnti, beam_conf_id: BeamConfId) -> Self {
        Self {
            rnti,
            imsi: rnti.value() as u64,
            beam_conf_id,
            dl_mcs: vec![INVALID_MCS],
            ul_mcs: INVALID_MCS,
            dl_tb_size: vec![0],
            ul_tb_size: 0,
            dl_rbg: 0,
            ul_rbg: 0,
            dl_sym: 0,
            ul_sym: 0,
            dl_lcg: BTreeMap::new(),
            ul_lcg: BTreeMap::new(),
            sr_pending: false,
            dl_cqi: DlCqiInfo::default(),
            dl_harq: HarqVector::default(),
            ul_harq: HarqVector::default(),
            dl_pf: PfMetric::default(),
            ul_pf: PfMetric::default(),
        }
    }

    /// Total DL bytes queued across every LCG.
    pub fn total_dl_buffer(&self) -> u32 {
        self.dl_lcg.values().map(|g| g.total_queue()).sum()
    }

    /// Total UL bytes reported across every LCG.
    pub fn total_ul_buffer(&self) -> u32 {
        self.ul_lcg.values().sum()
    }

    /// Cumulative DL TB size across streams.
    pub fn dl_tbs_total(&self) -> u32 {
        self.dl_tb_size.iter().sum()
    }

    pub fn rbg(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Dl => self.dl_rbg,
            Direction::Ul => self.ul_rbg,
        }
    }

    pub fn mcs(&self, dir: Direction) -> Mcs {
        match dir {
            Direction::Dl => self.dl_mcs[0],
            Direction::Ul => self.ul_mcs,
        }
    }

    pub fn tbs_total(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Dl => self.dl_tbs_total(),
            Direction::Ul => self.ul_tb_size,
        }
    }

    pub fn pf(&self, dir: Direction) -> &PfMetric {
        match dir {
            Direction::Dl => &self.dl_pf,
            Direction::Ul => &self.ul_pf,
        }
    }

    /// Record an allocation of `assigned` to this UE.
    pub fn add_assigned(&mut self, dir: Direction, assigned: FtResources) {
        match dir {
            Direction::Dl => {
                self.dl_rbg += assigned.rbg;
                self.dl_sym += assigned.sym;
            }
            Direction::Ul => {
                self.ul_rbg += assigned.rbg;
                self.ul_sym += assigned.sym;
            }
        }
    }

    /// Reset slot-dependent DL state. Called at slot start.
    ///
    /// The PF average of the previous slot is saved as the baseline for
    /// this slot's exponential moving average.
    pub fn reset_dl_sched_info(&mut self) {
        self.dl_rbg = 0;
        self.dl_sym = 0;
        for tbs in &mut self.dl_tb_size {
            *tbs = 0;
        }
        self.dl_pf.last_avg_tput = self.dl_pf.avg_tput;
        self.dl_pf.avg_tput = 0.0;
        self.dl_pf.curr_tput = 0.0;
        self.dl_pf.potential_tput = 0.0;
    }

    /// Reset slot-dependent UL state. Called at slot start.
    pub fn reset_ul_sched_info(&mut self) {
        self.ul_rbg = 0;
        self.ul_sym = 0;
        self.ul_tb_size = 0;
        self.ul_pf.last_avg_tput = self.ul_pf.avg_tput;
        self.ul_pf.avg_tput = 0.0;
        self.ul_pf.curr_tput = 0.0;
        self.ul_pf.potential_tput = 0.0;
    }

    /// Recompute the DL TB sizes from the assigned RBG count.
    ///
    /// A rank-1 UE that still carries two streams (it recently switched
    /// down from rank 2) transmits on the stream with the highest CQI;
    /// the other stream's TB size is zeroed.
    pub fn update_dl_metric(&mut self, amc: &dyn Amc, rb_per_rbg: u32) {
        if self.dl_rbg == 0 {
            for tbs in &mut self.dl_tb_size {
                *tbs = 0;
            }
            return;
        }

        let num_rb = self.dl_rbg * rb_per_rbg;
        match self.dl_cqi.ri {
            1 => {
                if self.dl_mcs.len() == 1 {
                    debug_assert_ne!(self.dl_mcs[0], INVALID_MCS);
                    self.dl_tb_size[0] = amc.calculate_tb_size(self.dl_mcs[0], num_rb);
                } else {
                    let best = self
                        .dl_cqi
                        .wb_cqi
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, cqi)| **cqi)
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    debug!(
                        "UE {} switched from 2 streams to 1, using stream {}",
                        self.rnti, best
                    );
                    for stream in 0..self.dl_tb_size.len() {
                        self.dl_tb_size[stream] = if stream == best {
                            debug_assert_ne!(self.dl_mcs[stream], INVALID_MCS);
                            amc.calculate_tb_size(self.dl_mcs[stream], num_rb)
                        } else {
                            0
                        };
                    }
                }
            }
            2 => {
                debug_assert!(self.dl_mcs.len() >= 2);
                for stream in 0..2 {
                    debug_assert_ne!(self.dl_mcs[stream], INVALID_MCS);
                    self.dl_tb_size[stream] = amc.calculate_tb_size(self.dl_mcs[stream], num_rb);
                }
            }
            ri => unreachable!("rank indicator {} not supported", ri),
        }
    }

    /// Recompute the UL TB size from the assigned RBG count.
    pub fn update_ul_metric(&mut self, amc: &dyn Amc, rb_per_rbg: u32) {
        if self.ul_rbg == 0 {
            self.ul_tb_size = 0;
        } else {
            self.ul_tb_size = amc.calculate_tb_size(self.ul_mcs, self.ul_rbg * rb_per_rbg);
        }
    }

    pub fn update_metric(&mut self, dir: Direction, amc: &dyn Amc, rb_per_rbg: u32) {
        match dir {
            Direction::Dl => self.update_dl_metric(amc, rb_per_rbg),
            Direction::Ul => self.update_ul_metric(amc, rb_per_rbg),
        }
    }

    /// Discard an assignation that did not result in a usable TB; the
    /// RBGs stay empty in the slot. Restores the PF average to the slot
    /// baseline.
    pub fn reset_metric(&mut self, dir: Direction) {
        match dir {
            Direction::Dl => {
                for tbs in &mut self.dl_tb_size {
                    *tbs = 0;
                }
                self.dl_pf.avg_tput = self.dl_pf.last_avg_tput;
            }
            Direction::Ul => {
                self.ul_tb_size = 0;
                self.ul_pf.avg_tput = self.ul_pf.last_avg_tput;
            }
        }
    }

    /// Zero the TB of every stream not needed to cover `buf` bytes.
    ///
    /// If the cumulative TB size of the first streams already covers the
    /// pending buffer, the surplus streams must not announce a TB the
    /// transmitter will never send.
    pub fn trim_surplus_dl_streams(&mut self, buf: u32) {
        let mut covered = 0u32;
        let mut satisfied = false;
        for tbs in &mut self.dl_tb_size {
            if satisfied {
                *tbs = 0;
                continue;
            }
            covered = covered.saturating_add(*tbs);
            if covered >= buf.max(crate::scheduler::MIN_TB_SIZE_BYTES) {
                satisfied = true;
            }
        }
    }

    /// Update the PF throughput tracking after an allocation iteration.
    ///
    /// Every candidate refreshes its average each iteration, scheduled or
    /// not: the averaging is time-windowed, so an idle UE's average must
    /// keep decaying toward zero.
    pub fn update_pf_metric(
        &mut self,
        dir: Direction,
        tot_assigned: FtResources,
        time_window: f64,
        amc: &dyn Amc,
        rb_per_rbg: u32,
    ) {
        self.update_metric(dir, amc, rb_per_rbg);
        let curr = if tot_assigned.sym > 0 {
            self.tbs_total(dir) as f64 / tot_assigned.sym as f64
        } else {
            0.0
        };
        let pf = match dir {
            Direction::Dl => &mut self.dl_pf,
            Direction::Ul => &mut self.ul_pf,
        };
        pf.curr_tput = curr;
        pf.avg_tput =
            (1.0 - 1.0 / time_window) * pf.last_avg_tput + (1.0 / time_window) * pf.curr_tput;
    }

    /// Compute the throughput this UE could reach with the resources
    /// assignable in one allocation iteration.
    pub fn calculate_potential_tput(
        &mut self,
        dir: Direction,
        assignable: FtResources,
        amc: &dyn Amc,
        rb_per_rbg: u32,
    ) {
        let num_rb = assignable.rbg * rb_per_rbg;
        let tbs: u32 = match dir {
            Direction::Dl => self
                .dl_mcs
                .iter()
                .filter(|mcs| **mcs != INVALID_MCS)
                .map(|mcs| amc.calculate_tb_size(*mcs, num_rb))
                .sum(),
            Direction::Ul => amc.calculate_tb_size(self.ul_mcs, num_rb),
        };
        let potential = if assignable.sym > 0 {
            tbs as f64 / assignable.sym as f64
        } else {
            0.0
        };
        match dir {
            Direction::Dl => self.dl_pf.potential_tput = potential,
            Direction::Ul => self.ul_pf.potential_tput = potential,
        }
    }
}
