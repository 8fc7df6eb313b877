//! Scheduling Policies
//!
//! The comparison policies (round robin, proportional fair, maximum rate)
//! that parameterize the TDMA and OFDMA allocation loops. Each policy is
//! a small strategy object: a pre-computation hook run once per UE before
//! the loop, a comparison deciding who is served next, and per-iteration
//! hooks for the winner and for everyone else.

use std::cmp::Ordering;

use common::Direction;

use crate::amc::Amc;
use crate::ue_info::{FtResources, UeInfo};

/// Shared context handed to every policy hook.
pub struct PolicyCtx<'a> {
    pub amc: &'a dyn Amc,
    pub rb_per_rbg: u32,
}

/// Strategy interface of a comparison policy.
///
/// `compare` returns the ordering of two candidates: the one ordered
/// first is served next. The `assigned` hook runs for the iteration's
/// winner, `not_assigned` for every other candidate in the pool; both
/// receive the winner-so-far totals so time-windowed metrics can keep
/// decaying for idle UEs.
pub trait SchedPolicy: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pre-computation before the allocation loop, once per UE.
    fn before_sched(&self, dir: Direction, ue: &mut UeInfo, assignable: FtResources, ctx: &PolicyCtx);

    fn compare(&self, dir: Direction, a: &UeInfo, b: &UeInfo) -> Ordering;

    /// The UE won `assigned` this iteration; its totals are `tot_assigned`.
    fn assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        assigned: FtResources,
        tot_assigned: FtResources,
        ctx: &PolicyCtx,
    );

    /// The UE received nothing this iteration.
    fn not_assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        not_assigned: FtResources,
        tot_assigned: FtResources,
        ctx: &PolicyCtx,
    );
}

/// Round robin: the UE with the fewest RBGs assigned so far goes first.
///
/// The ordering is re-evaluated fresh every slot; a UE starved in one
/// slot carries no explicit priority into the next.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl SchedPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "RR"
    }

    fn before_sched(&self, _: Direction, _: &mut UeInfo, _: FtResources, _: &PolicyCtx) {}

    fn compare(&self, dir: Direction, a: &UeInfo, b: &UeInfo) -> Ordering {
        a.rbg(dir).cmp(&b.rbg(dir))
    }

    fn assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        _assigned: FtResources,
        _tot: FtResources,
        ctx: &PolicyCtx,
    ) {
        ue.update_metric(dir, ctx.amc, ctx.rb_per_rbg);
    }

    fn not_assigned(
        &self,
        _: Direction,
        _: &mut UeInfo,
        _: FtResources,
        _: FtResources,
        _: &PolicyCtx,
    ) {
    }
}

/// Proportional fair: highest `potentialTput^alpha / max(1e-9, avgTput)`
/// goes first.
///
/// `alpha` in [0, 1] is the fairness exponent: 1 is classic PF, 0
/// degenerates toward a throughput-blind round robin. `time_window` is
/// the EMA time constant of the average-throughput tracking, in slots.
#[derive(Debug)]
pub struct ProportionalFair {
    pub alpha: f64,
    pub time_window: f64,
}

impl Default for ProportionalFair {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            time_window: 99.0,
        }
    }
}

impl ProportionalFair {
    fn metric(&self, dir: Direction, ue: &UeInfo) -> f64 {
        let pf = ue.pf(dir);
        pf.potential_tput.powf(self.alpha) / pf.avg_tput.max(1e-9)
    }
}

impl SchedPolicy for ProportionalFair {
    fn name(&self) -> &'static str {
        "PF"
    }

    fn before_sched(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        assignable: FtResources,
        ctx: &PolicyCtx,
    ) {
        ue.calculate_potential_tput(dir, assignable, ctx.amc, ctx.rb_per_rbg);
    }

    fn compare(&self, dir: Direction, a: &UeInfo, b: &UeInfo) -> Ordering {
        self.metric(dir, b)
            .partial_cmp(&self.metric(dir, a))
            .unwrap_or(Ordering::Equal)
    }

    fn assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        _assigned: FtResources,
        tot: FtResources,
        ctx: &PolicyCtx,
    ) {
        ue.update_pf_metric(dir, tot, self.time_window, ctx.amc, ctx.rb_per_rbg);
    }

    fn not_assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        _not_assigned: FtResources,
        tot: FtResources,
        ctx: &PolicyCtx,
    ) {
        ue.update_pf_metric(dir, tot, self.time_window, ctx.amc, ctx.rb_per_rbg);
    }
}

/// Maximum rate: highest current MCS goes first, ties broken by the
/// round-robin rule.
#[derive(Debug, Default)]
pub struct MaxRate;

impl SchedPolicy for MaxRate {
    fn name(&self) -> &'static str {
        "MR"
    }

    fn before_sched(&self, _: Direction, _: &mut UeInfo, _: FtResources, _: &PolicyCtx) {}

    fn compare(&self, dir: Direction, a: &UeInfo, b: &UeInfo) -> Ordering {
        b.mcs(dir)
            .cmp(&a.mcs(dir))
            .then_with(|| a.rbg(dir).cmp(&b.rbg(dir)))
    }

    fn assigned(
        &self,
        dir: Direction,
        ue: &mut UeInfo,
        _assigned: FtResources,
        _tot: FtResources,
        ctx: &PolicyCtx,
    ) {
        ue.update_metric(dir, ctx.amc, ctx.rb_per_rbg);
    }

    fn not_assigned(
        &self,
        _: Direction,
        _: &mut UeInfo,
        _: FtResources,
        _: FtResources,
        _: &PolicyCtx,
    ) {
    }
}
