//! TDMA Allocation
//!
//! Time-division allocation: every granted symbol spans the whole
//! assignable bandwidth, and the greedy loop hands out one symbol at a
//! time to the candidate the policy orders first.

use tracing::{debug, info};

use common::Direction;

use crate::dci::{DciFormat, DciInfoElementTdma};
use crate::policy::PolicyCtx;
use crate::scheduler::{ActiveUeMap, AllocCtx, BeamSymbolMap, PointInFtPlane, MIN_TB_SIZE_BYTES};
use crate::ue_info::{FtResources, UeInfo};

/// Index of the first candidate whose granted TB does not yet cover its
/// buffer, after advancing past the satisfied ones.
///
/// A candidate is satisfied once its cumulative TB size covers
/// `max(buffer, 7)` bytes. For DL multi-stream UEs the check is
/// cumulative across streams, and any stream not needed to cover the
/// buffer gets its TB size forced to zero so the receiver never waits
/// for a TB the transmitter will not send.
pub(crate) fn first_unsatisfied(
    dir: Direction,
    candidates: &[(usize, u32)],
    ues: &mut [&mut UeInfo],
) -> Option<usize> {
    for (pos, &(idx, buf)) in candidates.iter().enumerate() {
        let ue = &mut *ues[idx];
        if ue.tbs_total(dir) >= buf.max(MIN_TB_SIZE_BYTES) {
            if dir == Direction::Dl && ue.dl_tb_size.len() > 1 {
                ue.trim_surplus_dl_streams(buf);
            }
            info!(
                "UE {} TBS {} covers queue {}, passing",
                ue.rnti,
                ue.tbs_total(dir),
                buf
            );
        } else {
            return Some(pos);
        }
    }
    None
}

/// Distribute `sym_avail` whole-bandwidth symbols among the active UEs.
///
/// Returns the number of symbols granted per beam. Conservation holds:
/// the symbols granted sum to `sym_avail` unless every UE was satisfied
/// early.
pub(crate) fn assign_rbg_tdma(
    dir: Direction,
    sym_avail: u32,
    active: &ActiveUeMap,
    ues: &mut [&mut UeInfo],
    ctx: &AllocCtx,
) -> BeamSymbolMap {
    debug!(
        "Assigning RBG in {}, # beams active flows: {}, # sym: {}",
        dir,
        active.len(),
        sym_avail
    );

    let mut candidates: Vec<(usize, u32)> = active.values().flatten().copied().collect();

    let assignable_rbgs = ctx.assignable_rbgs();
    assert!(assignable_rbgs > 0, "no assignable RBGs after notching");

    let pctx = PolicyCtx {
        amc: ctx.amc,
        rb_per_rbg: ctx.rb_per_rbg,
    };

    for &(idx, _) in &candidates {
        ctx.policy.before_sched(
            dir,
            &mut *ues[idx],
            FtResources::new(assignable_rbgs, 1),
            &pctx,
        );
    }

    let mut resources = sym_avail;
    let mut assigned = FtResources::default();

    while resources > 0 {
        candidates.sort_by(|a, b| ctx.policy.compare(dir, &*ues[a.0], &*ues[b.0]));

        let winner_pos = match first_unsatisfied(dir, &candidates, ues) {
            Some(pos) => pos,
            None => {
                info!("All the UEs already have their resources allocated");
                break;
            }
        };
        let winner_idx = candidates[winner_pos].0;

        // One entire symbol, i.e. the full assignable bandwidth
        ues[winner_idx].add_assigned(dir, FtResources::new(assignable_rbgs, 1));
        assigned += FtResources::new(assignable_rbgs, 1);
        resources -= 1;

        debug!(
            "Assigned {} {} RBG (= 1 SYM) to UE {}, total assigned up to now: {}",
            assignable_rbgs, dir, ues[winner_idx].rnti, assigned.rbg
        );
        ctx.policy.assigned(
            dir,
            &mut *ues[winner_idx],
            FtResources::new(assignable_rbgs, 1),
            assigned,
            &pctx,
        );

        for &(idx, _) in &candidates {
            if idx != winner_idx {
                ctx.policy.not_assigned(
                    dir,
                    &mut *ues[idx],
                    FtResources::new(assignable_rbgs, 1),
                    assigned,
                    &pctx,
                );
            }
        }
    }

    let mut ret = BeamSymbolMap::new();
    for (beam, beam_ues) in active {
        let sym_of_beam = beam_ues
            .iter()
            .map(|&(idx, _)| ues[idx].rbg(dir) / assignable_rbgs)
            .sum();
        ret.insert(*beam, sym_of_beam);
    }
    ret
}

/// Turn a finalized DL tally into a grant spanning whole symbols.
///
/// Returns `None` when every stream's TB is below the minimum useful
/// size; the caller discards the assignation instead of emitting an
/// empty grant.
pub(crate) fn create_dl_dci(
    spoint: &mut PointInFtPlane,
    ue: &mut UeInfo,
    ctx: &AllocCtx,
) -> Option<DciInfoElementTdma> {
    let mut ndi = vec![0u8; ue.dl_tb_size.len()];
    let rv = vec![0u8; ue.dl_tb_size.len()];
    let mut count_below_min = 0;
    for stream in 0..ue.dl_tb_size.len() {
        if ue.dl_tb_size[stream] < MIN_TB_SIZE_BYTES {
            count_below_min += 1;
            debug!(
                "UE {} stream {} assigned {} DL RBG but TBS < {}, resetting to zero",
                ue.rnti, stream, ue.dl_rbg, MIN_TB_SIZE_BYTES
            );
            ue.dl_tb_size[stream] = 0;
        } else {
            ndi[stream] = 1;
        }
    }

    if count_below_min == ue.dl_tb_size.len() {
        debug!(
            "UE {} assigned {} DL RBG but no usable TB, no DCI",
            ue.rnti, ue.dl_rbg
        );
        return None;
    }

    let assignable_rbgs = ctx.assignable_rbgs();
    let num_sym = ((ue.dl_rbg / assignable_rbgs) as u8).max(1);

    let harq = match ue.dl_harq.first_idle() {
        Some(id) => id,
        None => {
            debug!("UE {} has no idle DL HARQ process, no DCI", ue.rnti);
            return None;
        }
    };
    ue.dl_harq
        .start(harq, ue.dl_mcs.clone(), ue.dl_tb_size.clone(), num_sym);

    let dci = DciInfoElementTdma::new(
        ue.rnti,
        DciFormat::Dl,
        spoint.sym,
        num_sym,
        ue.dl_mcs.clone(),
        ue.dl_tb_size.clone(),
        ndi,
        rv,
        ctx.bwp_index,
        harq,
        ctx.full_mask(),
    );

    // The starting point must advance
    spoint.rbg = 0;
    spoint.sym += num_sym;

    Some(dci)
}

/// Turn a finalized UL tally into a grant packed backward from the
/// current starting point.
pub(crate) fn create_ul_dci(
    spoint: &mut PointInFtPlane,
    ue: &mut UeInfo,
    max_sym: u32,
    ctx: &AllocCtx,
) -> Option<DciInfoElementTdma> {
    let tbs = ctx
        .amc
        .calculate_tb_size(ue.ul_mcs, ue.ul_rbg * ctx.rb_per_rbg);

    if tbs < MIN_TB_SIZE_BYTES {
        debug!(
            "UE {} assigned {} UL RBG but TBS {} < {}, no DCI",
            ue.rnti, ue.ul_rbg, tbs, MIN_TB_SIZE_BYTES
        );
        return None;
    }

    let assignable_rbgs = ctx.assignable_rbgs();
    let num_sym = ((ue.ul_rbg / assignable_rbgs).max(1).min(max_sym)) as u8;

    let harq = match ue.ul_harq.first_idle() {
        Some(id) => id,
        None => {
            debug!("UE {} has no idle UL HARQ process, no DCI", ue.rnti);
            return None;
        }
    };

    debug_assert!(spoint.sym >= num_sym);
    // The starting point must go backward to accommodate the needed sym
    spoint.sym -= num_sym;

    ue.ul_harq.start(harq, vec![ue.ul_mcs], vec![tbs], num_sym);

    let dci = DciInfoElementTdma::new(
        ue.rnti,
        DciFormat::Ul,
        spoint.sym,
        num_sym,
        vec![ue.ul_mcs],
        vec![tbs],
        vec![1],
        vec![0],
        ctx.bwp_index,
        harq,
        ctx.full_mask(),
    );

    spoint.rbg = 0;

    Some(dci)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ProportionalFair, RoundRobin, SchedPolicy};
    use crate::scheduler::tests::{active_map, linear_amc, ue_with_buffer};

    fn ctx<'a>(policy: &'a dyn SchedPolicy, amc: &'a dyn crate::amc::Amc) -> AllocCtx<'a> {
        AllocCtx {
            policy,
            amc,
            rb_per_rbg: 1,
            bandwidth_in_rbg: 25,
            notched_mask: &[],
            bwp_index: 0,
        }
    }

    #[test]
    fn test_symbols_conserved_with_unsatisfied_ues() {
        let rr = RoundRobin;
        let amc = linear_amc();
        let mut ues = vec![
            ue_with_buffer(1, 1_000_000),
            ue_with_buffer(2, 1_000_000),
            ue_with_buffer(3, 1_000_000),
        ];
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let active = active_map(&refs);

        let out = assign_rbg_tdma(Direction::Dl, 12, &active, &mut refs, &ctx(&rr, &amc));

        let total_sym: u32 = refs.iter().map(|u| u.dl_sym).sum();
        assert_eq!(total_sym, 12);
        assert_eq!(out.values().sum::<u32>(), 12);
        for ue in &refs {
            assert_eq!(ue.dl_rbg, ue.dl_sym * 25);
        }
    }

    #[test]
    fn test_rr_fairness_spread_at_most_one() {
        let rr = RoundRobin;
        let amc = linear_amc();
        let mut ues: Vec<UeInfo> = (1..=5).map(|r| ue_with_buffer(r, 1_000_000)).collect();
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let active = active_map(&refs);

        // one symbol at a time so every intermediate state is observable
        for _ in 0..13 {
            assign_rbg_tdma(Direction::Dl, 1, &active, &mut refs, &ctx(&rr, &amc));
            let max = refs.iter().map(|u| u.dl_sym).max().unwrap();
            let min = refs.iter().map(|u| u.dl_sym).min().unwrap();
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn test_early_exit_when_all_satisfied() {
        let rr = RoundRobin;
        let amc = linear_amc();
        // tiny buffer: one symbol more than covers it
        let mut ues = vec![ue_with_buffer(1, 50)];
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let active = active_map(&refs);

        assign_rbg_tdma(Direction::Dl, 12, &active, &mut refs, &ctx(&rr, &amc));
        assert!(refs[0].dl_sym < 12);
    }

    #[test]
    fn test_pf_allocation_tracks_average() {
        let pf = ProportionalFair::default();
        let amc = linear_amc();
        let mut ues = vec![ue_with_buffer(1, 1_000_000), ue_with_buffer(2, 1_000_000)];
        ues[0].dl_mcs = vec![20];
        ues[1].dl_mcs = vec![5];
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let active = active_map(&refs);

        assign_rbg_tdma(Direction::Dl, 10, &active, &mut refs, &ctx(&pf, &amc));

        // both UEs must have been served: the served UE's average grows
        // until the starved one's metric overtakes it
        assert!(refs[0].dl_sym > 0);
        assert!(refs[1].dl_sym > 0);
        assert!(refs[0].dl_pf.avg_tput > 0.0);
        assert!(refs[1].dl_pf.avg_tput > 0.0);
    }

    #[test]
    fn test_create_dl_dci_advances_cursor() {
        let amc = linear_amc();
        let rr = RoundRobin;
        let c = ctx(&rr, &amc);
        let mut ue = ue_with_buffer(1, 1_000_000);
        ue.dl_rbg = 25 * 3;
        ue.dl_sym = 3;
        ue.update_dl_metric(&amc, 1);

        let mut spoint = PointInFtPlane { rbg: 0, sym: 1 };
        let dci = create_dl_dci(&mut spoint, &mut ue, &c).unwrap();
        assert_eq!(dci.sym_start, 1);
        assert_eq!(dci.num_sym, 3);
        assert_eq!(dci.rbg_bitmask.len(), 25);
        assert_eq!(dci.allocated_rbgs(), 25);
        assert_eq!(spoint.sym, 4);
        assert_eq!(spoint.rbg, 0);
    }

    #[test]
    fn test_create_dl_dci_suppressed_below_min_tb() {
        let amc = linear_amc();
        let rr = RoundRobin;
        let c = ctx(&rr, &amc);
        let mut ue = ue_with_buffer(1, 1_000_000);
        ue.dl_rbg = 25;
        ue.dl_sym = 1;
        ue.dl_tb_size = vec![3];

        let mut spoint = PointInFtPlane { rbg: 0, sym: 1 };
        assert!(create_dl_dci(&mut spoint, &mut ue, &c).is_none());
        assert_eq!(ue.dl_tb_size, vec![0]);
        assert_eq!(spoint.sym, 1);
    }

    #[test]
    fn test_create_ul_dci_packs_backward() {
        let amc = linear_amc();
        let rr = RoundRobin;
        let c = ctx(&rr, &amc);
        let mut ue = ue_with_buffer(1, 1_000_000);
        ue.ul_mcs = 10;
        ue.ul_rbg = 25 * 2;
        ue.ul_sym = 2;

        let mut spoint = PointInFtPlane { rbg: 0, sym: 13 };
        let dci = create_ul_dci(&mut spoint, &mut ue, 2, &c).unwrap();
        assert_eq!(dci.num_sym, 2);
        assert_eq!(dci.sym_start, 11);
        assert_eq!(spoint.sym, 11);
    }

    #[test]
    fn test_mimo_surplus_stream_zeroed_in_skip() {
        let mut ues = vec![ue_with_buffer(1, 400)];
        ues[0].dl_mcs = vec![10, 10];
        ues[0].dl_tb_size = vec![500, 300];
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let candidates = vec![(0usize, 400u32)];

        // stream 0 alone covers the 400-byte queue
        let pos = first_unsatisfied(Direction::Dl, &candidates, &mut refs);
        assert_eq!(pos, None);
        assert_eq!(refs[0].dl_tb_size, vec![500, 0]);
    }
}
