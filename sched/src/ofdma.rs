//! OFDMA Allocation
//!
//! Frequency-division allocation: the available symbols are first
//! partitioned across beams proportionally to each beam's aggregate
//! buffered bytes, then within each beam the greedy loop hands out one
//! RBG (spanning the beam's symbols) at a time.

use tracing::{debug, info};

use common::Direction;

use crate::dci::{DciFormat, DciInfoElementTdma};
use crate::policy::PolicyCtx;
use crate::scheduler::{
    ActiveUeMap, AllocCtx, BeamSymbolMap, PointInFtPlane, MIN_TB_SIZE_BYTES,
};
use crate::tdma::first_unsatisfied;
use crate::ue_info::{FtResources, UeInfo};

/// Partition `sym_avail` symbols across beams proportionally to their
/// aggregate buffered bytes.
///
/// Leftover symbols from the flooring are redistributed one at a time to
/// the beam with the fewest symbols so far (ties go to the lowest beam
/// id), so the result always sums to `sym_avail` exactly.
pub(crate) fn get_sym_per_beam(sym_avail: u32, active: &ActiveUeMap) -> BeamSymbolMap {
    let buf_total: f64 = active
        .values()
        .flatten()
        .map(|&(_, buf)| buf as f64)
        .sum();

    let mut ret = BeamSymbolMap::new();
    let mut sym_used = 0u32;
    for (beam, beam_ues) in active {
        let buf_beam: f64 = beam_ues.iter().map(|&(_, buf)| buf as f64).sum();
        let sym_for_beam = if buf_total > 0.0 {
            (buf_beam * sym_avail as f64 / buf_total) as u32
        } else {
            0
        };
        sym_used += sym_for_beam;
        debug!("Assigned to beam {} symbols {}", beam, sym_for_beam);
        ret.insert(*beam, sym_for_beam);
    }

    debug_assert!(sym_used <= sym_avail);
    let mut to_redistribute = sym_avail - sym_used;
    while to_redistribute > 0 {
        // BTreeMap iteration is in beam id order and min_by_key keeps the
        // first minimum, so ties go to the lowest beam id
        match ret.iter_mut().min_by_key(|(_, sym)| **sym) {
            Some((beam, sym)) => {
                *sym += 1;
                debug!(
                    "Assigned to beam {} an additional symbol, for a total of {}",
                    beam, sym
                );
            }
            None => break,
        }
        to_redistribute -= 1;
    }

    ret
}

/// Distribute RBGs beam by beam over each beam's symbol allotment.
pub(crate) fn assign_rbg_ofdma(
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

    let sym_per_beam = get_sym_per_beam(sym_avail, active);

    let pctx = PolicyCtx {
        amc: ctx.amc,
        rb_per_rbg: ctx.rb_per_rbg,
    };

    for (beam, beam_ues) in active {
        let beam_sym = sym_per_beam[beam];
        if beam_sym == 0 {
            debug!("Beam {} received no symbols this slot", beam);
            continue;
        }

        // One grant = 1 RBG spanning the beam's symbols
        let rbg_assignable = beam_sym;
        let mut candidates: Vec<(usize, u32)> = beam_ues.clone();

        let mut resources = ctx.assignable_rbgs();
        assert!(resources > 0, "no assignable RBGs after notching");

        for &(idx, _) in &candidates {
            ctx.policy.before_sched(
                dir,
                &mut *ues[idx],
                FtResources::new(rbg_assignable, beam_sym),
                &pctx,
            );
        }

        let mut assigned = FtResources::default();
        while resources > 0 {
            candidates.sort_by(|a, b| ctx.policy.compare(dir, &*ues[a.0], &*ues[b.0]));

            let winner_pos = match first_unsatisfied(dir, &candidates, ues) {
                Some(pos) => pos,
                None => {
                    info!("Beam {} fully satisfied, passing to the next", beam);
                    break;
                }
            };
            let winner_idx = candidates[winner_pos].0;

            let winner = &mut *ues[winner_idx];
            match dir {
                Direction::Dl => {
                    winner.dl_rbg += rbg_assignable;
                    winner.dl_sym = beam_sym;
                }
                Direction::Ul => {
                    winner.ul_rbg += rbg_assignable;
                    winner.ul_sym = beam_sym;
                }
            }
            assigned.rbg += rbg_assignable;
            assigned.sym = beam_sym;

            // Resources are RBGs; they do not consider the beam symbols
            resources -= 1;

            debug!(
                "Assigned {} {} RBG, spanned over {} SYM, to UE {}",
                rbg_assignable, dir, beam_sym, ues[winner_idx].rnti
            );
            ctx.policy.assigned(
                dir,
                &mut *ues[winner_idx],
                FtResources::new(rbg_assignable, beam_sym),
                assigned,
                &pctx,
            );

            for &(idx, _) in &candidates {
                if idx != winner_idx {
                    ctx.policy.not_assigned(
                        dir,
                        &mut *ues[idx],
                        FtResources::new(rbg_assignable, beam_sym),
                        assigned,
                        &pctx,
                    );
                }
            }
        }
    }

    sym_per_beam
}

/// Walk the allowed-RBG mask from the current frequency cursor, marking
/// `rbg_num` positions, and clear everything else.
///
/// Returns the updated mask and the last marked position.
fn carve_bitmask(mask: &mut [bool], start_rbg: u32, mut rbg_num: u32) -> u32 {
    let mut last_rbg = start_rbg;
    for (i, bit) in mask.iter_mut().enumerate() {
        if i as u32 >= start_rbg && rbg_num > 0 && *bit {
            rbg_num -= 1;
            last_rbg = i as u32;
        } else {
            *bit = false;
        }
    }
    debug_assert_eq!(rbg_num, 0, "allocation and DCI construction misaligned");
    last_rbg
}

/// Turn a finalized DL tally into a grant of contiguous-in-mask RBGs
/// spanning the beam's symbols, advancing the frequency cursor.
pub(crate) fn create_dl_dci(
    spoint: &mut PointInFtPlane,
    ue: &mut UeInfo,
    max_sym: u32,
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

    debug_assert_eq!(ue.dl_rbg % max_sym, 0);
    debug_assert!(ue.dl_rbg <= max_sym * ctx.bandwidth_in_rbg);
    debug_assert!(spoint.rbg < ctx.bandwidth_in_rbg);

    if count_below_min == ue.dl_tb_size.len() {
        debug!(
            "UE {} assigned {} DL RBG but no usable TB, no DCI",
            ue.rnti, ue.dl_rbg
        );
        return None;
    }

    let harq = match ue.dl_harq.first_idle() {
        Some(id) => id,
        None => {
            debug!("UE {} has no idle DL HARQ process, no DCI", ue.rnti);
            return None;
        }
    };

    let rbg_num = ue.dl_rbg / max_sym;
    let mut mask = ctx.full_mask();
    let last_rbg = carve_bitmask(&mut mask, spoint.rbg, rbg_num);

    ue.dl_harq
        .start(harq, ue.dl_mcs.clone(), ue.dl_tb_size.clone(), max_sym as u8);

    let dci = DciInfoElementTdma::new(
        ue.rnti,
        DciFormat::Dl,
        spoint.sym,
        max_sym as u8,
        ue.dl_mcs.clone(),
        ue.dl_tb_size.clone(),
        ndi,
        rv,
        ctx.bwp_index,
        harq,
        mask,
    );

    spoint.rbg = last_rbg + 1;

    Some(dci)
}

/// UL counterpart of [`create_dl_dci`]; the grant occupies the `max_sym`
/// symbols ending at the current starting point.
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

    let harq = match ue.ul_harq.first_idle() {
        Some(id) => id,
        None => {
            debug!("UE {} has no idle UL HARQ process, no DCI", ue.rnti);
            return None;
        }
    };

    let rbg_num = ue.ul_rbg / max_sym;
    let mut mask = ctx.full_mask();
    let last_rbg = carve_bitmask(&mut mask, spoint.rbg, rbg_num);

    debug_assert!(spoint.sym as u32 >= max_sym);

    ue.ul_harq.start(harq, vec![ue.ul_mcs], vec![tbs], max_sym as u8);

    let dci = DciInfoElementTdma::new(
        ue.rnti,
        DciFormat::Ul,
        spoint.sym - max_sym as u8,
        max_sym as u8,
        vec![ue.ul_mcs],
        vec![tbs],
        vec![1],
        vec![0],
        ctx.bwp_index,
        harq,
        mask,
    );

    spoint.rbg = last_rbg + 1;

    Some(dci)
}

/// Move the allocation cursor to the next beam's symbols (DL grows
/// forward in time).
pub(crate) fn change_dl_beam(spoint: &mut PointInFtPlane, sym_of_beam: u32) {
    spoint.rbg = 0;
    spoint.sym += sym_of_beam as u8;
}

/// Move the allocation cursor to the next beam's symbols (UL grows
/// backward from the slot end).
pub(crate) fn change_ul_beam(spoint: &mut PointInFtPlane, sym_of_beam: u32) {
    spoint.rbg = 0;
    spoint.sym -= sym_of_beam as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BeamConfId, BeamId};

    use crate::policy::RoundRobin;
    use crate::scheduler::tests::{active_map, linear_amc, ue_with_buffer};

    fn beam(sector: u16) -> BeamConfId {
        BeamConfId::new(BeamId::new(sector, 0), None)
    }

    fn two_beam_map(bufs: &[(u16, u32)]) -> ActiveUeMap {
        let mut map = ActiveUeMap::new();
        for (idx, &(sector, buf)) in bufs.iter().enumerate() {
            map.entry(beam(sector)).or_default().push((idx, buf));
        }
        map
    }

    #[test]
    fn test_sym_per_beam_sums_exactly() {
        let cases: &[&[(u16, u32)]] = &[
            &[(0, 100), (1, 100), (2, 100)],
            &[(0, 1), (1, 1_000_000)],
            &[(0, 500_000), (1, 0)],
            &[(0, 7)],
            &[(0, 333), (1, 334), (2, 333), (3, 1)],
        ];
        for bufs in cases {
            let map = two_beam_map(bufs);
            for sym_avail in [1u32, 5, 12, 14] {
                let out = get_sym_per_beam(sym_avail, &map);
                assert_eq!(
                    out.values().sum::<u32>(),
                    sym_avail,
                    "lost or duplicated symbols for {:?}",
                    bufs
                );
            }
        }
    }

    #[test]
    fn test_sym_per_beam_sums_exactly_random_buffers() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let beams = rng.gen_range(1..=6u16);
            let bufs: Vec<(u16, u32)> = (0..beams)
                .map(|sector| (sector, rng.gen_range(0..=1_000_000u32)))
                .collect();
            let map = two_beam_map(&bufs);
            let sym_avail = rng.gen_range(1..=14u32);
            let out = get_sym_per_beam(sym_avail, &map);
            assert_eq!(out.values().sum::<u32>(), sym_avail, "for {:?}", bufs);
        }
    }

    #[test]
    fn test_sym_per_beam_one_beam_gets_all() {
        let map = two_beam_map(&[(0, 12345)]);
        let out = get_sym_per_beam(9, &map);
        assert_eq!(out[&beam(0)], 9);
    }

    #[test]
    fn test_sym_per_beam_leftover_to_lowest_beam() {
        // equal buffers, 7 symbols over 2 beams: 3 each, leftover to beam 0
        let map = two_beam_map(&[(0, 100), (1, 100)]);
        let out = get_sym_per_beam(7, &map);
        assert_eq!(out[&beam(0)], 4);
        assert_eq!(out[&beam(1)], 3);
    }

    #[test]
    fn test_assign_ofdma_splits_frequency() {
        let rr = RoundRobin;
        let amc = linear_amc();
        let ctx = AllocCtx {
            policy: &rr,
            amc: &amc,
            rb_per_rbg: 1,
            bandwidth_in_rbg: 10,
            notched_mask: &[],
            bwp_index: 0,
        };

        let mut ues = vec![ue_with_buffer(1, 1_000_000), ue_with_buffer(2, 1_000_000)];
        let mut refs: Vec<&mut UeInfo> = ues.iter_mut().collect();
        let active = active_map(&refs);

        let sym_per_beam = assign_rbg_ofdma(Direction::Dl, 8, &active, &mut refs, &ctx);
        assert_eq!(sym_per_beam.values().sum::<u32>(), 8);

        // single beam: all 10 RBGs distributed, 5 each under RR
        let total_rbg: u32 = refs.iter().map(|u| u.dl_rbg).sum();
        assert_eq!(total_rbg, 10 * 8);
        assert_eq!(refs[0].dl_rbg, refs[1].dl_rbg);
        assert_eq!(refs[0].dl_sym, 8);
    }

    #[test]
    fn test_dci_cursor_walk_skips_notches() {
        let rr = RoundRobin;
        let amc = linear_amc();
        let notched: Vec<bool> = (0..10).map(|i| !(3..=4).contains(&i)).collect();
        let ctx = AllocCtx {
            policy: &rr,
            amc: &amc,
            rb_per_rbg: 1,
            bandwidth_in_rbg: 10,
            notched_mask: &notched,
            bwp_index: 0,
        };

        let mut ue = ue_with_buffer(1, 1_000_000);
        ue.dl_rbg = 4 * 2; // 4 RBGs over 2 symbols
        ue.dl_sym = 2;
        ue.update_dl_metric(&amc, 1);

        let mut spoint = PointInFtPlane { rbg: 2, sym: 1 };
        let dci = create_dl_dci(&mut spoint, &mut ue, 2, &ctx).unwrap();

        // from cursor 2, four allowed positions: 2, 5, 6, 7 (3-4 notched)
        let expected: Vec<bool> = (0..10).map(|i| [2, 5, 6, 7].contains(&i)).collect();
        assert_eq!(dci.rbg_bitmask, expected);
        assert_eq!(dci.num_sym, 2);
        assert_eq!(spoint.rbg, 8);
    }

    #[test]
    fn test_ul_dci_ends_at_start_point() {
        let rr = RoundRobin;
        let amc = linear_amc();
        let ctx = AllocCtx {
            policy: &rr,
            amc: &amc,
            rb_per_rbg: 1,
            bandwidth_in_rbg: 10,
            notched_mask: &[],
            bwp_index: 0,
        };

        let mut ue = ue_with_buffer(1, 1_000_000);
        ue.ul_mcs = 10;
        ue.ul_rbg = 5 * 3;
        ue.ul_sym = 3;

        let mut spoint = PointInFtPlane { rbg: 0, sym: 13 };
        let dci = create_ul_dci(&mut spoint, &mut ue, 3, &ctx).unwrap();
        assert_eq!(dci.sym_start, 10);
        assert_eq!(dci.num_sym, 3);
        assert_eq!(dci.allocated_rbgs(), 5);
        assert_eq!(spoint.rbg, 5);

        change_ul_beam(&mut spoint, 3);
        assert_eq!(spoint.sym, 10);
        assert_eq!(spoint.rbg, 0);
    }
}
