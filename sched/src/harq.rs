//! HARQ Process Bookkeeping
//!
//! Each UE owns one vector of stop-and-wait HARQ processes per
//! direction. A process opens when a new-data grant is built, closes on
//! an ACK (or once the retransmission limit is reached) and is replayed
//! as a retransmission grant after a NACK. Retransmissions are served
//! ahead of new data by the slot loop in [`crate::scheduler`].

use std::collections::BTreeMap;

use tracing::debug;

use common::Mcs;

use crate::{Result, SchedError};

/// HARQ processes available per UE per direction
pub const NUM_HARQ_PROCESSES: u8 = 16;

/// Retransmissions of a TB before the process is given up
pub const MAX_HARQ_RETX: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqStatus {
    /// Transmitted, feedback not yet received
    WaitingFeedback,
    /// NACKed, waiting for a retransmission grant
    NackReceived,
}

/// One in-flight transport block (per stream for rank-2 DL).
#[derive(Debug, Clone)]
pub struct HarqProcess {
    pub status: HarqStatus,
    /// MCS per stream of the original grant
    pub mcs: Vec<Mcs>,
    /// TB size per stream, bytes
    pub tb_size: Vec<u32>,
    /// Redundancy version per stream, advanced on every retransmission
    pub rv: Vec<u8>,
    /// Streams the last feedback NACKed
    pub nacked_streams: Vec<u8>,
    /// Symbol span of the original grant
    pub num_sym: u8,
    /// Slots spent waiting for feedback
    timer: u8,
}

/// What a retransmission grant carries: the NACKed streams keep their
/// MCS and TB size with the next redundancy version and `ndi = 0`,
/// already-delivered streams are zeroed out.
#[derive(Debug, Clone)]
pub struct RetxGrant {
    pub mcs: Vec<Mcs>,
    pub tb_size: Vec<u32>,
    pub ndi: Vec<u8>,
    pub rv: Vec<u8>,
    pub num_sym: u8,
}

/// The per-UE, per-direction set of HARQ processes.
#[derive(Debug, Clone, Default)]
pub struct HarqVector {
    procs: BTreeMap<u8, HarqProcess>,
}

impl HarqVector {
    /// Lowest process id not currently in flight.
    pub fn first_idle(&self) -> Option<u8> {
        (0..NUM_HARQ_PROCESSES).find(|id| !self.procs.contains_key(id))
    }

    pub fn get(&self, id: u8) -> Option<&HarqProcess> {
        self.procs.get(&id)
    }

    /// Open a process for a freshly built grant.
    pub fn start(&mut self, id: u8, mcs: Vec<Mcs>, tb_size: Vec<u32>, num_sym: u8) {
        debug_assert!(!self.procs.contains_key(&id));
        let streams = tb_size.len();
        self.procs.insert(
            id,
            HarqProcess {
                status: HarqStatus::WaitingFeedback,
                mcs,
                tb_size,
                rv: vec![0; streams],
                nacked_streams: Vec::new(),
                num_sym,
                timer: 0,
            },
        );
    }

    /// Apply feedback for an in-flight process. An empty `nacked_streams`
    /// is an ACK and closes the process; a NACK past the retransmission
    /// limit drops the TB and closes it too.
    pub fn feedback(&mut self, id: u8, nacked_streams: &[u8]) -> Result<()> {
        let proc = self.procs.get_mut(&id).ok_or_else(|| {
            SchedError::InvalidState(format!("feedback for inactive HARQ process {}", id))
        })?;
        if nacked_streams.is_empty() || proc.rv.iter().any(|rv| *rv >= MAX_HARQ_RETX) {
            self.procs.remove(&id);
        } else {
            proc.status = HarqStatus::NackReceived;
            proc.nacked_streams = nacked_streams.to_vec();
        }
        Ok(())
    }

    /// Processes NACKed and not yet re-granted, in id order.
    pub fn retx_ready(&self) -> Vec<u8> {
        self.procs
            .iter()
            .filter(|(_, proc)| proc.status == HarqStatus::NackReceived)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Replay a NACKed process as a retransmission grant and put it back
    /// to waiting for feedback.
    pub fn begin_retx(&mut self, id: u8) -> Option<RetxGrant> {
        let proc = self.procs.get_mut(&id)?;
        if proc.status != HarqStatus::NackReceived {
            return None;
        }
        let streams = proc.tb_size.len();
        let mut grant = RetxGrant {
            mcs: proc.mcs.clone(),
            tb_size: vec![0; streams],
            ndi: vec![0; streams],
            rv: vec![0; streams],
            num_sym: proc.num_sym,
        };
        for &stream in &proc.nacked_streams {
            let stream = stream as usize;
            if stream >= streams {
                continue;
            }
            proc.rv[stream] += 1;
            grant.tb_size[stream] = proc.tb_size[stream];
            grant.rv[stream] = proc.rv[stream];
        }
        proc.status = HarqStatus::WaitingFeedback;
        proc.timer = 0;
        Some(grant)
    }

    /// Per-slot aging: a process whose feedback never arrives is
    /// released after `NUM_HARQ_PROCESSES` slots.
    pub fn tick(&mut self) {
        self.procs.retain(|id, proc| {
            if proc.status != HarqStatus::WaitingFeedback {
                return true;
            }
            proc.timer += 1;
            if proc.timer > NUM_HARQ_PROCESSES {
                debug!("HARQ process {} expired without feedback", id);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(v: &mut HarqVector) -> u8 {
        let id = v.first_idle().unwrap();
        v.start(id, vec![10], vec![500], 4);
        id
    }

    #[test]
    fn test_first_idle_skips_active() {
        let mut v = HarqVector::default();
        assert_eq!(started(&mut v), 0);
        assert_eq!(started(&mut v), 1);
        v.feedback(0, &[]).unwrap();
        assert_eq!(v.first_idle(), Some(0));
    }

    #[test]
    fn test_all_processes_busy() {
        let mut v = HarqVector::default();
        for _ in 0..NUM_HARQ_PROCESSES {
            started(&mut v);
        }
        assert_eq!(v.first_idle(), None);
    }

    #[test]
    fn test_nack_then_retx_advances_rv() {
        let mut v = HarqVector::default();
        let id = started(&mut v);
        assert!(v.retx_ready().is_empty());

        v.feedback(id, &[0]).unwrap();
        assert_eq!(v.retx_ready(), vec![id]);

        let grant = v.begin_retx(id).unwrap();
        assert_eq!(grant.rv, vec![1]);
        assert_eq!(grant.ndi, vec![0]);
        assert_eq!(grant.tb_size, vec![500]);
        assert_eq!(grant.num_sym, 4);

        // re-granted: not retx-ready again until the next NACK
        assert!(v.retx_ready().is_empty());
        assert!(v.begin_retx(id).is_none());
    }

    #[test]
    fn test_retx_limit_closes_process() {
        let mut v = HarqVector::default();
        let id = started(&mut v);
        for retx in 1..=MAX_HARQ_RETX {
            v.feedback(id, &[0]).unwrap();
            assert_eq!(v.begin_retx(id).unwrap().rv, vec![retx]);
        }
        // the redundancy version is exhausted: the next NACK drops the TB
        v.feedback(id, &[0]).unwrap();
        assert!(v.get(id).is_none());
        assert!(v.retx_ready().is_empty());
    }

    #[test]
    fn test_mimo_retx_keeps_only_nacked_stream() {
        let mut v = HarqVector::default();
        v.start(0, vec![12, 10], vec![900, 700], 6);
        v.feedback(0, &[1]).unwrap();

        let grant = v.begin_retx(0).unwrap();
        assert_eq!(grant.tb_size, vec![0, 700]);
        assert_eq!(grant.rv, vec![0, 1]);
        assert_eq!(grant.ndi, vec![0, 0]);
        assert_eq!(grant.mcs, vec![12, 10]);
    }

    #[test]
    fn test_feedback_for_inactive_process_rejected() {
        let mut v = HarqVector::default();
        assert!(matches!(
            v.feedback(3, &[]),
            Err(SchedError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unanswered_process_expires() {
        let mut v = HarqVector::default();
        let id = started(&mut v);
        for _ in 0..NUM_HARQ_PROCESSES {
            v.tick();
        }
        assert!(v.get(id).is_some());
        v.tick();
        assert!(v.get(id).is_none());
    }

    #[test]
    fn test_nacked_process_does_not_expire() {
        let mut v = HarqVector::default();
        let id = started(&mut v);
        v.feedback(id, &[0]).unwrap();
        for _ in 0..2 * NUM_HARQ_PROCESSES {
            v.tick();
        }
        assert_eq!(v.retx_ready(), vec![id]);
    }
}
