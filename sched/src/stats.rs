//! Scheduling Traces
//!
//! The scheduler pushes one structured record per granted stream into an
//! observer list; collectors subscribe independently. The TSV writer
//! reproduces the classic MAC-scheduling stats layout, one file per
//! direction.

use std::io::Write;

use common::{Direction, SfnSf};

use crate::dci::DciInfoElementTdma;
use crate::Result;

/// One scheduling decision for one stream of one UE.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingRecord {
    /// Simulated time of the slot, seconds
    pub time_secs: f64,
    pub cell_id: u16,
    pub bwp_id: u8,
    pub imsi: u64,
    pub rnti: u16,
    pub frame: u32,
    pub subframe: u8,
    pub slot: u8,
    pub sym_start: u8,
    pub num_sym: u8,
    pub stream: u8,
    pub harq_id: u8,
    pub ndi: u8,
    pub rv: u8,
    pub mcs: u8,
    /// Transport block size, bytes
    pub tb_size: u32,
}

impl SchedulingRecord {
    /// Records for every stream of a grant.
    pub fn from_dci(
        dci: &DciInfoElementTdma,
        sfn_sf: &SfnSf,
        cell_id: u16,
        imsi: u64,
    ) -> Vec<Self> {
        (0..dci.tb_size.len())
            .map(|stream| SchedulingRecord {
                time_secs: sfn_sf.to_secs(),
                cell_id,
                bwp_id: dci.bwp_index,
                imsi,
                rnti: dci.rnti.value(),
                frame: sfn_sf.frame,
                subframe: sfn_sf.subframe,
                slot: sfn_sf.slot,
                sym_start: dci.sym_start,
                num_sym: dci.num_sym,
                stream: stream as u8,
                harq_id: dci.harq_process,
                ndi: dci.ndi[stream],
                rv: dci.rv[stream],
                mcs: dci.mcs[stream],
                tb_size: dci.tb_size[stream],
            })
            .collect()
    }
}

/// Observer interface the scheduler fans its trace records out to.
pub trait SchedTraceSink {
    fn on_scheduling(&mut self, dir: Direction, record: &SchedulingRecord);
}

const TRACE_HEADER: &str = "% time(s)\tcellId\tbwpId\tIMSI\tRNTI\tframe\tsframe\tslot\tsymStart\tnumSym\tstream\tharqId\tndi\trv\tmcs\ttbSize";

/// Tab-separated trace writer, one output per direction.
#[derive(Debug)]
pub struct TsvTraceWriter<W: Write> {
    dl: W,
    ul: W,
}

impl<W: Write> TsvTraceWriter<W> {
    /// Create the writer and emit the header line on both outputs.
    pub fn new(mut dl: W, mut ul: W) -> Result<Self> {
        writeln!(dl, "{}", TRACE_HEADER)?;
        writeln!(ul, "{}", TRACE_HEADER)?;
        Ok(Self { dl, ul })
    }

    fn write_record(out: &mut W, r: &SchedulingRecord) -> Result<()> {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.time_secs,
            r.cell_id,
            r.bwp_id,
            r.imsi,
            r.rnti,
            r.frame,
            r.subframe,
            r.slot,
            r.sym_start,
            r.num_sym,
            r.stream,
            r.harq_id,
            r.ndi,
            r.rv,
            r.mcs,
            r.tb_size
        )?;
        Ok(())
    }

    pub fn into_inner(self) -> (W, W) {
        (self.dl, self.ul)
    }
}

impl<W: Write> SchedTraceSink for TsvTraceWriter<W> {
    fn on_scheduling(&mut self, dir: Direction, record: &SchedulingRecord) {
        let out = match dir {
            Direction::Dl => &mut self.dl,
            Direction::Ul => &mut self.ul,
        };
        if let Err(e) = Self::write_record(out, record) {
            tracing::warn!("Failed to write {} scheduling record: {}", dir, e);
        }
    }
}

/// In-memory sink, handy for tests and programmatic collectors.
#[derive(Debug, Default)]
pub struct VecTraceSink {
    pub records: Vec<(Direction, SchedulingRecord)>,
}

impl VecTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dl_records(&self) -> impl Iterator<Item = &SchedulingRecord> {
        self.records
            .iter()
            .filter(|(dir, _)| *dir == Direction::Dl)
            .map(|(_, r)| r)
    }

    pub fn ul_records(&self) -> impl Iterator<Item = &SchedulingRecord> {
        self.records
            .iter()
            .filter(|(dir, _)| *dir == Direction::Ul)
            .map(|(_, r)| r)
    }
}

impl SchedTraceSink for VecTraceSink {
    fn on_scheduling(&mut self, dir: Direction, record: &SchedulingRecord) {
        self.records.push((dir, record.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dci::DciFormat;
    use common::Rnti;

    fn dci() -> DciInfoElementTdma {
        DciInfoElementTdma::new(
            Rnti(7),
            DciFormat::Dl,
            1,
            4,
            vec![12, 10],
            vec![900, 0],
            vec![1, 0],
            vec![0, 0],
            2,
            5,
            vec![true; 25],
        )
    }

    #[test]
    fn test_records_per_stream() {
        let sfn_sf = SfnSf::new(1, 2, 0, 1);
        let recs = SchedulingRecord::from_dci(&dci(), &sfn_sf, 1, 7);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].stream, 0);
        assert_eq!(recs[1].stream, 1);
        assert_eq!(recs[0].tb_size, 900);
        assert_eq!(recs[1].ndi, 0);
        assert!((recs[0].time_secs - (20.0 + 4.0) * 0.5e-3).abs() < 1e-12);
    }

    #[test]
    fn test_tsv_writer_layout() {
        let sfn_sf = SfnSf::new(0, 1, 0, 0);
        let recs = SchedulingRecord::from_dci(&dci(), &sfn_sf, 1, 7);

        let mut writer = TsvTraceWriter::new(Vec::new(), Vec::new()).unwrap();
        for r in &recs {
            writer.on_scheduling(Direction::Dl, r);
        }
        let (dl, ul) = writer.into_inner();

        let dl = String::from_utf8(dl).unwrap();
        let mut lines = dl.lines();
        assert_eq!(lines.next().unwrap(), TRACE_HEADER);
        let first: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(first.len(), 16);
        assert_eq!(first[1], "1"); // cellId
        assert_eq!(first[2], "2"); // bwpId
        assert_eq!(first[4], "7"); // RNTI
        assert_eq!(first[15], "900"); // tbSize

        // nothing was scheduled in UL
        assert_eq!(String::from_utf8(ul).unwrap().lines().count(), 1);
    }
}
