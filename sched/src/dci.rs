//! Downlink/Uplink Control Information
//!
//! The grant descriptor a finalized per-UE allocation is converted into:
//! symbol span, per-stream MCS/TBS/NDI/RV and an RBG bitmask over the
//! bandwidth part.

use common::{utils, Mcs, Rnti};

/// Link direction of the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DciFormat {
    Dl,
    Ul,
}

/// What the granted symbols carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarTtiType {
    /// Sounding reference signals
    Srs,
    /// DL/UL data
    Data,
    /// DL/UL control
    Ctrl,
}

/// A per-UE scheduling grant over a flexible TTI.
///
/// Invariant: the RBG bitmask has at least one set bit, and every stream
/// announced as active (`ndi = 1`) carries a usable TB. A grant that
/// cannot satisfy this is never constructed; the scheduler suppresses the
/// DCI instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DciInfoElementTdma {
    pub rnti: Rnti,
    pub format: DciFormat,
    /// First symbol of the grant
    pub sym_start: u8,
    /// Number of consecutive symbols
    pub num_sym: u8,
    /// MCS per stream
    pub mcs: Vec<Mcs>,
    /// TB size per stream, bytes
    pub tb_size: Vec<u32>,
    /// New data indicator per stream
    pub ndi: Vec<u8>,
    /// Redundancy version per stream
    pub rv: Vec<u8>,
    pub var_tti_type: VarTtiType,
    /// Positional BWP index this grant belongs to
    pub bwp_index: u8,
    /// HARQ process feeding this grant
    pub harq_process: u8,
    /// Transmit power control command
    pub tpc: u8,
    /// One bit per RBG, true = allocated
    pub rbg_bitmask: Vec<bool>,
}

impl DciInfoElementTdma {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rnti: Rnti,
        format: DciFormat,
        sym_start: u8,
        num_sym: u8,
        mcs: Vec<Mcs>,
        tb_size: Vec<u32>,
        ndi: Vec<u8>,
        rv: Vec<u8>,
        bwp_index: u8,
        harq_process: u8,
        rbg_bitmask: Vec<bool>,
    ) -> Self {
        debug_assert!(num_sym > 0, "DCI with an empty symbol span");
        debug_assert!(
            utils::mask_popcount(&rbg_bitmask) > 0,
            "DCI with an all-zero RBG bitmask"
        );
        debug_assert_eq!(mcs.len(), tb_size.len());
        debug_assert_eq!(ndi.len(), tb_size.len());
        debug_assert_eq!(rv.len(), tb_size.len());
        Self {
            rnti,
            format,
            sym_start,
            num_sym,
            mcs,
            tb_size,
            ndi,
            rv,
            var_tti_type: VarTtiType::Data,
            bwp_index,
            harq_process,
            tpc: 1,
            rbg_bitmask,
        }
    }

    /// Number of allocated RBG positions in the bitmask.
    pub fn allocated_rbgs(&self) -> usize {
        utils::mask_popcount(&self.rbg_bitmask)
    }

    /// Cumulative TB size across streams, bytes.
    pub fn total_tb_size(&self) -> u32 {
        self.tb_size.iter().sum()
    }

    /// Streams carrying new data.
    pub fn active_streams(&self) -> impl Iterator<Item = usize> + '_ {
        self.ndi
            .iter()
            .enumerate()
            .filter(|(_, ndi)| **ndi == 1)
            .map(|(stream, _)| stream)
    }
}
