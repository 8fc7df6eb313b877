//! Adaptive Modulation and Coding
//!
//! Maps an MCS index and an allocated resource-block count to a transport
//! block size in bytes, and CQI/SINR reports back to an MCS. The
//! scheduler consumes AMC through the narrow [`Amc`] trait; it never
//! needs to know which model produced the numbers.

use serde::{Deserialize, Serialize};
use tracing::trace;

use common::Mcs;

/// Subcarriers in a resource block
const SUBCARRIERS_PER_RB: u32 = 12;

/// Transport block CRC length in bytes (24 bits)
const CRC_LEN_BYTES: u32 = 3;

/// Maximum LDPC code block size in bytes (8448 bits, base graph 1)
const MAX_CB_SIZE_BYTES: u32 = 1056;

/// Spectral efficiency for each 4-bit CQI index (TS 38.214 table 5.2.2.1-2)
const CQI_SPECTRAL_EFFICIENCY: [f64; 16] = [
    0.0, 0.1523, 0.2344, 0.3770, 0.6016, 0.8770, 1.1758, 1.4766, 1.9141, 2.4063, 2.7305, 3.3223,
    3.9023, 4.5234, 5.1152, 5.5547,
];

/// Modulation order per MCS, 64QAM table (TS 38.214 table 5.1.3.1-1)
const TABLE1_QM: [u32; 29] = [
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 4, 4, 4, 4, 4, 4, 4, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
];

/// Code rate × 1024 per MCS, 64QAM table
const TABLE1_ECR: [f64; 29] = [
    120.0, 157.0, 193.0, 251.0, 308.0, 379.0, 449.0, 526.0, 602.0, 679.0, 340.0, 378.0, 434.0,
    490.0, 553.0, 616.0, 658.0, 438.0, 466.0, 517.0, 567.0, 616.0, 666.0, 719.0, 772.0, 822.0,
    873.0, 910.0, 948.0,
];

/// Modulation order per MCS, 256QAM table (TS 38.214 table 5.1.3.1-2)
const TABLE2_QM: [u32; 28] = [
    2, 2, 2, 2, 2, 4, 4, 4, 4, 4, 4, 6, 6, 6, 6, 6, 6, 6, 6, 6, 8, 8, 8, 8, 8, 8, 8, 8,
];

/// Code rate × 1024 per MCS, 256QAM table
const TABLE2_ECR: [f64; 28] = [
    120.0, 193.0, 308.0, 449.0, 602.0, 378.0, 434.0, 490.0, 553.0, 616.0, 658.0, 466.0, 517.0,
    567.0, 616.0, 666.0, 719.0, 772.0, 822.0, 873.0, 682.5, 711.0, 754.0, 797.0, 841.0, 885.0,
    916.5, 948.0,
];

/// The AMC contract the scheduler depends on.
pub trait Amc: std::fmt::Debug {
    /// Transport block size in bytes for an MCS and an allocated number
    /// of resource blocks (RB × symbol units).
    fn calculate_tb_size(&self, mcs: Mcs, num_rb: u32) -> u32;

    /// Highest usable MCS index.
    fn max_mcs(&self) -> Mcs;

    /// MCS achieving at most the spectral efficiency of a CQI report.
    fn get_mcs_from_cqi(&self, cqi: u8) -> Mcs;
}

/// Model used to turn SINR measurements into CQI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmcModel {
    /// Spectral efficiency from Shannon capacity with a target BER
    ShannonModel,
    /// Spectral efficiency from the empirical MCS table
    ErrorModel,
}

/// MCS table in use (TS 38.214); Table2 enables 256QAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McsTable {
    Table1,
    Table2,
}

/// Table-driven AMC for one link direction.
#[derive(Debug, Clone)]
pub struct NrAmc {
    model: AmcModel,
    table: McsTable,
    /// Subcarriers per RB carrying reference signals, excluded from the
    /// payload computation
    num_ref_sc_per_rb: u32,
    /// Target BER of the Shannon model
    ber: f64,
}

impl Default for NrAmc {
    fn default() -> Self {
        Self {
            model: AmcModel::ErrorModel,
            table: McsTable::Table1,
            num_ref_sc_per_rb: 1,
            ber: 1e-5,
        }
    }
}

impl NrAmc {
    pub fn new(model: AmcModel, table: McsTable) -> Self {
        Self {
            model,
            table,
            ..Self::default()
        }
    }

    pub fn model(&self) -> AmcModel {
        self.model
    }

    fn qm(&self, mcs: Mcs) -> u32 {
        match self.table {
            McsTable::Table1 => TABLE1_QM[mcs as usize],
            McsTable::Table2 => TABLE2_QM[mcs as usize],
        }
    }

    fn ecr(&self, mcs: Mcs) -> f64 {
        let ecr = match self.table {
            McsTable::Table1 => TABLE1_ECR[mcs as usize],
            McsTable::Table2 => TABLE2_ECR[mcs as usize],
        };
        ecr / 1024.0
    }

    /// Spectral efficiency of an MCS (bits per symbol per subcarrier)
    fn spectral_efficiency_for_mcs(&self, mcs: Mcs) -> f64 {
        self.qm(mcs) as f64 * self.ecr(mcs)
    }

    /// Payload bytes carried by `num_rb` RB × symbol units before CRC
    /// subtraction.
    fn payload_size(&self, mcs: Mcs, num_rb: u32) -> u32 {
        let data_sc = SUBCARRIERS_PER_RB - self.num_ref_sc_per_rb;
        let bits = (num_rb * data_sc * self.qm(mcs)) as f64 * self.ecr(mcs);
        (bits / 8.0) as u32
    }

    fn get_mcs_from_spectral_efficiency(&self, se: f64) -> Mcs {
        let mut mcs: Mcs = 0;
        while mcs < self.max_mcs() && self.spectral_efficiency_for_mcs(mcs + 1) <= se {
            mcs += 1;
        }
        mcs
    }

    fn get_cqi_from_spectral_efficiency(&self, se: f64) -> u8 {
        let mut cqi = 15u8;
        while cqi > 0 && CQI_SPECTRAL_EFFICIENCY[cqi as usize] > se {
            cqi -= 1;
        }
        cqi
    }

    /// Produce a wideband CQI and MCS from per-RB linear SINR values.
    ///
    /// RBs with zero SINR carry no signal and are excluded from the
    /// average.
    pub fn create_cqi_feedback(&self, sinr_per_rb: &[f64]) -> (u8, Mcs) {
        let gamma = match self.model {
            // SE = log2(1 + SINR / (-ln(5 BER) / 1.5)), SINR linear
            AmcModel::ShannonModel => -(5.0 * self.ber).ln() / 1.5,
            AmcModel::ErrorModel => 1.0,
        };

        let mut se_sum = 0.0;
        let mut rb_num = 0u32;
        for &sinr in sinr_per_rb {
            if sinr == 0.0 {
                continue;
            }
            se_sum += (1.0 + sinr / gamma).log2();
            rb_num += 1;
        }

        if rb_num == 0 {
            return (0, 0);
        }

        let se_avg = se_sum / rb_num as f64;
        let cqi = self.get_cqi_from_spectral_efficiency(se_avg);
        let mcs = self.get_mcs_from_spectral_efficiency(se_avg);
        trace!("avg SE {:.4} -> CQI {} MCS {}", se_avg, cqi, mcs);
        (cqi, mcs)
    }
}

impl Amc for NrAmc {
    fn calculate_tb_size(&self, mcs: Mcs, num_rb: u32) -> u32 {
        debug_assert!(
            mcs <= self.max_mcs(),
            "MCS {} above maximum {}",
            mcs,
            self.max_mcs()
        );

        let payload = self.payload_size(mcs, num_rb);
        let mut tb_size = payload.saturating_sub(CRC_LEN_BYTES);

        // Code block segmentation adds one CRC per code block
        if tb_size > MAX_CB_SIZE_BYTES {
            let num_cb = tb_size.div_ceil(MAX_CB_SIZE_BYTES);
            tb_size = payload.saturating_sub(num_cb * CRC_LEN_BYTES);
        }

        tb_size
    }

    fn max_mcs(&self) -> Mcs {
        match self.table {
            McsTable::Table1 => 28,
            McsTable::Table2 => 27,
        }
    }

    fn get_mcs_from_cqi(&self, cqi: u8) -> Mcs {
        debug_assert!(cqi <= 15, "CQI must be in [0..15], got {}", cqi);
        let se = CQI_SPECTRAL_EFFICIENCY[cqi as usize];
        self.get_mcs_from_spectral_efficiency(se)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tb_size_monotonic_in_mcs() {
        let amc = NrAmc::default();
        let mut last = 0;
        for mcs in 0..=amc.max_mcs() {
            let tbs = amc.calculate_tb_size(mcs, 100);
            assert!(tbs >= last, "TBS not monotonic at MCS {}", mcs);
            last = tbs;
        }
    }

    #[test]
    fn test_tb_size_monotonic_in_rb() {
        let amc = NrAmc::default();
        let mut last = 0;
        for rb in [1, 10, 50, 100, 500] {
            let tbs = amc.calculate_tb_size(10, rb);
            assert!(tbs > last);
            last = tbs;
        }
    }

    #[test]
    fn test_zero_rb_gives_zero_tbs() {
        let amc = NrAmc::default();
        assert_eq!(amc.calculate_tb_size(10, 0), 0);
    }

    #[test]
    fn test_crc_subtraction() {
        let amc = NrAmc::default();
        // 11 data subcarriers * 2 * 120/1024 / 8 = 0.32 bytes payload per RB
        // at MCS 0, so a single RB ends below the CRC length
        assert_eq!(amc.calculate_tb_size(0, 1), 0);
    }

    #[test]
    fn test_mcs_from_cqi_bounds() {
        let amc = NrAmc::default();
        assert_eq!(amc.get_mcs_from_cqi(0), 0);
        assert_eq!(amc.get_mcs_from_cqi(15), amc.max_mcs());

        let mut last = 0;
        for cqi in 0..=15 {
            let mcs = amc.get_mcs_from_cqi(cqi);
            assert!(mcs >= last);
            last = mcs;
        }
    }

    #[test]
    fn test_cqi_feedback_shannon() {
        let amc = NrAmc::new(AmcModel::ShannonModel, McsTable::Table1);

        // strong signal saturates at CQI 15
        let (cqi, mcs) = amc.create_cqi_feedback(&[1e6; 10]);
        assert_eq!(cqi, 15);
        assert_eq!(mcs, amc.max_mcs());

        // no signal anywhere
        let (cqi, mcs) = amc.create_cqi_feedback(&[0.0; 10]);
        assert_eq!(cqi, 0);
        assert_eq!(mcs, 0);
    }

    #[test]
    fn test_table2_enables_higher_order() {
        let t1 = NrAmc::new(AmcModel::ErrorModel, McsTable::Table1);
        let t2 = NrAmc::new(AmcModel::ErrorModel, McsTable::Table2);
        assert_eq!(t1.max_mcs(), 28);
        assert_eq!(t2.max_mcs(), 27);
        // top of Table2 is 256QAM, carrying more per RB than top of Table1
        assert!(t2.calculate_tb_size(27, 100) > t1.calculate_tb_size(28, 100));
    }
}
