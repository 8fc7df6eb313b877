//! Spectrum Partition Model
//!
//! Carves an operation band into component carriers and bandwidth parts,
//! assigns stable small-integer ids and validates the frequency layout.
//! The flattened BWP sequence produced by [`CcBwpCreator::get_all_bwps`]
//! is the positional index space the schedulers and the BWP manager use
//! for routing; callers must not reorder it.

use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::{BandId, BwpId, CcId};

use crate::{Result, SchedError};

/// Maximum component carrier bandwidth below 6 GHz (FR1)
pub const MAX_CC_BANDWIDTH_FR1: f64 = 198e6;

/// Maximum component carrier bandwidth above 6 GHz (FR2)
pub const MAX_CC_BANDWIDTH_FR2: f64 = 396e6;

/// Frequency threshold between the FR1 and FR2 regimes
pub const FR1_FR2_THRESHOLD: f64 = 6e9;

/// 3GPP deployment scenario of a bandwidth part.
///
/// The variants with a `_LoS`/`_nLoS` suffix force every link into
/// line-of-sight or non-line-of-sight; the channel condition family is
/// otherwise probabilistic.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    RMa,
    RMa_LoS,
    RMa_nLoS,
    UMa,
    UMa_LoS,
    UMa_nLoS,
    UMi_StreetCanyon,
    UMi_StreetCanyon_LoS,
    UMi_StreetCanyon_nLoS,
    InH_OfficeOpen,
    InH_OfficeOpen_LoS,
    InH_OfficeOpen_nLoS,
    InH_OfficeMixed,
    InH_OfficeMixed_LoS,
    InH_OfficeMixed_nLoS,
    UMa_Buildings,
    UMi_Buildings,
    V2V_Highway,
    V2V_Urban,
}

impl Scenario {
    /// The propagation-model family this scenario maps onto.
    ///
    /// The LoS/nLoS refinements and the building variants share the family
    /// of their base scenario.
    pub fn family(&self) -> &'static str {
        match self {
            Scenario::RMa | Scenario::RMa_LoS | Scenario::RMa_nLoS => "RMa",
            Scenario::UMa | Scenario::UMa_LoS | Scenario::UMa_nLoS | Scenario::UMa_Buildings => {
                "UMa"
            }
            Scenario::UMi_StreetCanyon
            | Scenario::UMi_StreetCanyon_LoS
            | Scenario::UMi_StreetCanyon_nLoS
            | Scenario::UMi_Buildings => "UMi-StreetCanyon",
            Scenario::InH_OfficeOpen
            | Scenario::InH_OfficeOpen_LoS
            | Scenario::InH_OfficeOpen_nLoS => "InH-OfficeOpen",
            Scenario::InH_OfficeMixed
            | Scenario::InH_OfficeMixed_LoS
            | Scenario::InH_OfficeMixed_nLoS => "InH-OfficeMixed",
            Scenario::V2V_Highway => "V2V-Highway",
            Scenario::V2V_Urban => "V2V-Urban",
        }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario::RMa
    }
}

/// The smallest schedulable spectrum unit.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthPartInfo {
    /// Creation-time id, unique across one creator's lifetime
    pub bwp_id: BwpId,
    /// Central frequency in Hz
    pub central_frequency: f64,
    /// Lower edge in Hz
    pub lower_frequency: f64,
    /// Higher edge in Hz
    pub higher_frequency: f64,
    /// Occupied bandwidth in Hz
    pub channel_bandwidth: f64,
    /// Deployment scenario driving the channel model choice
    pub scenario: Scenario,
}

impl std::fmt::Display for BandwidthPartInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BWP id {} lower {:.2} MHz central {:.2} MHz higher {:.2} MHz bw {:.2} MHz",
            self.bwp_id,
            self.lower_frequency / 1e6,
            self.central_frequency / 1e6,
            self.higher_frequency / 1e6,
            self.channel_bandwidth / 1e6
        )
    }
}

/// A frequency sub-range of an operation band, owning an ordered list of
/// bandwidth parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentCarrierInfo {
    /// Creation-time id, unique across one creator's lifetime
    pub cc_id: CcId,
    /// Central frequency in Hz
    pub central_frequency: f64,
    /// Lower edge in Hz
    pub lower_frequency: f64,
    /// Higher edge in Hz
    pub higher_frequency: f64,
    /// Occupied bandwidth in Hz
    pub channel_bandwidth: f64,
    /// Bandwidth parts, in frequency order
    pub bwp: Vec<BandwidthPartInfo>,
}

impl ComponentCarrierInfo {
    /// Attach a bandwidth part, validating containment and non-overlap
    /// against the already attached siblings.
    pub fn add_bwp(&mut self, bwp: BandwidthPartInfo) -> Result<()> {
        if bwp.lower_frequency < self.lower_frequency
            || bwp.higher_frequency > self.higher_frequency
        {
            return Err(SchedError::ConfigurationError(format!(
                "BWP {} [{:.2}, {:.2}] MHz outside CC {} [{:.2}, {:.2}] MHz",
                bwp.bwp_id,
                bwp.lower_frequency / 1e6,
                bwp.higher_frequency / 1e6,
                self.cc_id.0,
                self.lower_frequency / 1e6,
                self.higher_frequency / 1e6
            )));
        }

        if let Some(prev) = self.bwp.last() {
            if prev.higher_frequency > bwp.lower_frequency {
                return Err(SchedError::ConfigurationError(format!(
                    "BWP {} has higher freq {:.2} MHz while BWP {} has lower freq {:.2} MHz",
                    prev.bwp_id,
                    prev.higher_frequency / 1e6,
                    bwp.bwp_id,
                    bwp.lower_frequency / 1e6
                )));
            }
        }

        debug!("Attached {} to CC {}", bwp, self.cc_id.0);
        self.bwp.push(bwp);
        Ok(())
    }
}

/// A contiguous or non-contiguous frequency region owning an ordered list
/// of component carriers.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBandInfo {
    /// Creation-time id, unique across one creator's lifetime
    pub band_id: BandId,
    /// Central frequency in Hz
    pub central_frequency: f64,
    /// Lower edge in Hz
    pub lower_frequency: f64,
    /// Higher edge in Hz
    pub higher_frequency: f64,
    /// Occupied bandwidth in Hz
    pub channel_bandwidth: f64,
    /// Component carriers, in frequency order
    pub cc: Vec<ComponentCarrierInfo>,
}

impl OperationBandInfo {
    /// Attach a component carrier, validating containment and non-overlap
    /// against the already attached siblings.
    pub fn add_cc(&mut self, cc: ComponentCarrierInfo) -> Result<()> {
        if cc.lower_frequency < self.lower_frequency || cc.higher_frequency > self.higher_frequency
        {
            return Err(SchedError::ConfigurationError(format!(
                "CC {} [{:.2}, {:.2}] MHz outside band {} [{:.2}, {:.2}] MHz",
                cc.cc_id.0,
                cc.lower_frequency / 1e6,
                cc.higher_frequency / 1e6,
                self.band_id.0,
                self.lower_frequency / 1e6,
                self.higher_frequency / 1e6
            )));
        }

        if let Some(prev) = self.cc.last() {
            if prev.higher_frequency > cc.lower_frequency {
                return Err(SchedError::ConfigurationError(format!(
                    "CC {} has higher freq {:.2} MHz while CC {} has lower freq {:.2} MHz",
                    prev.cc_id.0,
                    prev.higher_frequency / 1e6,
                    cc.cc_id.0,
                    cc.lower_frequency / 1e6
                )));
            }
        }

        debug!(
            "Attached CC {} [{:.2}, {:.2}] MHz with {} BWP(s) to band {}",
            cc.cc_id.0,
            cc.lower_frequency / 1e6,
            cc.higher_frequency / 1e6,
            cc.bwp.len(),
            self.band_id.0
        );
        self.cc.push(cc);
        Ok(())
    }

    /// Bandwidth parts of this band, flattened in CC order then BWP order.
    pub fn get_bwps(&self) -> Vec<&BandwidthPartInfo> {
        self.cc.iter().flat_map(|cc| cc.bwp.iter()).collect()
    }
}

/// Parameters for one automatically carved operation band.
#[derive(Debug, Clone, Copy)]
pub struct SimpleOperationBandConf {
    /// Central frequency in Hz
    pub central_frequency: f64,
    /// Total bandwidth in Hz
    pub channel_bandwidth: f64,
    /// Number of component carriers to carve
    pub num_cc: u8,
    /// Number of bandwidth parts per component carrier
    pub num_bwp_per_cc: u8,
    /// Scenario applied to every carved BWP
    pub scenario: Scenario,
}

impl SimpleOperationBandConf {
    pub fn new(central_frequency: f64, channel_bandwidth: f64, num_cc: u8) -> Self {
        Self {
            central_frequency,
            channel_bandwidth,
            num_cc,
            num_bwp_per_cc: 1,
            scenario: Scenario::default(),
        }
    }
}

/// Factory that carves operation bands and hands out band/CC/BWP ids.
///
/// The counters are fields on the creator, not process-wide globals, so
/// independent scenarios never leak id state into each other. Ids are
/// never reused within one creator's lifetime.
#[derive(Debug, Default)]
pub struct CcBwpCreator {
    operation_band_counter: u8,
    component_carrier_counter: u8,
    bandwidth_part_counter: u8,
}

impl CcBwpCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carve an operation band into `num_cc` contiguous component
    /// carriers, each split evenly into `num_bwp_per_cc` bandwidth parts.
    ///
    /// The per-CC bandwidth is capped at the FR1/FR2 regime maximum
    /// (198 MHz below 6 GHz, 396 MHz above).
    pub fn create_operation_band_contiguous_cc(
        &mut self,
        conf: &SimpleOperationBandConf,
    ) -> Result<OperationBandInfo> {
        if conf.num_cc == 0 {
            return Err(SchedError::ConfigurationError(
                "an operation band needs at least one component carrier".into(),
            ));
        }

        info!(
            "Creating an op band formed by {} contiguous CC, central freq {:.2} MHz, bw {:.2} MHz",
            conf.num_cc,
            conf.central_frequency / 1e6,
            conf.channel_bandwidth / 1e6
        );

        let mut band = OperationBandInfo {
            band_id: BandId(self.next_band_id()),
            central_frequency: conf.central_frequency,
            channel_bandwidth: conf.channel_bandwidth,
            lower_frequency: conf.central_frequency - conf.channel_bandwidth / 2.0,
            higher_frequency: conf.central_frequency + conf.channel_bandwidth / 2.0,
            cc: Vec::new(),
        };

        let max_cc_bandwidth = if conf.central_frequency > FR1_FR2_THRESHOLD {
            MAX_CC_BANDWIDTH_FR2
        } else {
            MAX_CC_BANDWIDTH_FR1
        };

        let cc_bandwidth = max_cc_bandwidth.min(conf.channel_bandwidth / conf.num_cc as f64);

        for cc_position in 0..conf.num_cc {
            let cc = self.create_cc(
                cc_bandwidth,
                band.lower_frequency,
                cc_position,
                conf.num_bwp_per_cc,
                conf.scenario,
            )?;
            band.add_cc(cc)?;
        }

        Ok(band)
    }

    /// Build an operation band from component carriers at arbitrary,
    /// possibly non-contiguous frequencies.
    ///
    /// Exactly one bandwidth part per component carrier is supported in
    /// this mode.
    pub fn create_operation_band_non_contiguous_cc(
        &mut self,
        configuration: &[SimpleOperationBandConf],
    ) -> Result<OperationBandInfo> {
        if configuration.is_empty() {
            return Err(SchedError::ConfigurationError(
                "an operation band needs at least one component carrier".into(),
            ));
        }

        let lower = configuration
            .iter()
            .map(|c| c.central_frequency - c.channel_bandwidth / 2.0)
            .fold(f64::INFINITY, f64::min);
        let higher = configuration
            .iter()
            .map(|c| c.central_frequency + c.channel_bandwidth / 2.0)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut band = OperationBandInfo {
            band_id: BandId(self.next_band_id()),
            central_frequency: (lower + higher) / 2.0,
            channel_bandwidth: higher - lower,
            lower_frequency: lower,
            higher_frequency: higher,
            cc: Vec::new(),
        };

        for conf in configuration {
            if conf.num_bwp_per_cc != 1 {
                return Err(SchedError::ConfigurationError(format!(
                    "non-contiguous CC at {:.2} MHz requests {} BWPs; exactly 1 is supported",
                    conf.central_frequency / 1e6,
                    conf.num_bwp_per_cc
                )));
            }
            let cc = self.create_cc(
                conf.channel_bandwidth,
                conf.central_frequency - conf.channel_bandwidth / 2.0,
                0,
                1,
                conf.scenario,
            )?;
            band.add_cc(cc)?;
        }

        Ok(band)
    }

    /// Flatten bands into one ordered BWP sequence.
    ///
    /// The positional index in the returned vector is the "BWP index"
    /// used by the schedulers and the BWP manager.
    pub fn get_all_bwps<'a>(bands: &[&'a OperationBandInfo]) -> Vec<&'a BandwidthPartInfo> {
        bands.iter().flat_map(|band| band.get_bwps()).collect()
    }

    /// Dump the band/CC/BWP layout as a gnuplot script.
    pub fn plot_configuration<W: Write>(bands: &[&OperationBandInfo], out: &mut W) -> Result<()> {
        let mut min_freq = f64::INFINITY;
        let mut max_freq = f64::NEG_INFINITY;
        for band in bands {
            min_freq = min_freq.min(band.lower_frequency);
            max_freq = max_freq.max(band.higher_frequency);
        }

        writeln!(out, "set term eps")?;
        writeln!(out, "set grid")?;
        writeln!(
            out,
            "set xrange [{}:{}]",
            min_freq * 1e-6 - 1.0,
            max_freq * 1e-6 + 1.0
        )?;
        writeln!(out, "set yrange [1:100]")?;
        writeln!(out, "set xlabel \"f [MHz]\"")?;

        // gnuplot object indices must be larger than zero
        let mut index = 1u16;
        for band in bands {
            let label = format!("n{}", band.band_id.0);
            Self::plot_frequency_band(
                out,
                index,
                band.lower_frequency * 1e-6,
                band.higher_frequency * 1e-6,
                70.0,
                90.0,
                &label,
            )?;
            index += 1;
            for cc in &band.cc {
                let label = format!("CC{}", cc.cc_id.0);
                Self::plot_frequency_band(
                    out,
                    index,
                    cc.lower_frequency * 1e-6,
                    cc.higher_frequency * 1e-6,
                    40.0,
                    60.0,
                    &label,
                )?;
                index += 1;
                for bwp in &cc.bwp {
                    let label = format!("BWP{}", bwp.bwp_id);
                    Self::plot_frequency_band(
                        out,
                        index,
                        bwp.lower_frequency * 1e-6,
                        bwp.higher_frequency * 1e-6,
                        10.0,
                        30.0,
                        &label,
                    )?;
                    index += 1;
                }
            }
        }

        writeln!(out, "unset key")?;
        writeln!(out, "plot -x")?;
        Ok(())
    }

    fn plot_frequency_band<W: Write>(
        out: &mut W,
        index: u16,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
        label: &str,
    ) -> Result<()> {
        writeln!(
            out,
            "set object {} rect from {},{} to {},{} front fs empty",
            index, xmin, ymin, xmax, ymax
        )?;
        writeln!(out, "LABEL{} = \"{}\"", index, label)?;
        writeln!(
            out,
            "set label {} at {},{} LABEL{}",
            index,
            xmin,
            (ymin + ymax) / 2.0,
            index
        )?;
        Ok(())
    }

    fn create_cc(
        &mut self,
        cc_bandwidth: f64,
        band_lower_freq: f64,
        cc_position: u8,
        bwp_number: u8,
        scenario: Scenario,
    ) -> Result<ComponentCarrierInfo> {
        let lower = band_lower_freq + cc_position as f64 * cc_bandwidth;
        let mut cc = ComponentCarrierInfo {
            cc_id: CcId(self.next_cc_id()),
            central_frequency: lower + cc_bandwidth / 2.0,
            lower_frequency: lower,
            higher_frequency: lower + cc_bandwidth,
            channel_bandwidth: cc_bandwidth,
            bwp: Vec::new(),
        };

        let bwp_bandwidth = cc_bandwidth / bwp_number as f64;
        for bwp_position in 0..bwp_number {
            let bwp_lower = cc.lower_frequency + bwp_position as f64 * bwp_bandwidth;
            let bwp = BandwidthPartInfo {
                bwp_id: BwpId(self.next_bwp_id()),
                central_frequency: bwp_lower + bwp_bandwidth / 2.0,
                lower_frequency: bwp_lower,
                higher_frequency: bwp_lower + bwp_bandwidth,
                channel_bandwidth: bwp_bandwidth,
                scenario,
            };
            cc.add_bwp(bwp)?;
        }

        Ok(cc)
    }

    fn next_band_id(&mut self) -> u8 {
        let id = self.operation_band_counter;
        self.operation_band_counter += 1;
        id
    }

    fn next_cc_id(&mut self) -> u8 {
        let id = self.component_carrier_counter;
        self.component_carrier_counter += 1;
        id
    }

    fn next_bwp_id(&mut self) -> u8 {
        let id = self.bandwidth_part_counter;
        self.bandwidth_part_counter += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contiguous(num_cc: u8, num_bwp: u8) -> OperationBandInfo {
        let mut creator = CcBwpCreator::new();
        let mut conf = SimpleOperationBandConf::new(3.5e9, 100e6, num_cc);
        conf.num_bwp_per_cc = num_bwp;
        creator.create_operation_band_contiguous_cc(&conf).unwrap()
    }

    #[test]
    fn test_contiguous_band_non_overlap() {
        let band = contiguous(4, 2);
        assert_eq!(band.cc.len(), 4);

        for pair in band.cc.windows(2) {
            assert!(pair[0].higher_frequency <= pair[1].lower_frequency);
        }
        for cc in &band.cc {
            assert!(cc.lower_frequency >= band.lower_frequency);
            assert!(cc.higher_frequency <= band.higher_frequency + 1.0);
            assert_eq!(cc.bwp.len(), 2);
            for pair in cc.bwp.windows(2) {
                assert!(pair[0].higher_frequency <= pair[1].lower_frequency);
            }
            for bwp in &cc.bwp {
                assert!(bwp.lower_frequency >= cc.lower_frequency);
                assert!(bwp.higher_frequency <= cc.higher_frequency + 1.0);
            }
        }
    }

    #[test]
    fn test_bwp_ids_unique_across_bands() {
        let mut creator = CcBwpCreator::new();
        let conf_a = SimpleOperationBandConf::new(3.5e9, 100e6, 2);
        let conf_b = SimpleOperationBandConf::new(28e9, 400e6, 2);
        let band_a = creator.create_operation_band_contiguous_cc(&conf_a).unwrap();
        let band_b = creator.create_operation_band_contiguous_cc(&conf_b).unwrap();

        let bwps = CcBwpCreator::get_all_bwps(&[&band_a, &band_b]);
        assert_eq!(bwps.len(), 4);
        for (i, bwp) in bwps.iter().enumerate() {
            // ids assigned in creation order, matching the flattened index
            assert_eq!(bwp.bwp_id, BwpId(i as u8));
        }
    }

    #[test]
    fn test_cc_bandwidth_capped_per_regime() {
        let mut creator = CcBwpCreator::new();

        // 400 MHz in FR1 split over a single CC must be capped at 198 MHz
        let conf = SimpleOperationBandConf::new(3.5e9, 400e6, 1);
        let band = creator.create_operation_band_contiguous_cc(&conf).unwrap();
        assert!((band.cc[0].channel_bandwidth - MAX_CC_BANDWIDTH_FR1).abs() < 1.0);

        // the same request above 6 GHz is allowed up to 396 MHz
        let conf = SimpleOperationBandConf::new(28e9, 400e6, 1);
        let band = creator.create_operation_band_contiguous_cc(&conf).unwrap();
        assert!((band.cc[0].channel_bandwidth - MAX_CC_BANDWIDTH_FR2).abs() < 1.0);
    }

    #[test]
    fn test_non_contiguous_requires_single_bwp() {
        let mut creator = CcBwpCreator::new();
        let mut conf = SimpleOperationBandConf::new(2.1e9, 20e6, 1);
        conf.num_bwp_per_cc = 2;
        let err = creator.create_operation_band_non_contiguous_cc(&[conf]);
        assert!(matches!(err, Err(SchedError::ConfigurationError(_))));
    }

    #[test]
    fn test_non_contiguous_placement() {
        let mut creator = CcBwpCreator::new();
        let confs = [
            SimpleOperationBandConf::new(2.1e9, 20e6, 1),
            SimpleOperationBandConf::new(2.6e9, 40e6, 1),
        ];
        let band = creator
            .create_operation_band_non_contiguous_cc(&confs)
            .unwrap();
        assert_eq!(band.cc.len(), 2);
        assert!((band.cc[0].central_frequency - 2.1e9).abs() < 1.0);
        assert!((band.cc[1].central_frequency - 2.6e9).abs() < 1.0);
        assert_eq!(band.get_bwps().len(), 2);
    }

    #[test]
    fn test_manual_overlap_is_fatal() {
        let mut band = OperationBandInfo {
            band_id: BandId(0),
            central_frequency: 2.0e9,
            channel_bandwidth: 100e6,
            lower_frequency: 1.95e9,
            higher_frequency: 2.05e9,
            cc: Vec::new(),
        };

        let cc = |id: u8, lower: f64, higher: f64| ComponentCarrierInfo {
            cc_id: CcId(id),
            central_frequency: (lower + higher) / 2.0,
            lower_frequency: lower,
            higher_frequency: higher,
            channel_bandwidth: higher - lower,
            bwp: Vec::new(),
        };

        band.add_cc(cc(0, 1.95e9, 2.0e9)).unwrap();
        let err = band.add_cc(cc(1, 1.99e9, 2.04e9));
        assert!(matches!(err, Err(SchedError::ConfigurationError(_))));
    }

    #[test]
    fn test_scenario_families() {
        assert_eq!(Scenario::UMa_LoS.family(), "UMa");
        assert_eq!(Scenario::UMa_Buildings.family(), "UMa");
        assert_eq!(Scenario::UMi_Buildings.family(), "UMi-StreetCanyon");
        assert_eq!(Scenario::InH_OfficeMixed_nLoS.family(), "InH-OfficeMixed");
        assert_eq!(Scenario::V2V_Highway.family(), "V2V-Highway");
    }

    #[test]
    fn test_plot_configuration_output() {
        let band = contiguous(2, 1);
        let mut out = Vec::new();
        CcBwpCreator::plot_configuration(&[&band], &mut out).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("set term eps"));
        assert!(script.contains("LABEL1 = \"n0\""));
        assert!(script.contains("CC0"));
        assert!(script.contains("BWP1"));
        assert!(script.ends_with("plot -x\n"));
    }
}
