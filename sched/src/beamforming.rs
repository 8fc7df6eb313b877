//! Beamforming Assignment
//!
//! Computes per-(gNB, UE) antenna steering vectors and pushes them into
//! both endpoints, so the channel quality the scheduler later sees
//! reflects the chosen beams. Two drivers exist: the ideal helper redoes
//! every registered pair on a fixed simulated-time period, the realistic
//! helper recomputes a single pair when enough SRS reports for it have
//! arrived.

use std::cell::RefCell;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::{BeamConfId, BeamId};

use crate::{Result, SchedError};

/// Antenna panel geometry, half-wavelength element spacing.
#[derive(Debug, Clone, Copy)]
pub struct AntennaArray {
    pub num_rows: u32,
    pub num_columns: u32,
    /// Azimuth sectors the panel can steer across
    pub num_sectors: u16,
}

impl AntennaArray {
    pub fn new(num_rows: u32, num_columns: u32, num_sectors: u16) -> Self {
        Self {
            num_rows,
            num_columns,
            num_sectors,
        }
    }

    pub fn num_elements(&self) -> u32 {
        self.num_rows * self.num_columns
    }

    /// Boresight azimuth of a sector, radians.
    pub fn sector_azimuth(&self, sector: u16) -> f64 {
        2.0 * PI * sector as f64 / self.num_sectors as f64
    }

    /// Sector whose boresight is closest to an azimuth.
    pub fn closest_sector(&self, azimuth_rad: f64) -> u16 {
        let norm = azimuth_rad.rem_euclid(2.0 * PI);
        let raw = (norm * self.num_sectors as f64 / (2.0 * PI)).round() as u16;
        raw % self.num_sectors
    }
}

/// A steering vector: one phase per element, unit magnitude, identified
/// by the beam it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamformingVector {
    /// Phase per antenna element, radians
    pub phases: Vec<f64>,
    pub beam_id: BeamId,
}

impl BeamformingVector {
    /// Steering vector of a planar array toward (azimuth, elevation).
    pub fn directional(array: &AntennaArray, azimuth_rad: f64, elevation_rad: f64) -> Self {
        let zenith = PI / 2.0 - elevation_rad;
        let u = zenith.sin() * azimuth_rad.cos();
        let v = zenith.sin() * azimuth_rad.sin();
        let mut phases = Vec::with_capacity(array.num_elements() as usize);
        for row in 0..array.num_rows {
            for col in 0..array.num_columns {
                phases.push(-PI * (col as f64 * u + row as f64 * v));
            }
        }
        let beam_id = BeamId::new(
            array.closest_sector(azimuth_rad),
            (elevation_rad.to_degrees() * 100.0) as i16,
        );
        Self { phases, beam_id }
    }

    /// Flat phase front covering the whole sector, used before any
    /// beamforming has run.
    pub fn quasi_omni(array: &AntennaArray) -> Self {
        Self {
            phases: vec![0.0; array.num_elements() as usize],
            beam_id: BeamId::QUASI_OMNI,
        }
    }

    /// Array gain of this vector toward a direction, linear.
    pub fn gain_toward(&self, array: &AntennaArray, azimuth_rad: f64, elevation_rad: f64) -> f64 {
        let target = Self::directional(array, azimuth_rad, elevation_rad);
        let mut re = 0.0;
        let mut im = 0.0;
        for (a, b) in self.phases.iter().zip(&target.phases) {
            re += (a - b).cos();
            im += (a - b).sin();
        }
        (re * re + im * im).sqrt() / self.phases.len() as f64
    }
}

/// Per-panel beam bookkeeping of one device.
///
/// One vector is active on the panel at any time; vectors computed toward
/// specific peers are stored and swapped in when transmitting to them.
#[derive(Debug)]
pub struct BeamManager {
    array: AntennaArray,
    active: BeamformingVector,
    stored: HashMap<u32, BeamformingVector>,
    predefined: Option<BeamformingVector>,
}

impl BeamManager {
    pub fn new(array: AntennaArray) -> Self {
        let active = BeamformingVector::quasi_omni(&array);
        Self {
            array,
            active,
            stored: HashMap::new(),
            predefined: None,
        }
    }

    pub fn array(&self) -> &AntennaArray {
        &self.array
    }

    pub fn active_beam_id(&self) -> BeamId {
        self.active.beam_id
    }

    /// Fix one beam for all transmissions, overriding the per-peer store.
    pub fn set_predefined_beam(&mut self, sector: u16, elevation_deg: f64) {
        let azimuth = self.array.sector_azimuth(sector);
        self.predefined = Some(BeamformingVector::directional(
            &self.array,
            azimuth,
            elevation_deg.to_radians(),
        ));
    }

    /// Store the vector to use toward a peer, replacing any previous one.
    pub fn save_beamforming_vector(&mut self, peer: u32, bfv: BeamformingVector) {
        if self.predefined.is_some() {
            warn!(
                "Saving beamforming vector toward node {} while a predefined beam overrides it",
                peer
            );
        }
        debug!("Save beamforming vector toward node {}: {:?}", peer, bfv.beam_id);
        self.stored.insert(peer, bfv);
    }

    /// Activate the vector stored for a peer; falls back to the
    /// predefined beam, then to quasi-omni.
    pub fn change_beamforming_vector(&mut self, peer: u32) {
        match self.stored.get(&peer) {
            Some(bfv) => self.active = bfv.clone(),
            None => match &self.predefined {
                Some(bfv) => self.active = bfv.clone(),
                None => self.change_to_quasi_omni(),
            },
        }
    }

    pub fn change_to_quasi_omni(&mut self) {
        self.active = BeamformingVector::quasi_omni(&self.array);
    }

    /// Beam id stored toward a peer, quasi-omni when nothing is stored.
    pub fn beam_id_toward(&self, peer: u32) -> BeamId {
        self.stored
            .get(&peer)
            .map(|bfv| bfv.beam_id)
            .or_else(|| self.predefined.as_ref().map(|bfv| bfv.beam_id))
            .unwrap_or(BeamId::QUASI_OMNI)
    }
}

/// One side of a beamforming task: a node with one antenna panel per
/// stream at a position.
#[derive(Debug)]
pub struct BeamformingEndpoint {
    pub node_id: u32,
    /// Position in meters, (x, y, z)
    pub position: [f64; 3],
    /// One beam manager per stream
    pub panels: Vec<BeamManager>,
}

impl BeamformingEndpoint {
    pub fn new(node_id: u32, position: [f64; 3], panels: Vec<BeamManager>) -> Self {
        Self {
            node_id,
            position,
            panels,
        }
    }

    /// Beam pairing toward a peer as the scheduler's grouping key: the
    /// first stream's beam is primary, the second (if any) secondary.
    pub fn beam_conf_id_toward(&self, peer: u32) -> BeamConfId {
        let primary = self.panels[0].beam_id_toward(peer);
        let secondary = self.panels.get(1).map(|p| p.beam_id_toward(peer));
        BeamConfId::new(primary, secondary)
    }
}

pub type EndpointHandle = Rc<RefCell<BeamformingEndpoint>>;

/// Direction of the line-of-sight path from `from` to `to` as
/// (azimuth, elevation), radians.
fn los_direction(from: [f64; 3], to: [f64; 3]) -> (f64, f64) {
    let dx = to[0] - from[0];
    let dy = to[1] - from[1];
    let dz = to[2] - from[2];
    let horiz = (dx * dx + dy * dy).sqrt();
    (dy.atan2(dx), dz.atan2(horiz))
}

/// How an algorithm picks the vector pair for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeamformingMethod {
    /// Exhaustive scan over the sector grid, best aligned pair wins
    CellScan,
    /// Steer both sides along the line-of-sight path
    DirectPath,
}

/// Computes a (gNB-side, UE-side) vector pair for one antenna pairing.
pub trait BeamformingAlgorithm: std::fmt::Debug {
    fn beamforming_vectors(
        &self,
        gnb: &BeamformingEndpoint,
        ue: &BeamformingEndpoint,
        stream: usize,
    ) -> (BeamformingVector, BeamformingVector);
}

/// Steer both endpoints along the line-of-sight path.
#[derive(Debug, Default)]
pub struct DirectPathBeamforming;

impl BeamformingAlgorithm for DirectPathBeamforming {
    fn beamforming_vectors(
        &self,
        gnb: &BeamformingEndpoint,
        ue: &BeamformingEndpoint,
        stream: usize,
    ) -> (BeamformingVector, BeamformingVector) {
        let (az_fwd, el_fwd) = los_direction(gnb.position, ue.position);
        let (az_rev, el_rev) = los_direction(ue.position, gnb.position);
        let gnb_bfv =
            BeamformingVector::directional(gnb.panels[stream].array(), az_fwd, el_fwd);
        let ue_bfv = BeamformingVector::directional(ue.panels[stream].array(), az_rev, el_rev);
        (gnb_bfv, ue_bfv)
    }
}

/// Scan the gNB sector/elevation grid and keep the candidate with the
/// highest array gain toward the UE.
///
/// The UE side always points back along the line of sight; only the gNB
/// side is scanned, mirroring a sweep of SSB beams.
#[derive(Debug)]
pub struct CellScanBeamforming {
    /// Elevation steps scanned, degrees
    pub elevations_deg: Vec<f64>,
}

impl Default for CellScanBeamforming {
    fn default() -> Self {
        Self {
            elevations_deg: vec![-30.0, -15.0, 0.0, 15.0, 30.0],
        }
    }
}

impl BeamformingAlgorithm for CellScanBeamforming {
    fn beamforming_vectors(
        &self,
        gnb: &BeamformingEndpoint,
        ue: &BeamformingEndpoint,
        stream: usize,
    ) -> (BeamformingVector, BeamformingVector) {
        let array = *gnb.panels[stream].array();
        let (az_los, el_los) = los_direction(gnb.position, ue.position);

        let mut best: Option<(f64, BeamformingVector)> = None;
        for sector in 0..array.num_sectors {
            for &elevation_deg in &self.elevations_deg {
                let candidate = BeamformingVector::directional(
                    &array,
                    array.sector_azimuth(sector),
                    elevation_deg.to_radians(),
                );
                let gain = candidate.gain_toward(&array, az_los, el_los);
                if best.as_ref().map_or(true, |(g, _)| gain > *g) {
                    best = Some((gain, candidate));
                }
            }
        }
        // the grid always has at least one candidate
        let (gain, gnb_bfv) = best.unwrap_or_else(|| {
            let bfv = BeamformingVector::directional(&array, az_los, el_los);
            (1.0, bfv)
        });
        debug!(
            "Cell scan for node {} -> {}: best beam {:?}, gain {:.3}",
            gnb.node_id, ue.node_id, gnb_bfv.beam_id, gain
        );

        let (az_rev, el_rev) = los_direction(ue.position, gnb.position);
        let ue_bfv = BeamformingVector::directional(ue.panels[stream].array(), az_rev, el_rev);
        (gnb_bfv, ue_bfv)
    }
}

fn algorithm_for(method: BeamformingMethod) -> Box<dyn BeamformingAlgorithm> {
    match method {
        BeamformingMethod::CellScan => Box::new(CellScanBeamforming::default()),
        BeamformingMethod::DirectPath => Box::new(DirectPathBeamforming),
    }
}

/// A UE whose beam pairing changed; the integration layer forwards these
/// to the affected schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamUpdate {
    pub ue_node_id: u32,
    pub beam_conf_id: BeamConfId,
}

fn run_task(
    algorithm: &dyn BeamformingAlgorithm,
    gnb: &EndpointHandle,
    ue: &EndpointHandle,
    stream: usize,
) {
    let (gnb_bfv, ue_bfv) = {
        let gnb = gnb.borrow();
        let ue = ue.borrow();
        algorithm.beamforming_vectors(&gnb, &ue, stream)
    };
    let mut gnb = gnb.borrow_mut();
    let mut ue = ue.borrow_mut();
    let gnb_id = gnb.node_id;
    let ue_id = ue.node_id;
    gnb.panels[stream].save_beamforming_vector(ue_id, gnb_bfv);
    ue.panels[stream].save_beamforming_vector(gnb_id, ue_bfv);
    // the UE has no notion of a pending beam: switch right away
    ue.panels[stream].change_beamforming_vector(gnb_id);
}

/// Streams a (gNB, UE) pair can beamform: limited by the smaller side.
fn paired_streams(gnb: &EndpointHandle, ue: &EndpointHandle) -> Result<usize> {
    let streams = gnb.borrow().panels.len().min(ue.borrow().panels.len());
    if streams == 0 {
        return Err(SchedError::ConfigurationError(format!(
            "beamforming task between nodes {} and {} with zero streams",
            gnb.borrow().node_id,
            ue.borrow().node_id
        )));
    }
    Ok(streams)
}

/// Periodic beamforming over every registered pair.
///
/// The surrounding event loop owns the clock: it asks for the next firing
/// time and calls [`IdealBeamformingHelper::expire_timer`] when simulated
/// time reaches it. The deadline is recomputed on every firing.
#[derive(Debug)]
pub struct IdealBeamformingHelper {
    algorithm: Box<dyn BeamformingAlgorithm>,
    periodicity_ms: u64,
    next_run_ms: Option<u64>,
    tasks: Vec<(EndpointHandle, EndpointHandle, usize)>,
}

impl IdealBeamformingHelper {
    pub fn new(method: BeamformingMethod, periodicity_ms: u64) -> Result<Self> {
        if periodicity_ms == 0 {
            return Err(SchedError::ConfigurationError(
                "beamforming periodicity must be greater than 0 ms".into(),
            ));
        }
        Ok(Self {
            algorithm: algorithm_for(method),
            periodicity_ms,
            next_run_ms: Some(periodicity_ms),
            tasks: Vec::new(),
        })
    }

    pub fn periodicity_ms(&self) -> u64 {
        self.periodicity_ms
    }

    /// Simulated time of the next periodic run.
    pub fn next_run_ms(&self) -> Option<u64> {
        self.next_run_ms
    }

    /// Register a pair, one task per common stream, and run them once
    /// immediately so the pair never communicates quasi-omni for a whole
    /// period.
    pub fn add_beamforming_task(
        &mut self,
        gnb: EndpointHandle,
        ue: EndpointHandle,
    ) -> Result<Vec<BeamUpdate>> {
        let streams = paired_streams(&gnb, &ue)?;
        for stream in 0..streams {
            run_task(self.algorithm.as_ref(), &gnb, &ue, stream);
            self.tasks.push((gnb.clone(), ue.clone(), stream));
        }
        Ok(vec![beam_update(&gnb, &ue)])
    }

    /// Recompute every registered task.
    pub fn run(&mut self) -> Vec<BeamUpdate> {
        info!(
            "Running the beamforming method. There are: {} tasks.",
            self.tasks.len()
        );
        for (gnb, ue, stream) in &self.tasks {
            run_task(self.algorithm.as_ref(), gnb, ue, *stream);
        }
        let mut updates = Vec::new();
        for (gnb, ue, stream) in &self.tasks {
            if *stream == 0 {
                updates.push(beam_update(gnb, ue));
            }
        }
        updates
    }

    /// Periodic timer firing: run everything and move the deadline.
    pub fn expire_timer(&mut self, now_ms: u64) -> Vec<BeamUpdate> {
        debug!("Beamforming timer expired; programming a beamforming");
        let updates = self.run();
        self.next_run_ms = Some(now_ms + self.periodicity_ms);
        updates
    }
}

fn beam_update(gnb: &EndpointHandle, ue: &EndpointHandle) -> BeamUpdate {
    let gnb = gnb.borrow();
    let ue = ue.borrow();
    BeamUpdate {
        ue_node_id: ue.node_id,
        beam_conf_id: gnb.beam_conf_id_toward(ue.node_id),
    }
}

/// SRS-triggered beamforming: one independent task per antenna pairing,
/// each firing after enough SRS reports for that pairing arrived.
#[derive(Debug)]
pub struct RealisticBeamformingHelper {
    algorithm: Box<dyn BeamformingAlgorithm>,
    /// Reports needed before a task recomputes its pair
    srs_reports_to_trigger: u32,
    tasks: HashMap<(u32, u32, usize), SrsTask>,
}

#[derive(Debug)]
struct SrsTask {
    gnb: EndpointHandle,
    ue: EndpointHandle,
    stream: usize,
    srs_count: u32,
}

impl RealisticBeamformingHelper {
    pub fn new(method: BeamformingMethod, srs_reports_to_trigger: u32) -> Result<Self> {
        if srs_reports_to_trigger == 0 {
            return Err(SchedError::ConfigurationError(
                "SRS trigger count must be greater than 0".into(),
            ));
        }
        Ok(Self {
            algorithm: algorithm_for(method),
            srs_reports_to_trigger,
            tasks: HashMap::new(),
        })
    }

    /// Register a pair. Registering the same antenna pairing twice is a
    /// configuration mistake.
    pub fn add_beamforming_task(&mut self, gnb: EndpointHandle, ue: EndpointHandle) -> Result<()> {
        let streams = paired_streams(&gnb, &ue)?;
        let gnb_id = gnb.borrow().node_id;
        let ue_id = ue.borrow().node_id;
        for stream in 0..streams {
            let key = (gnb_id, ue_id, stream);
            if self.tasks.contains_key(&key) {
                return Err(SchedError::ConfigurationError(format!(
                    "beamforming task for nodes {} / {} stream {} already registered",
                    gnb_id, ue_id, stream
                )));
            }
            self.tasks.insert(
                key,
                SrsTask {
                    gnb: gnb.clone(),
                    ue: ue.clone(),
                    stream,
                    srs_count: 0,
                },
            );
        }
        Ok(())
    }

    /// SRS SINR report from the gNB PHY for one pairing. Returns the beam
    /// update when the report count reaches the trigger.
    pub fn on_srs_report(
        &mut self,
        gnb_id: u32,
        ue_id: u32,
        stream: usize,
        sinr_db: f64,
    ) -> Result<Option<BeamUpdate>> {
        let trigger = self.srs_reports_to_trigger;
        let task = self
            .tasks
            .get_mut(&(gnb_id, ue_id, stream))
            .ok_or_else(|| {
                SchedError::InvalidState(format!(
                    "SRS report for unregistered pairing {} / {} stream {}",
                    gnb_id, ue_id, stream
                ))
            })?;
        task.srs_count += 1;
        debug!(
            "SRS report {}/{} for nodes {} / {} stream {} (SINR {:.1} dB)",
            task.srs_count, trigger, gnb_id, ue_id, stream, sinr_db
        );
        if task.srs_count < trigger {
            return Ok(None);
        }
        task.srs_count = 0;
        run_task(self.algorithm.as_ref(), &task.gnb, &task.ue, task.stream);
        Ok(Some(beam_update(&task.gnb, &task.ue)))
    }
}
