//! Channel Model Arena
//!
//! Channel, propagation-loss and fading model instances are shared by
//! every gNB and UE PHY tuned to the same bandwidth part, and their
//! random streams must be initialized exactly once. The arena keys the
//! shared instances by BWP id and tracks initialization explicitly
//! instead of deduplicating by pointer identity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use common::BwpId;

use crate::spectrum::{BandwidthPartInfo, Scenario};

/// The shared per-BWP channel state handed out to every PHY on that BWP.
///
/// Only the numeric summary the scheduler consumes is modelled here; the
/// signal-processing internals live outside this subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelModel {
    /// BWP this model belongs to
    pub bwp_id: BwpId,
    /// Scenario the model was built for
    pub scenario: Scenario,
    /// Central frequency of the BWP in Hz
    pub central_frequency: f64,
}

/// Arena of lazily created, shared channel models indexed by BWP id.
#[derive(Debug, Default)]
pub struct ChannelModelArena {
    models: HashMap<BwpId, Arc<ChannelModel>>,
    initialized: BTreeSet<BwpId>,
}

impl ChannelModelArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel model of a BWP, creating it on first access.
    ///
    /// Every subsequent call for the same BWP returns a handle to the
    /// same instance.
    pub fn get_or_init(&mut self, bwp: &BandwidthPartInfo) -> Arc<ChannelModel> {
        if let Some(model) = self.models.get(&bwp.bwp_id) {
            return Arc::clone(model);
        }

        debug!(
            "Initializing channel model for BWP {} scenario {}",
            bwp.bwp_id,
            bwp.scenario.family()
        );
        let model = Arc::new(ChannelModel {
            bwp_id: bwp.bwp_id,
            scenario: bwp.scenario,
            central_frequency: bwp.central_frequency,
        });
        self.models.insert(bwp.bwp_id, Arc::clone(&model));
        self.initialized.insert(bwp.bwp_id);
        model
    }

    /// Whether the model of a BWP has already been created.
    pub fn is_initialized(&self, bwp_id: BwpId) -> bool {
        self.initialized.contains(&bwp_id)
    }

    /// BWPs with an initialized model, in id order.
    pub fn initialized_bwps(&self) -> impl Iterator<Item = BwpId> + '_ {
        self.initialized.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bwp(id: u8) -> BandwidthPartInfo {
        BandwidthPartInfo {
            bwp_id: BwpId(id),
            central_frequency: 3.5e9,
            lower_frequency: 3.45e9,
            higher_frequency: 3.55e9,
            channel_bandwidth: 100e6,
            scenario: Scenario::UMa,
        }
    }

    #[test]
    fn test_model_created_once_and_shared() {
        let mut arena = ChannelModelArena::new();
        assert!(!arena.is_initialized(BwpId(0)));

        let a = arena.get_or_init(&bwp(0));
        let b = arena.get_or_init(&bwp(0));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(arena.is_initialized(BwpId(0)));
    }

    #[test]
    fn test_models_keyed_by_bwp() {
        let mut arena = ChannelModelArena::new();
        let a = arena.get_or_init(&bwp(0));
        let b = arena.get_or_init(&bwp(1));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(
            arena.initialized_bwps().collect::<Vec<_>>(),
            vec![BwpId(0), BwpId(1)]
        );
    }
}
