//! Common Utilities
//!
//! Bit-mask helpers for resource block group bitmaps and small numeric
//! helpers shared across the scheduling subsystem.

/// Count the set positions in an RBG bitmap
pub fn mask_popcount(mask: &[bool]) -> usize {
    mask.iter().filter(|b| **b).count()
}

/// Count the cleared (notched) positions in an RBG bitmap
pub fn mask_zeroes(mask: &[bool]) -> usize {
    mask.len() - mask_popcount(mask)
}

/// Render a bitmap as a compact `1`/`0` string for log output
pub fn mask_to_string(mask: &[bool]) -> String {
    mask.iter().map(|b| if *b { '1' } else { '0' }).collect()
}

/// Calculate resource blocks from bandwidth and subcarrier spacing
pub fn calculate_num_rb(bandwidth_hz: f64, scs_khz: u16) -> u32 {
    // Each RB has 12 subcarriers
    const SUBCARRIERS_PER_RB: f64 = 12.0;

    let scs_hz = scs_khz as f64 * 1000.0;
    (bandwidth_hz / (scs_hz * SUBCARRIERS_PER_RB)) as u32
}
