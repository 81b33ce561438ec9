//! Inverse solver for damage immunity percentages.
//!
//! The game rounds immunity reduction down but always shaves at least one
//! point, so dividing absorbed by original damage misreads small hits badly.
//! Instead the solver searches the quantized candidate grid near the naive
//! ratio and keeps only percentages the forward formula verifies.

/// Immunities are quantized to whole-percent steps.
const IMMUNITY_STEP: f64 = 0.01;

/// Points removed from a raw damage amount at the given immunity fraction.
/// Any non-zero immunity shaves at least one point.
pub fn damage_reduced(before: i32, immunity: f64) -> i32 {
    if before <= 0 || immunity <= 0.0 {
        return 0;
    }
    ((before as f64 * immunity).floor() as i32).max(1)
}

pub fn damage_after(before: i32, immunity: f64) -> i32 {
    (before - damage_reduced(before, immunity)).max(0)
}

/// All quantized immunity fractions consistent with an observed
/// (damage dealt, damage absorbed) pair. The original amount is their sum.
pub fn reverse_immunity(after: i32, reduced: i32) -> Vec<f64> {
    if reduced <= 0 {
        return vec![0.0];
    }
    let before = after + reduced;
    if before <= 0 {
        return Vec::new();
    }
    let naive = reduced as f64 / before as f64;
    let lo = naive - IMMUNITY_STEP;
    let hi = naive + IMMUNITY_STEP;
    (0..=100)
        .map(|p| p as f64 / 100.0)
        .filter(|&pct| pct >= lo && pct <= hi)
        .filter(|&pct| damage_reduced(before, pct) == reduced)
        .collect()
}

/// Smallest candidate as a whole percentage. The shave-at-least-one-point
/// rule makes several percentages produce identical small-hit results, and
/// the smallest is the only one every observation supports.
pub fn pick_immunity(matches: &[f64]) -> Option<i32> {
    matches
        .iter()
        .copied()
        .reduce(f64::min)
        .map(|m| (m * 100.0).round() as i32)
}

/// Immunity percentage for a target from its best observed sample, where
/// `max_damage` is the damage that landed and `max_absorbed` the points the
/// immunity soaked on the same hit.
pub fn calculate_immunity_percentage(max_damage: i32, max_absorbed: i32) -> Option<i32> {
    if max_damage <= 0 {
        return None;
    }
    if max_absorbed <= 0 {
        return Some(0);
    }
    pick_immunity(&reverse_immunity(max_damage, max_absorbed))
}
