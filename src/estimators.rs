//! Incremental estimators for hidden enemy statistics. Each tracker consumes
//! observations one at a time and can produce an estimate at any point.

use std::fmt;

use hashbrown::HashMap;

use crate::event_models::SaveKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseEstimate {
    Exact(i32),
    Range(i32, i32),
    /// Observations are contradictory (a miss at or above the lowest hit).
    Approximate(i32),
    AtMost(i32),
    Above(i32),
    Unknown,
}

impl fmt::Display for DefenseEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefenseEstimate::Exact(v) => write!(f, "{v}"),
            DefenseEstimate::Range(lo, hi) => write!(f, "{lo}-{hi}"),
            DefenseEstimate::Approximate(v) => write!(f, "~{v}"),
            DefenseEstimate::AtMost(v) => write!(f, "≤{v}"),
            DefenseEstimate::Above(v) => write!(f, ">{v}"),
            DefenseEstimate::Unknown => write!(f, "-"),
        }
    }
}

/// Brackets an enemy's armor class from observed attack totals.
///
/// Invariant: every retained hit total is strictly greater than `max_miss`.
/// Misses prune hits they contradict, and hits at or below the highest miss
/// are dropped on arrival, so the two bounds can only tighten.
#[derive(Debug, Clone, Default)]
pub struct DefenseTracker {
    max_miss: Option<i32>,
    hits: Vec<i32>,
}

impl DefenseTracker {
    pub fn record_hit(&mut self, total: i32, was_nat20: bool) {
        // A natural 20 hits regardless of the total, so it says nothing.
        if was_nat20 {
            return;
        }
        if self.max_miss.is_some_and(|m| total <= m) {
            return;
        }
        self.hits.push(total);
    }

    pub fn record_miss(&mut self, total: i32, was_nat1: bool, was_concealment: bool) {
        // Natural 1s always miss, and a failed miss-chance roll never
        // consulted armor class. Neither bounds the defense.
        if was_nat1 || was_concealment {
            return;
        }
        if self.max_miss.is_none_or(|m| total > m) {
            self.max_miss = Some(total);
        }
        self.hits.retain(|&h| h > total);
    }

    pub fn min_hit(&self) -> Option<i32> {
        self.hits.iter().copied().min()
    }

    pub fn max_miss(&self) -> Option<i32> {
        self.max_miss
    }

    pub fn estimate(&self) -> DefenseEstimate {
        match (self.min_hit(), self.max_miss) {
            (Some(min_hit), Some(max_miss)) => {
                if max_miss + 1 == min_hit {
                    DefenseEstimate::Exact(min_hit)
                } else if max_miss < min_hit {
                    DefenseEstimate::Range(max_miss + 1, min_hit)
                } else {
                    DefenseEstimate::Approximate(min_hit)
                }
            }
            (Some(min_hit), None) => DefenseEstimate::AtMost(min_hit),
            (None, Some(max_miss)) => DefenseEstimate::Above(max_miss),
            (None, None) => DefenseEstimate::Unknown,
        }
    }
}

/// Estimates an attacker's bonus as the mode of observed bonus values.
#[derive(Debug, Clone, Default)]
pub struct AttackBonusTracker {
    counts: HashMap<i32, u32>,
}

impl AttackBonusTracker {
    pub fn record_bonus(&mut self, bonus: i32) {
        *self.counts.entry(bonus).or_insert(0) += 1;
    }

    /// Most frequent observed bonus; ties resolve to the higher value.
    pub fn estimate(&self) -> Option<i32> {
        self.counts
            .iter()
            .max_by_key(|&(&bonus, &count)| (count, bonus))
            .map(|(&bonus, _)| bonus)
    }

    pub fn sample_count(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// Highest observed save bonus per save kind. Buffed saves can only raise
/// the reading, never lower it.
#[derive(Debug, Clone, Default)]
pub struct SaveTracker {
    fortitude: Option<i32>,
    reflex: Option<i32>,
    will: Option<i32>,
}

impl SaveTracker {
    pub fn record(&mut self, kind: SaveKind, bonus: i32) {
        let slot = match kind {
            SaveKind::Fortitude => &mut self.fortitude,
            SaveKind::Reflex => &mut self.reflex,
            SaveKind::Will => &mut self.will,
        };
        if slot.is_none_or(|current| bonus > current) {
            *slot = Some(bonus);
        }
    }

    pub fn get(&self, kind: SaveKind) -> Option<i32> {
        match kind {
            SaveKind::Fortitude => self.fortitude,
            SaveKind::Reflex => self.reflex,
            SaveKind::Will => self.will,
        }
    }
}

/// Per-name tracker maps, keyed by target for defenses and saves and by
/// attacker for attack bonuses. Cloneable so a whole session of estimator
/// state can be checkpointed and restored.
#[derive(Debug, Clone, Default)]
pub struct TrackerRegistry {
    defense: HashMap<String, DefenseTracker>,
    attack_bonus: HashMap<String, AttackBonusTracker>,
    saves: HashMap<String, SaveTracker>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defense_mut(&mut self, target: &str) -> &mut DefenseTracker {
        self.defense.entry_ref(target).or_default()
    }

    pub fn attack_bonus_mut(&mut self, attacker: &str) -> &mut AttackBonusTracker {
        self.attack_bonus.entry_ref(attacker).or_default()
    }

    pub fn save_mut(&mut self, target: &str) -> &mut SaveTracker {
        self.saves.entry_ref(target).or_default()
    }

    pub fn defense(&self, target: &str) -> Option<&DefenseTracker> {
        self.defense.get(target)
    }

    pub fn attack_bonus(&self, attacker: &str) -> Option<&AttackBonusTracker> {
        self.attack_bonus.get(attacker)
    }

    pub fn saves(&self, target: &str) -> Option<&SaveTracker> {
        self.saves.get(target)
    }

    pub fn snapshot(&self) -> TrackerRegistry {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: &TrackerRegistry) {
        *self = snapshot.clone();
    }

    pub fn clear(&mut self) {
        self.defense.clear();
        self.attack_bonus.clear();
        self.saves.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defense_exact_after_bracketing_sequence() {
        let mut tracker = DefenseTracker::default();
        tracker.record_hit(21, false);
        tracker.record_miss(15, false, false);
        tracker.record_hit(16, false);
        assert_eq!(tracker.estimate(), DefenseEstimate::Exact(16));
        assert_eq!(tracker.estimate().to_string(), "16");
    }

    #[test]
    fn defense_range_when_bounds_apart() {
        let mut tracker = DefenseTracker::default();
        tracker.record_hit(18, false);
        tracker.record_miss(14, false, false);
        assert_eq!(tracker.estimate(), DefenseEstimate::Range(15, 18));
        assert_eq!(tracker.estimate().to_string(), "15-18");
    }

    #[test]
    fn defense_hits_only_and_misses_only() {
        let mut hits = DefenseTracker::default();
        hits.record_hit(19, false);
        assert_eq!(hits.estimate().to_string(), "≤19");

        let mut misses = DefenseTracker::default();
        misses.record_miss(12, false, false);
        assert_eq!(misses.estimate().to_string(), ">12");

        assert_eq!(DefenseTracker::default().estimate().to_string(), "-");
    }

    #[test]
    fn defense_miss_prunes_contradicted_hits() {
        let mut tracker = DefenseTracker::default();
        tracker.record_hit(16, false);
        tracker.record_miss(18, false, false);
        assert_eq!(tracker.min_hit(), None);
        assert_eq!(tracker.estimate(), DefenseEstimate::Above(18));
    }

    #[test]
    fn defense_redundant_hit_dropped_on_arrival() {
        let mut tracker = DefenseTracker::default();
        tracker.record_miss(15, false, false);
        tracker.record_hit(12, false);
        assert_eq!(tracker.min_hit(), None);
        assert_eq!(tracker.estimate(), DefenseEstimate::Above(15));
    }

    #[test]
    fn defense_ignores_natural_rolls_and_concealment() {
        let mut tracker = DefenseTracker::default();
        tracker.record_hit(26, true);
        tracker.record_miss(3, true, false);
        tracker.record_miss(22, false, true);
        assert_eq!(tracker.estimate(), DefenseEstimate::Unknown);
    }

    #[test]
    fn defense_approximate_on_contradiction() {
        let tracker = DefenseTracker {
            max_miss: Some(16),
            hits: vec![16],
        };
        assert_eq!(tracker.estimate(), DefenseEstimate::Approximate(16));
        assert_eq!(tracker.estimate().to_string(), "~16");
    }

    #[test]
    fn attack_bonus_mode_with_tie_to_higher() {
        let mut tracker = AttackBonusTracker::default();
        for bonus in [5, 7, 7, 5] {
            tracker.record_bonus(bonus);
        }
        assert_eq!(tracker.estimate(), Some(7));

        let mut tracker = AttackBonusTracker::default();
        for bonus in [5, 5, 7] {
            tracker.record_bonus(bonus);
        }
        assert_eq!(tracker.estimate(), Some(5));
        assert_eq!(tracker.sample_count(), 3);
    }

    #[test]
    fn save_tracker_keeps_max_per_kind() {
        let mut tracker = SaveTracker::default();
        tracker.record(SaveKind::Fortitude, 8);
        tracker.record(SaveKind::Fortitude, 5);
        tracker.record(SaveKind::Reflex, 2);
        assert_eq!(tracker.get(SaveKind::Fortitude), Some(8));
        assert_eq!(tracker.get(SaveKind::Reflex), Some(2));
        assert_eq!(tracker.get(SaveKind::Will), None);
    }

    #[test]
    fn registry_snapshot_and_restore() {
        let mut registry = TrackerRegistry::new();
        registry.defense_mut("Goblin").record_hit(21, false);
        let snapshot = registry.snapshot();

        registry.defense_mut("Goblin").record_miss(15, false, false);
        registry.attack_bonus_mut("Woo").record_bonus(6);
        registry.restore(&snapshot);

        assert_eq!(
            registry.defense("Goblin").map(|t| t.estimate()),
            Some(DefenseEstimate::AtMost(21))
        );
        assert!(registry.attack_bonus("Woo").is_none());
    }
}
