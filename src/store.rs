//! Shared analytics store. All mutation and query paths funnel through one
//! mutex so the live poll loop, the past-log worker, and the command layer
//! always observe a consistent session.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::estimators::TrackerRegistry;
use crate::event_models::{AttackEvent, AttackOutcome, DamageEvent, SaveKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeTrackingMode {
    /// Each character's window runs from their own first to their own last
    /// damage, so one character idling never dilutes another's rate.
    #[default]
    PerCharacter,
    /// Every character shares one window from a common start to the global
    /// last damage timestamp.
    Global,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImmunityRecord {
    pub max_immunity: i32,
    pub max_damage: i32,
    pub sample_count: u32,
}

#[derive(Debug, Clone)]
struct DpsEntry {
    total_damage: i64,
    first_timestamp: NaiveDateTime,
    last_timestamp: NaiveDateTime,
    damage_by_type: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DpsRow {
    pub character: String,
    pub total_damage: i64,
    pub elapsed_seconds: i64,
    pub dps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeBreakdownRow {
    pub damage_type: String,
    pub total_damage: i64,
    pub dps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResistRow {
    pub damage_type: String,
    pub max_damage: i32,
    pub immunity_absorbed: i32,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackStats {
    pub hits: u32,
    pub critical_hits: u32,
    pub misses: u32,
    pub hit_rate: f64,
}

impl AttackStats {
    pub fn attempts(&self) -> u32 {
        self.hits + self.critical_hits + self.misses
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetStats {
    pub times_hit: u32,
    pub total_damage_taken: i64,
    pub total_absorbed: i64,
}

#[derive(Debug, Clone)]
pub struct TargetSummary {
    pub target: String,
    pub attack_bonus: String,
    pub armor_class: String,
    pub fortitude: String,
    pub reflex: String,
    pub will: String,
}

#[derive(Debug, Clone, Default)]
struct StoreInner {
    damage_events: Vec<DamageEvent>,
    attack_events: Vec<AttackEvent>,
    dps: HashMap<String, DpsEntry>,
    last_damage_timestamp: Option<NaiveDateTime>,
    /// target -> damage type -> best observed sample.
    immunity: HashMap<String, HashMap<String, ImmunityRecord>>,
}

/// Deep copy of the store's containers, produced before past logs merge in
/// so the live-only session can be brought back.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    inner: StoreInner,
}

#[derive(Debug, Default)]
pub struct DataStore {
    inner: Mutex<StoreInner>,
}

fn sort_desc_by_dps(rows: &mut [DpsRow]) {
    rows.sort_by(|a, b| b.dps.partial_cmp(&a.dps).unwrap_or(Ordering::Equal));
}

fn elapsed_secs(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    (end - start).num_seconds()
}

fn dps_over(total: i64, elapsed: i64) -> f64 {
    total as f64 / elapsed.max(1) as f64
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert_damage_event(&self, event: DamageEvent) {
        self.lock().damage_events.push(event);
    }

    pub fn insert_attack_event(&self, event: AttackEvent) {
        self.lock().attack_events.push(event);
    }

    pub fn update_dps_data(
        &self,
        character: &str,
        damage_amount: i32,
        timestamp: NaiveDateTime,
        damage_types: &[(String, i32)],
    ) {
        let mut inner = self.lock();
        if inner
            .last_damage_timestamp
            .is_none_or(|last| timestamp > last)
        {
            inner.last_damage_timestamp = Some(timestamp);
        }
        let entry = inner
            .dps
            .entry_ref(character)
            .or_insert_with(|| DpsEntry {
                total_damage: 0,
                first_timestamp: timestamp,
                last_timestamp: timestamp,
                damage_by_type: HashMap::new(),
            });
        entry.total_damage += i64::from(damage_amount);
        if timestamp < entry.first_timestamp {
            entry.first_timestamp = timestamp;
        }
        if timestamp > entry.last_timestamp {
            entry.last_timestamp = timestamp;
        }
        for (damage_type, amount) in damage_types {
            *entry.damage_by_type.entry_ref(damage_type.as_str()).or_insert(0) +=
                i64::from(*amount);
        }
    }

    /// Best-sample update for a (target, damage type) pair. The observation
    /// count always advances, but the stored pair only moves when the new
    /// hit dealt strictly more damage, keeping dealt and absorbed from the
    /// same swing.
    pub fn record_immunity(
        &self,
        target: &str,
        damage_type: &str,
        immunity_points: i32,
        damage_dealt: i32,
    ) {
        let mut inner = self.lock();
        let record = inner
            .immunity
            .entry_ref(target)
            .or_default()
            .entry_ref(damage_type)
            .or_default();
        record.sample_count += 1;
        if damage_dealt > record.max_damage {
            record.max_damage = damage_dealt;
            record.max_immunity = immunity_points;
        }
    }

    pub fn get_dps_data(
        &self,
        mode: TimeTrackingMode,
        global_start_time: Option<NaiveDateTime>,
    ) -> Vec<DpsRow> {
        let inner = self.lock();
        let Some(global_last) = inner.last_damage_timestamp else {
            return Vec::new();
        };
        let global_start = global_start_time
            .or_else(|| inner.dps.values().map(|d| d.first_timestamp).min());
        let mut rows: Vec<DpsRow> = inner
            .dps
            .iter()
            .filter_map(|(character, data)| {
                let (start, end) = match mode {
                    TimeTrackingMode::Global => (global_start?, global_last),
                    TimeTrackingMode::PerCharacter => {
                        (data.first_timestamp, data.last_timestamp)
                    }
                };
                let elapsed = elapsed_secs(start, end);
                Some(DpsRow {
                    character: character.clone(),
                    total_damage: data.total_damage,
                    elapsed_seconds: elapsed,
                    dps: dps_over(data.total_damage, elapsed),
                })
            })
            .collect();
        sort_desc_by_dps(&mut rows);
        rows
    }

    /// DPS restricted to damage dealt against one target. In per-character
    /// mode the window is the character's first and last damage against
    /// that target specifically; in global mode every view shares one
    /// encounter window ending at the store-wide last damage.
    pub fn get_dps_data_for_target(
        &self,
        target: &str,
        mode: TimeTrackingMode,
        global_start_time: Option<NaiveDateTime>,
    ) -> Vec<DpsRow> {
        let inner = self.lock();
        struct PerTarget {
            total: i64,
            first: NaiveDateTime,
            last: NaiveDateTime,
        }
        let mut per_attacker: HashMap<&str, PerTarget> = HashMap::new();
        for event in inner
            .damage_events
            .iter()
            .filter(|e| e.target == target && e.total_dealt > 0)
        {
            per_attacker
                .entry(event.attacker.as_str())
                .and_modify(|agg| {
                    agg.total += i64::from(event.total_dealt);
                    if event.timestamp < agg.first {
                        agg.first = event.timestamp;
                    }
                    if event.timestamp > agg.last {
                        agg.last = event.timestamp;
                    }
                })
                .or_insert(PerTarget {
                    total: i64::from(event.total_dealt),
                    first: event.timestamp,
                    last: event.timestamp,
                });
        }
        if per_attacker.is_empty() {
            return Vec::new();
        }
        let global_last = inner.last_damage_timestamp;
        let global_start =
            global_start_time.or_else(|| per_attacker.values().map(|a| a.first).min());
        let mut rows: Vec<DpsRow> = per_attacker
            .into_iter()
            .filter_map(|(attacker, agg)| {
                let (start, end) = match mode {
                    TimeTrackingMode::Global => (global_start?, global_last?),
                    TimeTrackingMode::PerCharacter => (agg.first, agg.last),
                };
                let elapsed = elapsed_secs(start, end);
                Some(DpsRow {
                    character: attacker.to_string(),
                    total_damage: agg.total,
                    elapsed_seconds: elapsed,
                    dps: dps_over(agg.total, elapsed),
                })
            })
            .collect();
        sort_desc_by_dps(&mut rows);
        rows
    }

    pub fn get_dps_breakdown_by_type(
        &self,
        character: &str,
        mode: TimeTrackingMode,
        global_start_time: Option<NaiveDateTime>,
    ) -> Vec<TypeBreakdownRow> {
        let inner = self.lock();
        let Some(data) = inner.dps.get(character) else {
            return Vec::new();
        };
        let Some(global_last) = inner.last_damage_timestamp else {
            return Vec::new();
        };
        let elapsed = match mode {
            TimeTrackingMode::Global => {
                let start = global_start_time
                    .or_else(|| inner.dps.values().map(|d| d.first_timestamp).min());
                match start {
                    Some(start) => elapsed_secs(start, global_last),
                    None => return Vec::new(),
                }
            }
            TimeTrackingMode::PerCharacter => {
                elapsed_secs(data.first_timestamp, data.last_timestamp)
            }
        };
        let mut rows: Vec<TypeBreakdownRow> = data
            .damage_by_type
            .iter()
            .map(|(damage_type, total)| TypeBreakdownRow {
                damage_type: damage_type.clone(),
                total_damage: *total,
                dps: dps_over(*total, elapsed),
            })
            .collect();
        rows.sort_by(|a, b| b.total_damage.cmp(&a.total_damage));
        rows
    }

    pub fn get_dps_breakdown_by_type_for_target(
        &self,
        character: &str,
        target: &str,
        mode: TimeTrackingMode,
        global_start_time: Option<NaiveDateTime>,
    ) -> Vec<TypeBreakdownRow> {
        let inner = self.lock();
        let mut by_type: HashMap<&str, i64> = HashMap::new();
        let mut first: Option<NaiveDateTime> = None;
        let mut last: Option<NaiveDateTime> = None;
        for event in inner
            .damage_events
            .iter()
            .filter(|e| e.attacker == character && e.target == target && e.total_dealt > 0)
        {
            *by_type.entry(event.damage_type.as_str()).or_insert(0) +=
                i64::from(event.total_dealt);
            if first.is_none_or(|f| event.timestamp < f) {
                first = Some(event.timestamp);
            }
            if last.is_none_or(|l| event.timestamp > l) {
                last = Some(event.timestamp);
            }
        }
        let (Some(first), Some(last)) = (first, last) else {
            return Vec::new();
        };
        let (start, end) = match mode {
            TimeTrackingMode::Global => {
                let Some(global_last) = inner.last_damage_timestamp else {
                    return Vec::new();
                };
                (global_start_time.unwrap_or(first), global_last)
            }
            TimeTrackingMode::PerCharacter => (first, last),
        };
        let elapsed = elapsed_secs(start, end);
        let mut rows: Vec<TypeBreakdownRow> = by_type
            .into_iter()
            .map(|(damage_type, total)| TypeBreakdownRow {
                damage_type: damage_type.to_string(),
                total_damage: total,
                dps: dps_over(total, elapsed),
            })
            .collect();
        rows.sort_by(|a, b| b.total_damage.cmp(&a.total_damage));
        rows
    }

    pub fn get_target_resists(&self, target: &str) -> Vec<ResistRow> {
        let inner = self.lock();
        let Some(by_type) = inner.immunity.get(target) else {
            return Vec::new();
        };
        let mut rows: Vec<ResistRow> = by_type
            .iter()
            .map(|(damage_type, record)| ResistRow {
                damage_type: damage_type.clone(),
                max_damage: record.max_damage,
                immunity_absorbed: record.max_immunity,
                sample_count: record.sample_count,
            })
            .collect();
        rows.sort_by(|a, b| a.damage_type.cmp(&b.damage_type));
        rows
    }

    pub fn get_immunity_for_target_and_type(
        &self,
        target: &str,
        damage_type: &str,
    ) -> ImmunityRecord {
        self.lock()
            .immunity
            .get(target)
            .and_then(|by_type| by_type.get(damage_type))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_all_targets(&self) -> Vec<String> {
        let inner = self.lock();
        let set: HashSet<&str> = inner
            .damage_events
            .iter()
            .map(|e| e.target.as_str())
            .collect();
        let mut targets: Vec<String> = set.into_iter().map(str::to_string).collect();
        targets.sort();
        targets
    }

    pub fn get_all_damage_types(&self) -> Vec<String> {
        let inner = self.lock();
        let set: HashSet<&str> = inner
            .damage_events
            .iter()
            .map(|e| e.damage_type.as_str())
            .collect();
        let mut types: Vec<String> = set.into_iter().map(str::to_string).collect();
        types.sort();
        types
    }

    pub fn get_max_damage_for_target_and_type(&self, target: &str, damage_type: &str) -> i32 {
        self.lock()
            .damage_events
            .iter()
            .filter(|e| e.target == target && e.damage_type == damage_type)
            .map(|e| e.total_dealt)
            .max()
            .unwrap_or(0)
    }

    pub fn get_target_stats(&self, target: &str) -> Option<TargetStats> {
        let inner = self.lock();
        let mut stats = TargetStats {
            times_hit: 0,
            total_damage_taken: 0,
            total_absorbed: 0,
        };
        let mut seen = false;
        for event in inner.damage_events.iter().filter(|e| e.target == target) {
            seen = true;
            stats.times_hit += 1;
            stats.total_damage_taken += i64::from(event.total_dealt);
            stats.total_absorbed += i64::from(event.immunity_absorbed);
        }
        for by_type in inner.immunity.get(target).iter() {
            for record in by_type.values() {
                stats.total_absorbed += i64::from(record.max_immunity);
            }
        }
        seen.then_some(stats)
    }

    pub fn get_attack_stats(&self, attacker: &str, target: &str) -> Option<AttackStats> {
        let inner = self.lock();
        attack_stats(
            inner
                .attack_events
                .iter()
                .filter(|e| e.attacker == attacker && e.target == target),
        )
    }

    pub fn get_attack_stats_for_target(&self, target: &str) -> Option<AttackStats> {
        let inner = self.lock();
        attack_stats(inner.attack_events.iter().filter(|e| e.target == target))
    }

    /// Hit rates per attacker against a target (or overall), restricted to
    /// attackers that actually dealt damage so summon spam and bystanders
    /// stay out of the damage tables.
    pub fn get_hit_rate_for_damage_dealers(&self, target: Option<&str>) -> HashMap<String, f64> {
        let inner = self.lock();
        let dealers: HashSet<&str> = inner
            .damage_events
            .iter()
            .filter(|e| target.is_none_or(|t| e.target == t) && e.total_dealt > 0)
            .map(|e| e.attacker.as_str())
            .collect();
        let mut rates = HashMap::new();
        for dealer in dealers {
            let stats = attack_stats(
                inner
                    .attack_events
                    .iter()
                    .filter(|e| e.attacker == dealer && target.is_none_or(|t| e.target == t)),
            );
            if let Some(stats) = stats {
                rates.insert(dealer.to_string(), stats.hit_rate);
            }
        }
        rates
    }

    pub fn get_earliest_timestamp(&self) -> Option<NaiveDateTime> {
        self.lock().dps.values().map(|d| d.first_timestamp).min()
    }

    pub fn get_last_damage_timestamp(&self) -> Option<NaiveDateTime> {
        self.lock().last_damage_timestamp
    }

    pub fn get_all_targets_summary(&self, trackers: &TrackerRegistry) -> Vec<TargetSummary> {
        fn bonus_or_dash(bonus: Option<i32>) -> String {
            bonus.map(|b| format!("+{b}")).unwrap_or_else(|| "-".to_string())
        }
        self.get_all_targets()
            .into_iter()
            .map(|target| {
                let armor_class = trackers
                    .defense(&target)
                    .map(|t| t.estimate().to_string())
                    .unwrap_or_else(|| "-".to_string());
                let attack_bonus =
                    bonus_or_dash(trackers.attack_bonus(&target).and_then(|t| t.estimate()));
                let saves = trackers.saves(&target);
                let fortitude = bonus_or_dash(saves.and_then(|t| t.get(SaveKind::Fortitude)));
                let reflex = bonus_or_dash(saves.and_then(|t| t.get(SaveKind::Reflex)));
                let will = bonus_or_dash(saves.and_then(|t| t.get(SaveKind::Will)));
                TargetSummary {
                    target,
                    attack_bonus,
                    armor_class,
                    fortitude,
                    reflex,
                    will,
                }
            })
            .collect()
    }

    pub fn clear_all_data(&self) {
        *self.lock() = StoreInner::default();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            inner: self.lock().clone(),
        }
    }

    pub fn restore(&self, snapshot: &StoreSnapshot) {
        *self.lock() = snapshot.inner.clone();
    }
}

fn attack_stats<'a>(events: impl Iterator<Item = &'a AttackEvent>) -> Option<AttackStats> {
    let mut stats = AttackStats {
        hits: 0,
        critical_hits: 0,
        misses: 0,
        hit_rate: 0.0,
    };
    let mut seen = false;
    for event in events {
        seen = true;
        match event.outcome {
            AttackOutcome::Hit => stats.hits += 1,
            AttackOutcome::CriticalHit => stats.critical_hits += 1,
            AttackOutcome::Miss => stats.misses += 1,
        }
    }
    if !seen {
        return None;
    }
    let attempts = stats.attempts();
    if attempts > 0 {
        stats.hit_rate =
            f64::from(stats.hits + stats.critical_hits) / f64::from(attempts) * 100.0;
    }
    Some(stats)
}
