//! Event ingestion between the classifier and the store.
//!
//! Damage and immunity lines for the same swing arrive as separate lines,
//! usually damage first. Each target's most recent damage breakdown is
//! buffered so immunity lines can couple to the hit they absorbed from;
//! immunity lines that arrive first wait in a pending queue for up to a
//! second of log time.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::event_models::{AttackEvent, DamageEvent, GameEvent};
use crate::store::DataStore;

/// Immunity lines couple to a buffered damage line when their timestamps
/// are within this window.
const IMMUNITY_MATCH_WINDOW_MS: i64 = 1_000;
const STALE_IMMUNITY_AGE_SECS: i64 = 5;
const STALE_SWEEP_INTERVAL: u64 = 100;

#[derive(Debug, Clone)]
struct BufferedDamage {
    breakdown: Vec<(String, i32)>,
    timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, Copy)]
struct QueuedImmunity {
    points: i32,
    timestamp: NaiveDateTime,
}

/// What a drain pass accomplished, for logging and display refresh.
#[derive(Debug, Default)]
pub struct DrainSummary {
    pub events_processed: usize,
    pub dps_updated: bool,
    pub updated_targets: HashSet<String>,
}

pub struct IngestionPipeline {
    store: Arc<DataStore>,
    damage_buffer: HashMap<String, BufferedDamage>,
    /// target -> damage type -> immunity lines still waiting for damage.
    pending_immunities: HashMap<String, HashMap<String, Vec<QueuedImmunity>>>,
    processed_events: u64,
}

impl IngestionPipeline {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            damage_buffer: HashMap::new(),
            pending_immunities: HashMap::new(),
            processed_events: 0,
        }
    }

    /// Consume everything currently queued on the live event channel.
    pub fn drain(&mut self, rx: &mut UnboundedReceiver<GameEvent>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        while let Ok(event) = rx.try_recv() {
            self.ingest_into(event, &mut summary);
        }
        if summary.events_processed > 0 {
            self.processed_events += summary.events_processed as u64;
            if self.processed_events % STALE_SWEEP_INTERVAL == 0 {
                self.sweep_stale_immunities();
            }
        }
        summary
    }

    pub fn ingest(&mut self, event: GameEvent) {
        let mut summary = DrainSummary::default();
        self.ingest_into(event, &mut summary);
        self.processed_events += 1;
        if self.processed_events % STALE_SWEEP_INTERVAL == 0 {
            self.sweep_stale_immunities();
        }
    }

    pub fn clear(&mut self) {
        self.damage_buffer.clear();
        self.pending_immunities.clear();
        self.processed_events = 0;
    }

    fn ingest_into(&mut self, event: GameEvent, summary: &mut DrainSummary) {
        summary.events_processed += 1;
        match event {
            GameEvent::Damage {
                attacker,
                target,
                total,
                breakdown,
                timestamp,
                ..
            } => {
                self.store
                    .update_dps_data(&attacker, total, timestamp, &breakdown);
                summary.dps_updated = true;
                for (damage_type, amount) in &breakdown {
                    self.store.insert_damage_event(DamageEvent {
                        target: target.clone(),
                        damage_type: damage_type.clone(),
                        immunity_absorbed: 0,
                        total_dealt: *amount,
                        attacker: attacker.clone(),
                        timestamp,
                    });
                }
                self.flush_queued_immunities(&target, &breakdown, timestamp, summary);
                self.damage_buffer.insert(
                    target.clone(),
                    BufferedDamage {
                        breakdown,
                        timestamp,
                    },
                );
                summary.updated_targets.insert(target);
            }
            GameEvent::Immunity {
                target,
                damage_type,
                points,
                timestamp,
            } => {
                let matched = self.damage_buffer.get(&target).and_then(|buffered| {
                    buffered
                        .breakdown
                        .iter()
                        .find(|(t, _)| *t == damage_type)
                        .map(|(_, amount)| *amount)
                });
                if let Some(amount) = matched {
                    self.store
                        .record_immunity(&target, &damage_type, points, amount);
                    summary.updated_targets.insert(target);
                } else {
                    tracing::debug!(
                        target_name = target.as_str(),
                        damage_type = damage_type.as_str(),
                        "immunity line without matching damage, queueing"
                    );
                    self.pending_immunities
                        .entry(target)
                        .or_default()
                        .entry(damage_type)
                        .or_default()
                        .push(QueuedImmunity { points, timestamp });
                }
            }
            GameEvent::Attack {
                attacker,
                target,
                outcome,
                roll,
                bonus,
                total,
                timestamp,
                ..
            } => {
                self.store.insert_attack_event(AttackEvent {
                    attacker,
                    target: target.clone(),
                    outcome,
                    roll,
                    bonus,
                    total,
                    timestamp,
                });
                summary.updated_targets.insert(target);
            }
            // Save bonuses land in the estimator registry at classify time.
            GameEvent::Save { .. } => {}
        }
    }

    /// Couple queued immunity lines to a freshly arrived damage breakdown.
    /// Queued entries for a type the breakdown carries are consumed either
    /// way; only those inside the time window are recorded.
    fn flush_queued_immunities(
        &mut self,
        target: &str,
        breakdown: &[(String, i32)],
        damage_timestamp: NaiveDateTime,
        summary: &mut DrainSummary,
    ) {
        let Some(by_type) = self.pending_immunities.get_mut(target) else {
            return;
        };
        let store = Arc::clone(&self.store);
        let mut recorded = false;
        by_type.retain(|damage_type, queued| {
            let Some((_, amount)) = breakdown.iter().find(|(t, _)| t == damage_type) else {
                return true;
            };
            for entry in queued.drain(..) {
                let gap_ms = (damage_timestamp - entry.timestamp).num_milliseconds().abs();
                if gap_ms <= IMMUNITY_MATCH_WINDOW_MS {
                    store.record_immunity(target, damage_type, entry.points, *amount);
                    recorded = true;
                } else {
                    tracing::debug!(
                        target_name = target,
                        damage_type = damage_type.as_str(),
                        gap_ms,
                        "queued immunity outside match window, dropping"
                    );
                }
            }
            false
        });
        if by_type.is_empty() {
            self.pending_immunities.remove(target);
        }
        if recorded {
            summary.updated_targets.insert(target.to_string());
        }
    }

    fn sweep_stale_immunities(&mut self) {
        let now = Local::now().naive_local();
        self.pending_immunities.retain(|target, by_type| {
            by_type.retain(|damage_type, queued| {
                queued.retain(|entry| {
                    let age = (now - entry.timestamp).num_seconds();
                    if age > STALE_IMMUNITY_AGE_SECS {
                        tracing::debug!(
                            target_name = target.as_str(),
                            damage_type = damage_type.as_str(),
                            age,
                            "dropping stale queued immunity"
                        );
                        false
                    } else {
                        true
                    }
                });
                !queued.is_empty()
            });
            !by_type.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::parser::LogParser;
    use crate::store::TimeTrackingMode;

    const PREFIX: &str = "[CHAT WINDOW TEXT] [Wed Dec 31 21:07:37]";

    fn ts(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(21, 7, 37)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn damage(target: &str, breakdown: &[(&str, i32)], at: i64) -> GameEvent {
        GameEvent::Damage {
            attacker: "Woo".to_string(),
            target: target.to_string(),
            total: breakdown.iter().map(|(_, n)| n).sum(),
            breakdown: breakdown
                .iter()
                .map(|(t, n)| (t.to_string(), *n))
                .collect(),
            timestamp: ts(at),
            filtered_for_player: false,
        }
    }

    fn immunity(target: &str, damage_type: &str, points: i32, at: i64) -> GameEvent {
        GameEvent::Immunity {
            target: target.to_string(),
            damage_type: damage_type.to_string(),
            points,
            timestamp: ts(at),
        }
    }

    #[test]
    fn immunity_after_damage_couples_to_buffered_hit() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        pipeline.ingest(damage("Goblin", &[("Physical", 30), ("Fire", 20)], 0));
        pipeline.ingest(immunity("Goblin", "Fire", 10, 0));

        let record = store.get_immunity_for_target_and_type("Goblin", "Fire");
        assert_eq!(record.max_damage, 20);
        assert_eq!(record.max_immunity, 10);
        assert_eq!(record.sample_count, 1);
    }

    #[test]
    fn immunity_before_damage_waits_in_queue() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        pipeline.ingest(immunity("Goblin", "Fire", 10, 0));
        assert_eq!(
            store
                .get_immunity_for_target_and_type("Goblin", "Fire")
                .sample_count,
            0
        );

        pipeline.ingest(damage("Goblin", &[("Fire", 20)], 0));
        let record = store.get_immunity_for_target_and_type("Goblin", "Fire");
        assert_eq!(record.sample_count, 1);
        assert_eq!(record.max_damage, 20);
    }

    #[test]
    fn queued_immunity_outside_window_is_dropped() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        pipeline.ingest(immunity("Goblin", "Fire", 10, 0));
        pipeline.ingest(damage("Goblin", &[("Fire", 20)], 3));
        assert_eq!(
            store
                .get_immunity_for_target_and_type("Goblin", "Fire")
                .sample_count,
            0
        );
        // The queue entry was consumed, not left to match later damage.
        pipeline.ingest(damage("Goblin", &[("Fire", 25)], 3));
        assert_eq!(
            store
                .get_immunity_for_target_and_type("Goblin", "Fire")
                .sample_count,
            0
        );
    }

    #[test]
    fn immunity_for_unlisted_type_stays_queued() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        pipeline.ingest(immunity("Goblin", "Cold", 5, 0));
        pipeline.ingest(damage("Goblin", &[("Fire", 20)], 0));
        assert_eq!(
            store
                .get_immunity_for_target_and_type("Goblin", "Cold")
                .sample_count,
            0
        );
        assert!(pipeline.pending_immunities.contains_key("Goblin"));
    }

    #[test]
    fn drain_consumes_live_channel() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(damage("Goblin", &[("Physical", 30)], 0)).unwrap();
        tx.send(immunity("Goblin", "Physical", 5, 0)).unwrap();

        let summary = pipeline.drain(&mut rx);
        assert_eq!(summary.events_processed, 2);
        assert!(summary.dps_updated);
        assert!(summary.updated_targets.contains("Goblin"));
        assert_eq!(
            store
                .get_immunity_for_target_and_type("Goblin", "Physical")
                .sample_count,
            1
        );
    }

    /// Full classify-and-ingest pass over a short combat burst.
    #[test]
    fn end_to_end_combat_lines() {
        let store = Arc::new(DataStore::new());
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        let mut parser = LogParser::new(None, true);

        for line in [
            "Woo attacks Goblin : *hit* : (15 + 6 = 21)",
            "Woo damages Goblin: 50 (30 Physical 20 Fire)",
            "Goblin : Damage Immunity absorbs 10 points of Fire",
            "Woo attacks Goblin : *miss* : (9 + 6 = 15)",
            "Woo attacks Goblin : *hit* : (10 + 6 = 16)",
        ] {
            let line = format!("{PREFIX} {line}");
            if let Some(event) = parser.parse_line(&line) {
                pipeline.ingest(event);
            }
        }

        let rows = store.get_dps_data(TimeTrackingMode::PerCharacter, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].character, "Woo");
        assert!((rows[0].dps - 50.0).abs() < f64::EPSILON);

        let record = store.get_immunity_for_target_and_type("Goblin", "Fire");
        assert_eq!(record.max_damage, 20);
        assert_eq!(record.max_immunity, 10);

        assert_eq!(
            parser
                .trackers
                .defense("Goblin")
                .unwrap()
                .estimate()
                .to_string(),
            "16"
        );

        let stats = store.get_attack_stats("Woo", "Goblin").unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
