//! REPL command handlers. Each handler reads from the shared store and
//! estimator registry and prints a plain-text table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;

use crate::bulk::{BulkMessage, BulkService};
use crate::config::AppConfig;
use crate::immunity;
use crate::lock_shared;
use crate::monitor::DirectoryMonitor;
use crate::parser::LogParser;
use crate::pipeline::IngestionPipeline;
use crate::store::{DataStore, TimeTrackingMode};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppContext {
    pub store: Arc<DataStore>,
    pub parser: Arc<Mutex<LogParser>>,
    pub monitor: Arc<Mutex<DirectoryMonitor>>,
    pub pipeline: Arc<Mutex<IngestionPipeline>>,
    pub bulk: BulkService,
    pub config: AppConfig,
    pub time_mode: TimeTrackingMode,
    pub global_start_time: Option<NaiveDateTime>,
}

impl AppContext {
    /// Start time for global mode, defaulting to the earliest first-damage
    /// timestamp on first use.
    fn global_start(&mut self) -> Option<NaiveDateTime> {
        if self.time_mode == TimeTrackingMode::Global && self.global_start_time.is_none() {
            self.global_start_time = self.store.get_earliest_timestamp();
        }
        self.global_start_time
    }
}

pub fn list_targets(ctx: &AppContext) {
    let targets = ctx.store.get_all_targets();
    if targets.is_empty() {
        println!("no targets recorded yet");
        return;
    }
    for target in targets {
        println!("{target}");
    }
}

pub fn show_dps(ctx: &mut AppContext, target: Option<&str>) {
    let start = ctx.global_start();
    let rows = match target {
        Some(target) => ctx
            .store
            .get_dps_data_for_target(target, ctx.time_mode, start),
        None => ctx.store.get_dps_data(ctx.time_mode, start),
    };
    if rows.is_empty() {
        println!("no damage recorded yet");
        return;
    }
    let hit_rates = ctx.store.get_hit_rate_for_damage_dealers(target);
    println!(
        "{:<24} {:>10} {:>8} {:>8} {:>8}",
        "character", "damage", "time", "dps", "hit%"
    );
    for row in rows {
        let hit_rate = hit_rates
            .get(&row.character)
            .map(|r| format!("{r:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:>10} {:>7}s {:>8.1} {:>8}",
            row.character, row.total_damage, row.elapsed_seconds, row.dps, hit_rate
        );
    }
}

pub fn show_breakdown(ctx: &mut AppContext, character: &str, target: Option<&str>) {
    let start = ctx.global_start();
    let rows = match target {
        Some(target) => ctx.store.get_dps_breakdown_by_type_for_target(
            character,
            target,
            ctx.time_mode,
            start,
        ),
        None => ctx
            .store
            .get_dps_breakdown_by_type(character, ctx.time_mode, start),
    };
    if rows.is_empty() {
        println!("no damage recorded for {character}");
        return;
    }
    println!("{:<20} {:>10} {:>8}", "type", "damage", "dps");
    for row in rows {
        println!(
            "{:<20} {:>10} {:>8.1}",
            row.damage_type, row.total_damage, row.dps
        );
    }
}

pub fn show_resists(ctx: &AppContext, target: &str) {
    let rows = ctx.store.get_target_resists(target);
    if rows.is_empty() {
        println!("no immunity data for {target}");
        return;
    }
    println!(
        "{:<20} {:>10} {:>10} {:>8} {:>10}",
        "type", "max dmg", "absorbed", "samples", "immunity"
    );
    for row in rows {
        let immunity =
            immunity::calculate_immunity_percentage(row.max_damage, row.immunity_absorbed)
                .map(|pct| format!("{pct}%"))
                .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<20} {:>10} {:>10} {:>8} {:>10}",
            row.damage_type, row.max_damage, row.immunity_absorbed, row.sample_count, immunity
        );
    }
}

pub fn show_attacks(ctx: &AppContext, target: &str, attacker: Option<&str>) {
    let stats = match attacker {
        Some(attacker) => ctx.store.get_attack_stats(attacker, target),
        None => ctx.store.get_attack_stats_for_target(target),
    };
    let Some(stats) = stats else {
        println!("no attacks recorded against {target}");
        return;
    };
    println!(
        "attempts: {}  hits: {}  crits: {}  misses: {}  hit rate: {:.1}%",
        stats.attempts(),
        stats.hits,
        stats.critical_hits,
        stats.misses,
        stats.hit_rate
    );
}

/// Damage-taken profile for one target: aggregate counts plus the hardest
/// observed hit per damage type.
pub fn show_target_stats(ctx: &AppContext, target: &str) {
    let Some(stats) = ctx.store.get_target_stats(target) else {
        println!("no damage recorded against {target}");
        return;
    };
    println!(
        "times hit: {}  damage taken: {}  absorbed: {}",
        stats.times_hit, stats.total_damage_taken, stats.total_absorbed
    );
    let mut header_printed = false;
    for damage_type in ctx.store.get_all_damage_types() {
        let max = ctx
            .store
            .get_max_damage_for_target_and_type(target, &damage_type);
        if max == 0 {
            continue;
        }
        if !header_printed {
            println!("{:<20} {:>10}", "type", "max hit");
            header_printed = true;
        }
        println!("{damage_type:<20} {max:>10}");
    }
}

pub fn show_hit_rates(ctx: &AppContext, target: Option<&str>) {
    let rates = ctx.store.get_hit_rate_for_damage_dealers(target);
    if rates.is_empty() {
        println!("no attack data recorded yet");
        return;
    }
    let mut rows: Vec<(String, f64)> = rates.into_iter().collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    for (attacker, rate) in rows {
        println!("{attacker:<24} {rate:>6.1}%");
    }
}

pub fn show_summary(ctx: &AppContext) {
    let parser = lock_shared(&ctx.parser);
    let rows = ctx.store.get_all_targets_summary(&parser.trackers);
    if rows.is_empty() {
        println!("no targets recorded yet");
        return;
    }
    println!(
        "{:<24} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "target", "ab", "ac", "fort", "reflex", "will"
    );
    for row in rows {
        println!(
            "{:<24} {:>6} {:>6} {:>6} {:>6} {:>6}",
            row.target, row.attack_bonus, row.armor_class, row.fortitude, row.reflex, row.will
        );
    }
}

pub fn show_status(ctx: &AppContext) {
    let monitor = lock_shared(&ctx.monitor);
    match monitor.active_file() {
        Some(path) => println!("monitoring: {}", path.display()),
        None => println!("monitoring: no log file found"),
    }
    println!(
        "time tracking: {}",
        match ctx.time_mode {
            TimeTrackingMode::PerCharacter => "per-character",
            TimeTrackingMode::Global => "global",
        }
    );
    println!(
        "immunity parsing: {}",
        if lock_shared(&ctx.parser).parse_immunity {
            "on"
        } else {
            "off"
        }
    );
    println!(
        "last damage: {}",
        match ctx.store.get_last_damage_timestamp() {
            Some(at) => at.format("%H:%M:%S").to_string(),
            None => "-".to_string(),
        }
    );
    println!(
        "past logs: {}",
        if ctx.bulk.is_running() {
            "parsing"
        } else if ctx.bulk.past_logs_included() {
            "included"
        } else {
            "session only"
        }
    );
}

pub fn show_settings(ctx: &AppContext) {
    println!("log_directory: {}", ctx.config.log_directory);
    println!(
        "player_name: {}",
        ctx.config.player_name.as_deref().unwrap_or("-")
    );
    println!("parse_immunity: {}", ctx.config.parse_immunity);
}

pub fn set_time_mode(ctx: &mut AppContext, mode: TimeTrackingMode) {
    ctx.time_mode = mode;
    ctx.config.time_tracking_mode = mode;
    ctx.config.save();
    if mode == TimeTrackingMode::Global && ctx.global_start_time.is_none() {
        ctx.global_start_time = ctx.store.get_earliest_timestamp();
    }
    println!(
        "time tracking set to {}",
        match mode {
            TimeTrackingMode::PerCharacter => "per-character",
            TimeTrackingMode::Global => "global",
        }
    );
}

pub fn set_immunity_parsing(ctx: &mut AppContext, enabled: bool) {
    lock_shared(&ctx.parser).parse_immunity = enabled;
    ctx.config.parse_immunity = enabled;
    ctx.config.save();
    println!(
        "immunity parsing {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

pub fn clear_data(ctx: &mut AppContext) {
    ctx.store.clear_all_data();
    let mut parser = lock_shared(&ctx.parser);
    parser.trackers.clear();
    parser.reset_context();
    drop(parser);
    lock_shared(&ctx.pipeline).clear();
    ctx.bulk.clear_state();
    ctx.global_start_time = None;
    println!("session data cleared");
}

pub fn past_logs_start(ctx: &mut AppContext) {
    if ctx.bulk.is_running() {
        println!("past log parsing already running");
        return;
    }
    let (directory, start_positions) = {
        let monitor = lock_shared(&ctx.monitor);
        (
            monitor.log_directory().to_path_buf(),
            monitor.start_positions().clone(),
        )
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    if !ctx.bulk.start(directory, start_positions, tx) {
        println!("past log parsing already running");
        return;
    }
    println!("past log parsing started");
    // Progress lands on the console as it happens; the worker drops the
    // sender when it finishes.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                BulkMessage::Started => {}
                BulkMessage::Progress { file, lines } => {
                    println!("  {file}: {lines} lines...");
                }
                BulkMessage::FileDone { file, lines } => {
                    println!("  {file}: done ({lines} lines)");
                }
                BulkMessage::FileError { file, message } => {
                    println!("  {file}: failed: {message}");
                }
                BulkMessage::Complete {
                    total_lines,
                    cancelled,
                } => {
                    if cancelled {
                        println!("past log parsing cancelled after {total_lines} lines");
                    } else {
                        println!("past log parsing complete: {total_lines} lines");
                    }
                }
            }
        }
    });
}

pub async fn past_logs_stop(ctx: &mut AppContext) {
    if !ctx.bulk.is_running() {
        println!("past log parsing is not running");
        return;
    }
    ctx.bulk.stop(STOP_TIMEOUT).await;
    println!("past log parsing stopped");
}

/// Flip between the merged view and the live-only session. Turning the
/// merge off rolls back to the retained snapshot without re-parsing.
pub async fn past_logs_toggle(ctx: &mut AppContext) {
    if ctx.bulk.is_running() {
        ctx.bulk.stop(STOP_TIMEOUT).await;
        ctx.bulk.restore_session_state();
        println!("past log parsing cancelled, session restored");
    } else if ctx.bulk.past_logs_included() {
        ctx.bulk.restore_session_state();
        println!("past logs excluded, session restored");
    } else {
        past_logs_start(ctx);
    }
}
