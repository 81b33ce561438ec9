use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use nwlog::commands::{self, AppContext};
use nwlog::bulk::BulkService;
use nwlog::config::AppConfig;
use nwlog::lock_shared;
use nwlog::monitor::DirectoryMonitor;
use nwlog::parser::LogParser;
use nwlog::pipeline::IngestionPipeline;
use nwlog::store::{DataStore, TimeTrackingMode};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load();
    let store = Arc::new(DataStore::new());
    let parser = Arc::new(Mutex::new(LogParser::new(
        config.player_name.clone(),
        config.parse_immunity,
    )));
    let pipeline = Arc::new(Mutex::new(IngestionPipeline::new(Arc::clone(&store))));
    let monitor = Arc::new(Mutex::new(DirectoryMonitor::new(&config.log_directory)));
    lock_shared(&monitor).start();

    spawn_poll_loop(
        Arc::clone(&monitor),
        Arc::clone(&parser),
        Arc::clone(&pipeline),
    );

    let mut ctx = AppContext {
        bulk: BulkService::new(Arc::clone(&store), Arc::clone(&parser)),
        time_mode: config.time_tracking_mode,
        global_start_time: None,
        store,
        parser,
        monitor,
        pipeline,
        config,
    };

    loop {
        let line = readline()?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match respond(line, &mut ctx).await {
            Ok(quit) => {
                if quit {
                    break;
                }
            }
            Err(err) => {
                write!(std::io::stdout(), "{err}").map_err(|e| e.to_string())?;
                std::io::stdout().flush().map_err(|e| e.to_string())?;
            }
        }
    }

    Ok(())
}

/// Tails the active log at a fixed cadence and drains parsed events into
/// the store.
fn spawn_poll_loop(
    monitor: Arc<Mutex<DirectoryMonitor>>,
    parser: Arc<Mutex<LogParser>>,
    pipeline: Arc<Mutex<IngestionPipeline>>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let report = {
                let mut monitor = lock_shared(&monitor);
                let mut parser = lock_shared(&parser);
                monitor.poll(&mut parser, &event_tx)
            };
            if report.rotated || report.truncated {
                tracing::info!(
                    rotated = report.rotated,
                    truncated = report.truncated,
                    "log file reset"
                );
            }
            let summary = lock_shared(&pipeline).drain(&mut event_rx);
            if summary.events_processed > 0 {
                tracing::debug!(events = summary.events_processed, "ingested live events");
            }
        }
    });
}

fn readline() -> Result<String, String> {
    write!(std::io::stdout(), "> ").map_err(|e| e.to_string())?;
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    let mut buffer = String::new();
    std::io::stdin()
        .read_line(&mut buffer)
        .map_err(|e| e.to_string())?;
    Ok(buffer)
}

#[derive(Parser)]
#[command(version, about = "combat log analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every target damage has been recorded against.
    Targets,
    /// DPS table, optionally restricted to one target.
    Dps { target: Option<String> },
    /// Per-damage-type breakdown for a character.
    Breakdown {
        character: String,
        target: Option<String>,
    },
    /// Observed immunity samples and solved percentages for a target.
    Resists { target: String },
    /// Attack roll statistics against a target.
    Attacks {
        target: String,
        #[arg(short, long)]
        attacker: Option<String>,
    },
    /// Damage-taken totals and hardest hits per type for a target.
    Stats { target: String },
    /// Hit rates for everyone who dealt damage.
    HitRate { target: Option<String> },
    /// Estimated AB, AC, and save bonuses per target.
    Summary,
    Status,
    Settings,
    /// Switch DPS time tracking: per-character or global.
    Mode {
        #[arg(value_parser = parse_mode)]
        mode: TimeTrackingMode,
    },
    /// Toggle damage immunity parsing: on or off.
    Immunity {
        #[arg(value_parser = parse_on_off)]
        enabled: bool,
    },
    /// Ingest historical pool files in the background.
    PastLogs {
        #[command(subcommand)]
        action: PastLogsAction,
    },
    /// Drop all session data.
    Clear,
    Exit,
}

#[derive(Subcommand)]
enum PastLogsAction {
    Start,
    Stop,
    Toggle,
}

fn parse_mode(s: &str) -> Result<TimeTrackingMode, String> {
    match s {
        "per-character" | "per_character" => Ok(TimeTrackingMode::PerCharacter),
        "global" => Ok(TimeTrackingMode::Global),
        _ => Err(format!("unknown mode {s:?}, expected per-character or global")),
    }
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(format!("expected on or off, got {s:?}")),
    }
}

async fn respond(line: &str, ctx: &mut AppContext) -> Result<bool, String> {
    let mut args = shlex::split(line).ok_or("error: Invalid quoting")?;
    args.insert(0, "nwlog".to_string());
    let cli = Cli::try_parse_from(args).map_err(|e| e.to_string())?;

    match &cli.command {
        Some(Commands::Targets) => commands::list_targets(ctx),
        Some(Commands::Dps { target }) => commands::show_dps(ctx, target.as_deref()),
        Some(Commands::Breakdown { character, target }) => {
            commands::show_breakdown(ctx, character, target.as_deref())
        }
        Some(Commands::Resists { target }) => commands::show_resists(ctx, target),
        Some(Commands::Attacks { target, attacker }) => {
            commands::show_attacks(ctx, target, attacker.as_deref())
        }
        Some(Commands::Stats { target }) => commands::show_target_stats(ctx, target),
        Some(Commands::HitRate { target }) => commands::show_hit_rates(ctx, target.as_deref()),
        Some(Commands::Summary) => commands::show_summary(ctx),
        Some(Commands::Status) => commands::show_status(ctx),
        Some(Commands::Settings) => commands::show_settings(ctx),
        Some(Commands::Mode { mode }) => commands::set_time_mode(ctx, *mode),
        Some(Commands::Immunity { enabled }) => commands::set_immunity_parsing(ctx, *enabled),
        Some(Commands::PastLogs { action }) => match action {
            PastLogsAction::Start => commands::past_logs_start(ctx),
            PastLogsAction::Stop => commands::past_logs_stop(ctx).await,
            PastLogsAction::Toggle => commands::past_logs_toggle(ctx).await,
        },
        Some(Commands::Clear) => commands::clear_data(ctx),
        Some(Commands::Exit) => {
            ctx.bulk.stop(Duration::from_secs(2)).await;
            write!(std::io::stdout(), "quitting...").map_err(|e| e.to_string())?;
            std::io::stdout().flush().map_err(|e| e.to_string())?;
            return Ok(true);
        }
        None => {}
    }
    Ok(false)
}
