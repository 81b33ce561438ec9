//! Background ingestion of historical log files.
//!
//! Parsing hundreds of thousands of lines from the pool files would freeze
//! an interactive session, so the work runs on a blocking worker task with
//! cooperative cancellation checked between files. Before the first merge
//! the live-only session is checkpointed, so the past-log view can be
//! toggled off again without re-parsing anything.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use encoding_rs::WINDOWS_1252;
use hashbrown::HashMap;
use memchr::memchr_iter;
use memmap2::Mmap;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::estimators::TrackerRegistry;
use crate::lock_shared;
use crate::monitor::LOG_FILE_POOL;
use crate::parser::LogParser;
use crate::pipeline::IngestionPipeline;
use crate::store::{DataStore, StoreSnapshot};

const PROGRESS_CHUNK_LINES: u64 = 5_000;

#[derive(Debug, Error)]
pub enum BulkError {
    #[error("failed to open log file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to memory map log file {path}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Progress and completion messages from the worker. `Complete` is sent on
/// every exit path, including cancellation and per-file failures.
#[derive(Debug)]
pub enum BulkMessage {
    Started,
    Progress { file: String, lines: u64 },
    FileDone { file: String, lines: u64 },
    FileError { file: String, message: String },
    Complete { total_lines: u64, cancelled: bool },
}

/// Live-only session state captured before past logs merge in.
struct SessionSnapshot {
    store: StoreSnapshot,
    trackers: TrackerRegistry,
}

pub struct BulkService {
    store: Arc<DataStore>,
    parser: Arc<Mutex<LogParser>>,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    past_logs_included: Arc<AtomicBool>,
    session_snapshot: Option<SessionSnapshot>,
    worker: Option<JoinHandle<()>>,
}

impl BulkService {
    pub fn new(store: Arc<DataStore>, parser: Arc<Mutex<LogParser>>) -> Self {
        Self {
            store,
            parser,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            past_logs_included: Arc::new(AtomicBool::new(false)),
            session_snapshot: None,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn past_logs_included(&self) -> bool {
        self.past_logs_included.load(Ordering::SeqCst)
    }

    /// Kick off ingestion of every pool file in the directory. For the file
    /// the monitor is currently tailing, `start_positions` bounds how far
    /// ingestion may read so live-consumed lines are not replayed.
    ///
    /// Returns false without side effects when a run is already underway.
    pub fn start(
        &mut self,
        log_directory: PathBuf,
        start_positions: HashMap<String, u64>,
        messages: UnboundedSender<BulkMessage>,
    ) -> bool {
        if self.is_running() {
            return false;
        }
        if self.session_snapshot.is_none() {
            self.save_session_state();
        }
        self.running.store(true, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);

        let store = Arc::clone(&self.store);
        let parser = Arc::clone(&self.parser);
        let running = Arc::clone(&self.running);
        let cancel = Arc::clone(&self.cancel);
        let included = Arc::clone(&self.past_logs_included);
        self.worker = Some(tokio::task::spawn_blocking(move || {
            let _running = ClearOnDrop(running);
            run_worker(
                &log_directory,
                store,
                &parser,
                &start_positions,
                &messages,
                &cancel,
                &included,
            );
        }));
        true
    }

    /// Request cancellation and wait for the worker, bounded by `timeout`.
    pub async fn stop(&mut self, timeout: Duration) {
        if !self.is_running() {
            self.worker = None;
            return;
        }
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take()
            && tokio::time::timeout(timeout, handle).await.is_err()
        {
            tracing::warn!("timed out waiting for past-log worker to stop");
        }
    }

    pub fn save_session_state(&mut self) {
        let trackers = lock_shared(&self.parser).trackers.snapshot();
        self.session_snapshot = Some(SessionSnapshot {
            store: self.store.snapshot(),
            trackers,
        });
        tracing::debug!("captured live session snapshot");
    }

    /// Roll the store and estimators back to the pre-merge snapshot. The
    /// snapshot is retained so the merged view can be rebuilt later.
    pub fn restore_session_state(&mut self) {
        let Some(snapshot) = &self.session_snapshot else {
            tracing::debug!("no session snapshot to restore");
            return;
        };
        self.store.restore(&snapshot.store);
        lock_shared(&self.parser).trackers.restore(&snapshot.trackers);
        self.past_logs_included.store(false, Ordering::SeqCst);
        tracing::debug!("restored live session snapshot");
    }

    pub fn clear_state(&mut self) {
        self.session_snapshot = None;
        self.past_logs_included.store(false, Ordering::SeqCst);
    }
}

/// Clears the running flag when the worker exits, unwinding included.
struct ClearOnDrop(Arc<AtomicBool>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn run_worker(
    log_directory: &Path,
    store: Arc<DataStore>,
    parser: &Mutex<LogParser>,
    start_positions: &HashMap<String, u64>,
    messages: &UnboundedSender<BulkMessage>,
    cancel: &AtomicBool,
    included: &AtomicBool,
) {
    let _ = messages.send(BulkMessage::Started);
    let mut pipeline = IngestionPipeline::new(store);
    let mut total_lines = 0u64;
    let mut cancelled = false;

    for name in LOG_FILE_POOL {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!("past-log ingestion cancelled");
            cancelled = true;
            break;
        }
        let path = log_directory.join(name);
        if !path.exists() {
            continue;
        }
        let max_line = start_positions.get(name).copied();
        match ingest_file(&path, parser, &mut pipeline, max_line, name, messages) {
            Ok(lines) => {
                total_lines += lines;
                tracing::info!(file = name, lines, "ingested past log");
                let _ = messages.send(BulkMessage::FileDone {
                    file: name.to_string(),
                    lines,
                });
            }
            Err(error) => {
                tracing::warn!(file = name, error = %error, "past log ingestion failed");
                let _ = messages.send(BulkMessage::FileError {
                    file: name.to_string(),
                    message: error.to_string(),
                });
            }
        }
    }

    if !cancelled {
        included.store(true, Ordering::SeqCst);
    }
    let _ = messages.send(BulkMessage::Complete {
        total_lines,
        cancelled,
    });
}

/// Parse one historical file through the shared classifier, stopping ahead
/// of `max_line` when the live monitor already owns the tail of this file.
fn ingest_file(
    path: &Path,
    parser: &Mutex<LogParser>,
    pipeline: &mut IngestionPipeline,
    max_line: Option<u64>,
    name: &str,
    messages: &UnboundedSender<BulkMessage>,
) -> Result<u64, BulkError> {
    let file = File::open(path).map_err(|source| BulkError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Ok(0);
    }
    let mmap = unsafe { Mmap::map(&file) }.map_err(|source| BulkError::MemoryMap {
        path: path.to_path_buf(),
        source,
    })?;
    let bytes = mmap.as_ref();

    let mut line_ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;
    for end in memchr_iter(b'\n', bytes) {
        line_ranges.push((start, end));
        start = end + 1;
    }
    if start < bytes.len() {
        line_ranges.push((start, bytes.len()));
    }

    let mut lines_processed = 0u64;
    for (start, end) in line_ranges {
        lines_processed += 1;
        if let Some(max) = max_line
            && lines_processed > max
        {
            return Ok(lines_processed - 1);
        }
        if end > start {
            let (decoded, _, _) = WINDOWS_1252.decode(&bytes[start..end]);
            let line = decoded.trim_end_matches('\r');
            let event = lock_shared(parser).parse_line(line);
            if let Some(event) = event {
                pipeline.ingest(event);
            }
        }
        if lines_processed % PROGRESS_CHUNK_LINES == 0 {
            let _ = messages.send(BulkMessage::Progress {
                file: name.to_string(),
                lines: lines_processed,
            });
        }
    }
    Ok(lines_processed)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use tokio::sync::mpsc;

    use super::*;
    use crate::store::TimeTrackingMode;

    const PREFIX: &str = "[CHAT WINDOW TEXT] [Wed Dec 31 21:07:37]";

    fn scratch_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("nwlog_{label}_{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn combat_lines(n: usize) -> String {
        let mut out = String::new();
        for _ in 0..n {
            out.push_str(PREFIX);
            out.push_str(" Woo damages Goblin: 10 (10 Physical)\n");
        }
        out
    }

    #[test]
    fn ingest_file_respects_line_bound() {
        let dir = scratch_dir("bound");
        let path = dir.join("nwclientLog1.txt");
        fs::write(&path, combat_lines(10)).unwrap();

        let store = Arc::new(DataStore::new());
        let parser = Mutex::new(LogParser::new(None, true));
        let mut pipeline = IngestionPipeline::new(Arc::clone(&store));
        let (tx, _rx) = mpsc::unbounded_channel();

        let lines = ingest_file(&path, &parser, &mut pipeline, Some(4), "nwclientLog1.txt", &tx)
            .unwrap();
        assert_eq!(lines, 4);
        let rows = store.get_dps_data(TimeTrackingMode::PerCharacter, None);
        assert_eq!(rows[0].total_damage, 40);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn worker_ingests_pool_and_signals_completion() {
        let dir = scratch_dir("worker");
        fs::write(dir.join("nwclientLog1.txt"), combat_lines(3)).unwrap();
        fs::write(dir.join("nwclientLog3.txt"), combat_lines(2)).unwrap();

        let store = Arc::new(DataStore::new());
        let parser = Arc::new(Mutex::new(LogParser::new(None, true)));
        let mut service = BulkService::new(Arc::clone(&store), Arc::clone(&parser));
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(service.start(dir.clone(), HashMap::new(), tx));

        let mut completed = false;
        while let Some(message) = rx.recv().await {
            if let BulkMessage::Complete {
                total_lines,
                cancelled,
            } = message
            {
                completed = true;
                assert!(!cancelled);
                assert_eq!(total_lines, 5);
            }
        }
        assert!(completed);
        service.stop(Duration::from_secs(5)).await;
        assert!(!service.is_running());
        assert!(service.past_logs_included());

        let rows = store.get_dps_data(TimeTrackingMode::PerCharacter, None);
        assert_eq!(rows[0].total_damage, 50);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn session_snapshot_round_trips_past_log_toggle() {
        let dir = scratch_dir("toggle");
        fs::write(dir.join("nwclientLog2.txt"), combat_lines(5)).unwrap();

        let store = Arc::new(DataStore::new());
        let parser = Arc::new(Mutex::new(LogParser::new(None, true)));

        // Live session state before any past logs merge in.
        store.update_dps_data(
            "Woo",
            50,
            chrono::Local::now().naive_local(),
            &[("Physical".to_string(), 50)],
        );
        lock_shared(&parser).trackers.defense_mut("Goblin").record_hit(21, false);

        let mut service = BulkService::new(Arc::clone(&store), Arc::clone(&parser));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(service.start(dir.clone(), HashMap::new(), tx));
        while rx.recv().await.is_some() {}

        let rows = store.get_dps_data(TimeTrackingMode::PerCharacter, None);
        assert_eq!(rows[0].total_damage, 100);

        service.restore_session_state();
        assert!(!service.past_logs_included());
        let rows = store.get_dps_data(TimeTrackingMode::PerCharacter, None);
        assert_eq!(rows[0].total_damage, 50);
        assert_eq!(
            lock_shared(&parser)
                .trackers
                .defense("Goblin")
                .unwrap()
                .estimate()
                .to_string(),
            "≤21"
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
