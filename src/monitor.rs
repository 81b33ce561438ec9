//! Poll-based watcher for the game's rotating client log pool.
//!
//! The game round-robins through four fixed file names and reuses them
//! across sessions, so the active file is simply the most recently
//! modified one. Each poll re-resolves the active file, detects rotation
//! and truncation, and feeds any complete new lines through the parser.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use encoding_rs::WINDOWS_1252;
use hashbrown::HashMap;
use memchr::memchr_iter;
use memmap2::Mmap;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::event_models::GameEvent;
use crate::parser::LogParser;

pub const LOG_FILE_POOL: [&str; 4] = [
    "nwclientLog1.txt",
    "nwclientLog2.txt",
    "nwclientLog3.txt",
    "nwclientLog4.txt",
];

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to stat log file {path}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open log file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to seek in log file {path}")]
    Seek {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read log file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What one poll cycle observed. Errors are reported here rather than
/// bubbled so a transient filesystem hiccup never kills the poll loop.
#[derive(Debug, Default)]
pub struct PollReport {
    pub rotated: bool,
    pub truncated: bool,
    pub lines_read: usize,
    pub events: usize,
    pub error: Option<String>,
}

pub struct DirectoryMonitor {
    log_directory: PathBuf,
    current_file: Option<PathBuf>,
    last_position: u64,
    /// Line counts at monitor start, keyed by pool file name. Past-log
    /// ingestion stops at these so lines consumed live are not replayed.
    start_positions: HashMap<String, u64>,
}

impl DirectoryMonitor {
    pub fn new(log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
            current_file: None,
            last_position: 0,
            start_positions: HashMap::new(),
        }
    }

    pub fn log_directory(&self) -> &Path {
        &self.log_directory
    }

    pub fn active_file(&self) -> Option<&Path> {
        self.current_file.as_deref()
    }

    pub fn start_positions(&self) -> &HashMap<String, u64> {
        &self.start_positions
    }

    /// Most recently modified pool file, if any exist.
    pub fn find_active_log_file(&self) -> Option<PathBuf> {
        let mut best: Option<(SystemTime, PathBuf)> = None;
        for name in LOG_FILE_POOL {
            let path = self.log_directory.join(name);
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if best.as_ref().is_none_or(|(t, _)| mtime >= *t) {
                best = Some((mtime, path));
            }
        }
        best.map(|(_, path)| path)
    }

    /// Resolve the active file and seek to its end, so only lines written
    /// from this moment on are consumed live.
    pub fn start(&mut self) {
        self.current_file = self.find_active_log_file();
        self.last_position = 0;
        self.start_positions.clear();
        if let Some(path) = self.current_file.clone() {
            if let Ok(meta) = fs::metadata(&path) {
                self.last_position = meta.len();
            }
            if let Ok(lines) = count_lines(&path)
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                self.start_positions.insert(name.to_string(), lines);
            }
            tracing::debug!(file = %path.display(), offset = self.last_position, "monitoring log file");
        } else {
            tracing::debug!(directory = %self.log_directory.display(), "no log files present yet");
        }
    }

    pub fn poll(&mut self, parser: &mut LogParser, events: &UnboundedSender<GameEvent>) -> PollReport {
        let mut report = PollReport::default();
        let active = self.find_active_log_file();
        if active != self.current_file {
            if let Some(next) = &active {
                tracing::debug!(from = ?self.current_file, to = %next.display(), "log rotation detected");
                report.rotated = true;
            }
            self.current_file = active;
            self.last_position = 0;
        }
        let Some(path) = self.current_file.clone() else {
            return report;
        };
        if let Err(error) = self.read_new_lines(&path, parser, events, &mut report) {
            tracing::warn!(error = %error, "log poll failed");
            report.error = Some(error.to_string());
        }
        report
    }

    fn read_new_lines(
        &mut self,
        path: &Path,
        parser: &mut LogParser,
        events: &UnboundedSender<GameEvent>,
        report: &mut PollReport,
    ) -> Result<(), MonitorError> {
        let meta = fs::metadata(path).map_err(|source| MonitorError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;
        let size = meta.len();
        if size < self.last_position {
            tracing::warn!(
                file = %path.display(),
                was = self.last_position,
                now = size,
                "log file truncated, rereading from the top"
            );
            report.truncated = true;
            self.last_position = 0;
        }
        if size == self.last_position {
            return Ok(());
        }
        let mut file = File::open(path).map_err(|source| MonitorError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        file.seek(SeekFrom::Start(self.last_position))
            .map_err(|source| MonitorError::Seek {
                path: path.to_path_buf(),
                source,
            })?;
        let mut buffer = Vec::with_capacity((size - self.last_position) as usize);
        file.read_to_end(&mut buffer)
            .map_err(|source| MonitorError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        // A partially written trailing line stays in the file until the
        // next poll finds its newline.
        let Some(last_newline) = buffer.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };
        let complete = &buffer[..=last_newline];
        let mut start = 0usize;
        for end in memchr_iter(b'\n', complete) {
            report.lines_read += 1;
            if end > start {
                let (decoded, _, _) = WINDOWS_1252.decode(&complete[start..end]);
                let line = decoded.trim_end_matches('\r');
                if let Some(event) = parser.parse_line(line) {
                    report.events += 1;
                    if events.send(event).is_err() {
                        tracing::warn!("event channel closed, dropping parsed events");
                    }
                }
            }
            start = end + 1;
        }
        self.last_position += (last_newline + 1) as u64;
        Ok(())
    }
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(0);
    }
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(memchr_iter(b'\n', mmap.as_ref()).count() as u64)
}
