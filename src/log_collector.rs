//! Decoupled, unbounded persistence of run logs.
//!
//! The in-memory rolling log held by `RunState` is capped for display. Every line
//! also reaches disk through this collector, which has no cap.
//!
//! # Architecture
//!
//! ```text
//! RunState / log::* macros
//!     |
//! [LogCollector] (non-blocking send)
//!     | (crossbeam unbounded channel)
//!     v
//! [DiskPersister thread]
//!     |
//! logs/full/<ts>_full.log      every line
//! logs/parsed/<ts>_parsed.log  status announcements only
//! ```

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Log, Metadata, Record};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// Session state with generation tracking for detecting session changes
#[derive(Clone, Debug)]
struct SessionState {
    path: Option<PathBuf>,
    /// Incremented when the session changes so the persister drops cached handles
    generation: u64,
}

/// Default logs path relative to the current working directory: ./logs
pub fn get_global_logs_path() -> Result<PathBuf, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Failed to get current working directory: {}", e))?;
    Ok(cwd.join("logs"))
}

/// Ensure the logs directory exists
pub fn ensure_logs_dir_exists(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create logs directory: {}", e))
}

/// Which persisted stream a line belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    /// Raw tool output and diagnostics
    Full,
    /// Status announcements (also written to the full log)
    Parsed,
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub kind: LogKind,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            kind: LogKind::Full,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            kind: LogKind::Parsed,
            ..LogLine::new(message)
        }
    }
}

/// Unified logger persisting every line on a background thread
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_dir: PathBuf,
    session_state: Arc<Mutex<SessionState>>,
}

impl LogCollector {
    /// Create a new LogCollector and its disk persister thread
    pub fn new(log_dir: PathBuf) -> Result<Self, String> {
        let full_log_dir = log_dir.join("full");
        let parsed_log_dir = log_dir.join("parsed");
        std::fs::create_dir_all(&full_log_dir)
            .map_err(|e| format!("Failed to create full log dir: {}", e))?;
        std::fs::create_dir_all(&parsed_log_dir)
            .map_err(|e| format!("Failed to create parsed log dir: {}", e))?;

        // crossbeam unbounded: sends never block the worker, whatever thread it runs on
        let (tx, rx) = unbounded::<LogMessage>();

        let session_state = Arc::new(Mutex::new(SessionState {
            path: None,
            generation: 0,
        }));
        let session_state_clone = Arc::clone(&session_state);

        std::thread::Builder::new()
            .name("log-persister".to_string())
            .spawn(move || {
                let mut file_handles: HashMap<&'static str, File> = HashMap::new();
                let mut last_generation: u64 = 0;

                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let session_path = match session_state_clone.lock() {
                                Ok(session) => {
                                    if session.generation != last_generation {
                                        file_handles.remove("full");
                                        last_generation = session.generation;
                                    }
                                    session.path.clone()
                                }
                                Err(_) => None,
                            };

                            if !file_handles.contains_key("full") {
                                let path = session_path
                                    .or_else(|| get_or_create_latest_log(&full_log_dir).ok());
                                if let Some(file) = path.and_then(|p| open_append(&p)) {
                                    file_handles.insert("full", file);
                                }
                            }

                            let formatted = format!("[{}] {}\n", line.timestamp, line.message);
                            if let Some(file) = file_handles.get_mut("full") {
                                let _ = file.write_all(formatted.as_bytes());
                            }

                            if line.kind == LogKind::Parsed {
                                if !file_handles.contains_key("parsed") {
                                    if let Some(file) = get_or_create_latest_log(&parsed_log_dir)
                                        .ok()
                                        .and_then(|p| open_append(&p))
                                    {
                                        file_handles.insert("parsed", file);
                                    }
                                }
                                if let Some(file) = file_handles.get_mut("parsed") {
                                    let _ = file.write_all(formatted.as_bytes());
                                }
                            }
                        }
                        LogMessage::Flush(done) => {
                            for file in file_handles.values_mut() {
                                let _ = file.flush();
                                let _ = file.sync_data();
                            }
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| format!("Failed to spawn log persister: {}", e))?;

        Ok(LogCollector {
            tx,
            log_dir,
            session_state,
        })
    }

    /// Register this collector as the global `log` backend.
    pub fn init_global_logger(self: Arc<Self>, level: log::LevelFilter) -> Result<(), String> {
        log::set_boxed_logger(Box::new((*self).clone()))
            .map(|()| log::set_max_level(level))
            .map_err(|e| format!("Failed to set global logger: {}", e))
    }

    /// Start a new session with a dedicated full-log file.
    pub fn start_new_session(&self, filename: &str) -> Result<PathBuf, String> {
        let log_path = self.log_dir.join("full").join(filename);
        let mut session = self
            .session_state
            .lock()
            .map_err(|e| format!("Failed to lock session state: {}", e))?;
        session.path = Some(log_path.clone());
        session.generation = session.generation.wrapping_add(1);
        Ok(log_path)
    }

    /// Get the current session log file path
    pub fn get_session_log_path(&self) -> Option<PathBuf> {
        self.session_state
            .lock()
            .ok()
            .and_then(|session| session.path.clone())
    }

    /// Send a log line (non-blocking, cannot fail)
    pub fn log(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    /// Send a status announcement
    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    /// Block until every line sent before this call is on disk.
    pub fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Clone for LogCollector {
    fn clone(&self) -> Self {
        LogCollector {
            tx: self.tx.clone(),
            log_dir: self.log_dir.clone(),
            session_state: Arc::clone(&self.session_state),
        }
    }
}

/// Wires log::info!(), log::warn!(), ... into the collector.
/// Records with target "parsed" are routed to the parsed log as well.
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == "parsed" {
            self.log_parsed(message);
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {
        let _ = self.wait_for_empty();
    }
}

fn open_append(path: &Path) -> Option<File> {
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Get the latest log file, or create a new one if none exist
fn get_or_create_latest_log(log_dir: &Path) -> Result<PathBuf, String> {
    if let Ok(entries) = std::fs::read_dir(log_dir) {
        let latest = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
            .max_by_key(|e| e.metadata().ok().and_then(|m| m.modified().ok()));
        if let Some(entry) = latest {
            return Ok(entry.path());
        }
    }

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let log_type = if log_dir.ends_with("parsed") { "parsed" } else { "full" };
    let log_path = log_dir.join(format!("{}_{}.log", timestamp, log_type));
    File::create(&log_path).map_err(|e| format!("Failed to create log file: {}", e))?;
    Ok(log_path)
}
