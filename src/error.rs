//! Unified error type hierarchy for the algtest supervisor
//!
//! Provides structured error handling with ProcessError, ProbeError, RecoveryError,
//! CollectError, ArchiveError, DeliveryError, ConfigError and ControlError.

use std::io;
use thiserror::Error;

/// External process lifecycle errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn '{cmd}': {reason}")]
    SpawnFailed { cmd: String, reason: String },

    #[error("Failed to capture {0} of the test process")]
    PipeUnavailable(&'static str),

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Failed to wait for the test process: {0}")]
    WaitFailed(#[from] io::Error),
}

/// Capability probe errors. Any of these is fatal for the whole batch.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Test tool could not be started: {0}")]
    Launch(#[from] ProcessError),

    #[error("Capability probe exited with code {0:?}")]
    ProbeFailed(Option<i32>),

    #[error("Capability dump missing: {0}")]
    DumpMissing(String),

    #[error("Device identity incomplete: {0}")]
    IdentityIncomplete(String),

    #[error("Capability probe stopped by request")]
    Stopped,
}

/// Key-record file errors. Row-level problems are reported, not raised.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Key file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Key file is not valid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Key file lacks required column '{0}'")]
    MissingColumn(String),
}

/// Errors raised while building the support/performance summaries.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Result collection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Detail file is not valid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Detail file {file} lacks required column '{column}'")]
    MissingColumn { file: String, column: String },

    #[error("Detail directory not found: {0}")]
    DetailDirMissing(String),
}

/// Errors raised while zipping the run directory.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip encoding failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Path {0} is outside the run directory")]
    ForeignPath(String),
}

/// Delivery failures. Never change the batch outcome.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No result archive is available yet")]
    NoArchive,

    #[error("Result volume is not mounted at {0}")]
    VolumeUnavailable(String),

    #[error("Failed to copy results to the volume: {0}")]
    CopyFailed(String),

    #[error("Upload request failed: {0}")]
    UploadFailed(String),

    #[error("Upload rejected by the depository")]
    UploadRejected,
}

impl DeliveryError {
    /// Get a user-facing message suitable for the status line
    pub fn user_message(&self) -> String {
        match self {
            DeliveryError::NoArchive => "Results are not ready yet.".to_string(),
            DeliveryError::VolumeUnavailable(_) => {
                "Result partition is not mounted. Can not store on USB.".to_string()
            }
            DeliveryError::CopyFailed(_) => "Failed to copy to USB.".to_string(),
            DeliveryError::UploadFailed(_) | DeliveryError::UploadRejected => {
                "Results upload failed.".to_string()
            }
        }
    }
}

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Misuse of the observer command interface.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("A test run is already in progress")]
    AlreadyRunning,

    #[error("Failed to prepare run directory: {0}")]
    RunDirectory(#[from] io::Error),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

/// Top-level result type for operations that may fail.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
