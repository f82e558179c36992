//! Algtest Supervisor
//!
//! Runs TPM algorithm test batches through the external `tpm2_algtest` tool,
//! tracks their live progress for an observer, and packages the raw output
//! into a result archive that can be stored on a USB volume or uploaded.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **config**: Supervisor settings and test profiles
//! - **log_collector**: Unbounded on-disk persistence of every log line
//! - **orchestrator**: Process lifecycle, progress parsing, run state and batch sequencing
//! - **results**: Key recovery, summaries, archive and delivery
//! - **system**: Opaque OS operations (mount, sync, power off)

// Core foundational modules
pub mod error;
pub mod models;

// Settings and test profiles
pub mod config;

// Robust, decoupled logging system
pub mod log_collector;

// Test run supervision
pub mod orchestrator;

// Post-run result pipeline
pub mod results;

// OS abstraction
pub mod system;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{LogCollector, LogLine};

/// Crate version, embedded in the default image tag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

// Re-export error types for easy access
pub use error::{
    ArchiveError, CollectError, ConfigError, ControlError, DeliveryError, ProbeError,
    ProcessError, RecoveryError, Result,
};

// Re-export model types for easy access
pub use models::{
    Connectivity, DeviceIdentity, LifecycleState, PostProcess, RunSnapshot, StageKind,
    StageSpec,
};

// Re-export config types and SettingsManager
pub use config::{SettingsManager, SupervisorConfig, TestProfile};

// Re-export orchestrator entry points
pub use orchestrator::{AlgtestController, RunState, StopToken, TestBatchRunner};

// Re-export system layer
pub use system::{SystemImpl, SystemOps};
