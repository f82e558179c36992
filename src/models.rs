//! Core data structures shared by the supervisor, the result pipeline and the observer.
//!
//! - `LifecycleState`: the run state machine (`NotRunning -> Running -> {Success, Failed, Stopped}`)
//! - `Connectivity`: tri-state internet reachability recorded after a run
//! - `StageSpec`: immutable descriptor of one external-tool invocation
//! - `DeviceIdentity`: manufacturer/vendor/firmware triple used to name summaries
//! - `RunSnapshot`: an immutable copy of the observable run state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    NotRunning,
    Running,
    Success,
    Failed,
    Stopped,
}

impl LifecycleState {
    /// Get the human-readable name for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotRunning => "not running",
            LifecycleState::Running => "running",
            LifecycleState::Success => "success",
            LifecycleState::Failed => "failed",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Terminal states are final for a run instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Success | LifecycleState::Failed | LifecycleState::Stopped
        )
    }

    /// Get all valid transitions FROM this state.
    pub fn valid_next_states(&self) -> Vec<LifecycleState> {
        match self {
            LifecycleState::NotRunning => vec![LifecycleState::Running],
            LifecycleState::Running => vec![
                LifecycleState::Success,
                LifecycleState::Failed,
                LifecycleState::Stopped,
            ],
            LifecycleState::Success | LifecycleState::Failed | LifecycleState::Stopped => vec![],
        }
    }

    /// Check if a transition to the given state is valid.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        self.valid_next_states().contains(&next)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internet reachability as measured by the post-run connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Unknown,
    Online,
    Offline,
}

impl Connectivity {
    pub fn as_option(&self) -> Option<bool> {
        match self {
            Connectivity::Unknown => None,
            Connectivity::Online => Some(true),
            Connectivity::Offline => Some(false),
        }
    }
}

/// The category of test a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Synchronous device metadata query, no percentage tracking
    CapabilityProbe,
    /// Performance benchmark of TPM commands
    Performance,
    /// Key generation benchmark (produces `Keygen_RSA_<bits>_keys.csv`)
    KeyGeneration,
    /// Anything else the tool offers (rng, cryptoops, ...)
    Other,
}

/// Work to run after a stage finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostProcess {
    /// Recover `q` and `d` for every key-record file the stage produced
    RecoverKeys,
}

/// Static descriptor of one stage. Immutable once the batch is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Display name, used in status announcements
    pub name: String,
    /// Tool category passed through the command dialect (e.g. "perf")
    pub category: String,
    pub kind: StageKind,
    /// Argument template; `{outdir}`, `{iterations}`, `{rng_bytes}`, `{tcti}` are substituted
    pub args: Vec<String>,
    /// Subdirectory of the run directory the tool writes into
    pub output_subdir: String,
    /// File name prefix of the detail files this stage produces; empty selects the
    /// built-in prefix for the stage's kind
    pub output_prefix: String,
    pub post_process: Option<PostProcess>,
}

impl StageSpec {
    pub fn new(name: &str, category: &str, kind: StageKind) -> Self {
        StageSpec {
            name: name.to_string(),
            category: category.to_string(),
            kind,
            args: vec!["--outdir".to_string(), "{outdir}".to_string()],
            output_subdir: "detail".to_string(),
            output_prefix: String::new(),
            post_process: None,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_output_prefix(mut self, prefix: &str) -> Self {
        self.output_prefix = prefix.to_string();
        self
    }

    pub fn with_post_process(mut self, post: PostProcess) -> Self {
        self.post_process = Some(post);
        self
    }

    /// Default capability probe stage (`Quicktest_<category>.txt` dumps).
    pub fn capability_probe() -> Self {
        StageSpec::new("capability probe", "quicktest", StageKind::CapabilityProbe)
            .with_output_prefix("Quicktest_")
    }
}

/// Identity of the device under test, read from the capability dump.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub vendor: String,
    pub firmware: String,
}

impl DeviceIdentity {
    /// File stem shared by the support and performance summaries.
    pub fn file_stem(&self) -> String {
        let sanitize = |s: &str| -> String {
            let cleaned: String = s
                .trim()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
                .collect();
            if cleaned.is_empty() {
                "unknown".to_string()
            } else {
                cleaned
            }
        };
        format!(
            "{}_{}_{}",
            sanitize(&self.manufacturer),
            sanitize(&self.vendor),
            sanitize(&self.firmware)
        )
    }
}

/// Immutable copy of the observable run state.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub percentage: u32,
    pub state: LifecycleState,
    pub status: String,
    pub log_tail: Vec<String>,
    pub connectivity: Connectivity,
    pub finished: bool,
}
