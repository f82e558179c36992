//! Test run supervision: process lifecycle, progress parsing, shared state and batch sequencing.
//!
//! `controller` is the entry point for observers. It spawns one `runner` per run
//! on a worker thread; the runner drives `process` per stage, classifies output
//! with `progress` and publishes everything through `state`.

pub mod controller;
pub mod dialect;
pub mod process;
pub mod progress;
pub mod runner;
pub mod stages;
pub mod state;

pub use controller::AlgtestController;
pub use dialect::{select_dialect, CommandDialect, ToolVersion};
pub use process::{ExitKind, ExitOutcome, ProcessHandle, ProcessSupervisor, StopToken};
pub use progress::{classify, overall_percentage, ToolLine};
pub use runner::{probe_connectivity, TestBatchRunner};
pub use state::RunState;
