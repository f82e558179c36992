//! Observer-facing command interface.
//!
//! The controller owns the worker thread and the current `RunState`. Observers
//! poll the getters and issue the four commands: start, stop, store to volume
//! and upload. Delivery failures only change the status line and the log,
//! never the lifecycle state of the run.

use super::process::StopToken;
use super::runner::TestBatchRunner;
use super::state::RunState;
use crate::config::SupervisorConfig;
use crate::error::{ControlError, DeliveryError};
use crate::log_collector::LogCollector;
use crate::models::{Connectivity, LifecycleState, RunSnapshot, StageSpec};
use crate::results::{archive, distribute, Uploader};
use crate::system::SystemOps;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

pub const RUN_ROOT: &str = "tpm2-algtest";

/// Command and observation surface of the supervisor.
pub struct AlgtestController {
    config: SupervisorConfig,
    system: Arc<dyn SystemOps>,
    log_sink: Option<LogCollector>,
    state: RunState,
    stop: StopToken,
    run_dir: Option<PathBuf>,
    contact: Option<String>,
    worker: Option<JoinHandle<LifecycleState>>,
}

impl AlgtestController {
    pub fn new(config: SupervisorConfig, system: Arc<dyn SystemOps>) -> Self {
        let state = RunState::new(config.log_capacity);
        AlgtestController {
            config,
            system,
            log_sink: None,
            state,
            stop: StopToken::new(),
            run_dir: None,
            contact: None,
            worker: None,
        }
    }

    /// Persist every run's log and statuses through `collector`.
    pub fn with_log_sink(mut self, collector: LogCollector) -> Self {
        self.state = self.state.clone().with_sink(collector.clone());
        self.log_sink = Some(collector);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Start a new run with a fresh state and run directory.
    pub fn start(
        &mut self,
        stages: Vec<StageSpec>,
        contact: Option<String>,
    ) -> Result<PathBuf, ControlError> {
        if self.worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return Err(ControlError::AlreadyRunning);
        }
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        let run_dir = self
            .config
            .work_dir
            .join(RUN_ROOT)
            .join(format!("algtest_result_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&run_dir)?;

        let mut state = RunState::new(self.config.log_capacity);
        if let Some(ref sink) = self.log_sink {
            if let Some(name) = run_dir.file_name() {
                if let Err(e) = sink.start_new_session(&format!("{}.log", name.to_string_lossy())) {
                    log::warn!("[Controller] Could not open run log: {}", e);
                }
            }
            state = state.with_sink(sink.clone());
        }
        let stop = StopToken::new();

        let runner = TestBatchRunner::new(
            self.config.clone(),
            run_dir.clone(),
            stages,
            state.clone(),
            stop.clone(),
        );
        let worker = std::thread::Builder::new()
            .name("algtest-runner".to_string())
            .spawn(move || runner.run())
            .map_err(|e| ControlError::WorkerSpawn(e.to_string()))?;

        log::info!("[Controller] Started run in {}", run_dir.display());
        self.state = state;
        self.stop = stop;
        self.run_dir = Some(run_dir.clone());
        self.contact = contact;
        self.worker = Some(worker);
        Ok(run_dir)
    }

    /// Cooperative stop of the current run.
    pub fn stop(&self) {
        if !self.stop.is_requested() {
            log::info!("[Controller] Stop requested");
            self.state.append_log("Stop requested.");
        }
        self.stop.request();
    }

    /// Copy the archive and instructions onto the result volume.
    pub fn store_to_volume(&self) -> Result<PathBuf, DeliveryError> {
        let archive = match self.archive_path() {
            Some(archive) => archive,
            None => {
                self.report_delivery_failure(&DeliveryError::NoArchive);
                return Err(DeliveryError::NoArchive);
            }
        };
        let result = distribute::store_to_volume(
            self.system.as_ref(),
            &archive,
            &self.config.result_mount_point,
            &self.config.result_volume_label,
        );
        match result {
            Ok(ref copied) => {
                let name = copied
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.state
                    .append_log(&format!("Copied to USB. File name: {}", name));
            }
            Err(ref e) => self.report_delivery_failure(e),
        }
        result
    }

    /// Upload the archive with the operator contact. Blocking.
    pub fn upload(&self) -> Result<(), DeliveryError> {
        let archive = match self.archive_path() {
            Some(archive) => archive,
            None => {
                self.report_delivery_failure(&DeliveryError::NoArchive);
                return Err(DeliveryError::NoArchive);
            }
        };
        self.state.append_log("Uploading results...");

        let description = format!(
            "{}; contact: {}",
            self.config.image_tag,
            self.contact.as_deref().unwrap_or("none")
        );
        let message = self.contact.clone().unwrap_or_default();
        let result = Uploader::from_config(&self.config).upload(&archive, &description, &message);
        match result {
            Ok(()) => {
                self.state.append_log("Results uploaded successfully.");
                self.state.set_status("Results uploaded successfully.");
            }
            Err(ref e) => self.report_delivery_failure(e),
        }
        result
    }

    fn report_delivery_failure(&self, error: &DeliveryError) {
        log::warn!("[Controller] Delivery failed: {}", error);
        let message = error.user_message();
        self.state.append_log(&message);
        self.state.set_status(&message);
    }

    /// Power the machine off through the system layer.
    pub fn power_off(&self) -> Result<(), String> {
        self.system.power_off()
    }

    /// Block until the worker has returned.
    pub fn join(&mut self) -> Option<LifecycleState> {
        self.worker.take().and_then(|w| w.join().ok())
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    pub fn get_percentage(&self) -> u32 {
        self.state.get_percentage()
    }

    pub fn get_state(&self) -> LifecycleState {
        self.state.get_state()
    }

    pub fn get_status(&self) -> String {
        self.state.get_status()
    }

    pub fn get_statuses(&self) -> Vec<String> {
        self.state.get_statuses()
    }

    pub fn get_log(&self, lines: usize) -> String {
        self.state.get_log(lines)
    }

    pub fn get_connectivity(&self) -> Connectivity {
        self.state.get_connectivity()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn has_changed(&self) -> bool {
        self.state.has_changed()
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.snapshot(self.config.display_log_lines)
    }

    /// Shared handle to the current run's state.
    pub fn state(&self) -> RunState {
        self.state.clone()
    }

    pub fn run_dir(&self) -> Option<PathBuf> {
        self.run_dir.clone()
    }

    /// Archive of the current run, once the run has finished and written it.
    pub fn archive_path(&self) -> Option<PathBuf> {
        if !self.state.is_finished() {
            return None;
        }
        self.run_dir
            .as_deref()
            .map(archive::archive_path)
            .filter(|p| p.is_file())
    }
}

impl Drop for AlgtestController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if !worker.is_finished() {
                self.stop.request();
            }
            let _ = worker.join();
        }
    }
}
