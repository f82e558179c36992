//! Sequential execution of one test batch.
//!
//! The runner lives on a dedicated worker thread. It owns the stage queue and
//! writes everything it learns into the shared `RunState`; observers never
//! talk to it directly. Stages run strictly one after another and every
//! process handle is joined before the next stage starts.

use super::dialect::{select_dialect, CommandDialect, ToolVersion};
use super::process::{ExitKind, ExitOutcome, ProcessHandle, ProcessSupervisor, StopToken};
use super::progress::{classify, overall_percentage, stage_position, ToolLine};
use super::stages::{render_args, split_probe, StageContext};
use super::state::RunState;
use crate::config::SupervisorConfig;
use crate::error::{ProbeError, ProcessError};
use crate::models::{Connectivity, DeviceIdentity, LifecycleState, PostProcess, StageKind, StageSpec};
use crate::results::{capability, keys, perf, ResultCollector};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of one percentage-tracked stage.
enum StageResult {
    Completed,
    Failed(String),
    Stopped,
}

/// Drives the stages of one run.
pub struct TestBatchRunner {
    config: SupervisorConfig,
    run_dir: PathBuf,
    stages: Vec<StageSpec>,
    state: RunState,
    stop: StopToken,
    /// Latest batch position announced by the runner, `Running <stage> (i/n)`
    position_status: RefCell<String>,
}

impl TestBatchRunner {
    pub fn new(
        config: SupervisorConfig,
        run_dir: PathBuf,
        stages: Vec<StageSpec>,
        state: RunState,
        stop: StopToken,
    ) -> Self {
        TestBatchRunner {
            config,
            run_dir,
            stages,
            state,
            stop,
            position_status: RefCell::new(String::new()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Run the whole batch. Always leaves the state terminal and finished.
    pub fn run(self) -> LifecycleState {
        self.state.set_state(LifecycleState::Running);
        self.state.advance_percentage(1);
        self.state.append_log("Starting TPM test..");
        self.state.tick();
        log::info!("[Runner] Run directory {}", self.run_dir.display());

        let outcome = self.run_batch();

        match outcome {
            LifecycleState::Success => {
                self.state.advance_percentage(100);
                self.state.announce("All tests finished successfully.");
            }
            LifecycleState::Stopped => self.state.announce("Stop requested."),
            _ => self
                .state
                .announce("The test run failed. Please re-run the test."),
        }
        self.state.set_state(outcome);
        self.state.set_finished();
        log::info!("[Runner] Batch finished: {}", outcome);
        outcome
    }

    fn run_batch(&self) -> LifecycleState {
        let (probe, stages) = split_probe(self.stages.clone());
        let base_ctx = StageContext::new(&self.config, &self.run_dir);

        let (dialect, identity) = match self.run_probe(&probe, &base_ctx) {
            Ok(found) => found,
            Err(ProbeError::Stopped) => return LifecycleState::Stopped,
            Err(e) => {
                log::error!("[Runner] Capability probe failed: {}", e);
                self.state.append_log(&format!("Capability probe failed: {}", e));
                self.state.set_status("Capability probe failed.");
                return LifecycleState::Failed;
            }
        };
        self.state.append_log(&format!(
            "Device: {} {} firmware {}",
            identity.manufacturer, identity.vendor, identity.firmware
        ));

        let mut outcome = LifecycleState::Success;
        let total = stages.len();
        for (index, stage) in stages.iter().enumerate() {
            if self.stop.is_requested() {
                outcome = LifecycleState::Stopped;
                break;
            }
            self.announce_position(&format!("Running {} ({}/{})", stage.name, index + 1, total));

            match self.run_stage(stage, &base_ctx, dialect.as_ref()) {
                StageResult::Completed => self.post_process(stage),
                StageResult::Failed(reason) => {
                    log::error!("[Runner] Stage '{}' failed: {}", stage.name, reason);
                    self.state
                        .append_log(&format!("Stage {} failed: {}", stage.name, reason));
                    outcome = LifecycleState::Failed;
                    break;
                }
                StageResult::Stopped => {
                    outcome = LifecycleState::Stopped;
                    break;
                }
            }
        }

        if outcome != LifecycleState::Stopped {
            self.state.announce("Testing internet connection...");
            let connectivity = probe_connectivity(
                &self.config.connectivity_url,
                self.config.connectivity_timeout(),
            );
            self.state.set_connectivity(connectivity);
            self.state.tick();
        }

        // partial results are still packaged after a failure or stop
        if let Err(e) = self.package(&probe, &identity) {
            log::error!("[Runner] {}", e);
            self.state.append_log(&e);
            self.state.set_status("Failed to archive the results.");
            if outcome == LifecycleState::Success {
                outcome = LifecycleState::Failed;
            }
        }
        outcome
    }

    /// Query the tool version, run the capability probe and read the device identity.
    fn run_probe(
        &self,
        probe: &StageSpec,
        base_ctx: &StageContext,
    ) -> Result<(Box<dyn CommandDialect>, DeviceIdentity), ProbeError> {
        self.state.announce(&format!("Running {}", probe.name));

        let version = self.spawn(&["--version".to_string()])?;
        let (_, lines) = version.wait()?;
        let modern_since =
            ToolVersion::parse(&self.config.modern_dialect_since).unwrap_or(ToolVersion(0, 6, 0));
        let dialect = select_dialect(&lines.concat(), modern_since);

        let ctx = base_ctx.for_stage(&self.run_dir, probe);
        std::fs::create_dir_all(&ctx.outdir)
            .map_err(|e| ProbeError::DumpMissing(format!("{}: {}", ctx.outdir.display(), e)))?;
        let args = dialect.stage_args(&probe.category, &render_args(probe, &ctx));
        let handle = self.spawn(&args)?;

        let outcome = self.pump(handle, false)?;
        match outcome.kind() {
            ExitKind::Success => {}
            ExitKind::Stopped => return Err(ProbeError::Stopped),
            ExitKind::Failed(code) => return Err(ProbeError::ProbeFailed(code)),
        }

        let identity =
            capability::read_identity(&ctx.outdir, prefix_or(probe, capability::DUMP_PREFIX))?;
        log::info!(
            "[Runner] Device {} using {} dialect",
            identity.file_stem(),
            dialect.name()
        );
        Ok((dialect, identity))
    }

    fn run_stage(
        &self,
        stage: &StageSpec,
        base_ctx: &StageContext,
        dialect: &dyn CommandDialect,
    ) -> StageResult {
        let ctx = base_ctx.for_stage(&self.run_dir, stage);
        if let Err(e) = std::fs::create_dir_all(&ctx.outdir) {
            return StageResult::Failed(format!("cannot create {}: {}", ctx.outdir.display(), e));
        }

        let args = dialect.stage_args(&stage.category, &render_args(stage, &ctx));
        log::debug!("[Runner] {} {}", self.config.tool_path, args.join(" "));
        let handle = match self.spawn(&args) {
            Ok(handle) => handle,
            Err(e) => return StageResult::Failed(e.to_string()),
        };

        match self.pump(handle, true) {
            Ok(outcome) => match outcome.kind() {
                ExitKind::Success => StageResult::Completed,
                ExitKind::Stopped => StageResult::Stopped,
                ExitKind::Failed(code) => StageResult::Failed(match code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                }),
            },
            Err(e) => StageResult::Failed(e.to_string()),
        }
    }

    fn spawn(&self, args: &[String]) -> Result<ProcessHandle, ProcessError> {
        let full = self.config.tool_args.iter().chain(args.iter());
        ProcessSupervisor::start(&self.config.tool_path, full, self.stop.clone())
    }

    /// Feed process output into the state until exit or stop, then join the process.
    fn pump(&self, mut handle: ProcessHandle, track_progress: bool) -> Result<ExitOutcome, ProcessError> {
        loop {
            let lines = handle.read_available_lines();
            let idle = lines.is_empty();
            for line in &lines {
                self.handle_line(line, track_progress);
            }
            self.state.tick();

            if self.stop.is_requested() {
                self.state
                    .append_log("Waiting for the tpm2_algtest process to finish...");
                let (outcome, rest) = handle.terminate()?;
                for line in &rest {
                    self.handle_line(line, track_progress);
                }
                return Ok(outcome);
            }

            if !handle.is_alive() {
                let (outcome, rest) = handle.wait()?;
                for line in &rest {
                    self.handle_line(line, track_progress);
                }
                return Ok(outcome);
            }

            if idle {
                std::thread::sleep(self.config.idle_recheck());
            }
        }
    }

    fn handle_line(&self, raw: &str, track_progress: bool) {
        match classify(raw) {
            ToolLine::Percentage(local) => {
                if track_progress {
                    let status = self.position_status.borrow();
                    self.state
                        .advance_percentage(overall_percentage(&status, local));
                }
            }
            // tool statuses are shown but never move the batch position
            ToolLine::Status(status) => self.state.announce(&status),
            ToolLine::Log(text) => self.state.append_log(&text),
            ToolLine::Empty => {}
        }
    }

    /// Announce the batch position that stage-local percentages are mapped onto.
    fn announce_position(&self, status: &str) {
        if stage_position(status).is_some() {
            *self.position_status.borrow_mut() = status.to_string();
        }
        self.state.announce(status);
    }

    fn post_process(&self, stage: &StageSpec) {
        match stage.post_process {
            Some(PostProcess::RecoverKeys) => {
                self.state.set_status("Recovering private keys...");
                self.recover_keys(
                    &self.run_dir.join(&stage.output_subdir),
                    prefix_or(stage, keys::KEYGEN_PREFIX),
                );
            }
            None => {}
        }
    }

    fn recover_keys(&self, dir: &Path, prefix: &str) {
        let files = match keys::find_key_files(dir, prefix) {
            Ok(files) => files,
            Err(e) => {
                log::warn!("[Runner] Cannot list key files in {}: {}", dir.display(), e);
                return;
            }
        };
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match keys::recover_file(&file) {
                Ok(report) => {
                    self.state.append_log(&format!(
                        "{}: recovered {} keys, {} failed",
                        name,
                        report.recovered,
                        report.failures.len()
                    ));
                    for failure in &report.failures {
                        self.state.append_log(&format!(
                            "{}: row {} (id {}) skipped: {}",
                            name, failure.row, failure.id, failure.failure
                        ));
                    }
                }
                Err(e) => {
                    log::warn!("[Runner] Key recovery in {} failed: {}", name, e);
                    self.state
                        .append_log(&format!("{}: key recovery failed: {}", name, e));
                }
            }
            self.state.tick();
        }
    }

    /// Write the summaries and zip the run directory.
    ///
    /// The archive is attempted even when the summaries could not be written,
    /// so the raw detail tree is always deliverable.
    fn package(&self, probe: &StageSpec, identity: &DeviceIdentity) -> Result<PathBuf, String> {
        self.state.announce("Formatting results...");
        let perf_prefix = self
            .stages
            .iter()
            .find(|s| s.kind == StageKind::Performance)
            .map_or(perf::PERF_PREFIX, |s| prefix_or(s, perf::PERF_PREFIX));
        let collected = ResultCollector::new(&self.run_dir, &probe.output_subdir, &self.config.image_tag)
            .with_warmup_rows(self.config.warmup_rows.clone())
            .with_prefixes(prefix_or(probe, capability::DUMP_PREFIX), perf_prefix)
            .collect(identity);
        if let Err(e) = collected {
            log::error!("[Runner] Result collection failed: {}", e);
            self.state.append_log(&format!("Result collection failed: {}", e));
            self.state.set_status("Failed to format the results.");
        }

        let archive = crate::results::create_archive(&self.run_dir)
            .map_err(|e| format!("Archive creation failed: {}", e))?;
        self.state.append_log(&format!(
            "Results archived in {}",
            archive.display()
        ));
        Ok(archive)
    }
}

/// File name prefix of a stage's detail files, or `default` when the stage names none.
fn prefix_or<'a>(stage: &'a StageSpec, default: &'a str) -> &'a str {
    if stage.output_prefix.is_empty() {
        default
    } else {
        &stage.output_prefix
    }
}

/// One GET against `url`; any response at all means online.
pub fn probe_connectivity(url: &str, timeout: Duration) -> Connectivity {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            log::warn!("[Runner] Cannot build HTTP client: {}", e);
            return Connectivity::Offline;
        }
    };
    match client.get(url).send() {
        Ok(_) => Connectivity::Online,
        Err(e) => {
            log::info!("[Runner] Connectivity probe to {} failed: {}", url, e);
            Connectivity::Offline
        }
    }
}
