//! External test process lifecycle.
//!
//! stdout and stderr are drained by two reader threads into one unbounded
//! crossbeam channel, so `read_available_lines` never blocks: the worker can
//! interleave polling with stop checks even when the tool is silent.
//!
//! The tool runs as the leader of its own process group. Termination signals
//! the whole group, so helpers the tool forked die with it and release the
//! output pipes.

use crate::error::ProcessError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Time the group gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(5);
/// Time the reader threads get to hit EOF once the tool has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const POLL_STEP: Duration = Duration::from_millis(20);

/// Cooperative stop request shared between the observer, the worker and the process handle.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        StopToken::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// Non-zero exit (or signal) without a stop request
    Failed(Option<i32>),
    /// Any exit after a stop request, whatever the code
    Stopped,
}

/// Exit status plus whether a stop had been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub stop_requested: bool,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus, stop_requested: bool) -> Self {
        ExitOutcome {
            code: status.code(),
            stop_requested,
        }
    }

    pub fn kind(&self) -> ExitKind {
        if self.stop_requested {
            ExitKind::Stopped
        } else if self.code == Some(0) {
            ExitKind::Success
        } else {
            ExitKind::Failed(self.code)
        }
    }
}

/// Spawns the external test executable.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn `command args...` with both output streams piped into a line channel.
    pub fn start<I, S>(command: &str, args: I, stop: StopToken) -> Result<ProcessHandle, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed {
                cmd: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::PipeUnavailable("stderr"))?;

        let (tx, rx) = unbounded::<String>();
        let readers = vec![
            spawn_reader("stdout", stdout, tx.clone()),
            spawn_reader("stderr", stderr, tx),
        ];

        log::debug!("[Process] Spawned {} (pid {})", command, child.id());

        Ok(ProcessHandle {
            child,
            lines: rx,
            readers,
            stop,
            exit: None,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    name: &'static str,
    stream: R,
    tx: Sender<String>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    // keep the terminator: the percentage protocol is defined on it
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("[Process] {} read error: {}", name, e);
                    break;
                }
            }
        }
    })
}

/// A running (or finished) test process.
pub struct ProcessHandle {
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    stop: StopToken,
    exit: Option<ExitOutcome>,
}

impl ProcessHandle {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Every complete line received so far; empty when none are ready.
    pub fn read_available_lines(&self) -> Vec<String> {
        self.lines.try_iter().collect()
    }

    /// Polls the child without blocking; records the exit once observed.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(ExitOutcome::from_status(status, self.stop.is_requested()));
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("[Process] try_wait failed: {}", e);
                false
            }
        }
    }

    /// Cooperative stop: only raises the shared flag.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Wait for a natural exit, then drain whatever output is left.
    pub fn wait(mut self) -> Result<(ExitOutcome, Vec<String>), ProcessError> {
        let outcome = self.reap()?;
        Ok((outcome, self.drain()))
    }

    /// SIGTERM the process group, SIGKILL it after a grace period, then drain the remaining output.
    pub fn terminate(mut self) -> Result<(ExitOutcome, Vec<String>), ProcessError> {
        if self.is_alive() {
            self.signal_group(Signal::SIGTERM)?;
            log::info!("[Process] Sent SIGTERM to process group {}", self.child.id());

            let deadline = Instant::now() + TERM_GRACE;
            while self.is_alive() && Instant::now() < deadline {
                std::thread::sleep(POLL_STEP);
            }
            if self.is_alive() {
                log::warn!(
                    "[Process] Group {} ignored SIGTERM, sending SIGKILL",
                    self.child.id()
                );
                self.signal_group(Signal::SIGKILL)?;
            }
        }
        let outcome = self.reap()?;
        // the leader is gone; stragglers still in its group go too
        let _ = self.signal_group(Signal::SIGKILL);
        Ok((outcome, self.drain()))
    }

    /// Signal every process in the tool's group. A group that is already gone is not an error.
    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        let pid = self.child.id();
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::SignalFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    fn reap(&mut self) -> Result<ExitOutcome, ProcessError> {
        if let Some(outcome) = self.exit {
            return Ok(outcome);
        }
        let status = self.child.wait()?;
        let outcome = ExitOutcome::from_status(status, self.stop.is_requested());
        self.exit = Some(outcome);
        Ok(outcome)
    }

    /// Collect the tail of the output once the readers hit EOF.
    ///
    /// A forked helper may still hold the pipes after the tool exited. The group
    /// is killed when the readers outlive `DRAIN_GRACE`, and readers still
    /// blocked after a second grace period are detached.
    fn drain(&mut self) -> Vec<String> {
        if !self.readers_finished(DRAIN_GRACE) {
            log::warn!(
                "[Process] Output of group {} still open after exit, killing the group",
                self.child.id()
            );
            let _ = self.signal_group(Signal::SIGKILL);
            if !self.readers_finished(DRAIN_GRACE) {
                log::warn!("[Process] Detaching reader threads of {}", self.child.id());
                self.readers.clear();
            }
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        self.lines.try_iter().collect()
    }

    fn readers_finished(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.readers.iter().all(|r| r.is_finished()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_STEP);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // never leave the tool or its helpers orphaned
        if self.exit.is_none() {
            if let Ok(None) = self.child.try_wait() {
                let _ = self.signal_group(Signal::SIGKILL);
                let _ = self.child.wait();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn collect_until_exit(handle: &mut ProcessHandle) -> Vec<String> {
        let mut lines = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.is_alive() && Instant::now() < deadline {
            lines.extend(handle.read_available_lines());
            std::thread::sleep(Duration::from_millis(10));
        }
        lines
    }

    #[test]
    fn test_lines_from_both_streams() {
        let mut handle = ProcessSupervisor::start(
            "sh",
            ["-c", "echo out; echo err 1>&2; printf '50%%\\n'"],
            StopToken::new(),
        )
        .unwrap();
        let mut lines = collect_until_exit(&mut handle);
        let (outcome, rest) = handle.wait().unwrap();
        lines.extend(rest);

        assert_eq!(outcome.kind(), ExitKind::Success);
        assert!(lines.contains(&"out\n".to_string()));
        assert!(lines.contains(&"err\n".to_string()));
        assert!(lines.contains(&"50%\n".to_string()));
    }

    #[test]
    fn test_read_is_non_blocking_on_silent_process() {
        let handle = ProcessSupervisor::start("sleep", ["5"], StopToken::new()).unwrap();
        let started = Instant::now();
        assert!(handle.read_available_lines().is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        let (outcome, _) = handle.terminate().unwrap();
        assert_eq!(outcome.kind(), ExitKind::Failed(None));
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let handle = ProcessSupervisor::start("sh", ["-c", "exit 3"], StopToken::new()).unwrap();
        let (outcome, _) = handle.wait().unwrap();
        assert_eq!(outcome.kind(), ExitKind::Failed(Some(3)));
    }

    #[test]
    fn test_stop_then_terminate_is_stopped() {
        let stop = StopToken::new();
        let handle = ProcessSupervisor::start("sleep", ["30"], stop.clone()).unwrap();
        handle.request_stop();
        assert!(stop.is_requested());
        let (outcome, _) = handle.terminate().unwrap();
        assert_eq!(outcome.kind(), ExitKind::Stopped);
    }

    #[test]
    fn test_stop_with_zero_exit_is_still_stopped() {
        let stop = StopToken::new();
        let handle = ProcessSupervisor::start("true", Vec::<&str>::new(), stop.clone()).unwrap();
        stop.request();
        let (outcome, _) = handle.wait().unwrap();
        assert_eq!(outcome.kind(), ExitKind::Stopped);
    }

    #[test]
    fn test_terminate_drains_buffered_output() {
        let handle = ProcessSupervisor::start(
            "sh",
            ["-c", "echo first; echo second; exec sleep 30"],
            StopToken::new(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let (_, rest) = handle.terminate().unwrap();
        assert!(rest.contains(&"first\n".to_string()));
        assert!(rest.contains(&"second\n".to_string()));
    }

    #[test]
    fn test_terminate_reaches_forked_children() {
        let handle = ProcessSupervisor::start(
            "sh",
            ["-c", "echo started; sleep 20; echo done"],
            StopToken::new(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        let (_, rest) = handle.terminate().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rest.contains(&"started\n".to_string()));
        assert!(!rest.contains(&"done\n".to_string()));
    }

    /// Running and not a zombie waiting for its new parent to reap it.
    #[cfg(target_os = "linux")]
    fn running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(false, |rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_terminate_leaves_no_orphan() {
        let mut handle = ProcessSupervisor::start(
            "sh",
            ["-c", "sleep 30 & echo $!; wait"],
            StopToken::new(),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lines = Vec::new();
        while lines.is_empty() && Instant::now() < deadline {
            lines.extend(handle.read_available_lines());
            std::thread::sleep(Duration::from_millis(10));
        }
        let helper: i32 = lines[0].trim().parse().unwrap();
        assert!(handle.is_alive());

        handle.terminate().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while running(helper) {
            assert!(Instant::now() < deadline, "helper {} survived termination", helper);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_wait_is_bounded_when_helper_holds_output() {
        let handle = ProcessSupervisor::start(
            "sh",
            ["-c", "sleep 30 & echo leader done"],
            StopToken::new(),
        )
        .unwrap();
        let started = Instant::now();
        let (outcome, rest) = handle.wait().unwrap();
        assert_eq!(outcome.kind(), ExitKind::Success);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(rest.contains(&"leader done\n".to_string()));
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let err = ProcessSupervisor::start("/nonexistent/tpm2_algtest", ["--version"], StopToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}
