//! Lock-guarded observable run state.
//!
//! A single mutex guards every observable field. Mutators lock, write and raise
//! the `changed` flag; accessors lock and return copies. `has_changed` clears the
//! flag, so a polling observer redraws only on edges. A condition variable lets
//! synchronous observers block until the next change instead of polling.

use crate::log_collector::LogCollector;
use crate::models::{Connectivity, LifecycleState, RunSnapshot};
use chrono::Local;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Activity within this window keeps `is_busy` true.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Inner {
    percentage: u32,
    status: String,
    statuses: Vec<String>,
    log: VecDeque<String>,
    log_capacity: usize,
    /// Lines appended since the run started, retained or not
    log_appended: usize,
    state: LifecycleState,
    connectivity: Connectivity,
    finished: bool,
    changed: bool,
    last_activity: Option<Instant>,
}

/// Shared handle to one run's observable state. Cloning shares the state.
#[derive(Clone)]
pub struct RunState {
    inner: Arc<(Mutex<Inner>, Condvar)>,
    sink: Option<LogCollector>,
}

impl RunState {
    pub fn new(log_capacity: usize) -> Self {
        RunState {
            inner: Arc::new((
                Mutex::new(Inner {
                    percentage: 0,
                    status: String::new(),
                    statuses: Vec::new(),
                    log: VecDeque::new(),
                    log_capacity: log_capacity.max(1),
                    log_appended: 0,
                    state: LifecycleState::NotRunning,
                    connectivity: Connectivity::Unknown,
                    finished: false,
                    changed: true,
                    last_activity: None,
                }),
                Condvar::new(),
            )),
            sink: None,
        }
    }

    /// Persist every log line and status through the collector as well.
    pub fn with_sink(mut self, collector: LogCollector) -> Self {
        self.sink = Some(collector);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking writer leaves plain data behind; keep serving it
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<F: FnOnce(&mut Inner)>(&self, f: F) {
        {
            let mut inner = self.lock();
            f(&mut inner);
            inner.changed = true;
        }
        self.inner.1.notify_all();
    }

    // ---------------------------------------------------------------------
    // Mutators (worker side)
    // ---------------------------------------------------------------------

    /// Raise the overall percentage. Ignores values below the current one.
    pub fn advance_percentage(&self, value: u32) {
        let value = value.min(100);
        let mut raised = false;
        {
            let mut inner = self.lock();
            if value > inner.percentage {
                inner.percentage = value;
                inner.changed = true;
                raised = true;
            }
        }
        if raised {
            self.inner.1.notify_all();
        }
    }

    /// Explicit restart of the percentage.
    pub fn reset_percentage(&self) {
        self.mutate(|inner| inner.percentage = 0);
    }

    pub fn set_status(&self, status: &str) {
        let entry = format!("{}: {}", Local::now().format("%H:%M:%S"), status);
        self.mutate(|inner| {
            inner.status = status.to_string();
            inner.statuses.push(entry);
        });
        if let Some(ref sink) = self.sink {
            sink.log_parsed(status);
        }
    }

    /// Append timestamped lines; blank lines are dropped.
    pub fn append_log(&self, text: &str) {
        let stamp = Local::now().format("%H:%M:%S").to_string();
        let lines: Vec<String> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| format!("{} {}", stamp, l))
            .collect();
        if lines.is_empty() {
            return;
        }
        if let Some(ref sink) = self.sink {
            for line in &lines {
                sink.log_str(line.clone());
            }
        }
        self.mutate(|inner| {
            for line in lines {
                if inner.log.len() == inner.log_capacity {
                    inner.log.pop_front();
                }
                inner.log.push_back(line);
                inner.log_appended += 1;
            }
        });
    }

    /// Status announcement: becomes the status and is logged.
    pub fn announce(&self, status: &str) {
        self.set_status(status);
        self.append_log(status);
    }

    /// Apply a lifecycle transition. Invalid transitions are refused and logged.
    pub fn set_state(&self, next: LifecycleState) -> bool {
        let mut applied = false;
        self.mutate(|inner| {
            if inner.state == next || inner.state.can_transition_to(next) {
                inner.state = next;
                applied = true;
            }
        });
        if !applied {
            log::warn!("[RunState] Refused transition to {}", next);
        }
        applied
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.mutate(|inner| inner.connectivity = connectivity);
    }

    pub fn set_finished(&self) {
        self.mutate(|inner| inner.finished = true);
    }

    /// Heartbeat from the worker loop.
    pub fn tick(&self) {
        self.lock().last_activity = Some(Instant::now());
    }

    // ---------------------------------------------------------------------
    // Accessors (observer side)
    // ---------------------------------------------------------------------

    pub fn get_percentage(&self) -> u32 {
        self.lock().percentage
    }

    pub fn get_state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn get_status(&self) -> String {
        self.lock().status.clone()
    }

    /// Timestamped history of every status set during the run.
    pub fn get_statuses(&self) -> Vec<String> {
        self.lock().statuses.clone()
    }

    /// Last `lines` log entries joined by newlines; `0` returns everything retained.
    pub fn get_log(&self, lines: usize) -> String {
        let inner = self.lock();
        let skip = if lines == 0 {
            0
        } else {
            inner.log.len().saturating_sub(lines)
        };
        inner
            .log
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Lines appended after the first `seen` ones that are still retained,
    /// with the new total to pass next time.
    pub fn get_log_since(&self, seen: usize) -> (Vec<String>, usize) {
        let inner = self.lock();
        let fresh = inner.log_appended.saturating_sub(seen).min(inner.log.len());
        let skip = inner.log.len() - fresh;
        (
            inner.log.iter().skip(skip).cloned().collect(),
            inner.log_appended,
        )
    }

    pub fn get_connectivity(&self) -> Connectivity {
        self.lock().connectivity
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// True once per change: reading clears the flag.
    pub fn has_changed(&self) -> bool {
        let mut inner = self.lock();
        std::mem::replace(&mut inner.changed, false)
    }

    /// Worker is running and reported activity recently.
    pub fn is_busy(&self) -> bool {
        let inner = self.lock();
        inner.state == LifecycleState::Running
            && inner
                .last_activity
                .map_or(false, |t| t.elapsed() < HEARTBEAT_WINDOW)
    }

    /// Block until a change is pending or the timeout elapses; clears the flag.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |inner| !inner.changed)
            .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut guard.changed, false)
    }

    pub fn snapshot(&self, log_lines: usize) -> RunSnapshot {
        let inner = self.lock();
        let skip = inner.log.len().saturating_sub(log_lines);
        RunSnapshot {
            percentage: inner.percentage,
            state: inner.state,
            status: inner.status.clone(),
            log_tail: inner.log.iter().skip(skip).cloned().collect(),
            connectivity: inner.connectivity,
            finished: inner.finished,
        }
    }
}
