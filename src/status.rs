//! Shared verdict state for a test run.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

/// Verdict of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// No terminal signal seen yet.
    Waiting,
    Pass,
    Fail,
    /// The ceiling elapsed before any terminal signal.
    TimedOut,
}

impl TestOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestOutcome::Waiting)
    }

    /// Process exit code for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            TestOutcome::Pass => 0,
            _ => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestOutcome::Waiting => "WAITING",
            TestOutcome::Pass => "PASSED",
            TestOutcome::Fail => "FAILED",
            TestOutcome::TimedOut => "TIME OUT",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time copy of a [`SharedStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub outcome: TestOutcome,
    pub message: Option<String>,
}

/// Outcome shared between monitor threads and the polling orchestrator.
///
/// Every access takes the inner lock; callers only ever see copies.
#[derive(Debug, Clone)]
pub struct SharedStatus {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusSnapshot {
                outcome: TestOutcome::Waiting,
                message: None,
            })),
        }
    }

    /// Record an outcome. `Fail` is sticky: once recorded, later calls are
    /// ignored. Returns whether the record was applied.
    pub fn record(&self, outcome: TestOutcome, message: Option<String>) -> bool {
        let mut status = self.lock();
        if status.outcome == TestOutcome::Fail {
            return false;
        }
        status.outcome = outcome;
        if message.is_some() {
            status.message = message;
        }
        true
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.record(TestOutcome::Fail, Some(message.into()))
    }

    pub fn pass(&self) -> bool {
        self.record(TestOutcome::Pass, None)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn outcome(&self) -> TestOutcome {
        self.lock().outcome
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        // A panicking monitor must not hide the verdict it already wrote.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
