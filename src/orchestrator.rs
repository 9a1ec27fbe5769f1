//! End-to-end test runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{HarnessError, Result};
use crate::monitor::{MonitorHandle, SerialMonitor};
use crate::qemu::VmProcess;
use crate::remote::{Interruption, RemoteCommandRunner, RemoteShell};
use crate::rules::VerdictRule;
use crate::scenario::{RemoteStep, RunPlan, Strategy};
use crate::status::{SharedStatus, TestOutcome};

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub outcome: TestOutcome,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub serial_file: PathBuf,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Drives one run: boot, observe, tear down, decide.
pub struct Orchestrator {
    plan: RunPlan,
}

impl Orchestrator {
    pub fn new(plan: RunPlan) -> Self {
        Self { plan }
    }

    /// Perform setup, boot QEMU and run the plan, using ssh for remote steps.
    pub fn run(self) -> Result<RunReport> {
        for action in &self.plan.setup {
            action.apply()?;
        }
        let vm = VmProcess::start(&self.plan.qemu, self.plan.timings.stop_grace)?;
        let shell = self.plan.ssh.clone();
        self.run_with(vm, shell)
    }

    /// Run the plan against an already started VM.
    ///
    /// The VM is stopped before this returns, whether the run passed, failed,
    /// errored or panicked.
    pub fn run_with<S: RemoteShell>(self, mut vm: VmProcess, shell: Option<S>) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let RunPlan { name, qemu, strategy, ceiling, post_checks, watch_serial, timings, .. } =
            self.plan;
        let serial_file = qemu.serial_file;
        let status = SharedStatus::new();

        let monitor_for = |rule: VerdictRule| -> Result<MonitorHandle> {
            let monitor = SerialMonitor {
                serial_file: serial_file.clone(),
                rule,
                watch: watch_serial,
                file_poll: timings.file_poll,
                read_poll: timings.serial_poll,
            };
            Ok(monitor.spawn(status.clone())?)
        };

        let observed = (|| -> Result<Option<MonitorHandle>> {
            match strategy {
                Strategy::Serial(rule) => {
                    let monitor = monitor_for(rule)?;
                    poll_status(&status, &mut vm, ceiling, timings.status_poll)?;
                    Ok(Some(monitor))
                }
                Strategy::Remote(steps) => {
                    let shell = shell.ok_or_else(|| {
                        HarnessError::Setup("remote steps need a remote shell".to_string())
                    })?;
                    let monitor =
                        if watch_serial { Some(monitor_for(VerdictRule::Passive)?) } else { None };
                    let mut runner = RemoteCommandRunner::new(shell);
                    runner.poll_interval = timings.ssh_poll;
                    runner.retry_interval = timings.ssh_retry;
                    runner.verbose = qemu.verbose;
                    run_remote_steps(&runner, &steps, &status, ceiling);
                    Ok(monitor)
                }
            }
        })();

        let teardown = vm.stop();
        let observed = observed.and_then(|monitor| {
            if let Some(monitor) = monitor {
                monitor.stop();
            }
            teardown.map(|_| ())
        });
        if let Err(e) = observed {
            error!("Run aborted: {}", e);
            return Err(e);
        }

        let snapshot = status.snapshot();
        let (mut outcome, mut message) = match snapshot.outcome {
            TestOutcome::Waiting => (
                TestOutcome::TimedOut,
                Some(format!("no verdict within {}s", ceiling.as_secs())),
            ),
            outcome => (outcome, snapshot.message),
        };

        if outcome == TestOutcome::Pass {
            for check in &post_checks {
                info!("Test {} in serial", check.label);
                if !check.holds(&serial_file)? {
                    warn!("{:?} not found in {}", check.needle, serial_file.display());
                    outcome = TestOutcome::Fail;
                    message = Some(format!("serial output lacks {:?}", check.needle));
                    break;
                }
            }
        }

        match (&outcome, &message) {
            (TestOutcome::Pass, _) => info!("TEST PASSED"),
            (_, Some(message)) => info!("TEST {}: {}", outcome, message),
            (_, None) => info!("TEST {}", outcome),
        }

        Ok(RunReport {
            scenario: name,
            outcome,
            message,
            started_at,
            duration_secs: start.elapsed().as_secs_f64(),
            serial_file,
        })
    }
}

/// Poll until the status turns terminal, the VM dies or `ceiling` elapses.
fn poll_status(
    status: &SharedStatus,
    vm: &mut VmProcess,
    ceiling: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut tick = 0u64;
    loop {
        info!("MET = {}", tick);
        if status.outcome().is_terminal() {
            return Ok(());
        }
        if let Some(exit) = vm.try_wait()? {
            // Let the monitor drain what the VM wrote before it went away.
            thread::sleep(interval);
            if !status.outcome().is_terminal() {
                status.record(
                    TestOutcome::TimedOut,
                    Some(format!("VM exited with {} before a verdict", exit)),
                );
            }
            return Ok(());
        }
        if start.elapsed() >= ceiling {
            return Ok(());
        }
        thread::sleep(interval.min(ceiling.saturating_sub(start.elapsed())));
        tick += 1;
    }
}

/// Run each step in order, stopping at the first that does not pass, on a
/// failure recorded elsewhere (the serial monitor), or once `ceiling` elapses.
fn run_remote_steps<S: RemoteShell>(
    runner: &RemoteCommandRunner<S>,
    steps: &[RemoteStep],
    status: &SharedStatus,
    ceiling: Duration,
) {
    let deadline = Instant::now() + ceiling;
    let cancel = || status.outcome() == TestOutcome::Fail || Instant::now() >= deadline;
    for step in steps {
        if cancel() {
            status.record(
                TestOutcome::TimedOut,
                Some(format!("{}: no verdict within {}s", step.label, ceiling.as_secs())),
            );
            return;
        }
        let report =
            runner.run_until(&step.command, step.connect_timeout, step.run_timeout, cancel);
        if let Some(interruption) = report.interruption {
            let message = match interruption {
                Interruption::Cancelled => {
                    format!("{}: no verdict within {}s", step.label, ceiling.as_secs())
                }
                _ => format!("{}: {} ({:?})", step.label, interruption.label(), report.lines),
            };
            status.record(TestOutcome::TimedOut, Some(message));
            return;
        }
        if report.return_code != Some(0) {
            status.fail(format!(
                "{}: exit code {:?} ({:?})",
                step.label, report.return_code, report.lines
            ));
            return;
        }
        if let Some(expected) = &step.expect_line {
            if !report.lines.iter().any(|line| line.contains(expected.as_str())) {
                status.fail(format!("{}: no {:?} in {:?}", step.label, expected, report.lines));
                return;
            }
        }
        info!("{} passed", step.label);
    }
    status.pass();
}
