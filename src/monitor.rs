//! Background serial monitor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::rules::{Event, VerdictRule};
use crate::serial::open_serial;
use crate::status::SharedStatus;

/// Watches a serial log file on a background thread and records the verdict
/// its rule reaches into a [`SharedStatus`].
///
/// After a terminal event the monitor keeps draining the file without
/// classifying, so the guest is never held up by an unread log.
pub struct SerialMonitor {
    pub serial_file: PathBuf,
    pub rule: VerdictRule,
    /// Echo every line through the logger.
    pub watch: bool,
    pub file_poll: Duration,
    pub read_poll: Duration,
}

/// Handle to a running monitor thread.
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Ask the monitor to exit at its next poll.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the monitor and wait for its thread.
    pub fn stop(mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Serial monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

impl SerialMonitor {
    pub fn new(serial_file: impl Into<PathBuf>, rule: VerdictRule) -> Self {
        Self {
            serial_file: serial_file.into(),
            rule,
            watch: false,
            file_poll: Duration::from_millis(100),
            read_poll: Duration::from_millis(100),
        }
    }

    pub fn spawn(self, status: SharedStatus) -> std::io::Result<MonitorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("serial-monitor".to_string())
            .spawn(move || self.run(status, &thread_stop))?;
        Ok(MonitorHandle { stop, thread: Some(thread) })
    }

    /// Monitor loop; returns when `stop` is raised or the file cannot be read.
    pub fn run(mut self, status: SharedStatus, stop: &AtomicBool) {
        let mut tailer = match open_serial(&self.serial_file, self.file_poll, stop) {
            Ok(Some(tailer)) => tailer,
            Ok(None) => return,
            Err(e) => {
                error!("Cannot open {}: {}", self.serial_file.display(), e);
                return;
            }
        };
        info!("serial_file exists");

        let mut classifying = true;
        while !stop.load(Ordering::Relaxed) {
            let line = match tailer.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    thread::sleep(self.read_poll);
                    continue;
                }
                Err(e) => {
                    error!("Reading {} failed: {}", self.serial_file.display(), e);
                    return;
                }
            };

            if self.watch {
                info!(target: "serial", "{}", line);
            }
            if !classifying {
                continue;
            }

            match self.rule.classify(&line) {
                Ok(Event::Failed(marker)) => {
                    warn!("Assertion failure in serial output: {}", marker);
                    status.fail(marker);
                    classifying = false;
                }
                Ok(Event::Passed) => {
                    info!("{} rule satisfied", self.rule.name());
                    status.pass();
                    classifying = false;
                }
                Ok(Event::Progress) | Ok(Event::Ignored) => {}
                Err(defect) => {
                    error!("Serial output violates harness invariant: {}", defect);
                    status.fail(defect.to_string());
                    classifying = false;
                }
            }
            if !classifying {
                debug!("Draining remaining serial output");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ExperimentRule, IterationRule, SEQUENTIAL_BANNER};
    use crate::status::TestOutcome;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::time::Instant;

    fn fast(monitor: SerialMonitor) -> SerialMonitor {
        SerialMonitor {
            file_poll: Duration::from_millis(5),
            read_poll: Duration::from_millis(5),
            ..monitor
        }
    }

    fn wait_for(status: &SharedStatus, outcome: TestOutcome) {
        let start = Instant::now();
        while status.outcome() != outcome {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "status stuck at {:?}",
                status.outcome()
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn file_created_late_still_monitored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        let status = SharedStatus::new();
        let handle = fast(SerialMonitor::new(&path, VerdictRule::Experiments(ExperimentRule::new(1))))
            .spawn(status.clone())
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(status.outcome(), TestOutcome::Waiting);

        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", SEQUENTIAL_BANNER).unwrap();
        write!(f, "Experiment: ").unwrap();
        f.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(status.outcome(), TestOutcome::Waiting);

        writeln!(f, "1").unwrap();
        f.flush().unwrap();
        wait_for(&status, TestOutcome::Pass);
        handle.stop();
    }

    #[test]
    fn failure_then_pass_looking_output_stays_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "TEST_ASSERT nmi_count == 1 failed").unwrap();
        for iter in 0..30 {
            writeln!(f, "CPU(0x0): SHV test iter {}", iter).unwrap();
        }
        f.flush().unwrap();

        let status = SharedStatus::new();
        let handle = fast(SerialMonitor::new(&path, VerdictRule::Iterations(IterationRule::new(1, false))))
            .spawn(status.clone())
            .unwrap();
        wait_for(&status, TestOutcome::Fail);
        thread::sleep(Duration::from_millis(30));
        handle.stop();

        let snap = status.snapshot();
        assert_eq!(snap.outcome, TestOutcome::Fail);
        assert_eq!(snap.message.as_deref(), Some("TEST_ASSERT nmi_count == 1 failed"));
    }

    #[test]
    fn cpu_count_violation_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        let mut f = File::create(&path).unwrap();
        for cpu in 0..3 {
            writeln!(f, "CPU(0x{}): SHV test iter 0", cpu).unwrap();
        }
        f.flush().unwrap();

        let status = SharedStatus::new();
        let handle = fast(SerialMonitor::new(&path, VerdictRule::Iterations(IterationRule::new(2, false))))
            .spawn(status.clone())
            .unwrap();
        wait_for(&status, TestOutcome::Fail);
        handle.stop();
        assert!(status.snapshot().message.unwrap().contains("0x2"));
    }

    #[test]
    fn keeps_draining_after_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        File::create(&path).unwrap();

        let status = SharedStatus::new();
        let handle = fast(SerialMonitor::new(&path, VerdictRule::Experiments(ExperimentRule::new(0))))
            .spawn(status.clone())
            .unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", SEQUENTIAL_BANNER).unwrap();
        f.flush().unwrap();
        wait_for(&status, TestOutcome::Pass);

        // A failure after the verdict is drained, not classified.
        writeln!(f, "Error: ASSERT late failed").unwrap();
        f.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.stop();
        assert_eq!(status.outcome(), TestOutcome::Pass);
    }
}
