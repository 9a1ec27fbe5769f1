//! VM process supervision

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::qemu_config::QemuConfig;

/// A running virtual machine process.
///
/// Teardown is idempotent: [`VmProcess::stop`] may be called any number of
/// times, and dropping the handle stops the process if nobody did, so the VM is
/// reaped on every exit path including a panic in the caller.
pub struct VmProcess {
    child: Child,
    program: String,
    exit: Option<ExitStatus>,
    grace: Duration,
}

impl VmProcess {
    /// Spawn QEMU for `config`.
    pub fn start(config: &QemuConfig, grace: Duration) -> Result<Self> {
        config.validate()?;
        info!("Starting QEMU: {} {}", config.qemu.display(), config.qemu_args().join(" "));
        info!("Serial output: {}", config.serial_file.display());
        Self::spawn(config.command(), grace)
    }

    /// Adopt an arbitrary command as the VM process.
    pub fn spawn(mut cmd: Command, grace: Duration) -> Result<Self> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let child = cmd
            .spawn()
            .map_err(|source| HarnessError::Spawn { program: program.clone(), source })?;
        debug!("{} started with pid {}", program, child.id());
        Ok(Self { child, program, exit: None, grace })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking check for exit; `Some` once the process is gone.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().map_err(HarnessError::Teardown)?;
        }
        Ok(self.exit)
    }

    /// Terminate the process and reap it.
    ///
    /// SIGTERM goes first so QEMU can flush the serial file; if it is still
    /// alive after the grace period it gets SIGKILL.
    pub fn stop(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        debug!("Sending SIGTERM to {} (pid {})", self.program, self.child.id());
        terminate(&self.child).map_err(HarnessError::Teardown)?;

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait()? {
                info!("{} exited: {}", self.program, status);
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(50));
        }

        warn!("{} ignored SIGTERM for {:?}, killing", self.program, self.grace);
        match self.child.kill() {
            Ok(()) => {}
            // Already exited between the last poll and the kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(HarnessError::Teardown(e)),
        }
        let status = self.child.wait().map_err(HarnessError::Teardown)?;
        self.exit = Some(status);
        info!("{} killed: {}", self.program, status);
        Ok(status)
    }
}

impl Drop for VmProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Err(e) = self.stop() {
                warn!("Failed to stop {}: {}", self.program, e);
            }
        }
    }
}

fn terminate(child: &Child) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
