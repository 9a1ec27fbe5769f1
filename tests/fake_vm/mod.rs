//! Stand-ins for QEMU and ssh so runs can be driven end to end without a
//! hypervisor.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use hvharness::remote::RemoteShell;
use hvharness::{PollTimings, VmProcess};

/// Poll cadences short enough for tests.
pub fn fast_timings() -> PollTimings {
    PollTimings {
        status_poll: Duration::from_millis(50),
        serial_poll: Duration::from_millis(10),
        file_poll: Duration::from_millis(10),
        ssh_poll: Duration::from_millis(20),
        ssh_retry: Duration::from_millis(20),
        stop_grace: Duration::from_secs(2),
    }
}

/// A "VM" that creates `serial` after a short delay, appends `content` to it,
/// then idles until stopped.
pub fn fake_vm(serial: &Path, content: &str) -> VmProcess {
    let source = serial.with_extension("src");
    fs::write(&source, content).expect("write serial source");
    let script = format!(
        "sleep 0.1; cat '{}' >> '{}'; exec sleep 30",
        source.display(),
        serial.display()
    );
    shell_vm(&script)
}

/// A "VM" that never writes its serial file.
pub fn silent_vm() -> VmProcess {
    shell_vm("exec sleep 30")
}

pub fn shell_vm(script: &str) -> VmProcess {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", script]);
    VmProcess::spawn(cmd, Duration::from_secs(2)).expect("spawn fake VM")
}

/// Runs "guest" commands with the local shell.
pub struct LocalShell;

impl RemoteShell for LocalShell {
    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }
}

/// Serial output of `cpus` CPUs each printing `iters` SHV iterations.
pub fn iteration_log(cpus: u32, iters: u32) -> String {
    let mut log = String::from("SHV booting\n");
    for iter in 0..iters {
        for cpu in 0..cpus {
            log.push_str(&format!("CPU(0x{:x}): SHV test iter {}\n", cpu, iter));
        }
    }
    log
}
