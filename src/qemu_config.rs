//! QEMU invocation settings and host-side setup helpers.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::info;

use crate::error::{HarnessError, Result};

/// Default QEMU binary; overridable from the command line.
pub const DEFAULT_QEMU: &str = "qemu-system-x86_64";

/// Guest port the remote shell listens on.
pub const GUEST_SSH_PORT: u16 = 22;

/// Disk image formats QEMU is told about explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    pub fn label(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub format: DiskFormat,
}

impl DiskImage {
    pub fn raw(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), format: DiskFormat::Raw }
    }

    pub fn qcow2(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), format: DiskFormat::Qcow2 }
    }
}

/// What the VM boots from.
#[derive(Debug, Clone)]
pub enum BootMedia {
    /// Multiboot kernel passed with `-kernel`, plus an optional command line.
    Kernel { image: PathBuf, cmdline: Option<String> },
    /// Disks attached in order; the first one is the boot disk.
    Disks(Vec<DiskImage>),
}

/// Configuration for a single VM launch, covering every knob the test
/// scenarios need.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub qemu: PathBuf,
    pub boot: BootMedia,
    /// Memory size in QEMU syntax, e.g. `512M`.
    pub memory: String,
    pub smp: usize,
    pub serial_file: PathBuf,
    pub display: bool,
    /// CPU model; VMX must be exposed for the hypervisor under test.
    pub cpu: Option<String>,
    pub enable_kvm: bool,
    /// Host port forwarded to the guest's ssh port, if any.
    pub ssh_port: Option<u16>,
    /// Let QEMU's stderr through to ours.
    pub verbose: bool,
    pub extra_args: Vec<String>,
}

impl QemuConfig {
    pub fn new(boot: BootMedia, serial_file: impl Into<PathBuf>) -> Self {
        Self {
            qemu: PathBuf::from(DEFAULT_QEMU),
            boot,
            memory: "512M".to_string(),
            smp: 1,
            serial_file: serial_file.into(),
            display: false,
            cpu: Some("Haswell,vmx=yes".to_string()),
            enable_kvm: true,
            ssh_port: None,
            verbose: false,
            extra_args: vec![],
        }
    }

    /// Full QEMU argument vector for this configuration.
    pub fn qemu_args(&self) -> Vec<String> {
        let mut args = vec!["-m".to_string(), self.memory.clone()];

        match &self.boot {
            BootMedia::Kernel { image, cmdline } => {
                args.push("-kernel".to_string());
                args.push(image.display().to_string());
                if let Some(cmdline) = cmdline {
                    args.push("-append".to_string());
                    args.push(cmdline.clone());
                }
            }
            BootMedia::Disks(disks) => {
                for (index, disk) in disks.iter().enumerate() {
                    args.push("-drive".to_string());
                    args.push(format!(
                        "media=disk,file={},format={},index={}",
                        disk.path.display(),
                        disk.format.label(),
                        index
                    ));
                }
            }
        }

        if let Some(port) = self.ssh_port {
            args.extend_from_slice(&[
                "-device".to_string(),
                "e1000,netdev=net0".to_string(),
                "-netdev".to_string(),
                format!("user,id=net0,hostfwd=tcp::{}-:{}", port, GUEST_SSH_PORT),
            ]);
        }

        args.push("-smp".to_string());
        args.push(self.smp.to_string());

        if let Some(cpu) = &self.cpu {
            args.push("-cpu".to_string());
            args.push(cpu.clone());
        }
        if self.enable_kvm {
            args.push("-enable-kvm".to_string());
        }

        args.push("-serial".to_string());
        args.push(format!("file:{}", self.serial_file.display()));

        if !self.display {
            args.push("-display".to_string());
            args.push("none".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Build the QEMU command, with stdio wired for unattended runs.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.qemu);
        cmd.args(self.qemu_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if self.verbose {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::null());
        }
        cmd
    }

    /// Every image file the VM will open.
    pub fn image_paths(&self) -> Vec<&Path> {
        match &self.boot {
            BootMedia::Kernel { image, .. } => vec![image.as_path()],
            BootMedia::Disks(disks) => disks.iter().map(|d| d.path.as_path()).collect(),
        }
    }

    /// Fail early if an image is missing instead of letting QEMU die silently.
    pub fn validate(&self) -> Result<()> {
        if self.smp == 0 {
            return Err(HarnessError::Setup("smp must be at least 1".to_string()));
        }
        for path in self.image_paths() {
            if !path.exists() {
                return Err(HarnessError::MissingFile(path.to_path_buf()));
            }
        }
        Ok(())
    }
}

/// Polling cadences and grace periods used by the engine.
#[derive(Debug, Clone, Copy)]
pub struct PollTimings {
    /// Orchestrator status poll.
    pub status_poll: Duration,
    /// Sleep between reads when no complete serial line is available.
    pub serial_poll: Duration,
    /// Sleep while waiting for the serial file to be created.
    pub file_poll: Duration,
    /// Remote command phase poll.
    pub ssh_poll: Duration,
    /// Delay before retrying a refused remote connection.
    pub ssh_retry: Duration,
    /// How long QEMU gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
}

impl Default for PollTimings {
    fn default() -> Self {
        Self {
            status_poll: Duration::from_secs(1),
            serial_poll: Duration::from_millis(100),
            file_poll: Duration::from_millis(100),
            ssh_poll: Duration::from_secs(1),
            ssh_retry: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Recreate `image` as a qcow2 overlay on top of `backing`, discarding any
/// changes a previous run left in it.
pub fn reset_overlay(image: &Path, backing: &Path, backing_format: DiskFormat) -> Result<()> {
    if !backing.exists() {
        return Err(HarnessError::MissingFile(backing.to_path_buf()));
    }
    info!("Resetting {} on top of {}", image.display(), backing.display());

    let status = Command::new("qemu-img")
        .arg("create")
        .args(["-f", "qcow2", "-b"])
        .arg(backing)
        .args(["-F", backing_format.label()])
        .arg(image)
        .stdout(Stdio::null())
        .status()
        .map_err(|source| HarnessError::Spawn { program: "qemu-img".to_string(), source })?;
    if !status.success() {
        return Err(HarnessError::Helper {
            program: "qemu-img".to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Ask the kernel for an unused TCP port on the loopback interface.
pub fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("{} missing from {:?}", flag, args))
    }

    #[test]
    fn kernel_boot_args() {
        let mut config = QemuConfig::new(
            BootMedia::Kernel {
                image: PathBuf::from("/img/shv.bin"),
                cmdline: Some("nmi=1".to_string()),
            },
            "/work/serial",
        );
        config.smp = 4;
        config.memory = "1024M".to_string();

        let args = config.qemu_args();
        assert_eq!(args[position(&args, "-kernel") + 1], "/img/shv.bin");
        assert_eq!(args[position(&args, "-append") + 1], "nmi=1");
        assert_eq!(args[position(&args, "-smp") + 1], "4");
        assert_eq!(args[position(&args, "-m") + 1], "1024M");
        assert_eq!(args[position(&args, "-serial") + 1], "file:/work/serial");
        assert_eq!(args[position(&args, "-display") + 1], "none");
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(!args.contains(&"-netdev".to_string()));
    }

    #[test]
    fn disk_boot_args_with_port_forward() {
        let mut config = QemuConfig::new(
            BootMedia::Disks(vec![
                DiskImage::raw("/work/grub/c.img"),
                DiskImage::qcow2("/work/guest.qcow2"),
            ]),
            "/work/serial",
        );
        config.display = true;
        config.ssh_port = Some(2222);

        let args = config.qemu_args();
        assert!(args.contains(&"media=disk,file=/work/grub/c.img,format=raw,index=0".to_string()));
        assert!(args.contains(&"media=disk,file=/work/guest.qcow2,format=qcow2,index=1".to_string()));
        assert_eq!(
            args[position(&args, "-netdev") + 1],
            "user,id=net0,hostfwd=tcp::2222-:22"
        );
        assert!(!args.contains(&"-display".to_string()));
    }

    #[test]
    fn validate_reports_missing_image() {
        let config = QemuConfig::new(
            BootMedia::Kernel { image: PathBuf::from("/nonexistent/shv.bin"), cmdline: None },
            "/tmp/serial",
        );
        match config.validate() {
            Err(HarnessError::MissingFile(path)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/shv.bin"))
            }
            other => panic!("expected MissingFile, got {:?}", other),
        }
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(pick_free_port().unwrap(), 0);
    }
}
