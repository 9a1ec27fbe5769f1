//! Test scenarios and the run plans they produce.
//!
//! A scenario turns user options into a [`RunPlan`]: the VM to boot, the setup
//! to perform first, how to watch the guest, and what to check afterwards.
//! Building a plan has no side effects; setup actions run in the orchestrator.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::qemu_config::{
    pick_free_port, reset_overlay, BootMedia, DiskFormat, DiskImage, PollTimings, QemuConfig,
    DEFAULT_QEMU,
};
use crate::remote::SshShell;
use crate::rules::{ExperimentRule, IterationRule, VerdictRule};

/// Serial line XMHF prints while booting.
pub const XMHF_BANNER: &str = "eXtensible Modular Hypervisor";

/// Serial line XMHF prints once every application processor is up.
pub const APS_AWAKE: &str = "APs all awake";

/// One command run on the guest.
#[derive(Debug, Clone)]
pub struct RemoteStep {
    pub label: String,
    pub command: String,
    pub connect_timeout: Duration,
    pub run_timeout: Duration,
    /// Some output line must contain this for the step to pass.
    pub expect_line: Option<String>,
}

/// How the guest is observed.
#[derive(Debug)]
pub enum Strategy {
    /// Classify serial output with a rule until it reaches a verdict.
    Serial(VerdictRule),
    /// Run commands on the guest in order; each runs only if the previous one
    /// passed.
    Remote(Vec<RemoteStep>),
}

/// Text the serial log must contain once the VM is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAssertion {
    pub label: String,
    pub needle: String,
}

impl LogAssertion {
    pub fn new(label: impl Into<String>, needle: impl Into<String>) -> Self {
        Self { label: label.into(), needle: needle.into() }
    }

    /// Whether any line of `path` contains the needle. A missing file counts as
    /// not found.
    pub fn holds(&self, path: &Path) -> Result<bool> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let contents = String::from_utf8_lossy(&bytes);
        Ok(contents.lines().any(|line| line.contains(&self.needle)))
    }
}

/// Work done before the VM is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupAction {
    /// Remove a stale file left by a previous run.
    RemoveFile(PathBuf),
    /// (Re)create `image` as a qcow2 overlay on `backing`.
    Overlay { image: PathBuf, backing: PathBuf, backing_format: DiskFormat },
}

impl SetupAction {
    pub fn apply(&self) -> Result<()> {
        match self {
            SetupAction::RemoveFile(path) => match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed stale {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            SetupAction::Overlay { image, backing, backing_format } => {
                reset_overlay(image, backing, *backing_format)
            }
        }
    }
}

/// Everything needed for one end-to-end run.
#[derive(Debug)]
pub struct RunPlan {
    pub name: String,
    pub qemu: QemuConfig,
    pub setup: Vec<SetupAction>,
    pub strategy: Strategy,
    /// How long a serial strategy may wait for a verdict.
    pub ceiling: Duration,
    pub post_checks: Vec<LogAssertion>,
    pub ssh: Option<SshShell>,
    pub watch_serial: bool,
    pub timings: PollTimings,
}

/// Options for booting SHV, directly or nested under XMHF.
#[derive(Debug, Clone)]
pub struct ShvOptions {
    pub qemu: PathBuf,
    pub shv_img: PathBuf,
    pub xmhf_img: Option<PathBuf>,
    pub mb_cmdline: Option<String>,
    /// Boot qcow2 overlays named `<image><suffix>` instead of the raw images.
    pub qcow2_suffix: Option<String>,
    pub smp: usize,
    pub work_dir: PathBuf,
    pub display: bool,
    pub verbose: bool,
    pub watch_serial: bool,
    pub memory: String,
    pub qemu_timeout: Duration,
    /// Run the NMI experiment protocol instead of counting iterations.
    pub nmi: bool,
}

impl ShvOptions {
    pub fn new(shv_img: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            qemu: PathBuf::from(DEFAULT_QEMU),
            shv_img: shv_img.into(),
            xmhf_img: None,
            mb_cmdline: None,
            qcow2_suffix: None,
            smp: 4,
            work_dir: work_dir.into(),
            display: false,
            verbose: false,
            watch_serial: false,
            memory: "1024M".to_string(),
            qemu_timeout: Duration::from_secs(30),
            nmi: false,
        }
    }

    pub fn plan(&self) -> Result<RunPlan> {
        if self.xmhf_img.is_some() && self.mb_cmdline.is_some() {
            return Err(HarnessError::Setup(
                "--mb-cmdline cannot be combined with --xmhf-img".to_string(),
            ));
        }
        if self.qcow2_suffix.is_some() && self.xmhf_img.is_none() {
            return Err(HarnessError::Setup("--qcow2-suffix requires --xmhf-img".to_string()));
        }

        let serial_file = self.work_dir.join("serial");
        let mut setup = vec![SetupAction::RemoveFile(serial_file.clone())];

        let boot = match &self.xmhf_img {
            None => BootMedia::Kernel {
                image: self.shv_img.clone(),
                cmdline: self.mb_cmdline.clone(),
            },
            Some(xmhf_img) => {
                let mut disks = vec![];
                for image in [xmhf_img, &self.shv_img] {
                    match &self.qcow2_suffix {
                        Some(suffix) => {
                            let overlay = overlay_path(image, suffix);
                            setup.push(SetupAction::Overlay {
                                image: overlay.clone(),
                                backing: image.clone(),
                                backing_format: DiskFormat::Raw,
                            });
                            disks.push(DiskImage::qcow2(overlay));
                        }
                        None => disks.push(DiskImage::raw(image.clone())),
                    }
                }
                BootMedia::Disks(disks)
            }
        };

        let mut qemu = QemuConfig::new(boot, &serial_file);
        qemu.qemu = self.qemu.clone();
        qemu.memory = self.memory.clone();
        qemu.smp = self.smp;
        qemu.display = self.display;
        qemu.verbose = self.verbose;

        let rule = if self.nmi {
            VerdictRule::Experiments(ExperimentRule::default())
        } else {
            VerdictRule::Iterations(IterationRule::new(self.smp, self.xmhf_img.is_some()))
        };

        Ok(RunPlan {
            name: if self.nmi { "shv-nmi" } else { "shv" }.to_string(),
            qemu,
            setup,
            strategy: Strategy::Serial(rule),
            ceiling: self.qemu_timeout,
            post_checks: vec![],
            ssh: None,
            watch_serial: self.watch_serial,
            timings: PollTimings::default(),
        })
    }
}

/// Guest word size flavour; decides which test binaries exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Subarch {
    I386,
    Amd64,
}

impl Subarch {
    pub fn word_sizes(&self) -> &'static [u32] {
        match self {
            Subarch::I386 => &[32],
            Subarch::Amd64 => &[32, 64],
        }
    }
}

/// Options for booting a guest OS on XMHF and testing it over ssh.
#[derive(Debug, Clone)]
pub struct XmhfOptions {
    pub qemu: PathBuf,
    pub subarch: Subarch,
    /// Guest disk (qcow2); reset from the backing file unless `skip_reset`.
    pub qemu_image: Option<PathBuf>,
    pub qemu_image_back: Option<PathBuf>,
    pub smp: usize,
    pub work_dir: PathBuf,
    pub display: bool,
    pub sshpass: Option<String>,
    pub ssh_user: String,
    /// Host port forwarded to the guest; a free one is picked when `None`.
    pub ssh_port: Option<u16>,
    pub verbose: bool,
    pub watch_serial: bool,
    pub skip_reset: bool,
}

impl XmhfOptions {
    pub fn new(subarch: Subarch, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            qemu: PathBuf::from(DEFAULT_QEMU),
            subarch,
            qemu_image: None,
            qemu_image_back: None,
            smp: 2,
            work_dir: work_dir.into(),
            display: false,
            sshpass: None,
            ssh_user: "root".to_string(),
            ssh_port: None,
            verbose: false,
            watch_serial: false,
            skip_reset: false,
        }
    }

    pub fn plan(&self) -> Result<RunPlan> {
        let serial_file = self.work_dir.join("serial");
        let mut setup = vec![SetupAction::RemoveFile(serial_file.clone())];

        if !self.skip_reset {
            let image = self.qemu_image.as_ref().ok_or_else(|| {
                HarnessError::Setup("--qemu-image is required unless --skip-reset-qemu".to_string())
            })?;
            if !image.exists() {
                return Err(HarnessError::MissingFile(image.clone()));
            }
            let backing = self.qemu_image_back.as_ref().ok_or_else(|| {
                HarnessError::Setup("resetting --qemu-image requires --qemu-image-back".to_string())
            })?;
            setup.push(SetupAction::Overlay {
                image: image.clone(),
                backing: backing.clone(),
                backing_format: DiskFormat::Qcow2,
            });
        }

        let mut disks = vec![DiskImage::raw(self.work_dir.join("grub").join("c.img"))];
        if let Some(image) = &self.qemu_image {
            disks.push(DiskImage::qcow2(image.clone()));
        }

        let port = match self.ssh_port {
            Some(port) => port,
            None => pick_free_port()?,
        };

        let mut qemu = QemuConfig::new(BootMedia::Disks(disks), &serial_file);
        qemu.qemu = self.qemu.clone();
        qemu.memory = "512M".to_string();
        qemu.smp = self.smp;
        qemu.display = self.display;
        qemu.verbose = self.verbose;
        qemu.ssh_port = Some(port);

        let steps = xmhf_steps(self.subarch);
        let ceiling = steps.iter().map(|s| s.connect_timeout + s.run_timeout).sum();

        Ok(RunPlan {
            name: format!("xmhf-{:?}", self.subarch).to_lowercase(),
            qemu,
            setup,
            strategy: Strategy::Remote(steps),
            ceiling,
            post_checks: vec![
                LogAssertion::new("XMHF banner", XMHF_BANNER),
                LogAssertion::new("APs", APS_AWAKE),
            ],
            ssh: Some(SshShell::new(port, self.ssh_user.clone()).with_password(self.sshpass.clone())),
            watch_serial: self.watch_serial,
            timings: PollTimings::default(),
        })
    }
}

/// Boot probe followed by the argument-passing test for each word size.
pub fn xmhf_steps(subarch: Subarch) -> Vec<RemoteStep> {
    let mut steps = vec![RemoteStep {
        label: "boot".to_string(),
        command: "date; echo 6. test boot 2; [ ! -f /tmp/asdf ]".to_string(),
        connect_timeout: Duration::from_secs(150),
        run_timeout: Duration::from_secs(10),
        expect_line: None,
    }];
    for w in subarch.word_sizes() {
        steps.push(RemoteStep {
            label: format!("test {}", w),
            command: format!("date; echo 7. run test {w}; ./test_args{w} 7 7 7"),
            connect_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(45),
            expect_line: Some("Test pass".to_string()),
        });
    }
    steps
}

fn overlay_path(image: &Path, suffix: &str) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shv_direct_boot_plan() {
        let mut opts = ShvOptions::new("/img/shv.bin", "/work");
        opts.mb_cmdline = Some("nmi".to_string());
        let plan = opts.plan().unwrap();

        assert_eq!(plan.name, "shv");
        assert_eq!(plan.qemu.serial_file, PathBuf::from("/work/serial"));
        assert_eq!(plan.qemu.smp, 4);
        assert_eq!(plan.ceiling, Duration::from_secs(30));
        assert_eq!(plan.setup, [SetupAction::RemoveFile(PathBuf::from("/work/serial"))]);
        assert!(matches!(plan.strategy, Strategy::Serial(VerdictRule::Iterations(_))));
        match &plan.qemu.boot {
            BootMedia::Kernel { image, cmdline } => {
                assert_eq!(image, &PathBuf::from("/img/shv.bin"));
                assert_eq!(cmdline.as_deref(), Some("nmi"));
            }
            other => panic!("unexpected boot media {:?}", other),
        }
    }

    #[test]
    fn shv_nested_with_overlays() {
        let mut opts = ShvOptions::new("/img/shv.img", "/work");
        opts.xmhf_img = Some(PathBuf::from("/img/xmhf.img"));
        opts.qcow2_suffix = Some(".qcow2".to_string());
        opts.nmi = true;
        let plan = opts.plan().unwrap();

        assert_eq!(plan.name, "shv-nmi");
        assert!(matches!(plan.strategy, Strategy::Serial(VerdictRule::Experiments(_))));
        assert_eq!(plan.setup.len(), 3);
        assert_eq!(
            plan.setup[1],
            SetupAction::Overlay {
                image: PathBuf::from("/img/xmhf.img.qcow2"),
                backing: PathBuf::from("/img/xmhf.img"),
                backing_format: DiskFormat::Raw,
            }
        );
        match &plan.qemu.boot {
            BootMedia::Disks(disks) => {
                assert_eq!(disks[0], DiskImage::qcow2("/img/xmhf.img.qcow2"));
                assert_eq!(disks[1], DiskImage::qcow2("/img/shv.img.qcow2"));
            }
            other => panic!("unexpected boot media {:?}", other),
        }
    }

    #[test]
    fn shv_rejects_cmdline_with_xmhf() {
        let mut opts = ShvOptions::new("/img/shv.img", "/work");
        opts.xmhf_img = Some(PathBuf::from("/img/xmhf.img"));
        opts.mb_cmdline = Some("x".to_string());
        assert!(matches!(opts.plan(), Err(HarnessError::Setup(_))));
    }

    #[test]
    fn xmhf_reset_requires_backing_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("guest.qcow2");
        fs::write(&image, b"").unwrap();

        let mut opts = XmhfOptions::new(Subarch::I386, dir.path());
        opts.ssh_port = Some(2222);
        assert!(matches!(opts.plan(), Err(HarnessError::Setup(_))));

        opts.qemu_image = Some(dir.path().join("missing.qcow2"));
        assert!(matches!(opts.plan(), Err(HarnessError::MissingFile(_))));

        opts.qemu_image = Some(image.clone());
        assert!(matches!(opts.plan(), Err(HarnessError::Setup(_))));

        opts.qemu_image_back = Some(dir.path().join("base.qcow2"));
        let plan = opts.plan().unwrap();
        assert!(plan.setup.contains(&SetupAction::Overlay {
            image,
            backing: dir.path().join("base.qcow2"),
            backing_format: DiskFormat::Qcow2,
        }));
    }

    #[test]
    fn xmhf_plan_runs_steps_over_ssh() {
        let mut opts = XmhfOptions::new(Subarch::Amd64, "/work");
        opts.skip_reset = true;
        opts.ssh_port = Some(2022);
        opts.sshpass = Some("pw".to_string());
        let plan = opts.plan().unwrap();

        assert_eq!(plan.name, "xmhf-amd64");
        assert_eq!(plan.qemu.ssh_port, Some(2022));
        assert_eq!(plan.ssh.as_ref().unwrap().port, 2022);
        assert_eq!(plan.post_checks.len(), 2);
        match &plan.strategy {
            Strategy::Remote(steps) => {
                let labels: Vec<_> = steps.iter().map(|s| s.label.as_str()).collect();
                assert_eq!(labels, ["boot", "test 32", "test 64"]);
                assert_eq!(steps[0].connect_timeout, Duration::from_secs(150));
                assert_eq!(steps[2].command, "date; echo 7. run test 64; ./test_args64 7 7 7");
            }
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn log_assertion_searches_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        assert!(!LogAssertion::new("banner", XMHF_BANNER).holds(&path).unwrap());

        fs::write(&path, "boot\neXtensible Modular Hypervisor (XMHF) 6.1.0\n").unwrap();
        assert!(LogAssertion::new("banner", XMHF_BANNER).holds(&path).unwrap());
        assert!(!LogAssertion::new("APs", APS_AWAKE).holds(&path).unwrap());
    }

    #[test]
    fn remove_file_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        SetupAction::RemoveFile(path.clone()).apply().unwrap();
        fs::write(&path, "old").unwrap();
        SetupAction::RemoveFile(path.clone()).apply().unwrap();
        assert!(!path.exists());
    }
}
