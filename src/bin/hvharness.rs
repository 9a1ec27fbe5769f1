use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hvharness::{logging, Orchestrator, RunPlan, ShvOptions, Subarch, XmhfOptions};
use tracing::info;

/// Boot a hypervisor under QEMU and report whether its tests pass.
#[derive(Parser)]
#[command(name = "hvharness")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Boot SHV (optionally nested under XMHF) and judge it by its serial output.
    Shv(ShvArgs),
    /// Boot a guest OS on XMHF and run the argument-passing tests over ssh.
    Xmhf(XmhfArgs),
}

#[derive(Args)]
struct Common {
    /// Directory holding the serial log and boot images.
    #[arg(long)]
    work_dir: PathBuf,
    /// QEMU binary to run.
    #[arg(long, env = "HVHARNESS_QEMU", default_value = hvharness::qemu_config::DEFAULT_QEMU)]
    qemu: PathBuf,
    /// Run QEMU without a display window.
    #[arg(long)]
    no_display: bool,
    /// Debug logging, and QEMU/ssh stderr passed through.
    #[arg(long)]
    verbose: bool,
    /// Echo the guest's serial output.
    #[arg(long)]
    watch_serial: bool,
    /// Write a JSON summary of the run to this file.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct ShvArgs {
    #[command(flatten)]
    common: Common,
    #[arg(long)]
    shv_img: PathBuf,
    /// Boot SHV on top of this XMHF image.
    #[arg(long)]
    xmhf_img: Option<PathBuf>,
    /// Multiboot command line for SHV.
    #[arg(long)]
    mb_cmdline: Option<String>,
    /// Boot qcow2 overlays `<image><suffix>` instead of the raw images.
    #[arg(long)]
    qcow2_suffix: Option<String>,
    #[arg(long, default_value_t = 4)]
    smp: usize,
    #[arg(long, default_value = "1024M")]
    memory: String,
    /// Seconds to wait for a verdict.
    #[arg(long, default_value_t = 30)]
    qemu_timeout: u64,
    /// Run the NMI experiments instead of counting test iterations.
    #[arg(long)]
    nmi: bool,
}

#[derive(Args)]
struct XmhfArgs {
    #[command(flatten)]
    common: Common,
    #[arg(long, value_enum)]
    subarch: Subarch,
    /// Guest disk image (qcow2).
    #[arg(long)]
    qemu_image: Option<PathBuf>,
    /// Backing file the guest disk is reset to before booting.
    #[arg(long)]
    qemu_image_back: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    smp: usize,
    /// Password for ssh, passed through sshpass.
    #[arg(long)]
    sshpass: Option<String>,
    #[arg(long, default_value = "root")]
    ssh_user: String,
    /// Host port forwarded to the guest's ssh port; picked automatically if unset.
    #[arg(long)]
    ssh_port: Option<u16>,
    /// Boot the guest disk as is instead of resetting it.
    #[arg(long)]
    skip_reset_qemu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (plan, common) = match cli.cmd {
        Cmd::Shv(args) => (shv_plan(&args)?, args.common),
        Cmd::Xmhf(args) => (xmhf_plan(&args)?, args.common),
    };

    let report = Orchestrator::new(plan).run().context("Test run failed")?;
    if let Some(path) = &common.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    process::exit(report.exit_code());
}

fn shv_plan(args: &ShvArgs) -> Result<RunPlan> {
    logging::init(args.common.verbose);
    let opts = ShvOptions {
        qemu: args.common.qemu.clone(),
        shv_img: args.shv_img.clone(),
        xmhf_img: args.xmhf_img.clone(),
        mb_cmdline: args.mb_cmdline.clone(),
        qcow2_suffix: args.qcow2_suffix.clone(),
        smp: args.smp,
        work_dir: args.common.work_dir.clone(),
        display: !args.common.no_display,
        verbose: args.common.verbose,
        watch_serial: args.common.watch_serial,
        memory: args.memory.clone(),
        qemu_timeout: Duration::from_secs(args.qemu_timeout),
        nmi: args.nmi,
    };
    opts.plan().context("Invalid SHV options")
}

fn xmhf_plan(args: &XmhfArgs) -> Result<RunPlan> {
    logging::init(args.common.verbose);
    let opts = XmhfOptions {
        qemu: args.common.qemu.clone(),
        subarch: args.subarch,
        qemu_image: args.qemu_image.clone(),
        qemu_image_back: args.qemu_image_back.clone(),
        smp: args.smp,
        work_dir: args.common.work_dir.clone(),
        display: !args.common.no_display,
        sshpass: args.sshpass.clone(),
        ssh_user: args.ssh_user.clone(),
        ssh_port: args.ssh_port,
        verbose: args.common.verbose,
        watch_serial: args.common.watch_serial,
        skip_reset: args.skip_reset_qemu,
    };
    let plan = opts.plan().context("Invalid XMHF options")?;
    if let Some(ssh) = &plan.ssh {
        info!("Use ssh port {}", ssh.port);
    }
    Ok(plan)
}
