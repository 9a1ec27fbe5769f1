//! hvharness - boot a hypervisor under QEMU and decide whether it works
//!
//! The engine starts a VM, watches its serial console and/or runs commands on
//! the guest over ssh, and turns what it sees into a [`TestOutcome`]:
//!
//! - [`qemu`] owns the VM process and guarantees it is torn down.
//! - [`serial`] and [`monitor`] tail the serial log and classify lines with a
//!   [`rules::VerdictRule`].
//! - [`remote`] runs guest commands with connect and run timeouts.
//! - [`orchestrator`] ties them together for a [`scenario::RunPlan`].

pub mod error;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod qemu;
pub mod qemu_config;
pub mod remote;
pub mod rules;
pub mod scenario;
pub mod serial;
pub mod status;

pub use error::{HarnessError, Result};
pub use orchestrator::{Orchestrator, RunReport};
pub use qemu::VmProcess;
pub use qemu_config::{PollTimings, QemuConfig};
pub use scenario::{RunPlan, ShvOptions, Subarch, XmhfOptions};
pub use status::{SharedStatus, TestOutcome};
