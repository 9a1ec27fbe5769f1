//! Error type shared by the harness library.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the harness engine.
///
/// Test-level failures (assertion markers, non-zero remote results) are not
/// errors: they are recorded as [`crate::TestOutcome::Fail`]. This type covers
/// setup problems, I/O failures and defects in the observed guest output.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad input detected before the VM is spawned.
    #[error("invalid setup: {0}")]
    Setup(String),

    /// A required image or helper file does not exist.
    #[error("required file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// An external helper (e.g. `qemu-img`) ran but reported failure.
    #[error("`{program}` exited with {status}")]
    Helper { program: String, status: String },

    /// More distinct CPU ids appeared in serial output than the guest has CPUs.
    #[error("saw {seen} distinct CPU ids but the guest only has {smp} (new id {cpu})")]
    CpuCountExceeded { cpu: String, seen: usize, smp: usize },

    #[error("failed to tear down VM process")]
    Teardown(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
