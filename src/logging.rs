//! Diagnostic output.
//!
//! Everything the harness reports goes through `tracing`. The subscriber
//! formats each event into a full line before writing it to stdout, so lines
//! from the serial monitor and the remote command thread never interleave.

use tracing::Level;

/// Install the stdout subscriber. Safe to call more than once; later calls are
/// ignored.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stdout)
        .with_thread_names(true)
        .try_init();
}
