//! Tailing of the serial log file QEMU appends to.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Reassembles complete lines from a reader that may return partial data.
///
/// Bytes after the last newline are held back until a later read supplies the
/// terminator, so a line is never split or dropped no matter how reads fall.
pub struct LineTailer<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: Read> LineTailer<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pending: Vec::new() }
    }

    /// Next complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when no complete line is available yet; callers sleep
    /// and retry rather than block.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = match self.reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Bytes received but not yet terminated.
    pub fn partial(&self) -> &[u8] {
        &self.pending
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Block until `path` exists, polling every `interval`.
///
/// Returns `false` if `stop` was raised first.
pub fn wait_for_file(path: &Path, interval: Duration, stop: &AtomicBool) -> bool {
    while !path.exists() {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        thread::sleep(interval);
    }
    debug!("{} exists", path.display());
    true
}

/// Wait for the serial file and open a tailer on it.
pub fn open_serial(
    path: &Path,
    interval: Duration,
    stop: &AtomicBool,
) -> io::Result<Option<LineTailer<File>>> {
    if !wait_for_file(path, interval, stop) {
        return Ok(None);
    }
    Ok(Some(LineTailer::new(File::open(path)?)))
}
