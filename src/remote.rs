//! Remote command execution on the guest.
//!
//! A worker thread keeps launching the command until the channel connects,
//! while the caller polls the shared [`RemoteCommandStatus`] and enforces the
//! connect and run timeouts.
//!
//! # Caller contract
//!
//! Every command must print at least one line before it exits. The only way to
//! tell "ssh could not connect" apart from "the command ran and ssh exited 255"
//! is whether any output was seen, so a silent command that fails like a
//! refused connection is retried until the connect timeout.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

/// Exit code ssh uses for its own failures, including refused connections.
pub const SSH_CONNECT_FAILURE: i32 = 255;

/// `ConnectTimeout` passed to ssh for each attempt, in seconds.
pub const SSH_CONNECT_TIMEOUT_SECS: u32 = 2;

/// Produces the command for one remote execution attempt.
pub trait RemoteShell: Send + Sync + 'static {
    fn command(&self, script: &str) -> Command;
}

/// Runs scripts on the guest over ssh through a forwarded local port.
#[derive(Debug, Clone)]
pub struct SshShell {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Handed to `sshpass` when set.
    pub password: Option<String>,
}

impl SshShell {
    pub fn new(port: u16, user: impl Into<String>) -> Self {
        Self { host: "127.0.0.1".to_string(), port, user: user.into(), password: None }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Argument vector, program first.
    pub fn argv(&self, script: &str) -> Vec<String> {
        let mut argv = vec![];
        if let Some(password) = &self.password {
            argv.extend(["sshpass".to_string(), "-p".to_string(), password.clone()]);
        }
        argv.extend([
            "ssh".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("{}@{}", self.user, self.host),
        ]);
        // ssh joins its arguments with spaces, so the script is quoted for the
        // remote shell.
        argv.push(shell_words::join(["bash", "-lc", script]));
        argv
    }
}

impl RemoteShell for SshShell {
    fn command(&self, script: &str) -> Command {
        let argv = self.argv(script);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

/// Phase of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No output seen yet; connection failures are retried.
    Connecting,
    /// At least one line of output arrived.
    Running,
    Completed,
}

/// State shared between the worker and the polling caller.
#[derive(Debug, Clone)]
pub struct RemoteCommandStatus {
    pub phase: Phase,
    pub last_activity: Instant,
    pub running_since: Option<Instant>,
    pub return_code: Option<i32>,
    pub lines: Vec<String>,
    /// Set by the caller; the worker stops after the next line.
    pub abort: bool,
}

impl RemoteCommandStatus {
    fn new() -> Self {
        Self {
            phase: Phase::Connecting,
            last_activity: Instant::now(),
            running_since: None,
            return_code: None,
            lines: vec![],
            abort: false,
        }
    }
}

/// Why the caller stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    ConnectAborted,
    RunTimeExceeded,
    /// The caller's stop condition fired first.
    Cancelled,
}

impl Interruption {
    pub fn label(&self) -> &'static str {
        match self {
            Interruption::ConnectAborted => "connect_aborted",
            Interruption::RunTimeExceeded => "run_time_exceeded",
            Interruption::Cancelled => "cancelled",
        }
    }
}

/// What one remote invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandReport {
    /// `None` when the command completed.
    pub interruption: Option<Interruption>,
    pub return_code: Option<i32>,
    pub lines: Vec<String>,
}

impl RemoteCommandReport {
    pub fn succeeded(&self) -> bool {
        self.interruption.is_none() && self.return_code == Some(0)
    }
}

#[derive(Clone)]
struct Shared(Arc<Mutex<RemoteCommandStatus>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RemoteCommandStatus> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs commands through a [`RemoteShell`] with connect/run timeouts.
pub struct RemoteCommandRunner<S> {
    shell: Arc<S>,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    /// Let the channel's stderr through to ours.
    pub verbose: bool,
}

impl<S: RemoteShell> RemoteCommandRunner<S> {
    pub fn new(shell: S) -> Self {
        Self {
            shell: Arc::new(shell),
            poll_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            verbose: false,
        }
    }

    /// Run `script` and wait for it, giving up after `connect_timeout` without
    /// a connection or `run_timeout` after output first appeared.
    ///
    /// On timeout the worker thread is told to abort and left behind; it is
    /// never killed outright.
    pub fn run(
        &self,
        script: &str,
        connect_timeout: Duration,
        run_timeout: Duration,
    ) -> RemoteCommandReport {
        self.run_until(script, connect_timeout, run_timeout, || false)
    }

    /// Like [`run`](Self::run), but also gives up with
    /// [`Interruption::Cancelled`] as soon as `cancel` returns true.
    pub fn run_until(
        &self,
        script: &str,
        connect_timeout: Duration,
        run_timeout: Duration,
        cancel: impl Fn() -> bool,
    ) -> RemoteCommandReport {
        info!("send_ssh: {:?}", script);
        let shared = Shared(Arc::new(Mutex::new(RemoteCommandStatus::new())));
        self.spawn_worker(script, shared.clone());

        let start = Instant::now();
        let interruption = loop {
            let status = shared.lock().clone();
            debug!(
                "run_ssh: MET = {}; phase = {:?}; lines = {}",
                start.elapsed().as_secs(),
                status.phase,
                status.lines.len()
            );
            match status.phase {
                Phase::Connecting => {
                    if start.elapsed() > connect_timeout {
                        break Some(Interruption::ConnectAborted);
                    }
                }
                Phase::Running => {
                    let since = status.running_since.unwrap_or(status.last_activity);
                    if since.elapsed() > run_timeout {
                        break Some(Interruption::RunTimeExceeded);
                    }
                }
                Phase::Completed => break None,
            }
            if cancel() {
                break Some(Interruption::Cancelled);
            }
            thread::sleep(self.poll_interval);
        };

        let mut status = shared.lock();
        if interruption.is_some() {
            status.abort = true;
        }
        RemoteCommandReport {
            interruption,
            return_code: status.return_code,
            lines: status.lines.clone(),
        }
    }

    fn spawn_worker(&self, script: &str, shared: Shared) {
        let shell = Arc::clone(&self.shell);
        let script = script.to_string();
        let retry = self.retry_interval;
        let verbose = self.verbose;
        let spawned = thread::Builder::new()
            .name("remote-command".to_string())
            .spawn(move || send_command(&*shell, &script, &shared, retry, verbose));
        if let Err(e) = spawned {
            error!("Cannot start remote command thread: {}", e);
        }
    }
}

/// Worker body: launch, stream output, retry refused connections.
fn send_command<S: RemoteShell + ?Sized>(
    shell: &S,
    script: &str,
    shared: &Shared,
    retry: Duration,
    verbose: bool,
) {
    loop {
        if shared.lock().abort {
            return;
        }

        let mut cmd = shell.command(script);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        cmd.stderr(if verbose { Stdio::inherit() } else { Stdio::null() });
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Cannot launch {:?}: {}", cmd.get_program(), e);
                let mut status = shared.lock();
                status.phase = Phase::Completed;
                status.return_code = None;
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Reading remote output failed: {}", e);
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                info!(target: "ssh", "{:?}", line);

                let mut status = shared.lock();
                let now = Instant::now();
                if status.phase == Phase::Connecting {
                    status.phase = Phase::Running;
                    status.running_since = Some(now);
                }
                status.last_activity = now;
                status.lines.push(line);
                if status.abort {
                    drop(status);
                    if let Err(e) = child.kill() {
                        debug!("Killing aborted remote command failed: {}", e);
                    }
                    if let Err(e) = child.wait() {
                        debug!("Reaping aborted remote command failed: {}", e);
                    }
                    return;
                }
            }
        }

        let code = match child.wait() {
            Ok(exit) => exit.code(),
            Err(e) => {
                error!("Waiting for remote command failed: {}", e);
                None
            }
        };

        let mut status = shared.lock();
        if status.phase == Phase::Connecting && code == Some(SSH_CONNECT_FAILURE) {
            drop(status);
            thread::sleep(retry);
            debug!("send_ssh: retry {:?}", script);
            continue;
        }
        status.phase = Phase::Completed;
        status.return_code = code;
        return;
    }
}
