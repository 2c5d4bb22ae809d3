//! Supervision of the extension runtime child process.
//!
//! The runtime gets the transport address as its last positional argument
//! (and, optionally, in an environment variable). Its stdout/stderr are
//! drained line by line into `tracing` and a broadcast channel; its exit is
//! published on a `watch` channel so late observers still see it.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::transport::TransportAddress;

pub const DEFAULT_ADDRESS_ENV: &str = "EXTHOST_BRIDGE_ADDRESS";
const RECENT_OUTPUT_LINES: usize = 64;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Absolute/relative path, or a bare name looked up on `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    /// Also export the address under this variable name.
    pub address_env: Option<String>,
    pub stop_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            address_env: Some(DEFAULT_ADDRESS_ENV.into()),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no extension runtime executable configured")]
    NotConfigured,
    #[error("extension runtime {program:?} not found: {source}")]
    NotFound {
        program: PathBuf,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// `stop()` had been requested before the process went away.
    pub expected: bool,
}

impl WorkerExit {
    fn from_status(status: ExitStatus, expected: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            expected,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct WorkerProcess {
    pid: Option<u32>,
    address: TransportAddress,
    stop_requested: Arc<AtomicBool>,
    stop_grace: Duration,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<WorkerExit>>,
    output: broadcast::Sender<WorkerOutput>,
    recent: Arc<Mutex<VecDeque<WorkerOutput>>>,
}

impl WorkerProcess {
    pub fn start(config: &WorkerConfig, address: &TransportAddress) -> Result<Self, ProcessError> {
        let program = resolve_program(&config.program)?;
        let address_arg = address.as_arg();

        let mut command = TokioCommand::new(&program);
        command
            .args(&config.args)
            .arg(&address_arg)
            .envs(config.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(var) = &config.address_env {
            command.env(var, &address_arg);
        }
        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(
            target = "exthost::worker",
            program = %program.display(),
            pid = pid.unwrap_or_default(),
            address = %address,
            "extension runtime started"
        );

        let (output, _) = broadcast::channel(256);
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_OUTPUT_LINES)));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_child_lines(
                BufReader::new(stdout),
                OutputStream::Stdout,
                output.clone(),
                Arc::clone(&recent),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_child_lines(
                BufReader::new(stderr),
                OutputStream::Stderr,
                output.clone(),
                Arc::clone(&recent),
            ));
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let monitor_stop = Arc::clone(&stop_requested);
        tokio::spawn(async move {
            // A dropped sender counts as a kill request.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        debug!(target = "exthost::worker", error = %err, "kill after exit");
                    }
                    child.wait().await
                }
            };
            let expected = monitor_stop.load(Ordering::SeqCst);
            let exit = match status {
                Ok(status) => WorkerExit::from_status(status, expected),
                Err(err) => {
                    warn!(target = "exthost::worker", error = %err, "failed to await extension runtime");
                    WorkerExit {
                        code: None,
                        signal: None,
                        expected,
                    }
                }
            };
            metrics::WORKER_EXITS
                .with_label_values(&[if expected { "true" } else { "false" }])
                .inc();
            if expected {
                info!(target = "exthost::worker", code = ?exit.code, signal = ?exit.signal, "extension runtime stopped");
            } else {
                warn!(target = "exthost::worker", code = ?exit.code, signal = ?exit.signal, "extension runtime exited unexpectedly");
            }
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            address: address.clone(),
            stop_requested,
            stop_grace: config.stop_grace,
            kill: Some(kill_tx),
            exit: exit_rx,
            output,
            recent,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit.clone()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<WorkerOutput> {
        self.output.subscribe()
    }

    /// The last few output lines, oldest first, for diagnostics after exit.
    pub fn recent_output(&self) -> Vec<WorkerOutput> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Marks the coming exit as expected without signalling the runtime, for
    /// shutdowns where the peer is told to leave over the wire first.
    pub fn expect_exit(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Asks the runtime to terminate, force-killing it once `stop_grace`
    /// has elapsed. Returns the observed exit.
    pub async fn stop(&mut self) -> Option<WorkerExit> {
        if let Some(exit) = self.exit.borrow().clone() {
            return Some(exit);
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.request_termination() {
            self.force_kill();
        }

        let mut exit = self.exit.clone();
        let timed_out = tokio::time::timeout(self.stop_grace, exit.wait_for(Option::is_some))
            .await
            .is_err();
        if timed_out {
            warn!(
                target = "exthost::worker",
                pid = self.pid.unwrap_or_default(),
                grace_ms = self.stop_grace.as_millis() as u64,
                "extension runtime ignored termination; killing"
            );
            self.force_kill();
        }
        let result = exit.wait_for(Option::is_some).await.ok().and_then(|exit| exit.clone());
        result
    }

    fn force_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    #[cfg(unix)]
    fn request_termination(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(
                target = "exthost::worker",
                pid,
                error = %io::Error::last_os_error(),
                "SIGTERM failed"
            );
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn request_termination(&self) -> bool {
        false
    }
}

fn resolve_program(program: &Path) -> Result<PathBuf, ProcessError> {
    if program.as_os_str().is_empty() {
        return Err(ProcessError::NotConfigured);
    }
    which::which(program).map_err(|source| ProcessError::NotFound {
        program: program.to_path_buf(),
        source,
    })
}

async fn forward_child_lines<R>(
    mut reader: BufReader<R>,
    stream: OutputStream,
    output: broadcast::Sender<WorkerOutput>,
    recent: Arc<Mutex<VecDeque<WorkerOutput>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                info!(target = "exthost::worker", stream = stream.as_str(), message = trimmed);
                let entry = WorkerOutput {
                    stream,
                    line: trimmed.to_string(),
                };
                {
                    let mut recent = recent.lock();
                    if recent.len() == RECENT_OUTPUT_LINES {
                        recent.pop_front();
                    }
                    recent.push_back(entry.clone());
                }
                let _ = output.send(entry);
            }
            Err(err) => {
                warn!(
                    target = "exthost::worker",
                    stream = stream.as_str(),
                    error = %err,
                    "failed to read worker output"
                );
                break;
            }
        }
    }
}
