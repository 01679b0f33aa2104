//! Worker supervision.
//!
//! The dispatcher talks to the supervisor over two one-directional channels:
//! [`WorkerCommand`]s go out fire-and-forget, [`WorkerStatus`] notifications
//! come back. The dispatcher never waits for the worker, so a slow or dead
//! worker cannot stall a control channel.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::telemetry::{self, AuditEvent};

/// Requests to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Launch the worker if it is not running.
    Start,
    /// Ask the running worker to terminate.
    Stop,
}

/// Notifications from the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The worker process is running.
    Started {
        /// Process id.
        pid: u32,
    },
    /// The worker process has exited.
    Exited {
        /// Exit code, when it exited normally.
        code: Option<i32>,
        /// Terminating signal, when it was killed.
        signal: Option<i32>,
    },
    /// The worker could not be launched.
    SpawnFailed(String),
}

/// Supervisor failures visible to the dispatcher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The supervisor task is gone or not accepting requests.
    #[error("Worker supervisor unavailable")]
    Unavailable,

    /// There is no worker program to run.
    #[error("No worker program configured")]
    NotConfigured,
}

/// How to launch the worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment, on top of the inherited one.
    pub env: BTreeMap<String, String>,
}

/// Dispatcher side of the command channel.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<WorkerCommand>,
    configured: bool,
}

impl SupervisorHandle {
    /// Wrap a command sender. `configured` says whether a worker program exists.
    pub fn new(tx: mpsc::Sender<WorkerCommand>, configured: bool) -> Self {
        Self { tx, configured }
    }

    /// Whether `start` can ever succeed.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Request a worker start.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if !self.configured {
            return Err(SupervisorError::NotConfigured);
        }
        self.send(WorkerCommand::Start)
    }

    /// Request a worker stop.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.send(WorkerCommand::Stop)
    }

    fn send(&self, cmd: WorkerCommand) -> Result<(), SupervisorError> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Supervisor queue full, dropping {:?}", cmd);
                Err(SupervisorError::Unavailable)
            }
            Err(TrySendError::Closed(_)) => Err(SupervisorError::Unavailable),
        }
    }
}

/// Spawn the supervisor task on the current runtime.
///
/// Returns the command handle and the status receiver the dispatcher selects
/// on. With `spec == None` every start is refused up front.
pub fn spawn_supervisor(spec: Option<WorkerSpec>) -> (SupervisorHandle, mpsc::Receiver<WorkerStatus>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = mpsc::channel(8);
    let handle = SupervisorHandle::new(cmd_tx, spec.is_some());

    if let Some(spec) = spec {
        tokio::spawn(supervise(spec, cmd_rx, status_tx));
    } else {
        // Keep the command side open so stop requests are not reported as a
        // dead supervisor.
        tokio::spawn(drain(cmd_rx, status_tx));
    }
    (handle, status_rx)
}

async fn drain(mut cmd_rx: mpsc::Receiver<WorkerCommand>, _status_tx: mpsc::Sender<WorkerStatus>) {
    while let Some(cmd) = cmd_rx.recv().await {
        debug!("No worker configured, ignoring {:?}", cmd);
    }
}

async fn supervise(
    spec: WorkerSpec,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    status_tx: mpsc::Sender<WorkerStatus>,
) {
    let mut child: Option<Child> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WorkerCommand::Start) => {
                    if child.is_some() {
                        debug!("Worker already running, ignoring start");
                        continue;
                    }
                    match launch(&spec) {
                        Ok(c) => {
                            let pid = c.id().unwrap_or_default();
                            info!("Worker started (pid {})", pid);
                            audit(AuditEvent::WorkerStarted { pid });
                            child = Some(c);
                            let _ = status_tx.send(WorkerStatus::Started { pid }).await;
                        }
                        Err(e) => {
                            error!("Could not start worker {}: {}", spec.program.display(), e);
                            let _ = status_tx.send(WorkerStatus::SpawnFailed(e.to_string())).await;
                        }
                    }
                }
                Some(WorkerCommand::Stop) => {
                    if let Some(c) = &child {
                        terminate(c);
                    }
                }
                None => {
                    if let Some(c) = &child {
                        terminate(c);
                    }
                    break;
                }
            },
            status = wait_child(&mut child) => {
                child = None;
                let (code, signal) = match status {
                    Ok(s) => exit_parts(s),
                    Err(e) => {
                        warn!("Lost track of worker: {}", e);
                        (None, None)
                    }
                };
                info!("Worker exited (code {:?}, signal {:?})", code, signal);
                audit(AuditEvent::WorkerExited { code, signal });
                let _ = status_tx.send(WorkerStatus::Exited { code, signal }).await;
            }
        }
    }
    debug!("Supervisor stopped");
}

fn launch(spec: &WorkerSpec) -> std::io::Result<Child> {
    // stdout may be the local control channel; never let the worker write to it.
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_output(out));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_output(err));
    }
    Ok(child)
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "mgtd::worker", "{}", line);
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}

fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!("Sending SIGTERM to worker {}", pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("Failed to signal worker {}: {}", pid, e);
    }
}

fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}

fn audit(event: AuditEvent) {
    if let Some(logger) = telemetry::try_audit() {
        logger.log(event);
    }
}
