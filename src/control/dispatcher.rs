//! Command dispatcher.
//!
//! The `Dispatcher` is the single owner of mutable management state: the
//! parameter registry and the last known worker state. Channel tasks send it
//! authorized commands over an `mpsc` queue and wait on a `oneshot` for the
//! reply. The dispatcher runs one command to completion before taking the
//! next, so handlers never race with each other.
//!
//! # Event sources
//!
//! - Commands from channel tasks
//! - Worker status notifications from the supervisor
//! - Local channel close (debug mode)
//! - Shutdown signal

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ControlError, ControlResult};
use super::protocol::{Reply, Status};
use super::session::{ChannelKind, Session};
use crate::params::{ParamError, ParamInfo, ParamRegistry, ParamValue};
use crate::supervisor::{SupervisorError, SupervisorHandle, WorkerStatus};
use crate::symbols::{SymbolTable, parse_address};
use crate::telemetry::{self, AuditEvent};

/// How long to wait for the worker to exit when the loop stops.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Used when `cli_limit` is somehow not a byte value.
const FALLBACK_CLI_LIMIT: usize = 48 * 1024;

/// Events delivered to the dispatcher.
#[derive(Debug)]
pub enum ControlEvent {
    /// An authorized command from a channel.
    Command {
        /// Issuing session.
        session: Uuid,
        /// Issuing channel kind.
        channel: ChannelKind,
        /// Tokenized request.
        words: Vec<String>,
        /// Where the reply goes.
        reply: oneshot::Sender<Reply>,
    },
    /// The local (stdin/stdout) channel closed.
    LocalClosed,
}

/// Cloneable sender side used by channel tasks.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<ControlEvent>,
}

impl DispatchHandle {
    /// Run a command and wait for its reply.
    pub async fn execute(&self, session: &Session, words: Vec<String>) -> ControlResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlEvent::Command {
                session: session.id(),
                channel: session.kind(),
                words,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ControlError::DispatcherGone)?;
        reply_rx.await.map_err(|_| ControlError::DispatcherGone)
    }

    /// Report that the local channel has closed.
    pub async fn local_closed(&self) {
        if self.tx.send(ControlEvent::LocalClosed).await.is_err() {
            debug!("Dispatcher already stopped");
        }
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The local channel closed in debug mode.
    LocalClosed,
    /// SIGINT/SIGTERM.
    Signal,
    /// No event source is left.
    SourcesGone,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::LocalClosed => write!(f, "local channel closed"),
            StopReason::Signal => write!(f, "signal"),
            StopReason::SourcesGone => write!(f, "no event sources left"),
        }
    }
}

/// Last known worker state, as seen through supervisor notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not running.
    Stopped,
    /// Start requested, no confirmation yet.
    Starting,
    /// Running with this pid.
    Running(u32),
    /// Stop requested, no exit notification yet.
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running(_) => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
        }
    }
}

struct CommandDesc {
    name: &'static str,
    synopsis: &'static str,
    help: &'static str,
    min_args: usize,
    max_args: usize,
}

const COMMANDS: &[CommandDesc] = &[
    CommandDesc {
        name: "auth",
        synopsis: "auth <response>",
        help: "Authenticate with the digest of the challenge and the shared secret.",
        min_args: 1,
        max_args: 1,
    },
    CommandDesc {
        name: "banner",
        synopsis: "banner",
        help: "Print welcome banner.",
        min_args: 0,
        max_args: 0,
    },
    CommandDesc {
        name: "debug.symbol",
        synopsis: "debug.symbol <address>",
        help: "Resolve a code address to the nearest enclosing symbol.",
        min_args: 1,
        max_args: 1,
    },
    CommandDesc {
        name: "help",
        synopsis: "help [<command>]",
        help: "Show command overview or get help on a single command.",
        min_args: 0,
        max_args: 1,
    },
    CommandDesc {
        name: "param.set",
        synopsis: "param.set <param> <value>",
        help: "Set parameter value.",
        min_args: 2,
        max_args: 2,
    },
    CommandDesc {
        name: "param.show",
        synopsis: "param.show [-l] [<param>]",
        help: "Show parameters and their values. With -l or a parameter name, \
               show the full description.",
        min_args: 0,
        max_args: 2,
    },
    CommandDesc {
        name: "ping",
        synopsis: "ping [<timestamp>]",
        help: "Keep connection alive.",
        min_args: 0,
        max_args: 1,
    },
    CommandDesc {
        name: "quit",
        synopsis: "quit",
        help: "Close connection.",
        min_args: 0,
        max_args: 0,
    },
    CommandDesc {
        name: "start",
        synopsis: "start",
        help: "Start the worker process.",
        min_args: 0,
        max_args: 0,
    },
    CommandDesc {
        name: "status",
        synopsis: "status",
        help: "Check status of the worker process.",
        min_args: 0,
        max_args: 0,
    },
    CommandDesc {
        name: "stop",
        synopsis: "stop",
        help: "Stop the worker process.",
        min_args: 0,
        max_args: 0,
    },
];

fn lookup(name: &str) -> Option<&'static CommandDesc> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// The command dispatcher and event loop.
pub struct Dispatcher {
    events: mpsc::Receiver<ControlEvent>,
    worker_status: mpsc::Receiver<WorkerStatus>,
    shutdown_rx: watch::Receiver<bool>,
    params: ParamRegistry,
    symbols: Arc<SymbolTable>,
    supervisor: SupervisorHandle,
    worker: WorkerState,
    banner: String,
}

impl Dispatcher {
    /// Create a dispatcher and the handle channel tasks use to reach it.
    pub fn new(
        params: ParamRegistry,
        symbols: Arc<SymbolTable>,
        supervisor: SupervisorHandle,
        worker_status: mpsc::Receiver<WorkerStatus>,
        shutdown_rx: watch::Receiver<bool>,
        banner: impl Into<String>,
    ) -> (Self, DispatchHandle) {
        let (tx, events) = mpsc::channel(64);
        let dispatcher = Self {
            events,
            worker_status,
            shutdown_rx,
            params,
            symbols,
            supervisor,
            worker: WorkerState::Stopped,
            banner: banner.into(),
        };
        (dispatcher, DispatchHandle { tx })
    }

    /// Last known worker state.
    pub fn worker_state(&self) -> WorkerState {
        self.worker
    }

    /// The parameter registry.
    pub fn params(&self) -> &ParamRegistry {
        &self.params
    }

    /// Run until a stop condition, then stop the worker.
    pub async fn run(mut self) -> StopReason {
        info!("Command dispatcher started");
        let mut status_open = true;

        let reason = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ControlEvent::Command { session, channel, words, reply }) => {
                        debug!("Session {} ({}) runs {:?}", session, channel, words.first());
                        let out = self.execute(session, &words);
                        if reply.send(out).is_err() {
                            debug!("Session {} went away before its reply", session);
                        }
                    }
                    Some(ControlEvent::LocalClosed) => {
                        info!("Local channel closed, stopping");
                        break StopReason::LocalClosed;
                    }
                    None => {
                        info!("No control channels left, stopping");
                        break StopReason::SourcesGone;
                    }
                },
                status = self.worker_status.recv(), if status_open => match status {
                    Some(status) => self.on_worker_status(status),
                    None => {
                        warn!("Worker supervisor is gone");
                        status_open = false;
                    }
                },
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Dispatcher received shutdown signal");
                        break StopReason::Signal;
                    }
                }
            }
        };

        if status_open {
            self.stop_worker().await;
        }
        info!("Command dispatcher stopped ({:?})", reason);
        reason
    }

    /// Execute one tokenized command and return its reply.
    pub fn execute(&mut self, session: Uuid, words: &[String]) -> Reply {
        let Some((name, args)) = words.split_first() else {
            return Reply::new(Status::Syntax, "Empty request");
        };
        let Some(desc) = lookup(name) else {
            return Reply::new(
                Status::Unknown,
                "Unknown request.\nType 'help' for more info.",
            );
        };
        if args.len() < desc.min_args {
            return Reply::new(Status::TooFew, "Too few parameters");
        }
        if args.len() > desc.max_args {
            return Reply::new(Status::TooMany, "Too many parameters");
        }

        let reply = match desc.name {
            "help" => self.help(args.first().map(String::as_str)),
            "ping" => ping(),
            "banner" => Reply::ok(self.banner.clone()),
            "status" => Reply::ok(format!("Child in state {}", self.worker)),
            "start" => self.start_worker(),
            "stop" => self.request_stop(),
            "param.show" => self.param_show(args),
            "param.set" => self.param_set(session, &args[0], &args[1]),
            "debug.symbol" => self.debug_symbol(&args[0]),
            _ => Reply::new(Status::Unimplemented, "Handled by the session"),
        };
        reply.truncate(self.cli_limit())
    }

    fn cli_limit(&self) -> usize {
        match self.params.get("cli_limit") {
            Some(ParamValue::Bytes(v)) => usize::try_from(*v).unwrap_or(usize::MAX),
            _ => FALLBACK_CLI_LIMIT,
        }
    }

    fn help(&self, command: Option<&str>) -> Reply {
        match command {
            None => {
                let mut out = String::new();
                for c in COMMANDS {
                    let _ = writeln!(out, "{}", c.synopsis);
                }
                Reply::ok(out)
            }
            Some(name) => match lookup(name) {
                Some(c) => Reply::ok(format!("{}\n  {}\n", c.synopsis, c.help)),
                None => Reply::new(Status::Unknown, format!("Unknown request '{name}'")),
            },
        }
    }

    /// Ask the supervisor to start the worker, as the `start` command does.
    pub fn start_worker(&mut self) -> Reply {
        if self.worker != WorkerState::Stopped {
            return Reply::new(Status::Cant, format!("Child in state {}", self.worker));
        }
        match self.supervisor.start() {
            Ok(()) => {
                self.worker = WorkerState::Starting;
                Reply::ok("")
            }
            Err(e) => supervisor_reply(e),
        }
    }

    fn request_stop(&mut self) -> Reply {
        match self.worker {
            WorkerState::Running(_) | WorkerState::Starting => {}
            state => return Reply::new(Status::Cant, format!("Child in state {state}")),
        }
        match self.supervisor.stop() {
            Ok(()) => {
                self.worker = WorkerState::Stopping;
                Reply::ok("")
            }
            Err(e) => supervisor_reply(e),
        }
    }

    fn param_show(&self, args: &[String]) -> Reply {
        let (long, name) = match args {
            [] => (false, None),
            [flag] if flag == "-l" => (true, None),
            [name] => (true, Some(name.as_str())),
            [flag, name] if flag == "-l" => (true, Some(name.as_str())),
            _ => return Reply::new(Status::Syntax, "Usage: param.show [-l] [<param>]"),
        };

        if let Some(name) = name {
            return match self.params.info(name) {
                Some(p) => Reply::ok(describe_long(&p)),
                None => Reply::new(Status::Param, ParamError::Unknown(name.to_string()).to_string()),
            };
        }

        let mut out = String::new();
        for p in self.params.introspect() {
            if long {
                out.push_str(&describe_long(&p));
            } else {
                let _ = writeln!(out, "{}", describe_short(&p));
            }
        }
        Reply::ok(out)
    }

    fn param_set(&mut self, session: Uuid, name: &str, value: &str) -> Reply {
        match self.params.set(name, value) {
            Ok(()) => {
                info!("Parameter {} set to {}", name, value);
                if let Some(logger) = telemetry::try_audit() {
                    logger.log(AuditEvent::ParamChange {
                        session,
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                Reply::ok("")
            }
            Err(e) => {
                debug!("param.set {} rejected: {}", name, e);
                Reply::new(Status::Param, e.to_string())
            }
        }
    }

    fn debug_symbol(&self, raw: &str) -> Reply {
        let Some(addr) = parse_address(raw) else {
            return Reply::new(Status::Param, format!("Invalid address '{raw}'"));
        };
        match self.symbols.resolve(addr) {
            Some(found) => Reply::ok(found.to_string()),
            None => Reply::new(Status::Cant, format!("No symbol for 0x{addr:x}")),
        }
    }

    fn on_worker_status(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Started { pid } => {
                debug!("Worker running as pid {}", pid);
                self.worker = WorkerState::Running(pid);
            }
            WorkerStatus::Exited { code, signal } => {
                if self.worker == WorkerState::Stopping {
                    info!("Worker stopped");
                } else {
                    warn!("Worker died (code {:?}, signal {:?})", code, signal);
                }
                self.worker = WorkerState::Stopped;
            }
            WorkerStatus::SpawnFailed(msg) => {
                warn!("Worker failed to start: {}", msg);
                self.worker = WorkerState::Stopped;
            }
        }
    }

    async fn stop_worker(&mut self) {
        if self.worker == WorkerState::Stopped {
            return;
        }
        if self.worker != WorkerState::Stopping {
            if let Err(e) = self.supervisor.stop() {
                warn!("Cannot stop worker: {}", e);
                return;
            }
            self.worker = WorkerState::Stopping;
        }

        let wait = async {
            while let Some(status) = self.worker_status.recv().await {
                let exited = !matches!(status, WorkerStatus::Started { .. });
                self.on_worker_status(status);
                if exited {
                    return;
                }
            }
        };
        if timeout(WORKER_STOP_GRACE, wait).await.is_err() {
            warn!("Worker did not exit within {:?}", WORKER_STOP_GRACE);
        }
    }
}

fn supervisor_reply(e: SupervisorError) -> Reply {
    Reply::new(Status::Cant, e.to_string())
}

fn ping() -> Reply {
    Reply::ok(format!("PONG {} 1.0", chrono::Utc::now().timestamp()))
}

fn units(p: &ParamInfo) -> String {
    if p.units.is_empty() {
        String::new()
    } else {
        format!(" [{}]", p.units)
    }
}

fn describe_short(p: &ParamInfo) -> String {
    let marker = if p.is_modified() { "" } else { " (default)" };
    format!("{:<24} {}{}{}", p.name, p.value, units(p), marker)
}

fn describe_long(p: &ParamInfo) -> String {
    let mut out = String::new();
    let marker = if p.is_modified() { "" } else { " (default)" };
    let _ = writeln!(out, "{}", p.name);
    let _ = writeln!(out, "        Value is: {}{}{}", p.value, units(p), marker);
    let _ = writeln!(out, "        Default is: {}", p.default);
    let _ = writeln!(out, "        Domain is: {}", p.constraints);
    if p.protected {
        let _ = writeln!(out, "        Read only");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "        {}", p.docs);
    let _ = writeln!(out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::collect_params;
    use crate::supervisor::WorkerCommand;
    use crate::symbols::SymbolEntry;

    struct Fixture {
        dispatcher: Dispatcher,
        handle: DispatchHandle,
        worker_rx: mpsc::Receiver<WorkerCommand>,
        status_tx: mpsc::Sender<WorkerStatus>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let (cmd_tx, worker_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let symbols = SymbolTable::from_entries(vec![
            SymbolEntry { address: 0x1000, length: 0x100, name: "f".to_string() },
            SymbolEntry { address: 0x1000, length: 0x10, name: "g".to_string() },
        ]);
        let (dispatcher, handle) = Dispatcher::new(
            collect_params().unwrap(),
            Arc::new(symbols),
            SupervisorHandle::new(cmd_tx, true),
            status_rx,
            shutdown_rx,
            "test banner",
        );
        Fixture { dispatcher, handle, worker_rx, status_tx, shutdown_tx }
    }

    fn run(d: &mut Dispatcher, line: &str) -> Reply {
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        d.execute(Uuid::nil(), &words)
    }

    #[test]
    fn test_unknown_and_arity() {
        let mut f = fixture();
        assert_eq!(run(&mut f.dispatcher, "frobnicate").status, Status::Unknown);
        assert_eq!(run(&mut f.dispatcher, "param.set x").status, Status::TooFew);
        assert_eq!(run(&mut f.dispatcher, "status now").status, Status::TooMany);
    }

    #[test]
    fn test_ping_and_help() {
        let mut f = fixture();
        let pong = run(&mut f.dispatcher, "ping");
        assert_eq!(pong.status, Status::Ok);
        assert!(pong.body.starts_with("PONG "));

        let help = run(&mut f.dispatcher, "help");
        assert!(help.body.contains("param.set <param> <value>"));
        assert_eq!(run(&mut f.dispatcher, "help stop").status, Status::Ok);
        assert_eq!(run(&mut f.dispatcher, "help nope").status, Status::Unknown);
    }

    #[test]
    fn test_param_set_and_show() {
        let mut f = fixture();
        assert_eq!(run(&mut f.dispatcher, "param.set default_ttl 60").status, Status::Ok);

        let show = run(&mut f.dispatcher, "param.show default_ttl");
        assert_eq!(show.status, Status::Ok);
        assert!(show.body.contains("Value is: 60"));
        assert!(show.body.contains("Default is: 120"));

        let listing = run(&mut f.dispatcher, "param.show");
        assert!(listing.body.lines().any(|l| l.starts_with("default_ttl") && !l.contains("(default)")));
        assert!(listing.body.lines().any(|l| l.starts_with("listen_depth") && l.contains("(default)")));
    }

    #[test]
    fn test_param_errors_map_to_106() {
        let mut f = fixture();
        assert_eq!(run(&mut f.dispatcher, "param.set nope 1").status, Status::Param);
        assert_eq!(run(&mut f.dispatcher, "param.set thread_pools 0").status, Status::Param);
        assert_eq!(run(&mut f.dispatcher, "param.set thread_pools many").status, Status::Param);
        assert_eq!(run(&mut f.dispatcher, "param.show nope").status, Status::Param);

        f.dispatcher.params.protect("listen_depth").unwrap();
        let reply = run(&mut f.dispatcher, "param.set listen_depth 10");
        assert_eq!(reply.status, Status::Param);
        assert_eq!(f.dispatcher.params().info("listen_depth").unwrap().value, "1024");
    }

    #[test]
    fn test_debug_symbol() {
        let mut f = fixture();
        let reply = run(&mut f.dispatcher, "debug.symbol 0x1005");
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.body, "0x1005: g+0x5");

        assert_eq!(run(&mut f.dispatcher, "debug.symbol 0x9000").status, Status::Cant);
        assert_eq!(run(&mut f.dispatcher, "debug.symbol zz").status, Status::Param);
    }

    #[test]
    fn test_cli_limit_truncates() {
        let mut f = fixture();
        assert_eq!(run(&mut f.dispatcher, "param.set cli_limit 128").status, Status::Ok);
        let reply = run(&mut f.dispatcher, "param.show -l");
        assert_eq!(reply.status, Status::Truncated);
        assert_eq!(reply.body.len(), 128);
    }

    #[test]
    fn test_worker_lifecycle() {
        let mut f = fixture();
        assert_eq!(run(&mut f.dispatcher, "stop").status, Status::Cant);

        assert_eq!(run(&mut f.dispatcher, "start").status, Status::Ok);
        assert_eq!(f.worker_rx.try_recv().unwrap(), WorkerCommand::Start);
        assert_eq!(f.dispatcher.worker_state(), WorkerState::Starting);
        assert_eq!(run(&mut f.dispatcher, "start").status, Status::Cant);

        f.dispatcher.on_worker_status(WorkerStatus::Started { pid: 42 });
        assert_eq!(run(&mut f.dispatcher, "status").body, "Child in state running");

        assert_eq!(run(&mut f.dispatcher, "stop").status, Status::Ok);
        assert_eq!(f.worker_rx.try_recv().unwrap(), WorkerCommand::Stop);
        f.dispatcher.on_worker_status(WorkerStatus::Exited { code: Some(0), signal: None });
        assert_eq!(f.dispatcher.worker_state(), WorkerState::Stopped);
    }

    #[test]
    fn test_supervisor_unavailable_is_300() {
        let mut f = fixture();
        drop(f.worker_rx);
        let reply = run(&mut f.dispatcher, "start");
        assert_eq!(reply.status, Status::Cant);
        assert_eq!(reply.body, "Worker supervisor unavailable");
        assert_eq!(f.dispatcher.worker_state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_run_serves_commands_and_stops_on_signal() {
        let f = fixture();
        let task = tokio::spawn(f.dispatcher.run());

        let (reply_tx, reply_rx) = oneshot::channel();
        f.handle
            .tx
            .send(ControlEvent::Command {
                session: Uuid::nil(),
                channel: ChannelKind::Local,
                words: vec!["banner".to_string()],
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert_eq!(reply_rx.await.unwrap().body, "test banner");

        f.shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), StopReason::Signal);
        drop(f.status_tx);
    }

    #[tokio::test]
    async fn test_local_close_stops_running_worker() {
        let mut f = fixture();
        run(&mut f.dispatcher, "start");
        f.dispatcher.on_worker_status(WorkerStatus::Started { pid: 7 });

        let task = tokio::spawn(f.dispatcher.run());
        f.handle.local_closed().await;

        assert_eq!(f.worker_rx.recv().await, Some(WorkerCommand::Stop));
        f.status_tx
            .send(WorkerStatus::Exited { code: None, signal: Some(15) })
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), StopReason::LocalClosed);
    }
}
