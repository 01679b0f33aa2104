//! Manager startup and lifetime.
//!
//! # Startup order
//!
//! 1. Option checks and configuration loading
//! 2. Parameter registry: defaults, config file, `-l`, `-p`, `-t`, then `-r`
//! 3. Working directory, secret, daemonization, audit log, pid file
//! 4. Runtime, supervisor, dispatcher and control channels
//!
//! Daemonizing happens before the runtime exists, because forking a process
//! that already runs threads is undefined. The secret is derived before the
//! fork so that its warnings and errors still reach the terminal; the daemon
//! then adopts the generated file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{BufReader, stdin, stdout};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::config::{Config, ConfigLoader};
use crate::control::{
    Backoff, ChannelKind, ChannelSetup, Dispatcher, ListenChannel, Session, SessionContext,
    StopReason, UplinkChannel, serve_channel,
};
use crate::error::StartupError;
use crate::params::{ParamRegistry, collect_params};
use crate::pidfile::PidFile;
use crate::secret::{SecretSource, SecretStore};
use crate::supervisor::{WorkerSpec, spawn_supervisor};
use crate::symbols::SymbolTable;
use crate::telemetry::{self, AuditEvent, DEFAULT_SYSLOG_TAG};

/// Working directory used without `-n`.
pub const DEFAULT_WORKDIR: &str = "/var/lib/mgtd";

/// Time given to blocked I/O tasks (stdin) once the dispatcher has stopped.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Everything the async part of the manager needs, prepared synchronously.
struct Prepared {
    cli: Cli,
    config: Config,
    params: ParamRegistry,
    workdir: PathBuf,
    ident: String,
}

/// Run the manager until it is told to stop.
///
/// Returns once the dispatcher has stopped and the worker is gone.
pub fn run(cli: Cli) -> Result<(), StartupError> {
    if cli.dump.as_deref() == Some("dumpparams") {
        print!("{}", collect_params()?.dump_rst());
        return Ok(());
    }

    cli.validate().map_err(StartupError::Usage)?;

    let config = ConfigLoader::new().load(cli.config.as_deref())?;
    debug!("Loaded configuration: {:?}", config);

    let params = build_params(&cli, &config)?;
    check_readable(&cli)?;

    if !cli.debug && cli.backend.is_none() && cli.script.is_none() {
        warn!("Neither -b nor -f given, won't start a worker child");
        warn!("Manager started, use a control client to configure and start the worker");
    }

    let workdir = cli
        .workdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
    fs::create_dir_all(&workdir)
        .with_context(|| format!("Cannot create working directory {}", workdir.display()))?;

    let ident = platform_ident();
    if cli.debug {
        eprintln!("Platform: {ident}");
    }

    let mut secret = derive_secret(&cli, &workdir)?;

    if !cli.debug && !cli.foreground {
        nix::unistd::daemon(true, false).context("Failed to daemonize")?;
        secret.adopt_pid();
    }

    let tag = syslog_tag(cli.workdir.as_deref());
    if let Err(e) = telemetry::init_logger(&tag) {
        warn!("Audit log unavailable, continuing without it: {}", e);
        let _ = telemetry::init_null_logger();
    }

    let _pidfile = match &cli.pidfile {
        Some(path) => Some(
            PidFile::create(path)
                .with_context(|| format!("Could not write pid file {}", path.display()))?,
        ),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let prepared = Prepared {
        cli,
        config,
        params,
        workdir,
        ident,
    };
    let result = runtime.block_on(serve(prepared, &secret));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    let reason = result?;
    if let Some(audit) = telemetry::try_audit() {
        audit.log(AuditEvent::ManagerStop {
            reason: reason.to_string(),
        });
    }
    info!("Manager stopped: {}", reason);
    Ok(())
}

/// Build the registry and apply every startup setting in order.
///
/// Config file settings come first so that command-line flags override them.
/// `-r` is applied last: it protects the final startup value.
pub fn build_params(cli: &Cli, config: &Config) -> Result<ParamRegistry, StartupError> {
    let mut params = collect_params()?;

    for (name, value) in &config.params {
        params.set(name, &value.to_string())?;
    }

    let (vsl, vsm) = cli.shm_sizes();
    if let Some(v) = vsl {
        params.set("vsl_space", v)?;
    }
    if let Some(v) = vsm {
        params.set("vsm_space", v)?;
    }

    for arg in &cli.params {
        let (name, value) = Cli::parse_param(arg)
            .ok_or_else(|| StartupError::Usage(format!("Invalid -p argument '{arg}'")))?;
        params.set(name, value)?;
    }

    if let Some(ttl) = &cli.default_ttl {
        params.set("default_ttl", ttl)?;
    }

    for name in cli.protected_params() {
        params.protect(name)?;
    }

    Ok(params)
}

/// Fail early on an unreadable `-f` file, before the terminal goes away.
fn check_readable(cli: &Cli) -> Result<(), StartupError> {
    if let Some(script) = &cli.script {
        fs::File::open(script).map_err(|e| {
            StartupError::Usage(format!("Cannot read -f file {}: {e}", script.display()))
        })?;
    }
    Ok(())
}

/// Read or generate the control secret for `-S`.
pub fn derive_secret(cli: &Cli, workdir: &Path) -> Result<SecretStore, StartupError> {
    let source = SecretSource::from_arg(cli.secret.as_deref().map(Path::new));
    Ok(SecretStore::derive(&source, workdir)?)
}

/// `sysname,release,machine` of the running host.
pub fn platform_ident() -> String {
    match nix::sys::utsname::uname() {
        Ok(u) => format!(
            "{},{},{}",
            u.sysname().to_string_lossy(),
            u.release().to_string_lossy(),
            u.machine().to_string_lossy()
        ),
        Err(e) => {
            debug!("uname failed: {}", e);
            format!("{},unknown,{}", std::env::consts::OS, std::env::consts::ARCH)
        }
    }
}

/// Syslog tag: the instance name, or the default.
pub fn syslog_tag(workdir: Option<&Path>) -> String {
    workdir
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSLOG_TAG.to_string())
}

/// Greeting sent on every authenticated channel.
pub fn banner(ident: &str) -> String {
    format!(
        "-----------------------------\n\
         mgtd control {}\n\
         -----------------------------\n\
         {ident}\n\
         \n\
         Type 'help' for command list.\n\
         Type 'quit' to close CLI session.",
        env!("CARGO_PKG_VERSION")
    )
}

/// Worker launch description, if a worker program is configured.
///
/// The worker learns the startup arguments that concern it from `MGTD_*`
/// environment variables.
pub fn worker_spec(cli: &Cli, config: &Config, workdir: &Path) -> Option<WorkerSpec> {
    let program = config.worker.program.clone()?;
    let mut spec = WorkerSpec {
        program,
        args: config.worker.args.clone(),
        env: Default::default(),
    };
    spec.env.insert("MGTD_LISTEN".into(), cli.listen.join(" "));
    spec.env
        .insert("MGTD_WORKDIR".into(), workdir.display().to_string());
    if let Some(backend) = &cli.backend {
        spec.env.insert("MGTD_BACKEND".into(), backend.clone());
    }
    if let Some(script) = &cli.script {
        spec.env
            .insert("MGTD_SCRIPT".into(), script.display().to_string());
    }
    if let Some(identity) = &cli.identity {
        spec.env.insert("MGTD_IDENTITY".into(), identity.clone());
    }
    Some(spec)
}

async fn serve(prepared: Prepared, secret: &SecretStore) -> Result<StopReason, StartupError> {
    let Prepared {
        cli,
        config,
        params,
        workdir,
        ident,
    } = prepared;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    let symbols = match std::env::current_exe() {
        Ok(exe) => SymbolTable::load(&exe),
        Err(e) => {
            debug!("Cannot locate own executable: {}", e);
            SymbolTable::default()
        }
    };
    debug!("Loaded {} symbols", symbols.len());

    let (supervisor, worker_status) = spawn_supervisor(worker_spec(&cli, &config, &workdir));
    let configured = supervisor.is_configured();

    let banner = banner(&ident);
    let (mut dispatcher, dispatch) = Dispatcher::new(
        params,
        Arc::new(symbols),
        supervisor,
        worker_status,
        shutdown_rx,
        banner.clone(),
    );

    let ctx = Arc::new(SessionContext {
        secret: secret.secret(),
        digest: config.control.digest().build(),
        failure_limit: config.control.auth_failure_limit(),
        banner,
    });
    let setup = ChannelSetup {
        ctx: ctx.clone(),
        dispatch: dispatch.clone(),
        line_limit: config.control.line_limit(),
    };

    if let Some(addr) = cli.control_listen() {
        let listener = ListenChannel::bind(addr).await?;
        for local in listener.local_addrs() {
            info!("Control listening on {}", local);
        }
        listener.spawn(setup.clone());
    }

    if let Some(addr) = cli.uplink() {
        let backoff = Backoff::new(
            config.control.uplink_backoff(),
            config.control.uplink_backoff_max(),
        );
        UplinkChannel::new(addr, backoff).spawn(setup.clone());
    }

    if cli.debug {
        let local = dispatch.clone();
        let line_limit = setup.line_limit;
        tokio::spawn(async move {
            let session = Session::new(ChannelKind::Local, "stdin", ctx);
            if let Err(e) =
                serve_channel(BufReader::new(stdin()), stdout(), session, local.clone(), line_limit)
                    .await
            {
                warn!("Local channel ended with error: {}", e);
            }
            local.local_closed().await;
        });
    }

    if let Some(audit) = telemetry::try_audit() {
        audit.log(AuditEvent::ManagerStart {
            ident: ident.clone(),
            pid: std::process::id(),
            auth: !secret.secret().is_empty(),
        });
    }
    info!("Manager started ({})", ident);

    if configured && !cli.debug {
        let reply = dispatcher.start_worker();
        debug!("Worker autostart: {} {}", reply.status, reply.body);
    }

    // The manager's own handle keeps the event queue open while no channel
    // is connected.
    let _dispatch = dispatch;
    Ok(dispatcher.run().await)
}
