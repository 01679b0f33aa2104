//! TCP transports for control channels.
//!
//! # Transports
//!
//! ```text
//!  admin client ──connect──▶ ListenChannel ──accept──▶ channel task (one per peer)
//!  UplinkChannel ──dial──▶ remote controller          channel task (one at a time)
//! ```
//!
//! Listening channels accept any number of sessions. The uplink keeps a
//! single outbound session and re-dials forever with exponential backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::serve_channel;
use super::dispatcher::DispatchHandle;
use super::error::{ControlError, ControlResult};
use super::session::{ChannelKind, Session, SessionContext};

/// Pause after a failed `accept` (typically descriptor exhaustion).
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Everything a channel task needs besides its transport.
#[derive(Debug, Clone)]
pub struct ChannelSetup {
    /// Shared session inputs.
    pub ctx: Arc<SessionContext>,
    /// Route to the dispatcher.
    pub dispatch: DispatchHandle,
    /// Maximum request line length.
    pub line_limit: usize,
}

impl ChannelSetup {
    /// Serve one connected TCP stream to completion.
    pub async fn serve_tcp(&self, stream: TcpStream, kind: ChannelKind) -> ControlResult<()> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let session = Session::new(kind, peer, self.ctx.clone());
        let (reader, writer) = stream.into_split();
        serve_channel(
            BufReader::new(reader),
            writer,
            session,
            self.dispatch.clone(),
            self.line_limit,
        )
        .await
    }
}

/// Turn `:port` into a wildcard address; everything else passes through.
fn normalize(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

/// Bound listening endpoint(s) for one `-T` address.
///
/// A host name may resolve to several addresses; each one gets a socket.
#[derive(Debug)]
pub struct ListenChannel {
    listeners: Vec<TcpListener>,
}

impl ListenChannel {
    /// Resolve and bind `addr` (`host:port`, `:port`).
    pub async fn bind(addr: &str) -> ControlResult<Self> {
        let target = normalize(addr);
        let resolved: Vec<SocketAddr> = lookup_host(target.as_str())
            .await
            .map_err(|e| ControlError::Bind {
                addr: addr.to_string(),
                message: e.to_string(),
            })?
            .collect();

        let mut listeners = Vec::new();
        let mut last_error = None;
        for sa in resolved {
            match TcpListener::bind(sa).await {
                Ok(l) => listeners.push(l),
                Err(e) => {
                    debug!("Cannot bind {}: {}", sa, e);
                    last_error = Some(e);
                }
            }
        }

        if listeners.is_empty() {
            return Err(ControlError::Bind {
                addr: addr.to_string(),
                message: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no addresses".to_string()),
            });
        }
        Ok(Self { listeners })
    }

    /// The addresses actually bound (ports resolved).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Start one accept loop per bound socket.
    pub fn spawn(self, setup: ChannelSetup) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(listener, setup.clone())))
            .collect()
    }
}

async fn accept_loop(listener: TcpListener, setup: ChannelSetup) {
    if let Ok(addr) = listener.local_addr() {
        info!("Control listener on {}", addr);
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted control connection from {}", peer);
                let setup = setup.clone();
                tokio::spawn(async move {
                    // Errors are logged by the channel task itself.
                    let _ = setup.serve_tcp(stream, ChannelKind::Listening).await;
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, double per failure, never exceed `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call returns a longer one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Outbound control channel to a remote controller.
#[derive(Debug, Clone)]
pub struct UplinkChannel {
    addr: String,
    backoff: Backoff,
}

impl UplinkChannel {
    /// Dial `addr` with the given backoff policy.
    pub fn new(addr: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            addr: addr.into(),
            backoff,
        }
    }

    /// Start the dial loop. It never finishes on its own.
    pub fn spawn(self, setup: ChannelSetup) -> JoinHandle<()> {
        tokio::spawn(self.run(setup))
    }

    async fn run(mut self, setup: ChannelSetup) {
        loop {
            match TcpStream::connect(self.addr.as_str()).await {
                Ok(stream) => {
                    info!("Uplink connected to {}", self.addr);
                    self.backoff.reset();
                    if let Err(e) = setup.serve_tcp(stream, ChannelKind::Uplink).await {
                        debug!("Uplink session ended: {}", e);
                    }
                    info!("Uplink to {} closed", self.addr);
                }
                Err(e) => warn!("Uplink connect to {} failed: {}", self.addr, e),
            }
            let delay = self.backoff.next_delay();
            debug!("Redialing {} in {:?}", self.addr, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
