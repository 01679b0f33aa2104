//! Per-channel authentication state machine.
//!
//! A [`Session`] consumes request lines and decides what happens with each:
//! answer it directly, forward it to the dispatcher, or close the channel.
//! It performs no I/O itself, which keeps the protocol testable without
//! sockets.
//!
//! ```text
//!                   open (secret set)
//!  Unauthenticated ───────────────────▶ ChallengeIssued ◀──┐ wrong digest:
//!        │                                   │             │ fresh challenge
//!        │ open (no secret / local)          │ auth <ok>   │
//!        ▼                                   ▼             │
//!   Authenticated ◀──────────────────────────┘─────────────┘
//!
//!  any state ── quit / EOF / error / failure limit ──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{Challenge, ResponseDigest, verify};
use super::protocol::{Reply, Status, tokenize};
use crate::secret::Secret;
use crate::telemetry::{self, AuditEvent};

/// Transport kind of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Inherited stdin/stdout; trusted.
    Local,
    /// Accepted from the listening endpoint.
    Listening,
    /// Dialed outward to a remote controller.
    Uplink,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Local => write!(f, "local"),
            ChannelKind::Listening => write!(f, "listen"),
            ChannelKind::Uplink => write!(f, "uplink"),
        }
    }
}

/// Authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet.
    Unauthenticated,
    /// A challenge is outstanding.
    ChallengeIssued,
    /// Commands are accepted.
    Authenticated,
    /// Terminal.
    Closed,
}

/// Shared, read-only inputs every session needs.
pub struct SessionContext {
    /// The shared secret. Empty disables authentication.
    pub secret: Arc<Secret>,
    /// Response digest construction.
    pub digest: Box<dyn ResponseDigest>,
    /// Consecutive failed `auth` attempts before the channel is closed.
    /// Zero means unlimited.
    pub failure_limit: u32,
    /// Text sent after successful authentication.
    pub banner: String,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("secret", &self.secret)
            .field("failure_limit", &self.failure_limit)
            .finish_non_exhaustive()
    }
}

/// What the channel should do with a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write this reply, then read the next line.
    Reply(Reply),
    /// Hand the words to the dispatcher and write its reply.
    Execute(Vec<String>),
    /// Write the reply if any, then close the channel.
    Close(Option<Reply>),
    /// Nothing to send.
    Ignore,
}

/// Authentication and command gating for one channel.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    kind: ChannelKind,
    peer: String,
    state: SessionState,
    challenge: Option<Challenge>,
    failures: u32,
    ctx: Arc<SessionContext>,
}

/// Commands answered before authentication.
const PRE_AUTH_COMMANDS: &[&str] = &["ping", "help"];

impl Session {
    /// Create a session for a freshly opened channel.
    pub fn new(kind: ChannelKind, peer: impl Into<String>, ctx: Arc<SessionContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            peer: peer.into(),
            state: SessionState::Unauthenticated,
            challenge: None,
            failures: 0,
            ctx,
        }
    }

    /// Session identifier used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The outstanding challenge, if any.
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Greeting for a new channel.
    ///
    /// Local channels and servers without a secret go straight to
    /// `Authenticated`; everyone else gets a challenge.
    pub fn open(&mut self) -> Reply {
        if self.kind == ChannelKind::Local || self.ctx.secret.is_empty() {
            self.state = SessionState::Authenticated;
            debug!("Session {} ({} {}) needs no authentication", self.id, self.kind, self.peer);
            return Reply::ok(self.ctx.banner.clone());
        }
        self.issue_challenge()
    }

    /// Process one request line.
    pub fn handle_line(&mut self, line: &str) -> SessionAction {
        if self.state == SessionState::Closed {
            return SessionAction::Close(None);
        }

        let words = match tokenize(line) {
            Ok(words) => words,
            Err(e) => return SessionAction::Reply(Reply::new(Status::Syntax, e.to_string())),
        };
        let Some(command) = words.first().map(String::as_str) else {
            return SessionAction::Ignore;
        };

        if command == "quit" {
            self.close();
            return SessionAction::Close(Some(Reply::new(Status::Close, "Closing CLI connection")));
        }

        match self.state {
            SessionState::Authenticated => {
                if command == "auth" {
                    SessionAction::Reply(Reply::ok("Already authenticated"))
                } else {
                    SessionAction::Execute(words)
                }
            }
            SessionState::Unauthenticated => SessionAction::Reply(self.issue_challenge()),
            SessionState::ChallengeIssued => match command {
                "auth" => self.authenticate(&words[1..]),
                c if PRE_AUTH_COMMANDS.contains(&c) => SessionAction::Execute(words),
                _ => SessionAction::Reply(self.challenge_reply()),
            },
            SessionState::Closed => SessionAction::Close(None),
        }
    }

    /// The channel went away.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!("Session {} ({} {}) closed", self.id, self.kind, self.peer);
            self.state = SessionState::Closed;
            self.challenge = None;
        }
    }

    fn authenticate(&mut self, args: &[String]) -> SessionAction {
        let response = match args {
            [] => return SessionAction::Reply(Reply::new(Status::TooFew, "Too few parameters")),
            [one] => one,
            _ => return SessionAction::Reply(Reply::new(Status::TooMany, "Too many parameters")),
        };

        let Some(challenge) = self.challenge.take() else {
            return SessionAction::Reply(self.issue_challenge());
        };

        if verify(self.ctx.digest.as_ref(), &challenge, &self.ctx.secret, response) {
            self.state = SessionState::Authenticated;
            self.failures = 0;
            info!("Session {} ({} {}) authenticated", self.id, self.kind, self.peer);
            audit(AuditEvent::AuthSuccess {
                session: self.id,
                channel: self.kind,
                peer: self.peer.clone(),
            });
            return SessionAction::Reply(Reply::ok(self.ctx.banner.clone()));
        }

        self.failures += 1;
        warn!(
            "Session {} ({} {}) failed authentication ({} consecutive)",
            self.id, self.kind, self.peer, self.failures
        );
        audit(AuditEvent::AuthFailure {
            session: self.id,
            channel: self.kind,
            peer: self.peer.clone(),
            failures: self.failures,
        });

        if self.ctx.failure_limit != 0 && self.failures >= self.ctx.failure_limit {
            self.close();
            return SessionAction::Close(Some(Reply::new(
                Status::Close,
                "Too many authentication failures, closing CLI connection",
            )));
        }

        // The old challenge was consumed above; never hand it out again.
        SessionAction::Reply(self.issue_challenge())
    }

    fn issue_challenge(&mut self) -> Reply {
        self.challenge = Some(Challenge::generate());
        self.state = SessionState::ChallengeIssued;
        self.challenge_reply()
    }

    fn challenge_reply(&self) -> Reply {
        let challenge = self.challenge.as_ref().map(Challenge::as_str).unwrap_or_default();
        Reply::new(
            Status::Auth,
            format!("{challenge}\n\nAuthentication required.\n"),
        )
    }
}

fn audit(event: AuditEvent) {
    if let Some(logger) = telemetry::try_audit() {
        logger.log(event);
    }
}

/// Extract the challenge from a 107 reply body.
pub fn challenge_from_reply(reply: &Reply) -> Option<Challenge> {
    if reply.status != Status::Auth {
        return None;
    }
    reply.body.lines().next().map(Challenge::from)
}
