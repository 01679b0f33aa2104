//! Control channels and the command dispatcher.
//!
//! This module provides the administrative surface of the manager:
//! - Wire framing and request tokenizing (`protocol`)
//! - Challenge-response authentication (`auth`, `session`)
//! - One task per channel (`channel`) over stdin/stdout or TCP (`socket`)
//! - The single-threaded dispatcher that owns mutable state (`dispatcher`)

pub mod auth;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod session;
pub mod socket;

pub use auth::{Challenge, DigestKind, ResponseDigest, Sha256NewlineFramed, Sha256Sandwich};
pub use channel::{DEFAULT_LINE_LIMIT, serve_channel};
pub use dispatcher::{DispatchHandle, Dispatcher, StopReason, WorkerState};
pub use error::{ControlError, ControlResult};
pub use protocol::{Reply, Status, tokenize};
pub use session::{ChannelKind, Session, SessionContext, SessionState, challenge_from_reply};
pub use socket::{Backoff, ChannelSetup, ListenChannel, UplinkChannel};
