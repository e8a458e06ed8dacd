//! echobus-core - deferred-reply bus call handling.
//!
//! This library models the contract a bus service must uphold when it
//! answers a call *after* its handler has already returned control to the
//! bus runtime: capture the call token, schedule a completion, send the
//! reply exactly once, and release the captured state.
//!
//! # Modules
//!
//! - [`bus`]: in-process bus router, connections, and the move-only call
//!   completion tokens ([`bus::CallResponder`], [`bus::DeferredReply`])
//! - [`error`]: error types ([`error::BusError`], [`error::BusResult`])
//! - [`object`]: declarative object/method registration metadata
//! - [`payload`]: call argument and reply payload types
//! - [`service`]: the echo service exercising both reply paths
//!
//! # Completion contract
//!
//! Every accepted call completes exactly once. The token types are consumed
//! by completion, so a second completion through the public API does not
//! compile; dropping a token without completing fails the call with
//! [`bus::CallStatus::Aborted`] so callers are never left waiting.
//!
//! # Runtime requirements
//!
//! The bus suspends nothing and blocks nowhere: deferred replies are tasks
//! on the ambient tokio runtime. Any runtime flavor works; the daemon binary
//! uses `multi_thread`.

pub mod bus;
pub mod error;
pub mod object;
pub mod payload;
pub mod service;

pub use bus::{
    BusConnection, CallOutcome, CallResponder, CallStatus, DeferredReply, InboundCall, LoopbackBus,
};
pub use error::{BusError, BusResult};
pub use object::{FieldSpec, FieldType, MethodSpec, ObjectSpec};
pub use payload::{EchoArgs, EchoReply, PLACEHOLDER_MESSAGE, format_reply};
pub use service::{EchoConfig, EchoService};
