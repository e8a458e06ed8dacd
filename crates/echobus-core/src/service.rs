//! The echo service: one object, an immediate method and a deferred one.
//!
//! `echo` computes and sends its reply before the handler returns.
//! `longecho` formats the reply at accept time, defers the call, and hands
//! the reply plus the deferred token to a timer task; the caller keeps
//! waiting until the timer fires. Shutdown cancels outstanding timers and
//! fails their calls instead of leaking them.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusConnection, CallStatus, InboundCall};
use crate::error::BusResult;
use crate::object::{FieldType, MethodSpec, ObjectSpec};
use crate::payload::{EchoArgs, EchoReply, format_reply};

/// Object name the service registers under by default.
pub const DEFAULT_OBJECT_NAME: &str = "async";

/// Default delay before a `longecho` reply is sent.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(5000);

/// Immediate-reply method name.
pub const METHOD_ECHO: &str = "echo";

/// Deferred-reply method name.
pub const METHOD_LONGECHO: &str = "longecho";

/// Configuration for one registered echo service.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Name the object is registered under.
    pub object_name: String,
    /// Delay before `longecho` replies are sent.
    pub delay: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            object_name: DEFAULT_OBJECT_NAME.to_owned(),
            delay: DEFAULT_DELAY,
        }
    }
}

impl EchoConfig {
    /// Create a config with an explicit object name and delay.
    #[must_use]
    pub fn new(object_name: impl Into<String>, delay: Duration) -> Self {
        Self {
            object_name: object_name.into(),
            delay,
        }
    }
}

/// Registration metadata for the echo object: both methods declare one
/// optional string field `message`.
fn echo_object_spec(name: &str) -> ObjectSpec {
    ObjectSpec::new(name)
        .method(MethodSpec::new(METHOD_ECHO).field("message", FieldType::String))
        .method(MethodSpec::new(METHOD_LONGECHO).field("message", FieldType::String))
}

/// A running echo service registered on a bus.
#[derive(Debug)]
pub struct EchoService {
    object_name: String,
    conn: BusConnection,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EchoService {
    /// Register the echo object on `conn` and start serving calls.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::BusError::Registration`] and
    /// [`crate::error::BusError::Connection`] from the bus; the caller
    /// decides whether to continue degraded.
    pub fn register(conn: &BusConnection, config: EchoConfig) -> BusResult<Self> {
        let inbox = conn.register_object(echo_object_spec(&config.object_name))?;
        let object_name = config.object_name.clone();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(inbox, config, cancel.clone()));
        Ok(Self {
            object_name,
            conn: conn.clone(),
            cancel,
            task,
        })
    }

    /// Name the service's object is registered under.
    #[must_use]
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Stop serving: cancel pending deferred replies, failing their calls
    /// as [`CallStatus::Aborted`], and unregister the object.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        if let Err(err) = self.conn.unregister_object(&self.object_name) {
            // Already gone when the bus shut down first.
            debug!(%err, object = %self.object_name, "unregister after shutdown");
        }
    }
}

/// Service loop: one task receives every call; deferred replies run as
/// timer tasks collected in a `JoinSet` so teardown can wait for them.
async fn serve(
    mut inbox: mpsc::UnboundedReceiver<InboundCall>,
    config: EchoConfig,
    cancel: CancellationToken,
) {
    info!(
        object = %config.object_name,
        delay_ms = config.delay.as_millis() as u64,
        "echo service running"
    );
    let mut timers = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            inbound = inbox.recv() => match inbound {
                Some(call) => handle_call(call, &config, &cancel, &mut timers),
                None => {
                    debug!(object = %config.object_name, "call inbox closed");
                    break;
                }
            },
            Some(_) = timers.join_next(), if !timers.is_empty() => {}
        }
    }
    // Wake any timers still sleeping so their calls fail now rather than
    // dangling past teardown.
    cancel.cancel();
    while timers.join_next().await.is_some() {}
    debug!(object = %config.object_name, "echo service stopped");
}

fn handle_call(
    call: InboundCall,
    config: &EchoConfig,
    cancel: &CancellationToken,
    timers: &mut JoinSet<()>,
) {
    let InboundCall {
        method,
        args,
        responder,
    } = call;
    let args = EchoArgs::from_value(&args);

    match method.as_str() {
        METHOD_ECHO => {
            match format_reply(&config.object_name, args.message.as_deref()) {
                Ok(text) => {
                    if let Err(err) = responder.reply_now(EchoReply { message: text }.into()) {
                        warn!(%err, "echo reply failed");
                    }
                },
                Err(err) => {
                    // No reply is sent on allocation failure; the caller
                    // learns of it through the completion status.
                    warn!(%err, "failed to build echo reply");
                    let _ = responder.fail(CallStatus::OutOfMemory);
                },
            }
        },
        METHOD_LONGECHO => {
            // The reply is fixed at accept time; only the send is delayed.
            let reply = match format_reply(&config.object_name, args.message.as_deref()) {
                Ok(text) => EchoReply { message: text },
                Err(err) => {
                    warn!(%err, "failed to build longecho reply");
                    let _ = responder.fail(CallStatus::OutOfMemory);
                    return;
                },
            };
            let deferred = responder.defer();
            let delay = config.delay;
            let cancel = cancel.clone();
            debug!(
                message = %reply.message,
                delay_ms = delay.as_millis() as u64,
                "deferred reply scheduled"
            );
            timers.spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        if let Err(err) = deferred.resolve(reply.into()) {
                            // The bus completed the call first (shutdown).
                            debug!(%err, "deferred reply raced completion");
                        }
                    },
                    () = cancel.cancelled() => {
                        debug!("deferred reply cancelled by shutdown");
                        if let Err(err) = deferred.abort() {
                            debug!(%err, "deferred abort raced completion");
                        }
                    },
                }
            });
        },
        other => {
            // The bus filters methods against the registered spec; this
            // arm only fires if the spec declares more than we handle.
            warn!(method = other, "method declared but not handled");
            let _ = responder.fail(CallStatus::MethodNotFound);
        },
    }
}
