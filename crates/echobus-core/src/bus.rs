//! In-process bus router and call completion tokens.
//!
//! The router stands in for an external bus daemon: it owns the object
//! table and the table of in-flight calls, and it is the only component
//! that can resolve a call id to its caller. Services never see call ids;
//! they hold move-only tokens that complete a call exactly once.
//!
//! # Call flow
//!
//! ```text
//! caller ──call(object, method, args)──▶ router ──InboundCall──▶ service
//!   ▲                                      │
//!   │   replies + final CallStatus         │ CallResponder
//!   └──────────────────────────────────────┘   │ reply_now / fail
//!                                              └ defer ─▶ DeferredReply
//!                                                           resolve / abort
//! ```
//!
//! The caller awaits transparently until completion. A completion happens
//! exactly once per call: the token types consume themselves when used, and
//! dropping one unfinished completes the call as [`CallStatus::Aborted`] so
//! no caller hangs on a forgotten reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::object::ObjectSpec;

/// Final status of a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The call completed successfully.
    Ok,
    /// No object with the requested name is registered.
    ObjectNotFound,
    /// The object exists but does not declare the requested method.
    MethodNotFound,
    /// The service could not allocate the reply.
    OutOfMemory,
    /// The call was abandoned before a reply was produced.
    Aborted,
}

impl CallStatus {
    /// Returns `true` for a successful completion.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Everything the caller gets back from one call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Final completion status.
    pub status: CallStatus,
    /// Reply payloads, in the order the service sent them.
    pub replies: Vec<Value>,
}

impl CallOutcome {
    /// The reply payload, when the call produced exactly one.
    #[must_use]
    pub fn single_reply(&self) -> Option<&Value> {
        match self.replies.as_slice() {
            [reply] => Some(reply),
            _ => None,
        }
    }
}

/// A call delivered to a registered service.
#[derive(Debug)]
pub struct InboundCall {
    /// Requested method name, already validated against the object spec.
    pub method: String,
    /// Call argument payload.
    pub args: Value,
    /// Token used to answer this call.
    pub responder: CallResponder,
}

/// One in-flight call, keyed by call id in the router.
struct InFlight {
    reply_tx: mpsc::UnboundedSender<Value>,
    done_tx: Option<oneshot::Sender<CallStatus>>,
    deferred: bool,
}

/// A registered object: its declared spec and the service's inbox.
struct Registered {
    spec: ObjectSpec,
    call_tx: mpsc::UnboundedSender<InboundCall>,
}

#[derive(Default)]
struct BusState {
    objects: HashMap<String, Registered>,
    calls: HashMap<u64, InFlight>,
    shut_down: bool,
}

/// Router internals shared by the bus handle, connections, and tokens.
#[derive(Clone)]
struct Shared {
    endpoint: Arc<str>,
    state: Arc<Mutex<BusState>>,
    next_call_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one reply payload for a still-pending call.
    fn send_reply(&self, call_id: u64, reply: Value) -> BusResult<()> {
        let state = self.lock();
        let call = state.calls.get(&call_id).ok_or_else(|| {
            BusError::invalid_state(format!("reply for call {call_id} after completion"))
        })?;
        // The caller may have gone away; the reply is then discarded.
        let _ = call.reply_tx.send(reply);
        Ok(())
    }

    /// Complete a call and release its state. Exactly-once is enforced
    /// here: a second completion for the same id is an `InvalidState` fault.
    fn complete(&self, call_id: u64, status: CallStatus) -> BusResult<()> {
        let mut call = {
            let mut state = self.lock();
            state.calls.remove(&call_id).ok_or_else(|| {
                BusError::invalid_state(format!("call {call_id} completed twice"))
            })?
        };
        debug!(
            endpoint = %self.endpoint,
            call_id,
            ?status,
            deferred = call.deferred,
            "call completed"
        );
        if let Some(done_tx) = call.done_tx.take() {
            let _ = done_tx.send(status);
        }
        Ok(())
    }

    fn mark_deferred(&self, call_id: u64) {
        let mut state = self.lock();
        if let Some(call) = state.calls.get_mut(&call_id) {
            call.deferred = true;
            debug!(endpoint = %self.endpoint, call_id, "call deferred");
        }
    }
}

/// An in-process message bus.
///
/// Hosts the object table and routes calls between connections. Shutting
/// the bus down fails every in-flight call as [`CallStatus::Aborted`] and
/// refuses further connections.
pub struct LoopbackBus {
    shared: Shared,
}

impl LoopbackBus {
    /// Host a bus under the given endpoint label.
    ///
    /// The label identifies the bus in logs, playing the role a socket
    /// path plays for an out-of-process bus.
    #[must_use]
    pub fn host(endpoint: impl Into<String>) -> Self {
        let endpoint: Arc<str> = endpoint.into().into();
        debug!(endpoint = %endpoint, "bus hosted");
        Self {
            shared: Shared {
                endpoint,
                state: Arc::new(Mutex::new(BusState::default())),
                next_call_id: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    /// Endpoint label this bus was hosted under.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Open a connection to this bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the bus has shut down.
    pub fn connection(&self) -> BusResult<BusConnection> {
        if self.shared.lock().shut_down {
            return Err(BusError::connection(format!(
                "bus '{}' has shut down",
                self.shared.endpoint
            )));
        }
        Ok(BusConnection {
            shared: self.shared.clone(),
        })
    }

    /// Shut the bus down.
    ///
    /// Every in-flight call completes as [`CallStatus::Aborted`], every
    /// registered service's inbox closes, and subsequent connections and
    /// calls fail with [`BusError::Connection`].
    pub fn shutdown(&self) {
        let (calls, objects) = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            let calls: Vec<InFlight> = state.calls.drain().map(|(_, call)| call).collect();
            let objects: Vec<Registered> = state.objects.drain().map(|(_, obj)| obj).collect();
            (calls, objects)
        };
        debug!(
            endpoint = %self.shared.endpoint,
            aborted_calls = calls.len(),
            dropped_objects = objects.len(),
            "bus shut down"
        );
        for mut call in calls {
            if let Some(done_tx) = call.done_tx.take() {
                let _ = done_tx.send(CallStatus::Aborted);
            }
        }
        // Dropping `objects` closes each service's inbox.
    }
}

/// A client handle onto a [`LoopbackBus`].
///
/// Cloneable; clones share the underlying bus.
#[derive(Clone, Debug)]
pub struct BusConnection {
    shared: Shared,
}

impl BusConnection {
    /// Register a named object and receive its call inbox.
    ///
    /// The bus validates inbound calls against `spec` and only delivers
    /// methods the spec declares.
    ///
    /// # Errors
    ///
    /// [`BusError::Registration`] if the name is already taken,
    /// [`BusError::Connection`] if the bus has shut down.
    pub fn register_object(
        &self,
        spec: ObjectSpec,
    ) -> BusResult<mpsc::UnboundedReceiver<InboundCall>> {
        let mut state = self.shared.lock();
        if state.shut_down {
            return Err(BusError::connection(format!(
                "bus '{}' has shut down",
                self.shared.endpoint
            )));
        }
        if state.objects.contains_key(&spec.name) {
            return Err(BusError::registration(format!(
                "object '{}' is already registered",
                spec.name
            )));
        }
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        debug!(endpoint = %self.shared.endpoint, object = %spec.name, "object registered");
        state
            .objects
            .insert(spec.name.clone(), Registered { spec, call_tx });
        Ok(call_rx)
    }

    /// Remove a registered object.
    ///
    /// In-flight calls on the object are unaffected; their tokens remain
    /// valid until completed.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidState`] if no such object is registered.
    pub fn unregister_object(&self, name: &str) -> BusResult<()> {
        let mut state = self.shared.lock();
        if state.objects.remove(name).is_none() {
            return Err(BusError::invalid_state(format!(
                "object '{name}' is not registered"
            )));
        }
        debug!(endpoint = %self.shared.endpoint, object = name, "object unregistered");
        Ok(())
    }

    /// Call a method on a named object and await its completion.
    ///
    /// The future resolves when the service completes the call, whether it
    /// replied immediately or deferred; the caller cannot tell the
    /// difference. Unknown objects and methods resolve as outcomes, not
    /// errors, mirroring how a bus daemon answers a misaddressed call.
    ///
    /// # Errors
    ///
    /// [`BusError::Connection`] if the bus has shut down before the call
    /// was accepted.
    pub async fn call(&self, object: &str, method: &str, args: Value) -> BusResult<CallOutcome> {
        let (mut reply_rx, mut done_rx, call_tx, inbound) = {
            let mut state = self.shared.lock();
            if state.shut_down {
                return Err(BusError::connection(format!(
                    "bus '{}' has shut down",
                    self.shared.endpoint
                )));
            }
            let call_tx = match state.objects.get(object) {
                None => {
                    return Ok(CallOutcome {
                        status: CallStatus::ObjectNotFound,
                        replies: Vec::new(),
                    });
                },
                Some(registered) if !registered.spec.has_method(method) => {
                    return Ok(CallOutcome {
                        status: CallStatus::MethodNotFound,
                        replies: Vec::new(),
                    });
                },
                Some(registered) => registered.call_tx.clone(),
            };

            let call_id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            let (done_tx, done_rx) = oneshot::channel();
            let inbound = InboundCall {
                method: method.to_owned(),
                args,
                responder: CallResponder {
                    shared: self.shared.clone(),
                    call_id,
                    finished: false,
                },
            };
            state.calls.insert(
                call_id,
                InFlight {
                    reply_tx,
                    done_tx: Some(done_tx),
                    deferred: false,
                },
            );
            (reply_rx, done_rx, call_tx, inbound)
        };

        // The send happens outside the state lock: a closed inbox drops the
        // responder here, and its abort path takes the lock again.
        if call_tx.send(inbound).is_err() {
            warn!(
                endpoint = %self.shared.endpoint,
                object, method, "service inbox closed, call aborted"
            );
        }

        let mut replies = Vec::new();
        let status = loop {
            tokio::select! {
                biased;
                Some(reply) = reply_rx.recv() => replies.push(reply),
                status = &mut done_rx => break status.unwrap_or(CallStatus::Aborted),
            }
        };
        // Completion raced ahead of queued replies; drain what remains.
        while let Ok(reply) = reply_rx.try_recv() {
            replies.push(reply);
        }
        Ok(CallOutcome { status, replies })
    }
}

/// The move-only token answering one accepted call.
///
/// The call id inside is owned by the bus and deliberately not exposed.
/// Consuming the token completes the call; dropping it unfinished completes
/// the call as [`CallStatus::Aborted`].
#[derive(Debug)]
pub struct CallResponder {
    shared: Shared,
    call_id: u64,
    finished: bool,
}

impl CallResponder {
    /// Send one reply payload without completing the call.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidState`] if the call already completed.
    pub fn send_reply(&self, reply: Value) -> BusResult<()> {
        self.shared.send_reply(self.call_id, reply)
    }

    /// Immediate path: send `reply` and complete with [`CallStatus::Ok`].
    pub fn reply_now(mut self, reply: Value) -> BusResult<()> {
        if let Err(err) = self.send_reply(reply) {
            // The call is already gone; nothing left to complete.
            self.finished = true;
            return Err(err);
        }
        self.finish(CallStatus::Ok)
    }

    /// Complete the call without a reply.
    pub fn fail(mut self, status: CallStatus) -> BusResult<()> {
        self.finish(status)
    }

    /// Defer the reply: return control to the bus now, answer later.
    ///
    /// The returned [`DeferredReply`] carries the completion obligation;
    /// this call's handler can return while the caller keeps waiting.
    #[must_use]
    pub fn defer(mut self) -> DeferredReply {
        self.finished = true;
        self.shared.mark_deferred(self.call_id);
        DeferredReply {
            shared: self.shared.clone(),
            call_id: self.call_id,
            finished: false,
        }
    }

    fn finish(&mut self, status: CallStatus) -> BusResult<()> {
        self.finished = true;
        self.shared.complete(self.call_id, status)
    }
}

impl Drop for CallResponder {
    fn drop(&mut self) {
        if !self.finished {
            warn!(call_id = self.call_id, "call responder dropped without completion");
            let _ = self.shared.complete(self.call_id, CallStatus::Aborted);
        }
    }
}

/// The completion obligation for a deferred call.
///
/// Obtained from [`CallResponder::defer`]. Holds the stored call token
/// until either [`resolve`](Self::resolve) sends the reply or
/// [`abort`](Self::abort) fails the call during teardown. Dropping it
/// unfinished aborts the call, so an abandoned timer cannot strand the
/// caller.
#[derive(Debug)]
pub struct DeferredReply {
    shared: Shared,
    call_id: u64,
    finished: bool,
}

impl DeferredReply {
    /// Send the stored reply and complete with [`CallStatus::Ok`].
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidState`] if the call was already completed, for
    /// example by a bus shutdown that raced the timer.
    pub fn resolve(mut self, reply: Value) -> BusResult<()> {
        if let Err(err) = self.shared.send_reply(self.call_id, reply) {
            // The call is already gone; nothing left to complete.
            self.finished = true;
            return Err(err);
        }
        self.finish(CallStatus::Ok)
    }

    /// Complete the call as [`CallStatus::Aborted`] without a reply.
    pub fn abort(mut self) -> BusResult<()> {
        self.finish(CallStatus::Aborted)
    }

    fn finish(&mut self, status: CallStatus) -> BusResult<()> {
        self.finished = true;
        self.shared.complete(self.call_id, status)
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if !self.finished {
            warn!(call_id = self.call_id, "deferred reply dropped without completion");
            let _ = self.shared.complete(self.call_id, CallStatus::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::object::{FieldType, MethodSpec};

    fn echo_object(name: &str) -> ObjectSpec {
        ObjectSpec::new(name).method(MethodSpec::new("echo").field("message", FieldType::String))
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();

        let _inbox = conn.register_object(echo_object("async")).unwrap();
        let err = conn.register_object(echo_object("async")).unwrap_err();
        assert!(matches!(err, BusError::Registration { .. }));
    }

    #[tokio::test]
    async fn unknown_object_and_method_resolve_as_outcomes() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();
        let _inbox = conn.register_object(echo_object("async")).unwrap();

        let outcome = conn.call("nope", "echo", json!({})).await.unwrap();
        assert_eq!(outcome.status, CallStatus::ObjectNotFound);
        assert!(outcome.replies.is_empty());

        let outcome = conn.call("async", "nope", json!({})).await.unwrap();
        assert_eq!(outcome.status, CallStatus::MethodNotFound);
    }

    #[tokio::test]
    async fn second_completion_is_an_invalid_state_fault() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();
        let mut inbox = conn.register_object(echo_object("async")).unwrap();

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("async", "echo", json!({})).await })
        };

        let call = inbox.recv().await.unwrap();
        let call_id = call.responder.call_id;
        let shared = call.responder.shared.clone();
        call.responder.reply_now(json!({ "message": "done" })).unwrap();

        // The token is consumed, so a second completion can only come from
        // misuse of a stale call id. The router must detect it.
        let err = shared.complete(call_id, CallStatus::Ok).unwrap_err();
        assert!(matches!(err, BusError::InvalidState { .. }));

        // And a stale reply is rejected the same way.
        let err = shared.send_reply(call_id, json!({})).unwrap_err();
        assert!(matches!(err, BusError::InvalidState { .. }));

        let outcome = caller.await.unwrap().unwrap();
        assert_eq!(outcome.status, CallStatus::Ok);
        assert_eq!(outcome.replies.len(), 1);
    }

    #[tokio::test]
    async fn dropped_responder_aborts_the_call() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();
        let mut inbox = conn.register_object(echo_object("async")).unwrap();

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("async", "echo", json!({})).await })
        };

        let call = inbox.recv().await.unwrap();
        drop(call);

        let outcome = caller.await.unwrap().unwrap();
        assert_eq!(outcome.status, CallStatus::Aborted);
        assert!(outcome.replies.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_and_refuses_new_work() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();
        let mut inbox = conn.register_object(echo_object("async")).unwrap();

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("async", "echo", json!({})).await })
        };
        let call = inbox.recv().await.unwrap();
        let deferred = call.responder.defer();

        bus.shutdown();

        let outcome = caller.await.unwrap().unwrap();
        assert_eq!(outcome.status, CallStatus::Aborted);

        // The timer side loses the race and gets an invalid-state fault,
        // scoped to that one call.
        let err = deferred.resolve(json!({})).unwrap_err();
        assert!(matches!(err, BusError::InvalidState { .. }));

        assert!(matches!(
            bus.connection().unwrap_err(),
            BusError::Connection { .. }
        ));
        assert!(matches!(
            conn.call("async", "echo", json!({})).await.unwrap_err(),
            BusError::Connection { .. }
        ));
        assert!(matches!(
            conn.register_object(echo_object("other")).unwrap_err(),
            BusError::Connection { .. }
        ));

        // The service inbox closed with the bus.
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_then_call_is_object_not_found() {
        let bus = LoopbackBus::host("test");
        let conn = bus.connection().unwrap();
        let _inbox = conn.register_object(echo_object("async")).unwrap();

        conn.unregister_object("async").unwrap();
        let err = conn.unregister_object("async").unwrap_err();
        assert!(matches!(err, BusError::InvalidState { .. }));

        let outcome = conn.call("async", "echo", json!({})).await.unwrap();
        assert_eq!(outcome.status, CallStatus::ObjectNotFound);
    }
}
