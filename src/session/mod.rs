//! Instrumentation sessions: install interceptors, count completions, restore.
//!
//! An [`InstrumentationSession`] wraps members of a [`Target`] so that every
//! asynchronous operation they trigger drives a
//! [`CompletionLedger`](crate::ledger::CompletionLedger). Five shapes are
//! supported, one registration call each:
//!
//! - [`track_callback`] - functions that take a completion callback and
//!   return a handle
//! - [`track_timer_handler`] - the fire side of a schedule/fire pair
//! - [`track_deferred`] - deferred-value classes (continuation attachment)
//! - [`track_method`] - shared methods that complete an operation
//! - [`track_property`] - settable "on-event" callback properties
//!
//! Every interceptor records what it replaced; restoration runs exactly once
//! before the session's outcome is delivered, on every exit path, so
//! observers of the outcome always see a fully un-instrumented target.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use std::time::Duration;
//! use settlekit::session::InstrumentationSession;
//! use settlekit::target::{Target, Value};
//!
//! let target = Target::new();
//! target.define_function("schedule", |args| {
//!     // Invokes the callback synchronously, then hands out a handle.
//!     if let Some(callback) = args.first().and_then(Value::as_callback) {
//!         (*callback)(&[]);
//!     }
//!     Value::Handle(7)
//! });
//!
//! let (tx, rx) = mpsc::channel();
//! let session = InstrumentationSession::with_callback(
//!     target.clone(),
//!     Duration::from_secs(1),
//!     move |error| tx.send(error).unwrap(),
//! );
//! session.track_callback("schedule").unwrap();
//!
//! // Uninstrumented application code runs.
//! target
//!     .call("schedule", &[Value::callback(|_args| Value::Unit)])
//!     .unwrap();
//!
//! // Every counted operation settled; restoration ran before delivery.
//! assert_eq!(rx.recv().unwrap(), None);
//! ```
//!
//! [`track_callback`]: InstrumentationSession::track_callback
//! [`track_timer_handler`]: InstrumentationSession::track_timer_handler
//! [`track_deferred`]: InstrumentationSession::track_deferred
//! [`track_method`]: InstrumentationSession::track_method
//! [`track_property`]: InstrumentationSession::track_property

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::ledger::{CompletionLedger, Token};
use crate::target::{
    Callback, CatchFn, GetterFn, MemberFn, MethodFn, PropertySlot, SetterFn, Target, ThenFn, Value,
};

mod record;
mod settled;

use record::InterceptionRecord;
pub use settled::Settled;
use settled::SettledState;

/// Predicate deciding whether a particular invocation settles its operation.
///
/// Passed the invocation's arguments; returning `false` suppresses the
/// decrement for that invocation only.
pub type RemovalPredicate = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Default session time budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

type SettleHook = Box<dyn FnOnce(Option<Error>) + Send>;

/// Wraps a target's asynchronous shapes and signals when all operations
/// they trigger have settled.
///
/// Concurrent instrumentation of one target by two sessions is unsupported;
/// callers must serialize sessions per target.
pub struct InstrumentationSession {
    ledger: CompletionLedger,
    target: Target,
    records: Arc<Mutex<Vec<InterceptionRecord>>>,
    settled: SettledState,
}

impl InstrumentationSession {
    /// Creates a session over `target` with the given time budget
    /// ([`DEFAULT_TIMEOUT`] is the conventional choice).
    ///
    /// The outcome is observed through [`settled`](Self::settled).
    #[must_use]
    pub fn new(target: Target, timeout: Duration) -> Self {
        Self::build(target, timeout, None)
    }

    /// Creates a session delivering its outcome to `on_settled` as well.
    ///
    /// `on_settled` is invoked exactly once, after restoration, with `None`
    /// on success or `Some(error)` on failure.
    pub fn with_callback<F>(target: Target, timeout: Duration, on_settled: F) -> Self
    where
        F: FnOnce(Option<Error>) + Send + 'static,
    {
        Self::build(target, timeout, Some(Box::new(on_settled)))
    }

    fn build(target: Target, timeout: Duration, user: Option<SettleHook>) -> Self {
        let records: Arc<Mutex<Vec<InterceptionRecord>>> = Arc::default();
        let settled = SettledState::new();

        let handler = {
            let records = Arc::clone(&records);
            let target = target.clone();
            let settled = settled.clone();
            move |error: Option<Error>| {
                // Restoration is unconditional and happens before the
                // outcome is observable anywhere.
                restore_records(&target, &records);
                settled.deliver(error.clone());
                if let Some(user) = user {
                    user(error);
                }
            }
        };

        let ledger = CompletionLedger::new(handler, timeout);
        Self {
            ledger,
            target,
            records,
            settled,
        }
    }

    /// Returns the session's ledger.
    ///
    /// Useful for pairing manual increments with tracked completion sides
    /// (the timer shape decrements a handle someone else incremented).
    #[must_use]
    pub fn ledger(&self) -> &CompletionLedger {
        &self.ledger
    }

    /// Returns the instrumented target.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Returns the number of interceptors currently installed.
    #[must_use]
    pub fn interceptor_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns a future resolving once the outcome has been delivered.
    #[must_use]
    pub fn settled(&self) -> Settled {
        self.settled.wait()
    }

    /// Forces an early failure of the whole session.
    ///
    /// No-op once the outcome is terminal.
    pub fn fail(&self, error: Error) {
        self.ledger.fail(error);
    }

    /// Wraps a callback-accepting function member.
    ///
    /// Equivalent to [`track_callback_with`](Self::track_callback_with) with
    /// no predicate and the callback in argument position 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// member is absent or not a function.
    pub fn track_callback(&self, name: &str) -> Result<()> {
        self.track_callback_with(name, None, 0)
    }

    /// Wraps a function member that accepts a completion callback at
    /// `callback_pos` and returns a handle.
    ///
    /// Each call increments the ledger with the returned handle; each
    /// qualifying invocation of the callback decrements it (zero, one, or
    /// many times - extra decrements are no-ops). A callback invoked
    /// synchronously before the handle is known records the settlement and
    /// replays it as soon as the original call returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// member is absent or not a function.
    ///
    /// # Panics
    ///
    /// The installed wrapper panics when invoked without a callback at
    /// `callback_pos`, or when the original returns something other than a
    /// handle.
    pub fn track_callback_with(
        &self,
        name: &str,
        can_remove: Option<RemovalPredicate>,
        callback_pos: usize,
    ) -> Result<()> {
        let original = self.target.function(name)?;

        let wrapper: MemberFn = {
            let ledger = self.ledger.clone();
            let inner = Arc::clone(&original);
            let member = name.to_string();
            Arc::new(move |args: &[Value]| {
                let callback = match args.get(callback_pos) {
                    Some(Value::Callback(callback)) => Arc::clone(callback),
                    _ => panic!(
                        "member `{member}` expects a callback argument at position {callback_pos}"
                    ),
                };

                let call = Arc::new(Mutex::new(CallState {
                    token: None,
                    early_decrements: 0,
                }));

                let counted: Callback = {
                    let ledger = ledger.clone();
                    let call = Arc::clone(&call);
                    let can_remove = can_remove.clone();
                    Arc::new(move |callback_args: &[Value]| {
                        let _guard = PendingCallGuard {
                            ledger: ledger.clone(),
                            call: Arc::clone(&call),
                            can_remove: can_remove.clone(),
                            args: callback_args.to_vec(),
                        };
                        (*callback)(callback_args)
                    })
                };

                let mut forwarded = args.to_vec();
                forwarded[callback_pos] = Value::Callback(counted);
                let returned = (*inner)(&forwarded);

                let handle = match returned.as_handle() {
                    Some(handle) => handle,
                    None => panic!(
                        "member `{member}` returned {returned:?} where a handle was expected"
                    ),
                };

                let token = Token::Handle(handle);
                let early = {
                    let mut call = call.lock();
                    call.token = Some(token);
                    std::mem::take(&mut call.early_decrements)
                };
                ledger.increment(token);
                for _ in 0..early {
                    ledger.decrement(token);
                }

                returned
            })
        };

        self.target.replace_function(name, wrapper)?;
        self.records.lock().push(InterceptionRecord::Callback {
            name: name.to_string(),
            original,
        });
        tracing::debug!(member = name, "callback shape tracked");
        Ok(())
    }

    /// Wraps the fire side of a schedule/fire pair.
    ///
    /// The member is the function a scheduler calls back with the handle it
    /// was given at schedule time. The wrapper runs the original, then
    /// decrements the ledger with that handle - even when the original
    /// panics. No increment happens here; the schedule site pairs with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// member is absent or not a function.
    ///
    /// # Panics
    ///
    /// The installed wrapper panics when invoked without a handle as its
    /// first argument.
    pub fn track_timer_handler(&self, name: &str) -> Result<()> {
        let original = self.target.function(name)?;

        let wrapper: MemberFn = {
            let ledger = self.ledger.clone();
            let inner = Arc::clone(&original);
            let member = name.to_string();
            Arc::new(move |args: &[Value]| {
                let handle = match args.first().and_then(Value::as_handle) {
                    Some(handle) => handle,
                    None => panic!(
                        "member `{member}` expects the fired handle as its first argument"
                    ),
                };
                let _guard = DecrementGuard {
                    ledger: ledger.clone(),
                    token: Token::Handle(handle),
                    can_remove: None,
                    args: Vec::new(),
                };
                (*inner)(args)
            })
        };

        self.target.replace_function(name, wrapper)?;
        self.records.lock().push(InterceptionRecord::TimerHandler {
            name: name.to_string(),
            original,
        });
        tracing::debug!(member = name, "timer-handler shape tracked");
        Ok(())
    }

    /// Replaces a deferred-value class's continuation-attachment operations.
    ///
    /// Attaching continuations increments the ledger keyed on the deferred
    /// instance and decrements it once either continuation path has run -
    /// including values that settle as errors with only an error-side
    /// continuation attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// member is absent or not a deferred-value class.
    pub fn track_deferred(&self, name: &str) -> Result<()> {
        let class = self.target.deferred_class(name)?;
        let original_then = class.then_fn();
        let original_catch = class.catch_fn();

        let patched_then: ThenFn = {
            let ledger = self.ledger.clone();
            let inner = Arc::clone(&original_then);
            Arc::new(move |deferred, on_resolve, on_reject| {
                let token = deferred.token();
                ledger.increment(token);

                let done: Callback = {
                    let ledger = ledger.clone();
                    Arc::new(move |_args: &[Value]| {
                        ledger.decrement(token);
                        Value::Unit
                    })
                };

                let result = (*inner)(deferred, on_resolve, on_reject);
                // Observe the result's settlement on both paths; the
                // original attachment keeps the observer itself uncounted.
                let _ = (*inner)(&result, Some(Arc::clone(&done)), Some(done));
                result
            })
        };

        // Error-only attachment in terms of the current `then`, so it is
        // counted exactly like a two-sided attachment.
        let patched_catch: CatchFn =
            Arc::new(move |deferred, on_reject| deferred.then(None, Some(on_reject)));

        class.replace_then(patched_then);
        class.replace_catch(patched_catch);
        self.records.lock().push(InterceptionRecord::Deferred {
            class,
            then: original_then,
            catch: original_catch,
        });
        tracing::debug!(member = name, "deferred shape tracked");
        Ok(())
    }

    /// Wraps a shared method that completes an operation.
    ///
    /// Equivalent to [`track_method_with`](Self::track_method_with) with no
    /// predicate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// class or method is absent.
    pub fn track_method(&self, class_name: &str, name: &str) -> Result<()> {
        self.track_method_with(class_name, name, None)
    }

    /// Wraps a shared method of `class_name`'s instances to decrement the
    /// ledger keyed on the instance around the original call - whether or
    /// not the original panics. Pairs with an increment elsewhere (commonly
    /// a tracked property on the same instance).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// class or method is absent.
    pub fn track_method_with(
        &self,
        class_name: &str,
        name: &str,
        can_remove: Option<RemovalPredicate>,
    ) -> Result<()> {
        let class = self.target.class(class_name)?;
        let original = class
            .method(name)
            .ok_or_else(|| Error::missing_member(format!("{class_name}::{name}")))?;

        let wrapper: MethodFn = {
            let ledger = self.ledger.clone();
            let inner = Arc::clone(&original);
            Arc::new(move |instance, args: &[Value]| {
                let _guard = DecrementGuard {
                    ledger: ledger.clone(),
                    token: instance.token(),
                    can_remove: can_remove.clone(),
                    args: args.to_vec(),
                };
                (*inner)(instance, args)
            })
        };

        class.replace_method(name, wrapper)?;
        self.records.lock().push(InterceptionRecord::Method {
            class,
            name: name.to_string(),
            original,
        });
        tracing::debug!(class = class_name, member = name, "method shape tracked");
        Ok(())
    }

    /// Wraps a settable callback property.
    ///
    /// Equivalent to [`track_property_with`](Self::track_property_with) with
    /// no predicate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// class is absent.
    pub fn track_property(&self, class_name: &str, name: &str) -> Result<()> {
        self.track_property_with(class_name, name, None)
    }

    /// Replaces a settable callback property of `class_name`'s instances by
    /// an accessor.
    ///
    /// Assigning a callback increments the ledger keyed on the instance and
    /// stores a counting wrapper under a shadow key; dispatching the
    /// property (see [`Instance::invoke`](crate::target::Instance::invoke))
    /// runs the wrapper, which decrements after the original callback.
    /// Reading the property hands back the originally assigned callback.
    /// Assigning a non-callback value stores it plainly without counting.
    ///
    /// The property need not be described before instrumentation; an absent
    /// descriptor is recorded and restored as an explicit plain descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] when the
    /// class is absent.
    pub fn track_property_with(
        &self,
        class_name: &str,
        name: &str,
        can_remove: Option<RemovalPredicate>,
    ) -> Result<()> {
        let class = self.target.class(class_name)?;
        let prior = class.property_slot(name);

        let property = name.to_string();
        let shadow = format!("${name}");

        let set: SetterFn = {
            let ledger = self.ledger.clone();
            let property = property.clone();
            let shadow = shadow.clone();
            Arc::new(move |instance, value| {
                let callback = match value {
                    Value::Callback(callback) => callback,
                    other => {
                        instance.raw_set(&property, other);
                        return;
                    }
                };

                let token = instance.token();
                let counted: Callback = {
                    let ledger = ledger.clone();
                    let can_remove = can_remove.clone();
                    let callback = Arc::clone(&callback);
                    Arc::new(move |args: &[Value]| {
                        let _guard = DecrementGuard {
                            ledger: ledger.clone(),
                            token,
                            can_remove: can_remove.clone(),
                            args: args.to_vec(),
                        };
                        (*callback)(args)
                    })
                };

                ledger.increment(token);
                instance.raw_set(&property, Value::Callback(callback));
                instance.raw_set(&shadow, Value::Callback(counted));
            })
        };

        let get: GetterFn = {
            let property = property.clone();
            Arc::new(move |instance| instance.raw_field(&property).unwrap_or(Value::Unit))
        };

        let handler: GetterFn =
            Arc::new(move |instance| instance.raw_field(&shadow).unwrap_or(Value::Unit));

        class.set_property_slot(name, PropertySlot::Accessor { get, set, handler });
        self.records.lock().push(InterceptionRecord::Property {
            class,
            name: property,
            original: prior,
        });
        tracing::debug!(class = class_name, member = name, "property shape tracked");
        Ok(())
    }

    /// Removes every installed interceptor, restoring the saved originals.
    ///
    /// Idempotent: the record list is cleared after the first run, so
    /// calling this again is a no-op. The session's completion handler
    /// calls this before delivering the outcome on every path; an explicit
    /// call is only needed to tear down early.
    pub fn restore(&self) {
        restore_records(&self.target, &self.records);
    }
}

impl std::fmt::Debug for InstrumentationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationSession")
            .field("ledger", &self.ledger)
            .field("interceptors", &self.records.lock().len())
            .finish()
    }
}

fn restore_records(target: &Target, records: &Mutex<Vec<InterceptionRecord>>) {
    let drained = std::mem::take(&mut *records.lock());
    if drained.is_empty() {
        return;
    }
    tracing::debug!(count = drained.len(), "restoring instrumented members");
    for record in drained {
        record.undo(target);
    }
}

/// Per-call state of a callback-shape invocation.
struct CallState {
    /// The handle token, known once the original call returns.
    token: Option<Token>,
    /// Settlements observed before the token was known.
    early_decrements: usize,
}

/// Settles a known token when dropped, unless the predicate declines.
///
/// Drop-based so the settlement fires even when the wrapped call unwinds.
struct DecrementGuard {
    ledger: CompletionLedger,
    token: Token,
    can_remove: Option<RemovalPredicate>,
    args: Vec<Value>,
}

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        let qualifies = self
            .can_remove
            .as_ref()
            .map_or(true, |predicate| (**predicate)(&self.args));
        if qualifies {
            self.ledger.decrement(self.token);
        }
    }
}

/// Callback-shape guard: the token may not be known yet when the callback
/// runs; early settlements are recorded and replayed once it is.
struct PendingCallGuard {
    ledger: CompletionLedger,
    call: Arc<Mutex<CallState>>,
    can_remove: Option<RemovalPredicate>,
    args: Vec<Value>,
}

impl Drop for PendingCallGuard {
    fn drop(&mut self) {
        let qualifies = self
            .can_remove
            .as_ref()
            .map_or(true, |predicate| (**predicate)(&self.args));
        if !qualifies {
            return;
        }
        let token = {
            let mut call = self.call.lock();
            if let Some(token) = call.token {
                Some(token)
            } else {
                call.early_decrements += 1;
                None
            }
        };
        if let Some(token) = token {
            self.ledger.decrement(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::same_fn;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;

    fn session_with_channel(
        target: &Target,
        timeout: Duration,
    ) -> (InstrumentationSession, mpsc::Receiver<Option<Error>>) {
        let (tx, rx) = mpsc::channel();
        let session = InstrumentationSession::with_callback(
            target.clone(),
            timeout,
            move |error| tx.send(error).unwrap(),
        );
        (session, rx)
    }

    /// A function member that invokes its callback synchronously once and
    /// returns handle 7.
    fn define_sync_schedule(target: &Target) {
        target.define_function("schedule", |args| {
            if let Some(callback) = args.first().and_then(Value::as_callback) {
                (*callback)(&[]);
            }
            Value::Handle(7)
        });
    }

    /// A function member that stores its callback for later, returning
    /// sequential handles.
    fn define_deferred_schedule(target: &Target, name: &str) -> Arc<Mutex<Vec<(u64, Callback)>>> {
        let stored: Arc<Mutex<Vec<(u64, Callback)>>> = Arc::default();
        let slot = Arc::clone(&stored);
        let next = Arc::new(Mutex::new(0u64));
        target.define_function(name, move |args| {
            let callback = args.first().and_then(Value::as_callback).unwrap();
            let mut next = next.lock();
            *next += 1;
            slot.lock().push((*next, callback));
            Value::Handle(*next)
        });
        stored
    }

    #[test]
    fn test_synchronous_callback_settles() {
        let target = Target::new();
        define_sync_schedule(&target);
        let original = target.function("schedule").unwrap();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("schedule").unwrap();
        assert_eq!(session.interceptor_count(), 1);

        let handle = target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();
        assert_eq!(handle, Value::Handle(7));

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);

        // The member is the original function again.
        let restored = target.function("schedule").unwrap();
        assert!(same_fn(&restored, &original));
        assert_eq!(session.interceptor_count(), 0);
    }

    #[test]
    fn test_asynchronous_callback_settles_on_invocation() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "schedule");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("schedule").unwrap();

        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();
        assert_eq!(session.ledger().outstanding_count(), 1);
        assert!(rx.try_recv().is_err());

        // Fire the stored (wrapped) callback later.
        let (_, callback) = stored.lock().pop().unwrap();
        (*callback)(&[]);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_multiple_operations_all_must_settle() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "schedule");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("schedule").unwrap();

        for _ in 0..3 {
            target
                .call("schedule", &[Value::callback(|_args| Value::Unit)])
                .unwrap();
        }
        assert_eq!(session.ledger().outstanding_count(), 3);

        let mut pending = std::mem::take(&mut *stored.lock());
        while let Some((_, callback)) = pending.pop() {
            assert!(rx.try_recv().is_err());
            (*callback)(&[]);
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_callback_fired_twice_is_harmless() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "schedule");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("schedule").unwrap();

        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();
        let (_, callback) = stored.lock().pop().unwrap();
        (*callback)(&[]);
        (*callback)(&[]);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_can_remove_suppresses_decrement() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "schedule");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(5));
        let only_final: RemovalPredicate =
            Arc::new(|args| matches!(args.first(), Some(Value::Bool(true))));
        session
            .track_callback_with("schedule", Some(only_final), 0)
            .unwrap();

        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();

        let (_, callback) = stored.lock().pop().unwrap();
        // A non-final tick does not settle the operation.
        (*callback)(&[Value::Bool(false)]);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.ledger().outstanding_count(), 1);

        // The final tick does.
        (*callback)(&[Value::Bool(true)]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_callback_position_other_than_first() {
        let target = Target::new();
        target.define_function("enqueue", |args| {
            if let Some(callback) = args.get(1).and_then(Value::as_callback) {
                (*callback)(&[]);
            }
            Value::Handle(1)
        });

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback_with("enqueue", None, 1).unwrap();

        target
            .call(
                "enqueue",
                &[Value::Int(10), Value::callback(|_args| Value::Unit)],
            )
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_panicking_callback_still_settles() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "schedule");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("schedule").unwrap();

        target
            .call(
                "schedule",
                &[Value::callback(|_args| -> Value { panic!("listener failed") })],
            )
            .unwrap();

        let (_, callback) = stored.lock().pop().unwrap();
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| (*callback)(&[])));
        assert!(unwound.is_err());

        // The error propagated, and the operation still settled.
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_reentrant_tracked_call() {
        let target = Target::new();
        let stored = define_deferred_schedule(&target, "outer");
        target.define_function("inner", |args| {
            if let Some(callback) = args.first().and_then(Value::as_callback) {
                (*callback)(&[]);
            }
            Value::Handle(99)
        });

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_callback("outer").unwrap();
        session.track_callback("inner").unwrap();

        let reentrant = target.clone();
        target
            .call(
                "outer",
                &[Value::callback(move |_args| {
                    reentrant
                        .call("inner", &[Value::callback(|_args| Value::Unit)])
                        .unwrap()
                })],
            )
            .unwrap();

        assert!(rx.try_recv().is_err());

        // Firing the outer callback triggers the nested tracked call.
        let (_, callback) = stored.lock().pop().unwrap();
        (*callback)(&[]);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_timer_handler_decrements_incremented_handle() {
        let target = Target::new();
        target.define_function("on_fired", |_args| Value::Unit);

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_timer_handler("on_fired").unwrap();

        // The schedule site registered handle 5; only the fire side is
        // instrumented here.
        session.ledger().increment(Token::Handle(5));
        assert!(rx.try_recv().is_err());

        target.call("on_fired", &[Value::Handle(5)]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_timer_handler_decrements_even_on_panic() {
        let target = Target::new();
        target.define_function("on_fired", |_args| -> Value { panic!("handler failed") });

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_timer_handler("on_fired").unwrap();
        session.ledger().increment(Token::Handle(5));

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = target.call("on_fired", &[Value::Handle(5)]);
        }));
        assert!(unwound.is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_deferred_counts_until_settlement() {
        let target = Target::new();
        let class = target.define_deferred_class("Promise");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_deferred("Promise").unwrap();

        let deferred = class.pending();
        deferred.then(Some(Arc::new(|_args: &[Value]| Value::Unit)), None);
        assert_eq!(session.ledger().outstanding_count(), 1);
        assert!(rx.try_recv().is_err());

        deferred.resolve(Value::Int(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_deferred_error_only_attachment_counts() {
        let target = Target::new();
        let class = target.define_deferred_class("Promise");

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_deferred("Promise").unwrap();

        let deferred = class.pending();
        deferred.catch(Arc::new(|_args: &[Value]| Value::Unit));
        assert_eq!(session.ledger().outstanding_count(), 1);

        // Settling as an error still counts the value complete.
        deferred.reject(Value::from("boom"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_deferred_attachments_restored() {
        let target = Target::new();
        let class = target.define_deferred_class("Promise");
        let original_then = class.then_fn();
        let original_catch = class.catch_fn();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_deferred("Promise").unwrap();
        assert!(!same_fn(&class.then_fn(), &original_then));

        let deferred = class.resolved(Value::Int(1));
        deferred.then(None, None);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);

        assert!(same_fn(&class.then_fn(), &original_then));
        assert!(same_fn(&class.catch_fn(), &original_catch));
    }

    #[test]
    fn test_method_completes_instance_operation() {
        let target = Target::new();
        let class = target.define_class("Job");
        class.define_method("finish", |_instance, _args| Value::Bool(true));
        let job = class.instantiate();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_method("Job", "finish").unwrap();

        session.ledger().increment(job.token());
        assert!(rx.try_recv().is_err());

        assert_eq!(job.call("finish", &[]).unwrap(), Value::Bool(true));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_method_decrements_even_on_panic() {
        let target = Target::new();
        let class = target.define_class("Job");
        class.define_method("finish", |_instance, _args| -> Value {
            panic!("finish failed")
        });
        let job = class.instantiate();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_method("Job", "finish").unwrap();
        session.ledger().increment(job.token());

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = job.call("finish", &[]);
        }));
        assert!(unwound.is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_method_restored_after_settlement() {
        let target = Target::new();
        let class = target.define_class("Job");
        class.define_method("finish", |_instance, _args| Value::Unit);
        let original = class.method("finish").unwrap();
        let job = class.instantiate();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_method("Job", "finish").unwrap();
        assert!(!same_fn(&class.method("finish").unwrap(), &original));

        session.ledger().increment(job.token());
        job.call("finish", &[]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);

        assert!(same_fn(&class.method("finish").unwrap(), &original));
    }

    #[test]
    fn test_property_counts_assignment_and_dispatch() {
        let target = Target::new();
        let class = target.define_class("Job");
        let job = class.instantiate();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_property("Job", "on_done").unwrap();

        let handler = Value::callback(|_args| Value::Int(1));
        job.set("on_done", handler.clone());
        assert_eq!(session.ledger().outstanding_count(), 1);

        // Reading hands back the assigned callback, not the wrapper.
        assert_eq!(job.get("on_done"), handler);

        // Dispatching runs the wrapper and settles the operation.
        assert_eq!(job.invoke("on_done", &[]), Value::Int(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);

        // After restoration the plain field still reads as the original.
        assert_eq!(job.get("on_done"), handler);
        assert!(matches!(
            class.property_slot("on_done"),
            Some(PropertySlot::Stored)
        ));
    }

    #[test]
    fn test_property_prior_descriptor_restored() {
        let target = Target::new();
        let class = target.define_class("Job");
        class.set_property_slot("on_done", PropertySlot::Stored);

        let (session, _rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_property("Job", "on_done").unwrap();
        assert!(matches!(
            class.property_slot("on_done"),
            Some(PropertySlot::Accessor { .. })
        ));

        session.restore();
        assert!(matches!(
            class.property_slot("on_done"),
            Some(PropertySlot::Stored)
        ));
    }

    #[test]
    fn test_property_non_callback_assignment_not_counted() {
        let target = Target::new();
        let class = target.define_class("Job");
        let job = class.instantiate();

        let (session, _rx) = session_with_channel(&target, Duration::from_secs(1));
        session.track_property("Job", "state").unwrap();

        job.set("state", Value::Int(3));
        assert_eq!(session.ledger().outstanding_count(), 0);
        assert_eq!(job.get("state"), Value::Int(3));
    }

    #[test]
    fn test_property_can_remove_gates_dispatch() {
        let target = Target::new();
        let class = target.define_class("Socket");
        let socket = class.instantiate();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(5));
        let only_close: RemovalPredicate =
            Arc::new(|args| matches!(args.first(), Some(Value::Str(kind)) if kind == "close"));
        session
            .track_property_with("Socket", "on_event", Some(only_close))
            .unwrap();

        socket.set("on_event", Value::callback(|_args| Value::Unit));

        socket.invoke("on_event", &[Value::from("message")]);
        assert!(rx.try_recv().is_err());

        socket.invoke("on_event", &[Value::from("close")]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_timeout_restores_before_failure_is_observed() {
        let target = Target::new();
        let _stored = define_deferred_schedule(&target, "schedule");
        let original = target.function("schedule").unwrap();

        let (tx, rx) = mpsc::channel();
        let session = InstrumentationSession::with_callback(
            target.clone(),
            Duration::from_millis(50),
            {
                let target = target.clone();
                move |error| {
                    let restored = same_fn(&target.function("schedule").unwrap(), &original);
                    tx.send((restored, error)).unwrap();
                }
            },
        );
        session.track_callback("schedule").unwrap();

        // The callback is never invoked, so the deadline fires.
        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();

        let (restored, error) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(restored);
        assert!(error.unwrap().is_timeout());

        // No second delivery, even if the callback fires late.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registration_errors() {
        let target = Target::new();
        target.define_function("f", |_args| Value::Unit);
        target.define_class("Job");

        let session = InstrumentationSession::new(target, Duration::from_secs(1));

        assert_eq!(
            session.track_callback("missing"),
            Err(Error::missing_member("missing"))
        );
        assert_eq!(
            session.track_callback("Job"),
            Err(Error::wrong_shape("Job", "function"))
        );
        assert_eq!(
            session.track_deferred("f"),
            Err(Error::wrong_shape("f", "deferred-value class"))
        );
        assert_eq!(
            session.track_method("Job", "run"),
            Err(Error::missing_member("Job::run"))
        );
        assert_eq!(
            session.track_property("Queue", "on_pop"),
            Err(Error::missing_member("Queue"))
        );
    }

    #[test]
    fn test_restore_is_idempotent() {
        let target = Target::new();
        define_sync_schedule(&target);
        let original = target.function("schedule").unwrap();

        let session = InstrumentationSession::new(target.clone(), Duration::from_secs(1));
        session.track_callback("schedule").unwrap();
        assert_eq!(session.interceptor_count(), 1);

        session.restore();
        assert_eq!(session.interceptor_count(), 0);
        assert!(same_fn(&target.function("schedule").unwrap(), &original));

        // A second restore is a no-op.
        session.restore();
        assert!(same_fn(&target.function("schedule").unwrap(), &original));
    }

    #[test]
    fn test_explicit_fail_delivers_and_restores() {
        let target = Target::new();
        define_sync_schedule(&target);
        let original = target.function("schedule").unwrap();

        let (session, rx) = session_with_channel(&target, Duration::from_secs(5));
        session.track_callback("schedule").unwrap();

        session.fail(Error::missing_member("gave up"));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Some(Error::missing_member("gave up"))
        );
        assert!(same_fn(&target.function("schedule").unwrap(), &original));
    }

    #[tokio::test]
    async fn test_settled_future_success() {
        let target = Target::new();
        define_sync_schedule(&target);

        let session = InstrumentationSession::new(target.clone(), Duration::from_secs(1));
        session.track_callback("schedule").unwrap();

        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();

        session.settled().await.unwrap();
        assert!(session.ledger().outcome().is_succeeded());
    }

    #[tokio::test]
    async fn test_settled_future_timeout() {
        let target = Target::new();
        let _stored = define_deferred_schedule(&target, "schedule");

        let session = InstrumentationSession::new(target.clone(), Duration::from_millis(30));
        session.track_callback("schedule").unwrap();

        target
            .call("schedule", &[Value::callback(|_args| Value::Unit)])
            .unwrap();

        let error = session.settled().await.unwrap_err();
        assert!(error.is_timeout());
    }

    #[test]
    fn test_debug() {
        let target = Target::new();
        let session = InstrumentationSession::new(target, Duration::from_secs(1));
        let debug = format!("{session:?}");
        assert!(debug.contains("InstrumentationSession"));
        assert!(debug.contains("interceptors"));
    }
}
