//! Deferred values: not-yet-available results with attachable continuations.
//!
//! A [`Deferred`] settles exactly once, as resolved or rejected, and runs
//! its continuations synchronously at settlement (or immediately when a
//! continuation is attached after settlement). Continuation attachment is
//! dispatched through the owning [`DeferredClass`]'s replaceable `then` and
//! `catch` slots, which is what lets a session intercept attachment and
//! restore the originals afterward.
//!
//! A continuation that panics rejects its downstream value first and then
//! resumes the unwind, so completion bookkeeping attached downstream still
//! fires while the error propagates to the original caller unchanged.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::class::ObjectId;
use super::{Callback, Value};
use crate::ledger::Token;

/// The continuation-attachment operation: `then(on_resolve, on_reject)`.
pub type ThenFn = Arc<dyn Fn(&Deferred, Option<Callback>, Option<Callback>) -> Deferred + Send + Sync>;

/// The error-only attachment operation: `catch(on_reject)`.
pub type CatchFn = Arc<dyn Fn(&Deferred, Callback) -> Deferred + Send + Sync>;

/// A deferred value's terminal state.
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    /// The value became available.
    Resolved(Value),
    /// The value failed with an error value.
    Rejected(Value),
}

/// A class of deferred values with replaceable attachment operations.
///
/// Cloning shares the underlying slots.
#[derive(Clone)]
pub struct DeferredClass {
    inner: Arc<DeferredClassInner>,
}

struct DeferredClassInner {
    name: String,
    then_slot: Mutex<ThenFn>,
    catch_slot: Mutex<CatchFn>,
}

fn default_then(deferred: &Deferred, on_resolve: Option<Callback>, on_reject: Option<Callback>) -> Deferred {
    deferred.attach(on_resolve, on_reject)
}

fn default_catch(deferred: &Deferred, on_reject: Callback) -> Deferred {
    deferred.attach(None, Some(on_reject))
}

impl DeferredClass {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(DeferredClassInner {
                name: name.to_string(),
                then_slot: Mutex::new(Arc::new(default_then) as ThenFn),
                catch_slot: Mutex::new(Arc::new(default_catch) as CatchFn),
            }),
        }
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Creates an unsettled deferred value of this class.
    #[must_use]
    pub fn pending(&self) -> Deferred {
        Deferred {
            inner: Arc::new(DeferredInner {
                id: ObjectId::new(),
                class: self.clone(),
                state: Mutex::new(DeferredState::Pending(Vec::new())),
            }),
        }
    }

    /// Creates an already-resolved deferred value.
    #[must_use]
    pub fn resolved(&self, value: Value) -> Deferred {
        let deferred = self.pending();
        deferred.resolve(value);
        deferred
    }

    /// Creates an already-rejected deferred value.
    #[must_use]
    pub fn rejected(&self, value: Value) -> Deferred {
        let deferred = self.pending();
        deferred.reject(value);
        deferred
    }

    /// Returns the current `then` operation.
    #[must_use]
    pub fn then_fn(&self) -> ThenFn {
        Arc::clone(&self.inner.then_slot.lock())
    }

    /// Returns the current `catch` operation.
    #[must_use]
    pub fn catch_fn(&self) -> CatchFn {
        Arc::clone(&self.inner.catch_slot.lock())
    }

    /// Swaps the `then` operation, returning the previous one.
    pub(crate) fn replace_then(&self, then: ThenFn) -> ThenFn {
        std::mem::replace(&mut *self.inner.then_slot.lock(), then)
    }

    /// Swaps the `catch` operation, returning the previous one.
    pub(crate) fn replace_catch(&self, catch: CatchFn) -> CatchFn {
        std::mem::replace(&mut *self.inner.catch_slot.lock(), catch)
    }
}

impl fmt::Debug for DeferredClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredClass")
            .field("name", &self.inner.name)
            .finish()
    }
}

enum DeferredState {
    Pending(Vec<Continuation>),
    Settled(Settlement),
}

struct Continuation {
    on_resolve: Option<Callback>,
    on_reject: Option<Callback>,
    downstream: Deferred,
}

/// A not-yet-available result with attachable continuations.
///
/// Cloning shares the underlying state; the clone is the same value.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<DeferredInner>,
}

struct DeferredInner {
    id: ObjectId,
    class: DeferredClass,
    state: Mutex<DeferredState>,
}

impl Deferred {
    /// Returns this value's unique id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Returns the ledger token keyed on this value.
    #[must_use]
    pub fn token(&self) -> Token {
        self.inner.id.token()
    }

    /// Returns the class this value belongs to.
    #[must_use]
    pub fn class(&self) -> &DeferredClass {
        &self.inner.class
    }

    /// Settles this value as resolved. No-op when already settled.
    pub fn resolve(&self, value: Value) {
        self.settle(Settlement::Resolved(value));
    }

    /// Settles this value as rejected. No-op when already settled.
    pub fn reject(&self, value: Value) {
        self.settle(Settlement::Rejected(value));
    }

    /// Returns `true` once this value has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.state.lock(), DeferredState::Settled(_))
    }

    /// Returns the settlement, if this value has settled.
    #[must_use]
    pub fn settlement(&self) -> Option<Settlement> {
        match &*self.inner.state.lock() {
            DeferredState::Settled(settlement) => Some(settlement.clone()),
            DeferredState::Pending(_) => None,
        }
    }

    /// Attaches continuations through the class's current `then` operation.
    ///
    /// Returns the downstream value that settles with the continuation's
    /// output (or forwards this value's settlement when the matching
    /// continuation is absent).
    pub fn then(&self, on_resolve: Option<Callback>, on_reject: Option<Callback>) -> Deferred {
        let then = self.inner.class.then_fn();
        (*then)(self, on_resolve, on_reject)
    }

    /// Attaches an error-only continuation through the class's current
    /// `catch` operation.
    pub fn catch(&self, on_reject: Callback) -> Deferred {
        let catch = self.inner.class.catch_fn();
        (*catch)(self, on_reject)
    }

    /// The base attachment operation, bypassing the class slots.
    ///
    /// Instrumented `then` operations delegate here (through the captured
    /// original) so counting wrappers never recurse into themselves.
    pub fn attach(&self, on_resolve: Option<Callback>, on_reject: Option<Callback>) -> Deferred {
        let downstream = self.inner.class.pending();
        let mut continuation = Some(Continuation {
            on_resolve,
            on_reject,
            downstream: downstream.clone(),
        });

        let settled = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                DeferredState::Pending(queue) => {
                    if let Some(continuation) = continuation.take() {
                        queue.push(continuation);
                    }
                    None
                }
                DeferredState::Settled(settlement) => Some(settlement.clone()),
            }
        };

        // Already settled: run the continuation now, outside the lock.
        if let (Some(settlement), Some(continuation)) = (settled, continuation) {
            run_continuation(&settlement, continuation);
        }

        downstream
    }

    fn settle(&self, settlement: Settlement) {
        let continuations = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                DeferredState::Pending(queue) => {
                    let drained = std::mem::take(queue);
                    *state = DeferredState::Settled(settlement.clone());
                    drained
                }
                DeferredState::Settled(_) => return,
            }
        };

        for continuation in continuations {
            run_continuation(&settlement, continuation);
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.inner.id)
            .field("class", &self.inner.class.name())
            .field("settlement", &self.settlement())
            .finish()
    }
}

fn run_continuation(settlement: &Settlement, continuation: Continuation) {
    let Continuation {
        on_resolve,
        on_reject,
        downstream,
    } = continuation;

    match settlement {
        Settlement::Resolved(value) => match on_resolve {
            Some(callback) => run_and_forward(callback, value, &downstream),
            None => downstream.resolve(value.clone()),
        },
        Settlement::Rejected(value) => match on_reject {
            Some(callback) => run_and_forward(callback, value, &downstream),
            None => downstream.reject(value.clone()),
        },
    }
}

fn run_and_forward(callback: Callback, value: &Value, downstream: &Deferred) {
    let args = [value.clone()];
    match panic::catch_unwind(AssertUnwindSafe(|| (*callback)(&args))) {
        Ok(output) => downstream.resolve(output),
        Err(payload) => {
            downstream.reject(panic_reason(payload.as_ref()));
            panic::resume_unwind(payload);
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> Value {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        Value::Str((*message).to_string())
    } else if let Some(message) = payload.downcast_ref::<String>() {
        Value::Str(message.clone())
    } else {
        Value::Str("continuation panicked".to_string())
    }
}
