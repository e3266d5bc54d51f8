//! Outstanding-operation accounting with a terminal outcome and a deadline.
//!
//! The [`CompletionLedger`] owns a set of in-flight operation [`Token`]s and
//! a single [`Outcome`]. Interceptors installed by a session increment the
//! ledger when an operation starts and decrement it when the matching
//! completion is observed; when the last outstanding token settles the
//! ledger succeeds, and if the deadline elapses first it fails with
//! [`Error::Timeout`](crate::error::Error::Timeout).
//!
//! The ledger is deliberately ignorant of *why* tokens exist. All shape
//! knowledge lives in [`session`](crate::session), which keeps the counting
//! protocol small and independently testable.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use std::time::Duration;
//! use settlekit::ledger::{CompletionLedger, Token};
//!
//! let (tx, rx) = mpsc::channel();
//! let ledger = CompletionLedger::new(move |error| tx.send(error).unwrap(),
//!     Duration::from_secs(1));
//!
//! ledger.increment(Token::Handle(7));
//! ledger.decrement(Token::Handle(7));
//!
//! // The set emptied, so the completion handler fired with no error.
//! assert_eq!(rx.recv().unwrap(), None);
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Error;

pub(crate) mod deadline;

use deadline::Deadline;

/// Identity of one in-flight asynchronous operation.
///
/// A token is whatever the instrumented call is keyed on: the handle a
/// scheduler returned, or the unique id of the object (instance or deferred
/// value) that owns the completion. The two spaces never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// A scheduler-issued handle, matched between schedule and fire sites.
    Handle(u64),
    /// A unique object identity (see [`ObjectId`](crate::target::ObjectId)).
    Object(u64),
}

/// The ledger's terminal state.
///
/// Transitions at most once, from `Pending` to either terminal variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Operations may still be outstanding.
    Pending,
    /// Every tracked operation settled before the deadline.
    Succeeded,
    /// The ledger failed, either by deadline or an explicit [`fail`].
    ///
    /// [`fail`]: CompletionLedger::fail
    Failed(Error),
}

impl Outcome {
    /// Returns `true` while no terminal transition has happened.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` once every tracked operation settled.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns `true` once the ledger failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

type SettleFn = Box<dyn FnOnce(Option<Error>) + Send>;

/// Counts in-flight operations and fires a completion handler exactly once.
///
/// Cloning shares the underlying state; all methods are safe to call from
/// any thread and from re-entrant interceptor bodies.
#[derive(Clone)]
pub struct CompletionLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    state: Mutex<LedgerState>,
}

struct LedgerState {
    outstanding: HashSet<Token>,
    outcome: Outcome,
    on_settled: Option<SettleFn>,
    deadline: Option<Deadline>,
}

impl CompletionLedger {
    /// Creates a ledger and immediately arms its deadline.
    ///
    /// `on_settled` is invoked exactly once: with `None` when the
    /// outstanding set empties, or with `Some(Error::Timeout)` when
    /// `timeout` elapses first.
    pub fn new<F>(on_settled: F, timeout: Duration) -> Self
    where
        F: FnOnce(Option<Error>) + Send + 'static,
    {
        let inner = Arc::new(LedgerInner {
            state: Mutex::new(LedgerState {
                outstanding: HashSet::new(),
                outcome: Outcome::Pending,
                on_settled: Some(Box::new(on_settled)),
                deadline: None,
            }),
        });

        let watchdog = {
            let weak = Arc::downgrade(&inner);
            Deadline::arm(timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    fail_inner(&inner, Error::Timeout(timeout));
                }
            })
        };
        inner.state.lock().deadline = Some(watchdog);

        Self { inner }
    }

    /// Registers `token` as outstanding.
    ///
    /// Legal at any point, including after a terminal transition (the token
    /// is recorded but can no longer affect the outcome).
    pub fn increment(&self, token: Token) {
        let mut state = self.inner.state.lock();
        state.outstanding.insert(token);
        tracing::trace!(?token, outstanding = state.outstanding.len(), "operation registered");
    }

    /// Settles `token`, removing it from the outstanding set.
    ///
    /// Idempotent: decrementing a token that is not outstanding (already
    /// settled, or never registered) is a silent no-op. Completion callbacks
    /// that also fire on cancellation rely on this.
    ///
    /// When the removal empties the set while the outcome is still pending,
    /// the ledger transitions to [`Outcome::Succeeded`], cancels the
    /// deadline, and invokes the completion handler with no error.
    pub fn decrement(&self, token: Token) {
        let finished = {
            let mut state = self.inner.state.lock();
            if !state.outstanding.remove(&token) {
                None
            } else {
                tracing::trace!(?token, outstanding = state.outstanding.len(), "operation settled");
                if state.outstanding.is_empty() && state.outcome.is_pending() {
                    state.outcome = Outcome::Succeeded;
                    Some((state.on_settled.take(), state.deadline.take()))
                } else {
                    None
                }
            }
        };

        // The lock is released before the handler runs: restoration and
        // user callbacks may re-enter the ledger.
        if let Some((handler, deadline)) = finished {
            tracing::debug!("every tracked operation has settled");
            if let Some(deadline) = deadline {
                deadline.cancel();
            }
            if let Some(handler) = handler {
                handler(None);
            }
        }
    }

    /// Forces an early failure.
    ///
    /// No-op once the outcome is terminal. The deadline calls this with
    /// [`Error::Timeout`] when it elapses.
    pub fn fail(&self, error: Error) {
        fail_inner(&self.inner, error);
    }

    /// Returns the number of currently outstanding tokens.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.inner.state.lock().outstanding.len()
    }

    /// Returns a snapshot of the ledger's outcome.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.inner.state.lock().outcome.clone()
    }
}

impl std::fmt::Debug for CompletionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionLedger")
            .field("outstanding", &state.outstanding.len())
            .field("outcome", &state.outcome)
            .finish()
    }
}

fn fail_inner(inner: &LedgerInner, error: Error) {
    let failed = {
        let mut state = inner.state.lock();
        if state.outcome.is_pending() {
            state.outcome = Outcome::Failed(error.clone());
            Some((state.on_settled.take(), state.deadline.take()))
        } else {
            None
        }
    };

    if let Some((handler, deadline)) = failed {
        tracing::debug!(%error, "ledger failed");
        if let Some(deadline) = deadline {
            deadline.cancel();
        }
        if let Some(handler) = handler {
            handler(Some(error));
        }
    }
}
