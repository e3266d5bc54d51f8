//! The session's deferred outcome, exposed as a future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use pin_project::pin_project;

use crate::error::Error;

/// Shared delivery slot between a session and its [`Settled`] futures.
#[derive(Clone, Default)]
pub(crate) struct SettledState {
    inner: Arc<Mutex<SettledSlot>>,
}

#[derive(Default)]
struct SettledSlot {
    /// `Some(None)` on success, `Some(Some(error))` on failure.
    result: Option<Option<Error>>,
    wakers: Vec<Waker>,
}

impl SettledState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Delivers the outcome exactly once; later deliveries are ignored.
    pub(crate) fn deliver(&self, error: Option<Error>) {
        let wakers = {
            let mut slot = self.inner.lock();
            if slot.result.is_some() {
                return;
            }
            slot.result = Some(error);
            std::mem::take(&mut slot.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn wait(&self) -> Settled {
        Settled {
            state: self.clone(),
        }
    }
}

/// Future resolving once a session's outcome has been delivered.
///
/// Created by [`InstrumentationSession::settled`]; resolves to `Ok(())` on
/// success or `Err` with the failure (a timeout, unless the session was
/// failed explicitly). Restoration has always completed by the time this
/// future resolves.
///
/// [`InstrumentationSession::settled`]: crate::session::InstrumentationSession::settled
#[pin_project]
pub struct Settled {
    state: SettledState,
}

impl Future for Settled {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut slot = this.state.inner.lock();
        match &slot.result {
            Some(None) => Poll::Ready(Ok(())),
            Some(Some(error)) => Poll::Ready(Err(error.clone())),
            None => {
                if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for Settled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settled")
            .field("delivered", &self.state.inner.lock().result.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once(future: &mut Settled) -> Poll<Result<(), Error>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_pending_until_delivered() {
        let state = SettledState::new();
        let mut future = state.wait();

        assert!(poll_once(&mut future).is_pending());

        state.deliver(None);
        assert_eq!(poll_once(&mut future), Poll::Ready(Ok(())));
    }

    #[test]
    fn test_failure_is_delivered() {
        let state = SettledState::new();
        let mut future = state.wait();

        state.deliver(Some(Error::missing_member("boom")));
        assert_eq!(
            poll_once(&mut future),
            Poll::Ready(Err(Error::missing_member("boom")))
        );
    }

    #[test]
    fn test_delivery_is_exactly_once() {
        let state = SettledState::new();
        state.deliver(None);
        state.deliver(Some(Error::missing_member("late")));

        let mut future = state.wait();
        assert_eq!(poll_once(&mut future), Poll::Ready(Ok(())));
    }

    #[test]
    fn test_multiple_futures_observe_outcome() {
        let state = SettledState::new();
        let mut first = state.wait();
        let mut second = state.wait();

        assert!(poll_once(&mut first).is_pending());
        state.deliver(None);

        assert_eq!(poll_once(&mut first), Poll::Ready(Ok(())));
        assert_eq!(poll_once(&mut second), Poll::Ready(Ok(())));
    }
}
