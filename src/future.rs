// Single-assignment completion primitive for outstanding LDAP operations.
//
// Exactly one of complete / fail / cancel wins, decided by a single atomic
// compare-and-swap on the terminal state. The cancel side effect (sending an
// abandon request) fires at most once, and only if cancel won. Intermediate
// responses are delivered to a revocable observer; delivery re-checks the
// terminal flag under the observer lock, so a late intermediate response
// after completion is dropped without invoking the observer.

use crate::ldap_protocol::IntermediateResponse;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const STATE_PENDING: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Terminal failure of an operation. Cloneable so several waiters can each
/// observe the same outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The operation was cancelled locally before a result arrived.
    Cancelled,
    /// No result within the caller-supplied deadline.
    Timeout,
    /// The connection terminated while the operation was in flight.
    ConnectionClosed(String),
    /// The peer sent something the engine could not interpret.
    Protocol(String),
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Cancelled => write!(f, "operation cancelled"),
            OperationError::Timeout => write!(f, "operation timed out"),
            OperationError::ConnectionClosed(msg) => {
                write!(f, "connection closed: {}", msg)
            }
            OperationError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for OperationError {}

type Observer = Box<dyn FnMut(&IntermediateResponse) -> bool + Send>;
type CancelAction = Box<dyn FnOnce() + Send>;

struct Inner<R> {
    state: AtomicU8,
    outcome: Mutex<Option<Result<R, OperationError>>>,
    done: Condvar,
    /// Held across intermediate delivery and cleared on terminal transition,
    /// both under this lock.
    observer: Mutex<Option<Observer>>,
    cancel_action: Mutex<Option<CancelAction>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

/// Caller-side handle: wait for the outcome, observe intermediate responses,
/// or cancel.
pub struct LdapFuture<R> {
    inner: Arc<Inner<R>>,
}

/// Transport-side handle: deliver the result, an error, or intermediate
/// responses as they arrive off the wire.
pub struct CompletionHandle<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for CompletionHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Create a linked future / completion pair.
pub fn future_pair<R>() -> (LdapFuture<R>, CompletionHandle<R>) {
    let now = Instant::now();
    let inner = Arc::new(Inner {
        state: AtomicU8::new(STATE_PENDING),
        outcome: Mutex::new(None),
        done: Condvar::new(),
        observer: Mutex::new(None),
        cancel_action: Mutex::new(None),
        created_at: now,
        last_activity: Mutex::new(now),
    });
    (
        LdapFuture {
            inner: Arc::clone(&inner),
        },
        CompletionHandle { inner },
    )
}

impl<R> Inner<R> {
    /// Try to claim the terminal transition. Only the winner delivers.
    fn claim(&self, terminal: u8) -> bool {
        self.state
            .compare_exchange(STATE_PENDING, terminal, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deliver(&self, outcome: Result<R, OperationError>) {
        // Drop the observer first so no intermediate delivery can run after
        // the outcome is observable.
        {
            let mut observer = self.observer.lock().unwrap();
            observer.take();
        }
        {
            let mut slot = self.outcome.lock().unwrap();
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }
}

impl<R: Clone> LdapFuture<R> {
    /// Block until the operation reaches a terminal state.
    pub fn wait(&self) -> Result<R, OperationError> {
        let mut slot = self.inner.outcome.lock().unwrap();
        while slot.is_none() {
            slot = self.inner.done.wait(slot).unwrap();
        }
        slot.as_ref().unwrap().clone()
    }

    /// Block up to `timeout`; `None` when still pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R, OperationError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.outcome.lock().unwrap();
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, wait_result) = self
                .inner
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
            if wait_result.timed_out() && slot.is_none() {
                return None;
            }
        }
        Some(slot.as_ref().unwrap().clone())
    }

    /// The outcome if terminal, without blocking.
    pub fn try_result(&self) -> Option<Result<R, OperationError>> {
        self.inner.outcome.lock().unwrap().clone()
    }
}

impl<R> LdapFuture<R> {
    pub fn is_done(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != STATE_PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    /// Cancel the operation. Returns true if cancellation won the race, in
    /// which case the registered cancel action (abandon) has been run.
    pub fn cancel(&self) -> bool {
        if !self.inner.claim(STATE_CANCELLED) {
            return false;
        }
        let action = self.inner.cancel_action.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
        self.inner.deliver(Err(OperationError::Cancelled));
        true
    }

    /// Register the side effect to run when (and only if) cancel wins.
    /// Typically sends an abandon request for this operation's message id.
    pub fn on_cancel(&self, action: impl FnOnce() + Send + 'static) {
        *self.inner.cancel_action.lock().unwrap() = Some(Box::new(action));
    }

    /// Register an observer for intermediate responses. Return `false` from
    /// the observer to stop receiving further intermediates.
    pub fn on_intermediate(
        &self,
        observer: impl FnMut(&IntermediateResponse) -> bool + Send + 'static,
    ) {
        *self.inner.observer.lock().unwrap() = Some(Box::new(observer));
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Time of the last response activity (intermediate or terminal).
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().unwrap()
    }
}

impl<R> CompletionHandle<R> {
    /// Deliver the final result. Returns false when some terminal outcome
    /// already won.
    pub fn complete(&self, result: R) -> bool {
        if !self.inner.claim(STATE_DONE) {
            return false;
        }
        *self.inner.last_activity.lock().unwrap() = Instant::now();
        self.inner.deliver(Ok(result));
        true
    }

    /// Deliver a terminal error. Returns false when already terminal.
    pub fn fail(&self, error: OperationError) -> bool {
        if !self.inner.claim(STATE_DONE) {
            return false;
        }
        *self.inner.last_activity.lock().unwrap() = Instant::now();
        self.inner.deliver(Err(error));
        true
    }

    /// Deliver an intermediate response. A no-op once the operation is
    /// terminal; the check happens under the observer lock so delivery can
    /// never race a concurrent completion.
    pub fn intermediate(&self, response: &IntermediateResponse) {
        let mut observer = self.inner.observer.lock().unwrap();
        if self.inner.state.load(Ordering::Acquire) != STATE_PENDING {
            return;
        }
        *self.inner.last_activity.lock().unwrap() = Instant::now();
        if let Some(active) = observer.as_mut() {
            if !active(response) {
                observer.take();
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != STATE_PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn intermediate(name: &str) -> IntermediateResponse {
        IntermediateResponse {
            response_name: Some(name.to_string()),
            response_value: None,
        }
    }

    #[test]
    fn test_complete_wins_once() {
        let (future, handle) = future_pair::<i32>();
        assert!(handle.complete(42));
        assert!(!handle.complete(43));
        assert!(!handle.fail(OperationError::Timeout));
        assert_eq!(future.wait(), Ok(42));
    }

    #[test]
    fn test_cancel_after_complete_is_rejected() {
        let (future, handle) = future_pair::<i32>();
        let abandons = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&abandons);
        future.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.complete(1));
        assert!(!future.cancel());
        // The abandon side effect must not fire when cancel lost.
        assert_eq!(abandons.load(Ordering::SeqCst), 0);
        assert_eq!(future.wait(), Ok(1));
    }

    #[test]
    fn test_cancel_fires_abandon_exactly_once() {
        let (future, handle) = future_pair::<i32>();
        let abandons = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&abandons);
        future.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(future.is_cancelled());
        assert_eq!(abandons.load(Ordering::SeqCst), 1);
        assert_eq!(future.wait(), Err(OperationError::Cancelled));
        // A result arriving after cancellation is dropped.
        assert!(!handle.complete(5));
        assert_eq!(future.wait(), Err(OperationError::Cancelled));
    }

    #[test]
    fn test_intermediate_after_terminal_is_dropped() {
        let (future, handle) = future_pair::<i32>();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        future.on_intermediate(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        handle.intermediate(&intermediate("a"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(handle.complete(0));
        handle.intermediate(&intermediate("late"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_revokes_itself() {
        let (future, handle) = future_pair::<i32>();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        future.on_intermediate(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false // stop after the first one
        });

        handle.intermediate(&intermediate("a"));
        handle.intermediate(&intermediate("b"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_pending_and_resolved() {
        let (future, handle) = future_pair::<i32>();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());

        let waiter = thread::spawn({
            let future_inner = Arc::clone(&future.inner);
            move || {
                let waiter_future = LdapFuture {
                    inner: future_inner,
                };
                waiter_future.wait()
            }
        });
        thread::sleep(Duration::from_millis(20));
        assert!(handle.complete(7));
        assert_eq!(waiter.join().unwrap(), Ok(7));
        assert_eq!(
            future.wait_timeout(Duration::from_millis(1)),
            Some(Ok(7))
        );
    }

    #[test]
    fn test_concurrent_complete_and_cancel_single_winner() {
        for _ in 0..200 {
            let (future, handle) = future_pair::<i32>();
            let abandons = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&abandons);
            future.on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let canceller = thread::spawn({
                let inner = Arc::clone(&future.inner);
                move || LdapFuture { inner }.cancel()
            });
            let completer = thread::spawn(move || handle.complete(9));

            let cancelled = canceller.join().unwrap();
            let completed = completer.join().unwrap();
            assert!(cancelled != completed, "exactly one side must win");
            match future.wait() {
                Ok(9) => {
                    assert!(completed);
                    assert_eq!(abandons.load(Ordering::SeqCst), 0);
                }
                Err(OperationError::Cancelled) => {
                    assert!(cancelled);
                    assert_eq!(abandons.load(Ordering::SeqCst), 1);
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn test_timestamps_advance_on_activity() {
        let (future, handle) = future_pair::<i32>();
        let created = future.created_at();
        thread::sleep(Duration::from_millis(5));
        future.on_intermediate(|_| true);
        handle.intermediate(&intermediate("tick"));
        assert!(future.last_activity() > created);
    }
}
