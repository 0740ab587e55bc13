//! Single-settlement deferred values.
//!
//! A [`Deferred`] owns two callback lists, one per outcome. Settling one side
//! drains its list in registration order, caches the value for late subscribers,
//! and permanently cancels the other side. A [`Promise`] is the subscribe-only view
//! handed to consumers.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

type Callback<V> = Box<dyn FnOnce(&V) + Send + 'static>;

/// A callback, a nested list of callbacks, or nothing.
///
/// Lists are flattened depth-first, preserving order. `Skip` entries are ignored.
pub enum Callbacks<V> {
    One(Callback<V>),
    Many(Vec<Callbacks<V>>),
    Skip,
}

impl<V> Callbacks<V> {
    pub fn one(f: impl FnOnce(&V) + Send + 'static) -> Self {
        Self::One(Box::new(f))
    }

    pub fn many(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Many(items.into_iter().collect())
    }

    pub fn maybe(f: Option<impl FnOnce(&V) + Send + 'static>) -> Self {
        match f {
            Some(f) => Self::one(f),
            None => Self::Skip,
        }
    }

    fn flatten_into(self, out: &mut VecDeque<Callback<V>>) {
        match self {
            Self::One(cb) => out.push_back(cb),
            Self::Many(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            Self::Skip => {}
        }
    }
}

impl<V> fmt::Debug for Callbacks<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(_) => f.write_str("Callbacks::One"),
            Self::Many(items) => f.debug_tuple("Callbacks::Many").field(items).finish(),
            Self::Skip => f.write_str("Callbacks::Skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
}

struct Side<V> {
    callbacks: VecDeque<Callback<V>>,
    /// Cached settlement; set once draining has finished (or unwound).
    fired: Option<Arc<V>>,
    firing: bool,
    cancelled: bool,
}

impl<V> Side<V> {
    fn new() -> Self {
        Self {
            callbacks: VecDeque::new(),
            fired: None,
            firing: false,
            cancelled: false,
        }
    }

    fn is_settled(&self) -> bool {
        self.firing || self.fired.is_some()
    }
}

struct Inner<T, E> {
    done: Side<T>,
    fail: Side<E>,
    wakers: Vec<Waker>,
}

type Accessor<T, E, V> = fn(&mut Inner<T, E>) -> &mut Side<V>;

fn done_side<T, E>(inner: &mut Inner<T, E>) -> &mut Side<T> {
    &mut inner.done
}

fn fail_side<T, E>(inner: &mut Inner<T, E>) -> &mut Side<E> {
    &mut inner.fail
}

struct Shared<T, E> {
    inner: Mutex<Inner<T, E>>,
}

impl<T: 'static, E: 'static> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        // Callbacks never run under the lock, so a poisoned guard still holds
        // consistent bookkeeping.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<V>(&self, callbacks: Callbacks<V>, side: Accessor<T, E, V>) {
        let mut queued = VecDeque::new();
        callbacks.flatten_into(&mut queued);

        let replay = {
            let mut inner = self.lock();
            let side = side(&mut inner);
            if side.cancelled {
                return;
            }
            side.callbacks.extend(queued);
            if side.firing { None } else { side.fired.clone() }
        };

        if let Some(value) = replay {
            self.drain(&value, side);
        }
    }

    /// Run queued callbacks against an already cached value.
    fn drain<V>(&self, value: &Arc<V>, side: Accessor<T, E, V>) {
        loop {
            let next = side(&mut self.lock()).callbacks.pop_front();
            match next {
                Some(cb) => cb(value),
                None => break,
            }
        }
    }

    fn settle<V, W>(&self, value: V, this: Accessor<T, E, V>, other: Accessor<T, E, W>) -> bool {
        let value = Arc::new(value);
        let discarded = {
            let mut inner = self.lock();
            let side = this(&mut inner);
            if side.cancelled || side.is_settled() {
                return false;
            }
            side.firing = true;
            let other = other(&mut inner);
            other.cancelled = true;
            mem::take(&mut other.callbacks)
        };
        drop(discarded);

        let mut guard = FiringGuard {
            shared: self,
            side: this,
            value: Arc::clone(&value),
            armed: true,
        };

        loop {
            let next = {
                let mut inner = self.lock();
                let side = this(&mut inner);
                match side.callbacks.pop_front() {
                    Some(cb) => cb,
                    None => {
                        side.fired = Some(Arc::clone(&value));
                        side.firing = false;
                        guard.armed = false;
                        let wakers = mem::take(&mut inner.wakers);
                        drop(inner);
                        wakers.into_iter().for_each(Waker::wake);
                        break;
                    }
                }
            };
            next(&value);
        }
        true
    }

    fn state(&self) -> State {
        let inner = self.lock();
        if inner.done.is_settled() {
            State::Resolved
        } else if inner.fail.is_settled() {
            State::Rejected
        } else {
            State::Pending
        }
    }
}

/// Finalizes a side whose drain unwound through a panicking callback: the value
/// is cached, `firing` is cleared, and callbacks queued behind the panicking one
/// stay queued until the next registration replays them.
struct FiringGuard<'a, T: 'static, E: 'static, V> {
    shared: &'a Shared<T, E>,
    side: Accessor<T, E, V>,
    value: Arc<V>,
    armed: bool,
}

impl<T: 'static, E: 'static, V> Drop for FiringGuard<'_, T, E, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let wakers = {
            let mut inner = self.shared.lock();
            let side = (self.side)(&mut inner);
            side.fired = Some(Arc::clone(&self.value));
            side.firing = false;
            mem::take(&mut inner.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }
}

/// Producer handle of a single-settlement value.
pub struct Deferred<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static, E: 'static> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static, E: 'static> Deferred<T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    done: Side::new(),
                    fail: Side::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// A deferred already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    /// A deferred already rejected with `error`.
    #[must_use]
    pub fn rejected(error: E) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    /// Settle the success side. Returns `false` (and does nothing) when the
    /// deferred is already settled or this side was cancelled.
    #[doc(alias = "resolveWith")]
    pub fn resolve(&self, value: T) -> bool {
        self.shared.settle(value, done_side, fail_side)
    }

    /// Settle the failure side. Same guards as [`Deferred::resolve`].
    #[doc(alias = "rejectWith")]
    pub fn reject(&self, error: E) -> bool {
        self.shared.settle(error, fail_side, done_side)
    }

    #[doc(alias = "success")]
    pub fn done(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.shared.register(Callbacks::one(f), done_side);
        self
    }

    pub fn done_all(&self, callbacks: Callbacks<T>) -> &Self {
        self.shared.register(callbacks, done_side);
        self
    }

    #[doc(alias = "error")]
    pub fn fail(&self, f: impl FnOnce(&E) + Send + 'static) -> &Self {
        self.shared.register(Callbacks::one(f), fail_side);
        self
    }

    pub fn fail_all(&self, callbacks: Callbacks<E>) -> &Self {
        self.shared.register(callbacks, fail_side);
        self
    }

    pub fn then(
        &self,
        on_done: impl FnOnce(&T) + Send + 'static,
        on_fail: impl FnOnce(&E) + Send + 'static,
    ) -> &Self {
        self.done(on_done).fail(on_fail)
    }

    /// Register `f` on both sides; it runs once with whichever outcome happens.
    #[doc(alias = "complete")]
    pub fn always(&self, f: impl FnOnce(Result<&T, &E>) + Send + 'static) -> &Self {
        let slot = Arc::new(Mutex::new(Some(f)));
        let on_fail = Arc::clone(&slot);
        self.done(move |value| {
            let f = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(f) = f {
                f(Ok(value));
            }
        });
        self.fail(move |error| {
            let f = on_fail.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(f) = f {
                f(Err(error));
            }
        });
        self
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// True once the success side has started firing.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// The read-only view of this deferred.
    #[must_use]
    pub fn promise(&self) -> Promise<T, E> {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// The cached settlement, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        outcome(&self.shared)
    }
}

fn outcome<T: Clone + 'static, E: Clone + 'static>(
    shared: &Shared<T, E>,
) -> Option<Result<T, E>> {
    let mut inner = shared.lock();
    if let Some(value) = &inner.done.fired {
        return Some(Ok(T::clone(value)));
    }
    fail_side(&mut inner)
        .fired
        .as_ref()
        .map(|error| Err(E::clone(error)))
}

impl<T, E> fmt::Debug for Deferred<T, E>
where
    T: 'static,
    E: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Subscribe-only view of a [`Deferred`].
///
/// Awaiting a promise yields `Ok` or `Err` once its deferred settles. A promise
/// whose deferred is dropped unsettled never completes.
pub struct Promise<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static, E: 'static> Promise<T, E> {
    #[doc(alias = "success")]
    pub fn done(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.shared.register(Callbacks::one(f), done_side);
        self
    }

    pub fn done_all(&self, callbacks: Callbacks<T>) -> &Self {
        self.shared.register(callbacks, done_side);
        self
    }

    #[doc(alias = "error")]
    pub fn fail(&self, f: impl FnOnce(&E) + Send + 'static) -> &Self {
        self.shared.register(Callbacks::one(f), fail_side);
        self
    }

    pub fn fail_all(&self, callbacks: Callbacks<E>) -> &Self {
        self.shared.register(callbacks, fail_side);
        self
    }

    pub fn then(
        &self,
        on_done: impl FnOnce(&T) + Send + 'static,
        on_fail: impl FnOnce(&E) + Send + 'static,
    ) -> &Self {
        self.done(on_done).fail(on_fail)
    }

    #[doc(alias = "complete")]
    pub fn always(&self, f: impl FnOnce(Result<&T, &E>) + Send + 'static) -> &Self {
        Deferred {
            shared: Arc::clone(&self.shared),
        }
        .always(f);
        self
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// A promise is its own read-only view.
    #[must_use]
    pub fn promise(&self) -> Self {
        self.clone()
    }

    /// Whether both handles observe the same deferred.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        outcome(&self.shared)
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.lock();
        if let Some(value) = &inner.done.fired {
            return Poll::Ready(Ok(T::clone(value)));
        }
        if let Some(error) = &inner.fail.fired {
            return Poll::Ready(Err(E::clone(error)));
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T, E> fmt::Debug for Promise<T, E>
where
    T: 'static,
    E: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let push = move |entry: &str| sink.lock().unwrap().push(entry.to_string());
        (log, push)
    }

    #[test]
    fn test_second_settlement_is_noop() {
        let deferred: Deferred<i32, String> = Deferred::new();
        let (log, push) = recorder();
        let p = push.clone();
        deferred.done(move |v| p(&format!("done {v}")));
        let p = push.clone();
        deferred.fail(move |e| p(&format!("fail {e}")));

        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert!(!deferred.reject("late".to_string()));

        assert_eq!(*log.lock().unwrap(), vec!["done 1"]);
        assert_eq!(deferred.outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_late_registration_replays_cached_value() {
        let deferred: Deferred<&'static str, ()> = Deferred::resolved("ready");
        let (log, push) = recorder();
        deferred.done(move |v| push(v));
        assert_eq!(*log.lock().unwrap(), vec!["ready"]);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let deferred: Deferred<(), ()> = Deferred::new();
        let (log, push) = recorder();
        for i in 0..4 {
            let p = push.clone();
            deferred.done(move |()| p(&i.to_string()));
        }
        deferred.resolve(());
        assert_eq!(*log.lock().unwrap(), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_nested_lists_flatten_and_skip_entries_are_ignored() {
        let deferred: Deferred<u8, ()> = Deferred::new();
        let (log, push) = recorder();
        let (a, b, c) = (push.clone(), push.clone(), push);
        deferred.done_all(Callbacks::many([
            Callbacks::one(move |v: &u8| a(&format!("a{v}"))),
            Callbacks::Skip,
            Callbacks::many([
                Callbacks::one(move |v: &u8| b(&format!("b{v}"))),
                Callbacks::maybe(None::<fn(&u8)>),
            ]),
            Callbacks::maybe(Some(move |v: &u8| c(&format!("c{v}")))),
        ]));
        deferred.resolve(7);
        assert_eq!(*log.lock().unwrap(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn test_resolve_cancels_failure_side() {
        let deferred: Deferred<(), &'static str> = Deferred::new();
        let (log, push) = recorder();
        let p = push.clone();
        deferred.fail(move |e| p(e));
        deferred.resolve(());
        deferred.fail(move |e| push(e));
        assert!(!deferred.reject("nope"));
        assert!(log.lock().unwrap().is_empty());
        assert!(deferred.is_resolved());
        assert!(!deferred.is_rejected());
    }

    #[test]
    fn test_reject_cancels_success_side() {
        let deferred: Deferred<i32, i32> = Deferred::new();
        let (log, push) = recorder();
        let p = push.clone();
        deferred.then(move |_| p("done"), move |e| push(&format!("fail {e}")));
        deferred.reject(-1);
        assert!(!deferred.resolve(5));
        assert_eq!(*log.lock().unwrap(), vec!["fail -1"]);
        assert_eq!(deferred.state(), State::Rejected);
    }

    #[test]
    fn test_callback_registered_while_firing_runs_in_same_drain() {
        let deferred: Deferred<i32, ()> = Deferred::new();
        let (log, push) = recorder();
        let inner = deferred.clone();
        let p = push.clone();
        deferred.done(move |v| {
            p(&format!("outer {v}"));
            let p = p.clone();
            inner.done(move |v| p(&format!("inner {v}")));
        });
        deferred.done(move |v| push(&format!("second {v}")));
        deferred.resolve(3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer 3", "second 3", "inner 3"]
        );
    }

    #[test]
    fn test_panicking_callback_still_finalizes() {
        let deferred: Deferred<i32, ()> = Deferred::new();
        let (log, push) = recorder();
        deferred.done(|_| panic!("callback bug"));
        let p = push.clone();
        deferred.done(move |v| p(&format!("after {v}")));

        let result = catch_unwind(AssertUnwindSafe(|| deferred.resolve(9)));
        assert!(result.is_err());
        assert!(deferred.is_resolved());
        assert!(!deferred.resolve(10));
        assert!(log.lock().unwrap().is_empty());

        // The next registration flushes the callback stranded behind the panic.
        deferred.done(move |v| push(&format!("late {v}")));
        assert_eq!(*log.lock().unwrap(), vec!["after 9", "late 9"]);
    }

    #[test]
    fn test_always_runs_once_on_either_side() {
        let resolved: Deferred<i32, i32> = Deferred::new();
        let rejected: Deferred<i32, i32> = Deferred::new();
        let (log, push) = recorder();
        let p = push.clone();
        resolved.always(move |r| p(&format!("{r:?}")));
        rejected.promise().always(move |r| push(&format!("{r:?}")));
        resolved.resolve(1);
        rejected.reject(2);
        assert_eq!(*log.lock().unwrap(), vec!["Ok(1)", "Err(2)"]);
    }

    #[test]
    fn test_promise_is_read_only_view_of_same_state() {
        let deferred: Deferred<i32, ()> = Deferred::new();
        let promise = deferred.promise();
        assert!(promise.is_pending());
        assert!(promise.same_as(&deferred.promise()));
        assert!(promise.same_as(&promise.promise()));
        deferred.resolve(4);
        assert_eq!(promise.outcome(), Some(Ok(4)));
    }

    #[tokio::test]
    async fn test_awaiting_promise_yields_settlement() {
        let deferred: Deferred<i32, String> = Deferred::new();
        let promise = deferred.promise();
        let producer = deferred.clone();
        let task = tokio::spawn(async move { promise.await });
        tokio::task::yield_now().await;
        producer.resolve(11);
        assert_eq!(task.await.unwrap(), Ok(11));

        let rejected: Deferred<i32, String> = Deferred::rejected("boom".to_string());
        assert_eq!(rejected.promise().await, Err("boom".to_string()));
    }
}
