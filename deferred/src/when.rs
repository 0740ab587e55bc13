//! Join combinator.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use crate::deferred::{Deferred, Promise};

/// One argument to [`when`]: a plain value or a promise to wait on.
pub enum Operand<T, E> {
    Value(T),
    Pending(Promise<T, E>),
}

impl<T, E> From<Promise<T, E>> for Operand<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Self::Pending(promise)
    }
}

struct Join<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

/// Resolve once every pending operand resolves, with results in operand order.
///
/// Plain values pass straight through to their slot. The first rejection rejects
/// the join; the other operands keep running and their outcomes are ignored.
/// With no pending operands the join is already resolved.
pub fn when<T, E>(operands: impl IntoIterator<Item = Operand<T, E>>) -> Promise<Vec<T>, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let joined = Deferred::new();
    let mut slots = Vec::new();
    let mut pending = Vec::new();
    for (index, operand) in operands.into_iter().enumerate() {
        match operand {
            Operand::Value(value) => slots.push(Some(value)),
            Operand::Pending(promise) => {
                slots.push(None);
                pending.push((index, promise));
            }
        }
    }

    if pending.is_empty() {
        joined.resolve(slots.into_iter().flatten().collect());
        return joined.promise();
    }

    let state = Arc::new(Mutex::new(Join {
        slots,
        remaining: pending.len(),
    }));

    for (index, promise) in pending {
        let state = Arc::clone(&state);
        let on_done = joined.clone();
        let on_fail = joined.clone();
        promise.then(
            move |value| {
                let values = {
                    let mut join = state.lock().unwrap_or_else(PoisonError::into_inner);
                    join.slots[index] = Some(value.clone());
                    join.remaining -= 1;
                    if join.remaining > 0 {
                        return;
                    }
                    mem::take(&mut join.slots)
                };
                on_done.resolve(values.into_iter().flatten().collect());
            },
            move |error| {
                on_fail.reject(error.clone());
            },
        );
    }

    joined.promise()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn empty_join_is_already_resolved() {
        let joined = when(Vec::<Operand<i32, ()>>::new());
        assert_eq!(joined.outcome(), Some(Ok(vec![])));
    }

    #[test]
    fn single_value_resolves_immediately() {
        let joined = when([Operand::<_, ()>::Value("x")]);
        assert_eq!(joined.outcome(), Some(Ok(vec!["x"])));
    }

    #[test]
    fn single_promise_is_mirrored() {
        let source: Deferred<i32, &'static str> = Deferred::new();
        let joined = when([source.promise().into()]);
        assert!(joined.is_pending());
        source.reject("nope");
        assert_eq!(joined.outcome(), Some(Err("nope")));
    }

    #[test]
    fn results_are_positional_regardless_of_settle_order() {
        let first: Deferred<i32, ()> = Deferred::new();
        let second: Deferred<i32, ()> = Deferred::new();
        let joined = when([
            first.promise().into(),
            Operand::Value(10),
            second.promise().into(),
        ]);

        second.resolve(3);
        assert!(joined.is_pending());
        first.resolve(1);
        assert_eq!(joined.outcome(), Some(Ok(vec![1, 10, 3])));
    }

    #[test]
    fn first_rejection_wins_exactly_once() {
        let first: Deferred<i32, i32> = Deferred::new();
        let second: Deferred<i32, i32> = Deferred::new();
        let third: Deferred<i32, i32> = Deferred::new();
        let joined = when([
            first.promise().into(),
            second.promise().into(),
            third.promise().into(),
        ]);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        joined.fail(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        first.resolve(1);
        second.reject(2);
        third.reject(3);

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(joined.outcome(), Some(Err(2)));
        // Outstanding operands are not cancelled.
        assert!(third.is_rejected());
    }

    #[test]
    fn already_settled_operands_are_honoured() {
        let ready: Deferred<i32, ()> = Deferred::resolved(5);
        let joined = when([ready.promise().into(), Operand::Value(6)]);
        assert_eq!(joined.outcome(), Some(Ok(vec![5, 6])));
    }
}
