use std::sync::{Arc, Mutex};

use crossframe_deferred::{Deferred, Operand, State, when};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Resolve(u8),
    Reject(u8),
    Subscribe,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<u8>().prop_map(Step::Resolve),
        any::<u8>().prop_map(Step::Reject),
        Just(Step::Subscribe),
    ]
}

proptest! {
    #[test]
    fn only_first_settlement_is_observed(steps in proptest::collection::vec(step(), 1..32)) {
        let deferred: Deferred<u8, u8> = Deferred::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subscribers = 0usize;
        let mut first: Option<Result<u8, u8>> = None;

        for step in steps {
            match step {
                Step::Resolve(v) => {
                    let applied = deferred.resolve(v);
                    prop_assert_eq!(applied, first.is_none());
                    if first.is_none() {
                        first = Some(Ok(v));
                    }
                }
                Step::Reject(e) => {
                    let applied = deferred.reject(e);
                    prop_assert_eq!(applied, first.is_none());
                    if first.is_none() {
                        first = Some(Err(e));
                    }
                }
                Step::Subscribe => {
                    subscribers += 1;
                    let sink = Arc::clone(&seen);
                    deferred.promise().always(move |outcome| {
                        sink.lock().unwrap().push(outcome.map(|v| *v).map_err(|e| *e));
                    });
                }
            }
        }

        let seen = seen.lock().unwrap();
        match first {
            Some(outcome) => {
                prop_assert_eq!(seen.len(), subscribers);
                prop_assert!(seen.iter().all(|o| *o == outcome));
                prop_assert_eq!(deferred.outcome(), Some(outcome));
            }
            None => {
                prop_assert!(seen.is_empty());
                prop_assert_eq!(deferred.state(), State::Pending);
            }
        }
    }
}

#[test]
fn join_of_two_where_second_rejects() {
    let a: Deferred<&'static str, (i64, String)> = Deferred::new();
    let b: Deferred<&'static str, (i64, String)> = Deferred::new();
    let joined = when([Operand::from(a.promise()), Operand::from(b.promise())]);

    let rejections = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&rejections);
    joined.fail(move |e| sink.lock().unwrap().push(e.clone()));

    b.reject((-1, "boom".to_string()));
    a.resolve("late");

    assert_eq!(*rejections.lock().unwrap(), vec![(-1, "boom".to_string())]);
    assert!(joined.is_rejected());
}
