//! Correlation of relay responses to the calls that caused them.
//!
//! Every call sent through the relay is stored under a fresh [`CorrelationId`].
//! The relay echoes that id, which is the only thing tying a response back to
//! its caller: responses may arrive in any order.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossframe_deferred::{Deferred, Promise};
use crossframe_types::{ApiReply, ApiRequest, CorrelationId, Failure, ResponseEnvelope};
use tokio::time::Instant;

/// Producer side of an API call.
pub type CallDeferred = Deferred<ApiReply, Failure>;

/// Consumer side of an API call.
pub type CallPromise = Promise<ApiReply, Failure>;

const EVICTED: &str = "call evicted";

#[derive(Debug)]
pub struct PendingCall {
    deferred: CallDeferred,
    request: ApiRequest,
    dispatched_at: Instant,
}

impl PendingCall {
    #[must_use]
    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    #[must_use]
    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    #[must_use]
    pub fn promise(&self) -> CallPromise {
        self.deferred.promise()
    }
}

#[derive(Debug, Default)]
struct Table {
    last_id: u64,
    pending: HashMap<CorrelationId, PendingCall>,
}

/// Calls dispatched through the relay and not yet answered.
#[derive(Debug, Default)]
pub struct CallRegistry {
    table: Mutex<Table>,
}

impl CallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a dispatched call under the next id.
    ///
    /// Allocation and insertion happen under one lock, so two calls can never
    /// share an id.
    pub fn collect(&self, deferred: CallDeferred, request: ApiRequest) -> CorrelationId {
        let mut table = self.lock();
        table.last_id += 1;
        let id = CorrelationId::new(table.last_id);
        table.pending.insert(
            id,
            PendingCall {
                deferred,
                request,
                dispatched_at: Instant::now(),
            },
        );
        id
    }

    /// Remove a call without settling it.
    pub fn uncollect(&self, id: CorrelationId) -> Option<PendingCall> {
        self.lock().pending.remove(&id)
    }

    /// Settle the call a response refers to.
    ///
    /// A response for an id that is not pending (never issued, already answered,
    /// aborted, evicted) is logged and dropped; no caller observes it.
    pub fn complete(&self, envelope: ResponseEnvelope) -> bool {
        let id = envelope.id;
        let Some(call) = self.uncollect(id) else {
            tracing::warn!("related call {id} not found, response dropped");
            return false;
        };
        match envelope.into_outcome() {
            Ok(reply) => {
                call.deferred.resolve(reply);
            }
            Err(failure) => {
                tracing::info!("[{id}] call \"{}\" failed {failure}", call.request.api);
                call.deferred.reject(failure);
            }
        }
        true
    }

    /// Reject a pending call as aborted.
    pub fn abort(&self, id: CorrelationId) -> bool {
        self.reject(id, Failure::aborted())
    }

    /// Reject and forget a call whose response is never coming.
    pub fn evict(&self, id: CorrelationId) -> bool {
        self.reject(id, Failure::network(EVICTED))
    }

    /// Evict every call dispatched at least `age` ago. Returns how many were evicted.
    pub fn evict_older_than(&self, age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<(CorrelationId, PendingCall)> = self
            .lock()
            .pending
            .extract_if(|_, call| now.duration_since(call.dispatched_at) >= age)
            .collect();
        for (id, call) in &stale {
            tracing::warn!("[{id}] evicting call \"{}\"", call.request.api);
            call.deferred.reject(Failure::network(EVICTED));
        }
        stale.len()
    }

    fn reject(&self, id: CorrelationId, failure: Failure) -> bool {
        match self.uncollect(id) {
            Some(call) => call.deferred.reject(failure),
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids issued so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.lock().last_id
    }
}
