//! Completion matching for the bridge transport.
//!
//! The bridge reports completions on a single event stream without any request
//! identifier, so calls settle strictly in dispatch order: each event answers
//! the oldest outstanding request.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossframe_types::{ApiReply, Failure, ResponseBody, ResponseFormat};
use serde_json::Value;

use crate::registry::CallDeferred;

/// A completion event raised by the bridge module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEvent {
    /// Event type; anything containing "complete" (any case) is a success.
    pub kind: String,
    /// Raw response text.
    pub data: String,
}

impl FlashEvent {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    fn is_complete(&self) -> bool {
        self.kind.to_ascii_lowercase().contains("complete")
    }
}

struct Slot {
    deferred: CallDeferred,
    format: ResponseFormat,
}

#[derive(Default)]
pub struct FlashQueue {
    slots: Mutex<VecDeque<Slot>>,
}

impl FlashQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, deferred: CallDeferred, format: ResponseFormat) {
        self.lock().push_back(Slot { deferred, format });
    }

    /// Settle the oldest outstanding request with `event`.
    ///
    /// An aborted request keeps its slot; the event that eventually answers it
    /// is consumed without effect.
    pub fn on_complete(&self, event: &FlashEvent) -> bool {
        let Some(slot) = self.lock().pop_front() else {
            tracing::warn!("bridge completion \"{}\" with no outstanding request", event.kind);
            return false;
        };
        match settle(event, slot.format) {
            Ok(reply) => slot.deferred.resolve(reply),
            Err(failure) => slot.deferred.reject(failure),
        };
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn settle(event: &FlashEvent, format: ResponseFormat) -> Result<ApiReply, Failure> {
    if !event.is_complete() {
        return Err(Failure::from_remote(204, event.kind.clone()));
    }
    let body = ResponseBody::from_text(event.data.clone(), format)
        .map_err(|e| Failure::network(e.to_string()))?;
    Ok(ApiReply {
        body,
        headers: Value::String(String::new()),
    })
}
