//! API calls from the host page.
//!
//! A call moves through `Queued` (its solution is still initializing),
//! `Dispatched` (sent over the transport) and `Settled`. Calls made before the
//! solution is ready park on its readiness promise and replay once it settles;
//! a rejected solution rejects every parked call with the same failure.

use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossframe_types::{
    ApiCatalog, ApiReply, ApiRequest, CallEnvelope, CorrelationId, Failure, ReadyState, ResponseFormat,
    TransportKind,
};
use serde_json::Value;

use crate::broker::{Solution, TransportBroker};
use crate::fetch::request_target;
use crate::flash::{FlashEvent, FlashQueue};
use crate::page::AccessTokenSource;
use crate::registry::{CallDeferred, CallPromise, CallRegistry};

const API_VERSION: &str = "2.0";

const SOLUTION_ERROR: &str = "solution error";

const NOT_LOGIN: &str = "not login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Queued,
    Dispatched,
    Settled,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Queued,
    Relayed(CorrelationId),
    Bridged,
}

/// Caller's handle to one API call.
///
/// Await it, or subscribe through [`CallHandle::promise`].
#[derive(Clone)]
pub struct CallHandle {
    deferred: CallDeferred,
    stage: Arc<Mutex<Stage>>,
    registry: Arc<CallRegistry>,
}

impl CallHandle {
    fn new(registry: Arc<CallRegistry>) -> Self {
        Self {
            deferred: CallDeferred::new(),
            stage: Arc::new(Mutex::new(Stage::Queued)),
            registry,
        }
    }

    fn stage(&self) -> MutexGuard<'_, Stage> {
        self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn promise(&self) -> CallPromise {
        self.deferred.promise()
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        if !self.deferred.is_pending() {
            return CallState::Settled;
        }
        match *self.stage() {
            Stage::Queued => CallState::Queued,
            Stage::Relayed(_) | Stage::Bridged => CallState::Dispatched,
        }
    }

    /// The relay correlation id, once dispatched through the relay.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match *self.stage() {
            Stage::Relayed(id) => Some(id),
            Stage::Queued | Stage::Bridged => None,
        }
    }

    /// Settle the call as `(-1, "aborted")` unless it already settled.
    ///
    /// A relayed call leaves the registry, so its late response is dropped. A
    /// bridged call keeps its queue slot, which absorbs the bridge's eventual
    /// completion event.
    pub fn abort(&self) -> bool {
        let stage = *self.stage();
        if let Stage::Relayed(id) = stage {
            return self.registry.abort(id);
        }
        self.deferred.reject(Failure::aborted())
    }

    fn reject(&self, failure: Failure) {
        self.deferred.reject(failure);
    }
}

impl IntoFuture for CallHandle {
    type Output = Result<ApiReply, Failure>;
    type IntoFuture = CallPromise;

    fn into_future(self) -> Self::IntoFuture {
        self.promise()
    }
}

/// Issues API calls over whichever solution the broker provides.
pub struct ApiClient {
    broker: Arc<TransportBroker>,
    registry: Arc<CallRegistry>,
    flash: FlashQueue,
    tokens: Arc<dyn AccessTokenSource>,
    catalog: Arc<ApiCatalog>,
}

impl ApiClient {
    pub fn new(
        broker: Arc<TransportBroker>,
        registry: Arc<CallRegistry>,
        tokens: Arc<dyn AccessTokenSource>,
        catalog: Arc<ApiCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            registry,
            flash: FlashQueue::new(),
            tokens,
            catalog,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<TransportBroker> {
        &self.broker
    }

    pub fn call(self: &Arc<Self>, request: ApiRequest) -> CallHandle {
        self.call_with(request, None)
    }

    /// Call through a specific solution instead of the automatic choice.
    pub fn call_with(
        self: &Arc<Self>,
        request: ApiRequest,
        forced: Option<TransportKind>,
    ) -> CallHandle {
        let handle = CallHandle::new(Arc::clone(&self.registry));
        self.submit(normalize(request), forced, handle.clone());
        handle
    }

    /// Deliver a bridge completion event.
    pub fn flash_completed(&self, event: &FlashEvent) -> bool {
        self.flash.on_complete(event)
    }

    fn submit(self: &Arc<Self>, request: ApiRequest, forced: Option<TransportKind>, handle: CallHandle) {
        let Some(solution) = self.broker.select_solution(forced) else {
            tracing::error!("{SOLUTION_ERROR}");
            handle.reject(Failure::network(SOLUTION_ERROR));
            return;
        };

        match solution.ready_state() {
            ReadyState::Failed => {
                tracing::error!("{SOLUTION_ERROR}");
                handle.reject(Failure::network(SOLUTION_ERROR));
            }
            ReadyState::Uninitialized => {
                tracing::warn!(
                    "solution is not ready, call \"{}\" is queued until it is",
                    request.api
                );
                let client = Arc::clone(self);
                let on_fail = handle.clone();
                solution.promise().then(
                    move |_| {
                        if handle.deferred.is_pending() {
                            tracing::info!("invoking queued call \"{}\"", request.api);
                            client.submit(request, forced, handle);
                        }
                    },
                    move |failure| {
                        tracing::error!("can't invoke queued call: {failure}");
                        on_fail.reject(failure.clone());
                    },
                );
            }
            ReadyState::Ready => self.dispatch(&solution, request, &handle),
        }
    }

    fn dispatch(&self, solution: &Solution, mut request: ApiRequest, handle: &CallHandle) {
        let Some(token) = self.tokens.access_token() else {
            handle.reject(Failure::network(NOT_LOGIN));
            return;
        };
        request
            .params
            .insert("access_token".to_string(), Value::String(token));

        tracing::info!(
            "[{}] requesting data \"{}\" from server...",
            self.registry.total() + 1,
            self.catalog.describe(&request.api)
        );

        match solution.kind() {
            TransportKind::PostMessageChannel => self.relay(solution, request, handle),
            TransportKind::FlashBridge => self.bridge(solution, request, handle),
            TransportKind::SilverlightBridge => {
                handle.reject(Failure::network(SOLUTION_ERROR));
            }
        }
    }

    fn relay(&self, solution: &Solution, request: ApiRequest, handle: &CallHandle) {
        let id = self
            .registry
            .collect(handle.deferred.clone(), request.clone());
        *handle.stage() = Stage::Relayed(id);

        let sent = CallEnvelope::new(id, &request)
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                self.broker
                    .post_to_relay(solution.id(), &payload)
                    .map_err(|e| e.to_string())
            });
        if let Err(reason) = sent {
            tracing::error!("{reason}");
            if self.registry.uncollect(id).is_some() {
                handle.reject(Failure::network(reason));
            }
        }
    }

    fn bridge(&self, solution: &Solution, request: ApiRequest, handle: &CallHandle) {
        let Some(bridge) = solution.flash_bridge() else {
            handle.reject(Failure::network(SOLUTION_ERROR));
            return;
        };
        let (url, data) = request_target(self.broker.endpoints().api.as_str(), &request);
        *handle.stage() = Stage::Bridged;
        self.flash.enqueue(handle.deferred.clone(), request.format);
        bridge.http_request(&url, &data, request.method);
    }
}

/// Restrict the format to json/xml and add the fixed api parameters.
fn normalize(mut request: ApiRequest) -> ApiRequest {
    request.format = ResponseFormat::for_api_call(request.format.as_str());
    request
        .params
        .insert("version".to_string(), Value::from(API_VERSION));
    request
        .params
        .insert("format".to_string(), Value::from(request.format.as_str()));
    request
}
