//! Transport selection and initialization.
//!
//! The broker owns at most one record per [`TransportKind`]. A record is created
//! by the first `init_solution` call for a supported kind and is shared by every
//! later call, so repeated or concurrent initialization never restarts an
//! attempt. A record's ready state moves from `Uninitialized` to exactly one
//! terminal value. Failed records stay cached until `reset_solution` clears them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossframe_deferred::{Deferred, Promise};
use crossframe_types::{
    Capabilities, ChannelId, Failure, FailureKind, HANDSHAKE_SIGNAL, ReadyState, TransportKind,
};
use tokio::time::{sleep, timeout};
use url::Url;

use crate::page::{FlashTransport, PageEmbedder, PostError};

pub const RELAY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub const FLASH_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

const RELAY_NOT_WORKING: &str = "server proxy frame not working";

const FLASH_LOAD_FAILED: &str = "encounter error while loading proxy swf";

/// Resolves once the solution is usable; rejects with the reason it never will be.
pub type ReadyPromise = Promise<(), Failure>;

/// Trusted endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// The relay document, served from the API origin.
    pub relay: Url,
    /// The bridge module.
    pub flash_bridge: Url,
    /// Base the api paths are appended to.
    pub api: Url,
}

impl Endpoints {
    /// The only origin whose messages the host page accepts.
    #[must_use]
    pub fn relay_origin(&self) -> String {
        self.relay.origin().ascii_serialization()
    }

    #[must_use]
    pub fn is_trusted_origin(&self, origin: &str) -> bool {
        let expected = self.relay_origin();
        expected != "null" && expected == origin
    }

    /// Whether `location` is the relay document itself.
    #[must_use]
    pub fn is_relay_location(&self, location: &str) -> bool {
        self.relay.as_str() == location
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerTimeouts {
    /// Grace period after the relay frame's load signal.
    pub relay_handshake: Duration,
    /// Bound on the bridge module reporting ready.
    pub flash_load: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            relay_handshake: RELAY_HANDSHAKE_TIMEOUT,
            flash_load: FLASH_LOAD_TIMEOUT,
        }
    }
}

struct SolutionState {
    kind: TransportKind,
    id: ChannelId,
    ready_state: AtomicU8,
    deferred: Deferred<(), Failure>,
    handshake_armed: AtomicBool,
    bridge: Mutex<Option<Arc<dyn FlashTransport>>>,
}

/// A cached initialization attempt.
#[derive(Clone)]
pub struct Solution {
    state: Arc<SolutionState>,
}

impl Solution {
    fn new(kind: TransportKind, id: ChannelId) -> Self {
        Self {
            state: Arc::new(SolutionState {
                kind,
                id,
                ready_state: AtomicU8::new(ReadyState::Uninitialized.as_u8()),
                deferred: Deferred::new(),
                handshake_armed: AtomicBool::new(kind == TransportKind::PostMessageChannel),
                bridge: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.state.kind
    }

    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.state.id
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.ready_state.load(Ordering::SeqCst))
            .unwrap_or(ReadyState::Uninitialized)
    }

    #[must_use]
    pub fn promise(&self) -> ReadyPromise {
        self.state.deferred.promise()
    }

    /// The bridge RPC handle, once a bridge solution is ready.
    #[must_use]
    pub fn flash_bridge(&self) -> Option<Arc<dyn FlashTransport>> {
        self.bridge_slot().clone()
    }

    fn bridge_slot(&self) -> MutexGuard<'_, Option<Arc<dyn FlashTransport>>> {
        self.state
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: ReadyState) -> bool {
        self.state
            .ready_state
            .compare_exchange(
                ReadyState::Uninitialized.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// The ready state is published before the promise resolves, so callers
    /// replayed from the promise see `Ready`.
    fn mark_ready(&self) -> bool {
        if !self.transition(ReadyState::Ready) {
            return false;
        }
        self.state.deferred.resolve(());
        true
    }

    fn mark_failed(&self, failure: Failure) -> bool {
        if !self.transition(ReadyState::Failed) {
            return false;
        }
        self.state.deferred.reject(failure);
        true
    }

    fn take_handshake(&self) -> bool {
        self.state.handshake_armed.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solution")
            .field("kind", &self.kind())
            .field("id", self.id())
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

/// Picks and initializes the cross-origin channel for one page.
pub struct TransportBroker {
    capabilities: Capabilities,
    endpoints: Endpoints,
    timeouts: BrokerTimeouts,
    embedder: Arc<dyn PageEmbedder>,
    document_ready: Promise<(), Infallible>,
    solutions: Mutex<HashMap<TransportKind, Solution>>,
    next_channel: AtomicU64,
}

impl TransportBroker {
    /// Mounting waits for `document_ready`.
    pub fn new(
        capabilities: Capabilities,
        endpoints: Endpoints,
        timeouts: BrokerTimeouts,
        embedder: Arc<dyn PageEmbedder>,
        document_ready: Promise<(), Infallible>,
    ) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            endpoints,
            timeouts,
            embedder,
            document_ready,
            solutions: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TransportKind, Solution>> {
        self.solutions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or join) the initialization of `kind`.
    ///
    /// A missing capability rejects at once without creating a record or touching
    /// the page, so another kind can still be tried. Spawns the attempt on the
    /// current Tokio runtime.
    pub fn init_solution(self: &Arc<Self>, kind: TransportKind) -> ReadyPromise {
        if !self.capabilities.supports(kind) {
            tracing::error!("can't init solution \"{kind}\", browser doesn't support it");
            return Deferred::rejected(Failure::unsupported()).promise();
        }

        let (solution, fresh) = {
            let mut table = self.table();
            if let Some(existing) = table.get(&kind) {
                (existing.clone(), false)
            } else {
                let n = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
                let solution = Solution::new(kind, ChannelId::solution(n));
                table.insert(kind, solution.clone());
                (solution, true)
            }
        };

        if fresh {
            match kind {
                TransportKind::PostMessageChannel => self.start_relay(solution.clone()),
                TransportKind::FlashBridge => self.start_flash(solution.clone()),
                TransportKind::SilverlightBridge => {
                    tracing::warn!("silverlight solution has no bridge, it will stay pending");
                }
            }
        }

        solution.promise()
    }

    /// [`Self::init_solution`] by wire name (`html5`, `flash`, `silverlight`).
    pub fn init_solution_named(self: &Arc<Self>, name: &str) -> ReadyPromise {
        match name.parse::<TransportKind>() {
            Ok(kind) => self.init_solution(kind),
            Err(unknown) => {
                tracing::error!("{unknown}");
                Deferred::rejected(Failure::new(
                    FailureKind::TransportUnsupported,
                    -1,
                    unknown.to_string(),
                ))
                .promise()
            }
        }
    }

    fn start_relay(self: &Arc<Self>, solution: Solution) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let _ = broker.document_ready.clone().await;
            tracing::info!("init html5 solution...");
            let loaded = broker
                .embedder
                .mount_relay(solution.id(), &broker.endpoints.relay);
            // The load signal fires even for error pages, so only the handshake
            // proves the relay works.
            if loaded.await.is_ok() {
                sleep(broker.timeouts.relay_handshake).await;
            } else {
                tracing::warn!(channel = %solution.id(), "relay frame was discarded before loading");
            }
            if solution.mark_failed(Failure::timeout(RELAY_NOT_WORKING)) {
                tracing::error!(
                    "html5 solution initialization has failed, server proxy frame encountered error"
                );
            }
        });
    }

    fn start_flash(self: &Arc<Self>, solution: Solution) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let _ = broker.document_ready.clone().await;
            tracing::info!("init flash solution...");
            let loading = broker
                .embedder
                .load_flash_bridge(solution.id(), &broker.endpoints.flash_bridge);
            match timeout(broker.timeouts.flash_load, loading).await {
                Ok(Ok(bridge)) => {
                    *solution.bridge_slot() = Some(bridge);
                    if solution.mark_ready() {
                        tracing::info!("flash solution initialized successfully");
                    }
                }
                Ok(Err(_)) | Err(_) => {
                    if solution.mark_failed(Failure::timeout(FLASH_LOAD_FAILED)) {
                        tracing::error!("flash solution initialization has failed");
                        broker.embedder.remove(solution.id());
                    }
                }
            }
        });
    }

    /// Feed a trusted-origin message to the pending relay handshake.
    ///
    /// The handshake listens once: the first trusted message consumes it whether
    /// or not it is the handshake literal. Returns `false` when no handshake was
    /// waiting, in which case the message is not the broker's to handle.
    pub fn accept_handshake(&self, data: &str) -> bool {
        let Some(solution) = self.solution(TransportKind::PostMessageChannel) else {
            return false;
        };
        if !solution.take_handshake() {
            return false;
        }
        if data == HANDSHAKE_SIGNAL {
            if solution.mark_ready() {
                tracing::info!("html5 solution was successfully initialized");
            }
        } else {
            tracing::info!("unexpected solution signal {data}");
        }
        true
    }

    #[must_use]
    pub fn solution(&self, kind: TransportKind) -> Option<Solution> {
        self.table().get(&kind).cloned()
    }

    /// The kind the host page boots with.
    #[must_use]
    pub fn preferred_kind(&self) -> Option<TransportKind> {
        self.capabilities.preferred()
    }

    /// The solution a call should use.
    ///
    /// A forced kind is initialized on demand. Otherwise the first kind in
    /// priority order that is both supported and already initialized wins.
    pub fn select_solution(self: &Arc<Self>, forced: Option<TransportKind>) -> Option<Solution> {
        if let Some(kind) = forced {
            tracing::warn!("forced to use solution {kind}");
            if self.solution(kind).is_none() {
                tracing::warn!("solution {kind} is not initialized, initializing...");
                let _ = self.init_solution(kind);
            }
            return self.solution(kind);
        }
        TransportKind::PRIORITY
            .into_iter()
            .filter(|kind| self.capabilities.supports(*kind))
            .find_map(|kind| self.solution(kind))
    }

    /// Drop a failed record so the next `init_solution` starts over.
    ///
    /// Records that are pending or ready are left alone.
    pub fn reset_solution(&self, kind: TransportKind) -> bool {
        let removed = {
            let mut table = self.table();
            match table.get(&kind) {
                Some(solution) if solution.ready_state() == ReadyState::Failed => {
                    table.remove(&kind)
                }
                _ => None,
            }
        };
        match removed {
            Some(solution) => {
                self.embedder.remove(solution.id());
                tracing::info!("solution {kind} reset");
                true
            }
            None => false,
        }
    }

    pub(crate) fn post_to_relay(&self, channel: &ChannelId, payload: &str) -> Result<(), PostError> {
        self.embedder
            .post_to_relay(channel, payload, self.endpoints.relay.as_str())
    }
}

impl fmt::Debug for TransportBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBroker")
            .field("capabilities", &self.capabilities)
            .field("endpoints", &self.endpoints)
            .field("solutions", &*self.table())
            .finish_non_exhaustive()
    }
}
