//! Boot sequencing for one window.
//!
//! Three readiness signals are tracked. The token gate starts locked once and
//! opens when `init` has settled the stored tokens. Document readiness is a
//! one-shot latch. The everything gate starts locked twice and takes one
//! unlock from each of the other two, so it opens only when both hold.
//!
//! `boot` inspects the window it runs in and takes exactly one of five
//! branches: the authorization popup hands its redirect to the opener, the
//! relay document serves calls, the host page starts a transport, and the
//! remaining two only log.

use std::convert::Infallible;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use crossframe_deferred::{Deferred, Gate, GateHook};
use crossframe_transport::{
    AccessTokenSource, ApiClient, ApiFetcher, CallHandle, CallRegistry, MessageRouter,
    PageEmbedder, ParentWindow, RelayRouter, TransportBroker, WindowMessage,
};
use crossframe_types::{ApiCatalog, ApiRequest, TransportKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use crate::auth_window::{
    ACCESS_DENIED_RESPONSE, AuthWindowTracker, PopupOpener, authorize_url,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::events::{BootEvent, EventBus};
use crate::service::TokenService;
use crate::token::{CookieJar, LoginStatus, Resolution, TokenStore};

/// The window that opened the authorization popup.
pub trait OpenerWindow: Send + Sync {
    /// Whether the popup may read and script the opener.
    fn is_same_origin(&self) -> bool;
    fn notify(&self, event: BootEvent);
    fn stop_tracking_auth_window(&self);
}

/// Reports whether the document can be scripted yet.
pub trait DocumentProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Page services the orchestrator is built on.
pub struct Collaborators {
    pub embedder: Arc<dyn PageEmbedder>,
    pub cookies: Arc<dyn CookieJar>,
    pub tokens: Arc<dyn TokenService>,
}

/// The popup's view of the window that opened it.
pub struct AuthRedirect {
    pub opener: Arc<dyn OpenerWindow>,
    /// Closes the popup.
    pub close: Box<dyn FnOnce() + Send>,
}

/// What the relay needs to serve calls.
pub struct RelayParts {
    pub fetcher: Arc<dyn ApiFetcher>,
    pub parent: Arc<dyn ParentWindow>,
}

/// Facts about the window being booted.
pub struct WindowContext {
    pub location: Url,
    /// Running inside a frame.
    pub framed: bool,
    pub opener: Option<AuthRedirect>,
    /// `message` events addressed to this window.
    pub messages: Option<mpsc::Receiver<WindowMessage>>,
    pub relay: Option<RelayParts>,
}

impl WindowContext {
    #[must_use]
    pub fn top_level(location: Url) -> Self {
        Self {
            location,
            framed: false,
            opener: None,
            messages: None,
            relay: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBranch {
    AuthorizationResult,
    Relay,
    FramedClient,
    Host,
    PlainServer,
}

impl BootBranch {
    #[must_use]
    pub const fn select(has_opener: bool, framed: bool, is_relay_location: bool) -> Self {
        match (has_opener, framed, is_relay_location) {
            (true, _, _) => BootBranch::AuthorizationResult,
            (false, true, true) => BootBranch::Relay,
            (false, true, false) => BootBranch::FramedClient,
            (false, false, false) => BootBranch::Host,
            (false, false, true) => BootBranch::PlainServer,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub appkey: Option<String>,
    /// Redirect target for the authorization window.
    pub client_proxy: Option<String>,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Handlers waiting for a condition.
#[derive(Default)]
struct ReadyHooks {
    pending: Mutex<Vec<Hook>>,
}

impl ReadyHooks {
    fn pending(&self) -> MutexGuard<'_, Vec<Hook>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The check happens under the lock so a concurrent `fire` cannot slip in
    // between it and the push.
    fn run_or_queue(&self, holds: impl FnOnce() -> bool, hook: Hook) {
        let mut pending = self.pending();
        if holds() {
            drop(pending);
            hook();
        } else {
            pending.push(hook);
        }
    }

    fn fire(&self) {
        let ready = mem::take(&mut *self.pending());
        for hook in ready {
            hook();
        }
    }
}

pub struct Orchestrator {
    config: BridgeConfig,
    store: Arc<TokenStore>,
    events: EventBus,
    catalog: Arc<ApiCatalog>,
    broker: Arc<TransportBroker>,
    registry: Arc<CallRegistry>,
    client: Arc<ApiClient>,
    token_service: Arc<dyn TokenService>,
    token_gate: Gate,
    everything_gate: Gate,
    document: Deferred<(), Infallible>,
    booted: OnceLock<BootBranch>,
    inited: AtomicBool,
    token_hooks: ReadyHooks,
    everything_hooks: ReadyHooks,
    auth_window: Arc<AuthWindowTracker>,
    client_proxy: RwLock<Option<String>>,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig, page: Collaborators) -> Result<Arc<Self>, ConfigError> {
        let endpoints = config.endpoints()?;
        let store = Arc::new(TokenStore::new(
            page.cookies,
            config.cookie.clone(),
            config.appkey(),
        ));
        let catalog = Arc::new(config.catalog());
        let document = Deferred::new();
        let broker = TransportBroker::new(
            config.capabilities(),
            endpoints,
            config.timeouts.broker(),
            page.embedder,
            document.promise(),
        );
        let registry = Arc::new(CallRegistry::new());
        let client = ApiClient::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn AccessTokenSource>,
            Arc::clone(&catalog),
        );

        let orchestrator = Arc::new_cyclic(|this: &Weak<Self>| Self {
            token_gate: Gate::new(
                Some(log_hook("tokenReady is locked")),
                Some(forward(this, Self::on_token_unlocked)),
            ),
            everything_gate: Gate::new(
                Some(log_hook("everythingReady is locked")),
                Some(forward(this, Self::on_everything_unlocked)),
            ),
            config,
            store,
            events: EventBus::new(),
            catalog,
            broker,
            registry,
            client,
            token_service: page.tokens,
            document,
            booted: OnceLock::new(),
            inited: AtomicBool::new(false),
            token_hooks: ReadyHooks::default(),
            everything_hooks: ReadyHooks::default(),
            auth_window: AuthWindowTracker::new(),
            client_proxy: RwLock::new(None),
        });

        // Until `init` runs.
        orchestrator.token_gate.lock();
        // Once for the token, once for the document.
        orchestrator.everything_gate.lock();
        orchestrator.everything_gate.lock();
        Ok(orchestrator)
    }

    fn on_token_unlocked(&self, gate: &Gate) {
        tracing::info!("tokenReady is unlocked");
        if !gate.is_open() {
            return;
        }
        tracing::info!("token is ready");
        self.events.emit(BootEvent::TokenReady);
        self.token_hooks.fire();
        self.everything_gate.unlock();
    }

    fn on_everything_unlocked(&self, gate: &Gate) {
        tracing::info!("everythingReady is unlocked");
        if !gate.is_open() {
            return;
        }
        tracing::info!("everything is ready");
        if let Some(status) = self.store.login_status() {
            tracing::info!("current user is {}", status.name);
        }
        self.events.emit(BootEvent::EverythingReady);
        self.everything_hooks.fire();
    }

    /// Take the branch that fits `context`. A window boots once; later calls
    /// return the first branch and do nothing.
    pub fn boot(self: &Arc<Self>, context: WindowContext) -> BootBranch {
        let is_relay = self
            .broker
            .endpoints()
            .is_relay_location(context.location.as_str());
        let branch = BootBranch::select(context.opener.is_some(), context.framed, is_relay);
        if self.booted.set(branch).is_err() {
            let first = self.booted.get().copied().unwrap_or(branch);
            tracing::warn!("already booted as {first:?}");
            return first;
        }

        match branch {
            BootBranch::AuthorizationResult => {
                if let Some(redirect) = context.opener {
                    self.finish_authorization(&context.location, redirect);
                }
            }
            BootBranch::Relay => self.serve_relay(context),
            BootBranch::FramedClient => {
                tracing::info!("library is booting at client proxy mode");
            }
            BootBranch::Host => self.start_host(context),
            BootBranch::PlainServer => {
                tracing::info!("library is booting at plain server mode");
            }
        }
        branch
    }

    fn finish_authorization(&self, location: &Url, redirect: AuthRedirect) {
        let fragment = location.fragment().unwrap_or_default();
        if redirect.opener.is_same_origin() {
            match self.store.resolve_response(fragment) {
                Resolution::LoggedIn(status) => {
                    redirect.opener.notify(BootEvent::UserLoggedIn(status));
                }
                Resolution::Failed(failure) => {
                    redirect.opener.notify(BootEvent::UserLoginFailed(failure));
                }
                Resolution::CookieRejected => {}
            }
        } else {
            tracing::error!("crossdomain login is not supported currently");
        }
        // The popup is closing on purpose; the opener must not read that as a denial.
        redirect.opener.stop_tracking_auth_window();
        (redirect.close)();
        tracing::info!("library is booting at server authorization mode");
    }

    fn serve_relay(&self, context: WindowContext) {
        tracing::info!("library is booting at server proxy mode");
        if !self.broker.capabilities().postmessage {
            tracing::warn!("relay needs postmessage, not serving calls");
            return;
        }
        let (Some(parts), Some(messages)) = (context.relay, context.messages) else {
            tracing::error!("relay document has no parent window to serve");
            return;
        };
        RelayRouter::new(Arc::clone(&self.catalog), parts.fetcher, parts.parent).listen(messages);
    }

    fn start_host(&self, context: WindowContext) {
        tracing::info!("library is booting at plain client mode, waiting init signal...");
        if let Some(messages) = context.messages {
            MessageRouter::new(Arc::clone(&self.broker), Arc::clone(&self.registry))
                .listen(messages);
        }
        match self.broker.preferred_kind() {
            // Nothing can complete a silverlight attempt.
            Some(TransportKind::SilverlightBridge) | None => {
                tracing::warn!("no cross-origin solution available on this page");
            }
            Some(kind) => {
                self.broker.init_solution(kind);
            }
        }
    }

    /// Settle the stored tokens and open the token gate. Only the first call does anything.
    pub fn init(self: &Arc<Self>, options: InitOptions) -> bool {
        if self.inited.swap(true, Ordering::SeqCst) {
            tracing::warn!("already initialized");
            return false;
        }
        tracing::info!("init signal has arrived");

        if let Some(appkey) = options.appkey {
            tracing::info!("client id is {appkey}");
            self.store.set_appkey(appkey);
        }
        if let Some(client_proxy) = options
            .client_proxy
            .or_else(|| self.config.endpoints.client_proxy.clone())
        {
            tracing::info!("client proxy uri is {client_proxy}");
            *self
                .client_proxy
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(client_proxy);
        }

        let access_token = self.store.access_token();
        let refresh_token = self.store.refresh_token();

        match (refresh_token, access_token) {
            (Some(refresh_token), None) => {
                self.token_gate.lock();
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.exchange_token(&refresh_token).await;
                    this.token_gate.unlock();
                });
            }
            (None, None) => {
                self.token_gate.lock();
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.request_new_token().await;
                    this.token_gate.unlock();
                });
            }
            _ => {}
        }

        self.token_gate.unlock();
        true
    }

    async fn exchange_token(&self, refresh_token: &str) {
        tracing::info!("exchanging refresh token to access token...");
        let appkey = self.store.appkey();
        let exchanged = match self.token_service.exchange(&appkey, refresh_token).await {
            Ok(response) => match self.store.resolve_response(&response) {
                Resolution::Failed(failure) => {
                    tracing::error!("exchange token error {}", failure.error);
                    false
                }
                Resolution::LoggedIn(_) | Resolution::CookieRejected => {
                    tracing::info!("exchange token succeed");
                    true
                }
            },
            Err(failure) if failure.status() == 404 => {
                tracing::error!("exchange token has failed, script not found");
                false
            }
            Err(failure) => {
                tracing::error!("exchange token has failed, {}", failure.reason());
                false
            }
        };

        if !exchanged {
            tracing::warn!("exchange token has failed, trying to retrieve a new access_token...");
            self.token_gate.lock();
            self.request_new_token().await;
            self.token_gate.unlock();
        }
    }

    async fn request_new_token(&self) {
        tracing::info!("retrieving new access token...");
        let appkey = self.store.appkey();
        match self.token_service.request_new(&appkey).await {
            Ok(response) => match self.store.resolve_response(&response) {
                Resolution::Failed(failure) => {
                    tracing::error!("retrieve new access token error {}", failure.error);
                }
                Resolution::LoggedIn(_) | Resolution::CookieRejected => {
                    tracing::info!("retrieve new access token succeed");
                }
            },
            Err(failure) => tracing::error!("get token failed, {}", failure.reason()),
        }
    }

    /// Mark the document ready. Later calls are ignored.
    pub fn document_ready_detected(&self) {
        if !self.document.resolve(()) {
            return;
        }
        tracing::info!("document is ready");
        self.everything_gate.unlock();
        self.events.emit(BootEvent::DocumentReady);
    }

    #[must_use]
    pub fn is_document_ready(&self) -> bool {
        self.document.is_resolved()
    }

    /// Poll `probe` every `interval` until the document is ready.
    pub fn watch_document(
        self: &Arc<Self>,
        probe: Arc<dyn DocumentProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while !this.is_document_ready() {
                if probe.is_ready() {
                    this.document_ready_detected();
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Run `handler` now if the token is ready, otherwise when it next is.
    pub fn token_ready(&self, handler: impl FnOnce() + Send + 'static) {
        self.token_hooks
            .run_or_queue(|| self.token_gate.is_open(), Box::new(handler));
    }

    pub fn document_ready(&self, handler: impl FnOnce() + Send + 'static) {
        self.document.done(move |_| handler());
    }

    /// Run `handler` now if token and document are both ready, otherwise when they next are.
    pub fn everything_ready(&self, handler: impl FnOnce() + Send + 'static) {
        self.everything_hooks
            .run_or_queue(|| self.everything_gate.is_open(), Box::new(handler));
    }

    #[must_use]
    pub fn is_token_ready(&self) -> bool {
        self.token_gate.is_open()
    }

    #[must_use]
    pub fn is_everything_ready(&self) -> bool {
        self.everything_gate.is_open()
    }

    #[must_use]
    pub fn login_status(&self) -> Option<LoginStatus> {
        self.store.login_status()
    }

    /// Open the authorization window unless a user is already logged in.
    ///
    /// The outcome arrives as a [`BootEvent::UserLoggedIn`] or
    /// [`BootEvent::UserLoginFailed`]; closing the window counts as a denial.
    pub fn login(self: &Arc<Self>, opener: &dyn PopupOpener, referer: &str) -> Option<LoginStatus> {
        if !self.inited.load(Ordering::SeqCst) {
            tracing::error!("Library not initialized, call init() to initialize");
        }
        if let Some(Ok(record)) = self.store.record()
            && record.is_expired(Utc::now())
        {
            tracing::info!("stored access token has expired");
            self.store.clear_access_token();
        }
        if let Some(status) = self.login_status() {
            return Some(status);
        }

        let redirect_uri = self
            .client_proxy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| referer.to_string());
        let url = match Url::parse(&self.config.endpoints.auth) {
            Ok(auth) => authorize_url(&auth, &self.store.appkey(), &redirect_uri, referer),
            Err(e) => {
                tracing::error!("authorization endpoint is invalid: {e}");
                return None;
            }
        };

        let popup = opener.open(&url);
        self.auth_window.start();
        let this = Arc::downgrade(self);
        self.auth_window.watch(
            popup,
            self.config.timeouts.auth_window_poll(),
            move || {
                if let Some(this) = this.upgrade() {
                    this.resolve_login(ACCESS_DENIED_RESPONSE);
                }
            },
        );
        None
    }

    fn resolve_login(&self, response: &str) {
        match self.store.resolve_response(response) {
            Resolution::LoggedIn(status) => self.events.emit(BootEvent::UserLoggedIn(status)),
            Resolution::Failed(failure) => self.events.emit(BootEvent::UserLoginFailed(failure)),
            Resolution::CookieRejected => {}
        }
    }

    /// Forget both tokens.
    pub fn logout(&self) {
        if self.login_status().is_none() {
            tracing::info!("user not logged in");
        } else {
            self.store.clear_access_token();
            self.store.clear_refresh_token();
        }
        self.events.emit(BootEvent::UserLoggedOut);
    }

    /// Issue an API call.
    pub fn call(&self, request: ApiRequest) -> CallHandle {
        self.client.call(request)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BootEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<TransportBroker> {
        &self.broker
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.store
    }

    #[must_use]
    pub fn auth_window(&self) -> &Arc<AuthWindowTracker> {
        &self.auth_window
    }
}

/// A same-origin opener in this process: the popup talks to it directly.
impl OpenerWindow for Orchestrator {
    fn is_same_origin(&self) -> bool {
        true
    }

    fn notify(&self, event: BootEvent) {
        self.events.emit(event);
    }

    fn stop_tracking_auth_window(&self) {
        self.auth_window.stop();
    }
}

fn log_hook(message: &'static str) -> GateHook {
    Arc::new(move |_: &Gate| tracing::info!("{message}"))
}

fn forward(this: &Weak<Orchestrator>, hook: fn(&Orchestrator, &Gate)) -> GateHook {
    let this = Weak::clone(this);
    Arc::new(move |gate: &Gate| {
        if let Some(this) = this.upgrade() {
            hook(&this, gate);
        }
    })
}
