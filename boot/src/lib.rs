//! Boot layer for crossframe.
//!
//! Loads [`BridgeConfig`], keeps the user's tokens in a [`TokenStore`], and
//! drives the [`Orchestrator`], which owns the transport broker and call
//! registry for one window and reports readiness through gates and
//! [`BootEvent`]s.

mod auth_window;
mod blackbox;
mod config;
mod events;
mod orchestrator;
mod service;
mod token;

pub use auth_window::{
    ACCESS_DENIED_RESPONSE, AuthWindowTracker, PopupOpener, PopupWindow, authorize_url,
};
pub use blackbox::{BLACKBOX_CAPACITY, BlackBox, BlackBoxWriter};
pub use config::{
    ApiConfig, BridgeConfig, CapabilitiesConfig, ConfigError, CookieConfig, EndpointsConfig,
    TimeoutsConfig, config_path,
};
pub use events::{BootEvent, EventBus};
pub use orchestrator::{
    AuthRedirect, BootBranch, Collaborators, DocumentProbe, InitOptions, OpenerWindow,
    Orchestrator, RelayParts, WindowContext,
};
pub use service::{HttpTokenService, TokenFut, TokenService};
pub use token::{
    CookieJar, LoginFailure, LoginStatus, MemoryCookieJar, Resolution, SetCookie, TokenGrant,
    TokenRecord, TokenRecordError, TokenStore, TokenUser,
};
