//! Cross-origin transport for crossframe.
//!
//! The host page asks the [`TransportBroker`] for a channel, issues calls
//! through the [`ApiClient`], and feeds window messages to the
//! [`MessageRouter`], which hands responses to the [`CallRegistry`]. On the other
//! side of the channel the [`RelayRouter`] performs allow-listed calls with an
//! [`ApiFetcher`] and echoes the results.

mod broker;
mod dispatch;
mod fetch;
mod flash;
mod listener;
pub mod loopback;
mod page;
mod registry;
mod relay;

#[cfg(test)]
mod testing;

pub use broker::{
    BrokerTimeouts, Endpoints, FLASH_LOAD_TIMEOUT, RELAY_HANDSHAKE_TIMEOUT, ReadyPromise, Solution,
    TransportBroker,
};
pub use dispatch::{ApiClient, CallHandle, CallState};
pub use fetch::{FetchError, HttpFetcher, normalize_status, request_target};
pub use flash::{FlashEvent, FlashQueue};
pub use listener::{MessageRouter, Routed};
pub use page::{
    AccessTokenSource, ApiFetcher, FetchFut, FetchedResponse, FlashTransport, PageEmbedder,
    ParentWindow, PostError, WindowMessage,
};
pub use registry::{CallDeferred, CallPromise, CallRegistry, PendingCall};
pub use relay::RelayRouter;
