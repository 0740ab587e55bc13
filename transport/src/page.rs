//! Seams to the embedding page.
//!
//! The broker and dispatcher never touch a real document. Whatever hosts them
//! (a browser binding, the loopback demo, a test) implements these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crossframe_types::{ApiRequest, ChannelId, Failure, HttpMethod, ResponseBody};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

/// A `message` event delivered to a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: String,
}

impl WindowMessage {
    pub fn new(origin: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("server proxy not found")]
    NotFound,
    #[error("server proxy not valid")]
    NotValid,
    #[error("post message to server proxy has failed, {0}")]
    Delivery(String),
}

/// DOM operations the broker needs from the host page.
pub trait PageEmbedder: Send + Sync {
    /// Insert the hidden relay frame `channel` pointing at `url`. The receiver
    /// completes on the frame's load signal; dropping the sender means the
    /// frame will never load.
    fn mount_relay(&self, channel: &ChannelId, url: &Url) -> oneshot::Receiver<()>;

    /// Post `message` into the relay frame. Implementations must fail with
    /// [`PostError::NotFound`] when the frame is gone and [`PostError::NotValid`]
    /// when its source no longer points at the relay.
    fn post_to_relay(
        &self,
        channel: &ChannelId,
        message: &str,
        target_origin: &str,
    ) -> Result<(), PostError>;

    /// Load the bridge module. The receiver yields its RPC surface once the
    /// module reports ready.
    fn load_flash_bridge(
        &self,
        channel: &ChannelId,
        url: &Url,
    ) -> oneshot::Receiver<Arc<dyn FlashTransport>>;

    /// Remove whatever was mounted for `channel`.
    fn remove(&self, channel: &ChannelId);
}

/// RPC surface of a loaded bridge module. Completions come back separately,
/// one event per request, in request order.
pub trait FlashTransport: Send + Sync {
    fn http_request(&self, url: &str, data: &str, method: HttpMethod);
}

/// The relay document's view of the window that framed it.
pub trait ParentWindow: Send + Sync {
    fn post_message(&self, message: &str, target_origin: &str);
}

/// Where the current page gets its access token from.
pub trait AccessTokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResponse {
    pub status: i64,
    pub status_text: String,
    pub body: ResponseBody,
    pub headers: Value,
}

pub type FetchFut<'a> = Pin<Box<dyn Future<Output = Result<FetchedResponse, Failure>> + Send + 'a>>;

/// Same-origin HTTP access used by the relay.
pub trait ApiFetcher: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a ApiRequest) -> FetchFut<'a>;
}
