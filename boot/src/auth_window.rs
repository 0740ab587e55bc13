//! Tracking of the authorization popup.
//!
//! The opener polls the popup while tracking is on. A popup that closes while
//! still tracked was dismissed by the user and counts as `access_denied`. The
//! popup stops tracking through its opener before closing itself after a
//! normal redirect, so that close is not mistaken for a denial.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossframe_types::encode_query;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use url::Url;

/// The response synthesized when the user closes the popup.
pub const ACCESS_DENIED_RESPONSE: &str = "error=access_denied";

/// The popup as seen from its opener.
pub trait PopupWindow: Send + Sync {
    fn is_closed(&self) -> bool;
}

/// Opens the authorization popup.
pub trait PopupOpener: Send + Sync {
    fn open(&self, url: &Url) -> Arc<dyn PopupWindow>;
}

#[derive(Debug, Default)]
pub struct AuthWindowTracker {
    tracking: AtomicBool,
}

impl AuthWindowTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start(&self) {
        self.tracking.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.tracking.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    /// Poll `popup` every `interval` until tracking stops or the popup closes.
    ///
    /// Runs `on_denied` when the popup closed while still tracked. The task
    /// yields whether that happened.
    pub fn watch(
        self: &Arc<Self>,
        popup: Arc<dyn PopupWindow>,
        interval: Duration,
        on_denied: impl FnOnce() + Send + 'static,
    ) -> JoinHandle<bool> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !tracker.is_tracking() {
                    return false;
                }
                if popup.is_closed() {
                    tracker.stop();
                    tracing::info!("authorization window closed by user");
                    on_denied();
                    return true;
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// The authorization page URL for an implicit-grant login.
#[must_use]
pub fn authorize_url(auth: &Url, appkey: &str, redirect_uri: &str, referer: &str) -> Url {
    let mut params = Map::new();
    params.insert("response_type".to_string(), Value::from("token"));
    params.insert("client_id".to_string(), Value::from(appkey));
    params.insert("redirect_uri".to_string(), Value::from(redirect_uri));
    params.insert("referer".to_string(), Value::from(referer));
    params.insert("scope".to_string(), Value::from("all"));
    let mut url = auth.clone();
    url.set_query(Some(&encode_query(&params)));
    url
}
