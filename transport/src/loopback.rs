//! A host window and its relay frame living in one process.
//!
//! Messages cross between the two through bounded channels, stamped with the
//! sender's origin the way a browser would. There is no bridge module, so
//! loading one fails at once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossframe_types::ChannelId;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::broker::Endpoints;
use crate::page::{FlashTransport, PageEmbedder, ParentWindow, PostError, WindowMessage};

const CHANNEL_CAPACITY: usize = 64;

/// Receiving ends of the two windows.
pub struct LoopbackInboxes {
    pub host: mpsc::Receiver<WindowMessage>,
    pub relay: mpsc::Receiver<WindowMessage>,
}

pub struct LoopbackPage {
    relay_url: String,
    relay_origin: String,
    host_origin: String,
    to_host: mpsc::Sender<WindowMessage>,
    to_relay: mpsc::Sender<WindowMessage>,
    frames: Mutex<HashSet<ChannelId>>,
}

impl LoopbackPage {
    pub fn new(endpoints: &Endpoints, host_origin: impl Into<String>) -> (Arc<Self>, LoopbackInboxes) {
        let (to_host, host) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_relay, relay) = mpsc::channel(CHANNEL_CAPACITY);
        let page = Arc::new(Self {
            relay_url: endpoints.relay.to_string(),
            relay_origin: endpoints.relay_origin(),
            host_origin: host_origin.into(),
            to_host,
            to_relay,
            frames: Mutex::new(HashSet::new()),
        });
        (page, LoopbackInboxes { host, relay })
    }

    fn frames(&self) -> MutexGuard<'_, HashSet<ChannelId>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PageEmbedder for LoopbackPage {
    fn mount_relay(&self, channel: &ChannelId, url: &Url) -> oneshot::Receiver<()> {
        tracing::debug!("mounting relay frame {channel} at {url}");
        self.frames().insert(channel.clone());
        let (loaded, rx) = oneshot::channel();
        let _ = loaded.send(());
        rx
    }

    fn post_to_relay(
        &self,
        channel: &ChannelId,
        message: &str,
        target_origin: &str,
    ) -> Result<(), PostError> {
        if !self.frames().contains(channel) {
            return Err(PostError::NotFound);
        }
        if target_origin != self.relay_url {
            return Err(PostError::NotValid);
        }
        self.to_relay
            .try_send(WindowMessage::new(self.host_origin.clone(), message))
            .map_err(|e| PostError::Delivery(e.to_string()))
    }

    fn load_flash_bridge(
        &self,
        channel: &ChannelId,
        _url: &Url,
    ) -> oneshot::Receiver<Arc<dyn FlashTransport>> {
        tracing::debug!("no bridge module available for {channel}");
        let (_never, rx) = oneshot::channel();
        rx
    }

    fn remove(&self, channel: &ChannelId) {
        self.frames().remove(channel);
    }
}

impl ParentWindow for LoopbackPage {
    fn post_message(&self, message: &str, _target_origin: &str) {
        let delivered = self
            .to_host
            .try_send(WindowMessage::new(self.relay_origin.clone(), message));
        if let Err(e) = delivered {
            tracing::warn!("relay message to host was lost: {e}");
        }
    }
}
