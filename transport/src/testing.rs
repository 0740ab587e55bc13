//! In-memory page collaborators for unit tests.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use crossframe_deferred::Deferred;
use crossframe_types::{Capabilities, ChannelId, HttpMethod};
use tokio::sync::oneshot;
use url::Url;

use crate::broker::{BrokerTimeouts, Endpoints, TransportBroker};
use crate::page::{AccessTokenSource, FlashTransport, PageEmbedder, PostError};

pub(crate) fn endpoints() -> Endpoints {
    Endpoints {
        relay: Url::parse("https://api.example.com/relay.html").unwrap(),
        flash_bridge: Url::parse("https://api.example.com/bridge.swf").unwrap(),
        api: Url::parse("https://api.example.com/api").unwrap(),
    }
}

pub(crate) fn broker_with(
    capabilities: Capabilities,
    embedder: &Arc<FakeEmbedder>,
) -> Arc<TransportBroker> {
    TransportBroker::new(
        capabilities,
        endpoints(),
        BrokerTimeouts::default(),
        Arc::clone(embedder) as Arc<dyn PageEmbedder>,
        Deferred::<(), Infallible>::resolved(()).promise(),
    )
}

/// Let spawned tasks run up to their next real suspension point.
pub(crate) async fn settle_tasks() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub(crate) struct FakeEmbedder {
    mounted: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    posted: Mutex<Vec<(String, String, String)>>,
    post_error: Mutex<Option<PostError>>,
    bridge: Option<Arc<FakeBridge>>,
    held: Mutex<Vec<oneshot::Sender<Arc<dyn FlashTransport>>>>,
}

impl FakeEmbedder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_bridge(bridge: Arc<FakeBridge>) -> Arc<Self> {
        Arc::new(Self {
            bridge: Some(bridge),
            ..Self::default()
        })
    }

    pub(crate) fn mounted(&self) -> Vec<String> {
        self.mounted.lock().unwrap().clone()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub(crate) fn posted(&self) -> Vec<(String, String, String)> {
        self.posted.lock().unwrap().clone()
    }

    pub(crate) fn fail_posts_with(&self, error: PostError) {
        *self.post_error.lock().unwrap() = Some(error);
    }
}

impl PageEmbedder for FakeEmbedder {
    fn mount_relay(&self, channel: &ChannelId, _url: &Url) -> oneshot::Receiver<()> {
        self.mounted.lock().unwrap().push(channel.to_string());
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        rx
    }

    fn post_to_relay(
        &self,
        channel: &ChannelId,
        message: &str,
        target_origin: &str,
    ) -> Result<(), PostError> {
        if let Some(error) = self.post_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.posted.lock().unwrap().push((
            channel.to_string(),
            message.to_string(),
            target_origin.to_string(),
        ));
        Ok(())
    }

    fn load_flash_bridge(
        &self,
        channel: &ChannelId,
        _url: &Url,
    ) -> oneshot::Receiver<Arc<dyn FlashTransport>> {
        self.mounted.lock().unwrap().push(channel.to_string());
        let (tx, rx) = oneshot::channel();
        match &self.bridge {
            Some(bridge) => {
                let _ = tx.send(Arc::clone(bridge) as Arc<dyn FlashTransport>);
            }
            None => self.held.lock().unwrap().push(tx),
        }
        rx
    }

    fn remove(&self, channel: &ChannelId) {
        self.removed.lock().unwrap().push(channel.to_string());
    }
}

#[derive(Default)]
pub(crate) struct FakeBridge {
    requests: Mutex<Vec<(String, String, HttpMethod)>>,
}

impl FakeBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn requests(&self) -> Vec<(String, String, HttpMethod)> {
        self.requests.lock().unwrap().clone()
    }
}

impl FlashTransport for FakeBridge {
    fn http_request(&self, url: &str, data: &str, method: HttpMethod) {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), data.to_string(), method));
    }
}

pub(crate) struct FixedToken(pub(crate) Mutex<Option<String>>);

impl FixedToken {
    pub(crate) fn some(token: &str) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(token.to_string()))))
    }

    pub(crate) fn none() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }
}

impl AccessTokenSource for FixedToken {
    fn access_token(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}
