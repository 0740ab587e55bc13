//! The relay document's side of the channel.
//!
//! The relay accepts call envelopes from any origin. What keeps it from being an
//! open proxy is the allow-list: only paths in the [`ApiCatalog`] are ever
//! requested, and everything else is answered with a refusal.

use std::sync::Arc;

use crossframe_types::{
    ApiCatalog, CallEnvelope, CorrelationId, Failure, HANDSHAKE_SIGNAL, ResponseEnvelope,
    ResponseFormat,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::page::{ApiFetcher, ParentWindow, WindowMessage};

/// The relay replies to whoever framed it.
const ANY_ORIGIN: &str = "*";

pub struct RelayRouter {
    catalog: Arc<ApiCatalog>,
    fetcher: Arc<dyn ApiFetcher>,
    parent: Arc<dyn ParentWindow>,
}

impl RelayRouter {
    pub fn new(
        catalog: Arc<ApiCatalog>,
        fetcher: Arc<dyn ApiFetcher>,
        parent: Arc<dyn ParentWindow>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            fetcher,
            parent,
        })
    }

    /// Tell the parent the relay has loaded.
    pub fn announce(&self) {
        self.parent.post_message(HANDSHAKE_SIGNAL, ANY_ORIGIN);
    }

    /// Answer one call envelope, posting the response to the parent.
    ///
    /// Returns the response sent, or `None` when the message was not a call
    /// envelope at all.
    pub async fn handle(&self, raw: &str) -> Option<ResponseEnvelope> {
        let envelope = match CallEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("relay ignored message: {e}");
                return None;
            }
        };
        let response = self.answer(envelope).await;
        match response.to_json() {
            Ok(json) => self.parent.post_message(&json, ANY_ORIGIN),
            Err(e) => tracing::error!("relay could not encode response: {e}"),
        }
        Some(response)
    }

    async fn answer(&self, envelope: CallEnvelope) -> ResponseEnvelope {
        let id = envelope.id;
        let api = envelope.api().to_string();

        if api.is_empty() {
            tracing::error!("interface is empty");
            return refuse(id, &Failure::empty_interface());
        }
        if !self.catalog.is_provided(&api) {
            tracing::error!("interface \"{api}\" is not allowed to be called");
            return refuse(id, &Failure::unsupported_interface(&api));
        }

        let mut request = match envelope.request() {
            Ok(request) => request,
            Err(e) => return ResponseEnvelope::refused(id, -1, &e.to_string()),
        };
        // XML documents cannot cross the channel; ship the text instead.
        if request.format == ResponseFormat::Xml {
            request.format = ResponseFormat::XmlText;
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => ResponseEnvelope::completed(
                id,
                response.status,
                &response.status_text,
                response.body.into_wire(),
                response.headers,
                request.format,
            ),
            Err(failure) => refuse(id, &failure),
        }
    }

    /// Announce, then answer every inbound message concurrently until the
    /// channel closes.
    pub fn listen(self: Arc<Self>, mut inbound: mpsc::Receiver<WindowMessage>) -> JoinHandle<()> {
        self.announce();
        tracing::info!("server message listener installed, waiting messages from client...");
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let relay = Arc::clone(&self);
                tokio::spawn(async move {
                    relay.handle(&message.data).await;
                });
            }
        })
    }
}

fn refuse(id: CorrelationId, failure: &Failure) -> ResponseEnvelope {
    let (status, reason) = failure.pair();
    ResponseEnvelope::refused(id, status, reason)
}
