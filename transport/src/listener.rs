//! Host-page `message` handling.
//!
//! Origin is the only trust signal: anything not from the relay origin is
//! dropped before its payload is looked at.

use std::sync::Arc;

use crossframe_types::ResponseEnvelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::TransportBroker;
use crate::page::WindowMessage;
use crate::registry::CallRegistry;

/// What became of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Untrusted,
    Handshake,
    Response,
    /// Trusted, well formed, but answering no pending call.
    CorrelationMiss,
    Malformed,
}

pub struct MessageRouter {
    broker: Arc<TransportBroker>,
    registry: Arc<CallRegistry>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(broker: Arc<TransportBroker>, registry: Arc<CallRegistry>) -> Self {
        Self { broker, registry }
    }

    pub fn route(&self, message: &WindowMessage) -> Routed {
        if !self.broker.endpoints().is_trusted_origin(&message.origin) {
            tracing::warn!(
                "unexpected message arrived from {} with data {}",
                message.origin,
                message.data
            );
            return Routed::Untrusted;
        }

        if self.broker.accept_handshake(&message.data) {
            return Routed::Handshake;
        }

        let envelope = match ResponseEnvelope::parse(&message.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("dropping relay message: {e}");
                return Routed::Malformed;
            }
        };
        if self.registry.complete(envelope) {
            Routed::Response
        } else {
            Routed::CorrelationMiss
        }
    }

    /// Route every message from `inbound` until the channel closes.
    pub fn listen(self, mut inbound: mpsc::Receiver<WindowMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                self.route(&message);
            }
            tracing::debug!("message channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use crossframe_types::{ApiRequest, Capabilities, TransportKind};

    use super::*;
    use crate::registry::CallDeferred;
    use crate::testing::{FakeEmbedder, broker_with, settle_tasks};

    const RELAY_ORIGIN: &str = "https://api.example.com";

    fn router() -> (MessageRouter, Arc<TransportBroker>, Arc<CallRegistry>) {
        let embedder = FakeEmbedder::new();
        let broker = broker_with(
            Capabilities {
                postmessage: true,
                ..Capabilities::default()
            },
            &embedder,
        );
        let registry = Arc::new(CallRegistry::new());
        (
            MessageRouter::new(Arc::clone(&broker), Arc::clone(&registry)),
            broker,
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn untrusted_origin_does_not_consume_handshake() {
        let (router, broker, _) = router();
        let ready = broker.init_solution(TransportKind::PostMessageChannel);
        settle_tasks().await;

        let spoofed = WindowMessage::new("https://evil.example.net", "success");
        assert_eq!(router.route(&spoofed), Routed::Untrusted);
        assert!(ready.is_pending());

        let genuine = WindowMessage::new(RELAY_ORIGIN, "success");
        assert_eq!(router.route(&genuine), Routed::Handshake);
        assert!(ready.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn untrusted_response_never_settles_a_call() {
        let (router, _, registry) = router();
        let call = CallDeferred::new();
        let id = registry.collect(call.clone(), ApiRequest::get("/a"));

        let forged = WindowMessage::new(
            "https://evil.example.net",
            format!(r#"{{"id":{id},"data":[200,"OK",{{}},{{}}]}}"#),
        );
        assert_eq!(router.route(&forged), Routed::Untrusted);
        assert!(call.is_pending());

        let genuine = WindowMessage::new(
            RELAY_ORIGIN,
            format!(r#"{{"id":{id},"data":[200,"OK",{{}},{{}}]}}"#),
        );
        assert_eq!(router.route(&genuine), Routed::Response);
        assert!(call.is_resolved());
    }

    #[tokio::test]
    async fn unknown_id_and_garbage_are_dropped() {
        let (router, _, _) = router();
        let miss = WindowMessage::new(RELAY_ORIGIN, r#"{"id":7,"data":[200,"OK",1,{}]}"#);
        assert_eq!(router.route(&miss), Routed::CorrelationMiss);
        let garbage = WindowMessage::new(RELAY_ORIGIN, "not json");
        assert_eq!(router.route(&garbage), Routed::Malformed);
    }

    #[tokio::test]
    async fn listen_routes_until_closed() {
        let (router, _, registry) = router();
        let call = CallDeferred::new();
        let id = registry.collect(call.clone(), ApiRequest::get("/a"));
        let (tx, rx) = mpsc::channel(4);
        let task = router.listen(rx);

        tx.send(WindowMessage::new(
            RELAY_ORIGIN,
            format!(r#"{{"id":{id},"data":[500,"Server Error"]}}"#),
        ))
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(call.outcome().unwrap().unwrap_err().pair(), (500, "Server Error"));
    }
}
