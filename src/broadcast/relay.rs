//! Cross-process relay of persisted messages.
//!
//! Delivery is at-least-once: receivers dedup by origin and message id. [`LocalRelay`]
//! links engines inside one process; [`HttpRelay`] posts envelopes to the
//! `/relay` route of every peer instance.

use std::time::Duration;

use futures_util::{future::{join_all, BoxFuture}, FutureExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{error::{ChatError, ChatResult}, store::ChatMessage};

pub const RELAY_TOKEN_HEADER: &str = "x-relay-token";

const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Instance that persisted the message.
    pub origin: Uuid,
    pub message: ChatMessage,
}

pub trait Relay: Send + Sync {
    fn publish<'a>(&'a self, envelope: &'a RelayEnvelope) -> BoxFuture<'a, ChatResult<()>>;

    /// Envelopes arriving from other instances.
    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope>;

    /// Ingress for envelopes received out of band (the `/relay` route).
    fn accept(&self, envelope: RelayEnvelope);
}

/// In-process bus. Clones share the bus, so every engine built with a clone
/// sees the others' messages.
#[derive(Clone)]
pub struct LocalRelay {
    tx: broadcast::Sender<RelayEnvelope>,
}

impl LocalRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(INBOUND_CAPACITY)
    }
}

impl Relay for LocalRelay {
    fn publish<'a>(&'a self, envelope: &'a RelayEnvelope) -> BoxFuture<'a, ChatResult<()>> {
        // no subscribers is not an error, there is just nobody else around
        let _ = self.tx.send(envelope.clone());
        futures_util::future::ready(Ok(())).boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.tx.subscribe()
    }

    fn accept(&self, envelope: RelayEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

pub struct HttpRelay {
    client: reqwest::Client,
    peers: Vec<String>,
    token: Option<String>,
    max_attempts: u32,
    backoff: Duration,
    inbound: broadcast::Sender<RelayEnvelope>,
}

impl HttpRelay {
    pub fn new(peers: Vec<String>, token: Option<String>) -> ChatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(ChatError::relay)?;
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        Ok(Self {
            client,
            peers,
            token,
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            inbound,
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    async fn publish_to(&self, peer: &str, envelope: &RelayEnvelope) -> Result<(), reqwest::Error> {
        let url = format!("{peer}/relay");
        let mut attempt = 1;

        loop {
            let mut request = self.client.post(&url).json(envelope);
            if let Some(token) = &self.token {
                request = request.header(RELAY_TOKEN_HEADER, token);
            }

            let result = request.send().await.and_then(|resp| resp.error_for_status());
            match result {
                Ok(_) => return Ok(()),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    tracing::debug!(peer, attempt, error = %err, "relay publish failed, retrying");
                    let jitter = rand::rng().random_range(0..=self.backoff.as_millis() as u64 / 2);
                    tokio::time::sleep(self.backoff * attempt + Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Relay for HttpRelay {
    fn publish<'a>(&'a self, envelope: &'a RelayEnvelope) -> BoxFuture<'a, ChatResult<()>> {
        async move {
            let results = join_all(self.peers.iter().map(|peer| async move {
                self.publish_to(peer, envelope).await.map_err(|err| format!("{peer}: {err}"))
            }))
            .await;

            let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(ChatError::relay(failures.join("; ")))
            }
        }
        .boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.inbound.subscribe()
    }

    fn accept(&self, envelope: RelayEnvelope) {
        let _ = self.inbound.send(envelope);
    }
}
