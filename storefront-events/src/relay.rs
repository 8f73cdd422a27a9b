//! Relay backend.
//!
//! Publishing is a synchronous call to the relay's ingestion API; the relay
//! stores the message and later delivers it, signed, to a callback URL with
//! its own retry schedule. A successful `publish` means the relay accepted
//! the job, not that any destination processed it.
//!
//! There is nothing to pull, so `subscribe` does not start anything: inbound
//! deliveries arrive through the webhook endpoints in [`crate::webhook`] and
//! end in the same [`TopicRouter`] the log backend uses.

use crate::bus::{StatsRecorder, Transport, TransportError, TransportMode, TransportResult, TransportStats};
use crate::config::RelayConfig;
use crate::router::TopicRouter;
use crate::types::{Event, Topic};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Header carrying the number of delivery attempts the relay should make.
pub const RETRIES_HEADER: &str = "Upstash-Retries";

/// Header delaying the first delivery.
pub const DELAY_HEADER: &str = "Upstash-Delay";

/// Acknowledgement returned by the relay's ingestion API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    /// Relay-assigned message ID
    pub message_id: String,

    /// Destination the relay will deliver to, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Whether the relay recognized the message as a duplicate
    #[serde(default)]
    pub deduplicated: bool,
}

#[derive(Serialize)]
struct RelayEnvelope<'a> {
    body: &'a Event,
}

/// Transport over a push relay.
pub struct RelayTransport {
    client: Client,
    config: RelayConfig,
    connected: AtomicBool,
    stats: Arc<StatsRecorder>,
}

impl RelayTransport {
    /// Create a relay client.
    pub fn new(config: RelayConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::ConfigurationError(format!("Failed to build HTTP client: {e}")))?;

        if config.token.is_none() {
            warn!("Relay token not set; publishing will be rejected by the relay");
        }

        Ok(Self {
            client,
            config,
            connected: AtomicBool::new(false),
            stats: Arc::new(StatsRecorder::default()),
        })
    }

    /// Relay settings in use.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn publish_url(&self, topic: Topic) -> String {
        match self.config.destination_for(topic) {
            Some(destination) => self.config.url(&format!("/v2/publish/{destination}")),
            None => self.config.url(&format!("/v1/publish/{}", topic.as_str())),
        }
    }

    /// Publish with an optional delivery delay and return the relay's receipt.
    #[instrument(skip(self, event), fields(topic = %event.topic, event_id = %event.id))]
    pub async fn publish_with(
        &self,
        event: &Event,
        delay: Option<Duration>,
    ) -> TransportResult<PublishReceipt> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        let url = self.publish_url(event.topic);
        debug!(url = %url, "Publishing event to relay");

        let mut request = self
            .client
            .post(&url)
            .header(RETRIES_HEADER, self.config.retries.to_string())
            .json(&RelayEnvelope { body: event });

        if let Some(ref token) = self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(delay) = delay {
            request = request.header(DELAY_HEADER, format!("{}s", delay.as_secs()));
        }

        let response = request.send().await.map_err(|e| TransportError::PublishError {
            topic: event.topic.to_string(),
            reason: e.to_string(),
        })?;

        let receipt = handle_response(event.topic, response).await?;
        self.stats.record_published();
        debug!(message_id = %receipt.message_id, "Relay accepted event");
        Ok(receipt)
    }

    /// Publish several events concurrently.
    ///
    /// Results are returned in input order; one failure does not stop the
    /// others.
    pub async fn publish_batch(&self, events: &[Event]) -> Vec<TransportResult<PublishReceipt>> {
        join_all(events.iter().map(|event| self.publish_with(event, None))).await
    }
}

async fn handle_response(topic: Topic, response: Response) -> TransportResult<PublishReceipt> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<PublishReceipt>()
            .await
            .map_err(|e| TransportError::PublishError {
                topic: topic.to_string(),
                reason: format!("invalid relay response: {e}"),
            })
    } else {
        let message = response.text().await.unwrap_or_default();
        warn!(topic = %topic, status = status.as_u16(), "Relay rejected publish");
        Err(TransportError::PublishError {
            topic: topic.to_string(),
            reason: format!("relay returned {}: {}", status.as_u16(), message),
        })
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Relay
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.config.token.is_none() {
            warn!(mode = %TransportMode::Relay, "Relay token not set");
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!(
            mode = %TransportMode::Relay,
            relay = %self.config.base_url,
            retries = self.config.retries,
            "Relay transport ready"
        );
        Ok(())
    }

    async fn publish(&self, event: Event) -> TransportResult<()> {
        self.publish_with(&event, None).await.map(|_| ())
    }

    async fn subscribe(&self, router: Arc<TopicRouter>) -> TransportResult<()> {
        warn!(
            mode = %TransportMode::Relay,
            topics = ?router.topics(),
            "subscribe is a no-op for the relay transport; deliveries arrive on the webhook endpoints"
        );
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!(mode = %TransportMode::Relay, "Relay transport disconnected");
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
