//! Log backend.
//!
//! Events are appended to a partitioned, replicated log and read back by
//! consumer groups. Each service runs one logical consumer per group; the
//! broker assigns partitions and the group's committed offsets decide where
//! reading resumes after a restart.
//!
//! [`LogTransport`] holds the dispatch logic and talks to the broker through
//! the [`LogClient`] seam:
//!
//! - [`MemoryLog`] (feature `memory`, default): in-process broker for local
//!   development and tests
//! - `KafkaLog` (feature `kafka`): Kafka-compatible broker via rdkafka
//!
//! Delivery is at least once. A record's offset is committed only after its
//! handler completed or the record was moved to the dead-letter topic. A
//! record that could not be parked is rewound and read again after a
//! backoff. Empty records (compaction tombstones) carry no event and are
//! committed without dispatch.

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
#[cfg(feature = "memory")]
pub use memory::MemoryLog;

use crate::bus::{
    HandlerError, StatsRecorder, Transport, TransportError, TransportMode, TransportResult,
    TransportStats,
};
use crate::config::LogConfig;
use crate::retry::{with_retry, with_retry_if, RetryConfig};
use crate::router::TopicRouter;
use crate::types::{Event, Topic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// One record read from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Topic name as stored by the broker
    pub topic: String,
    /// Partition the record lives on
    pub partition: i32,
    /// Position within the partition
    pub offset: i64,
    /// Partition key
    pub key: Option<String>,
    /// Raw value bytes
    pub payload: Vec<u8>,
}

/// Broker operations the log transport needs.
///
/// Implementations normalize their failures into [`TransportError`]:
/// `ConnectionError` from `probe`, `PublishError` from `append`,
/// `SubscribeError` from `consumer`.
#[async_trait]
pub trait LogClient: Send + Sync + 'static {
    /// Broker flavour, for log fields.
    fn name(&self) -> &'static str;

    /// Check that the broker is reachable.
    async fn probe(&self) -> TransportResult<()>;

    /// Append a record; returns `(partition, offset)`.
    async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> TransportResult<(i32, i64)>;

    /// Join `group` and start reading `topics`.
    ///
    /// `from_beginning` applies only when the group has no committed offset
    /// for a partition.
    async fn consumer(
        &self,
        group: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> TransportResult<Box<dyn LogConsumer>>;

    /// Flush pending writes and release broker resources.
    async fn close(&self) -> TransportResult<()>;
}

/// A consumer-group member.
#[async_trait]
pub trait LogConsumer: Send {
    /// Wait for the next record. `None` once the consumer is closed.
    ///
    /// Must be cancel safe: the dispatch loop races it against shutdown.
    async fn next(&mut self) -> Option<TransportResult<LogRecord>>;

    /// Commit `record` as processed for the group.
    async fn commit(&mut self, record: &LogRecord) -> TransportResult<()>;

    /// Make `record` the next one `next` returns on its partition.
    async fn rewind(&mut self, record: &LogRecord) -> TransportResult<()>;
}

/// Record written to `<topic>.dlq` when a handler keeps failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the record was read from
    pub topic: String,
    /// Partition of the original record
    pub partition: i32,
    /// Offset of the original record
    pub offset: i64,
    /// Consumer group that gave up on it
    pub group: String,
    /// Last error
    pub error: String,
    /// When the record was given up on
    pub failed_at: DateTime<Utc>,
    /// Original value, as JSON when it parses and as a string otherwise
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct Lifecycle {
    connected: bool,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

/// Transport over a partitioned log.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use storefront_events::{BusConfig, LogTransport, MemoryLog, TopicRouter, Transport};
///
/// async fn example(router: TopicRouter) -> Result<(), Box<dyn std::error::Error>> {
///     let config = BusConfig::local("order-service", 8001);
///     let transport = LogTransport::new(MemoryLog::new(3), config.log);
///     transport.connect().await?;
///     transport.subscribe(Arc::new(router)).await?;
///     Ok(())
/// }
/// ```
pub struct LogTransport<C: LogClient> {
    client: Arc<C>,
    config: LogConfig,
    stats: Arc<StatsRecorder>,
    lifecycle: Mutex<Lifecycle>,
}

impl<C: LogClient> LogTransport<C> {
    /// Create a transport over `client`.
    pub fn new(client: C, config: LogConfig) -> Self {
        Self {
            client: Arc::new(client),
            config,
            stats: Arc::new(StatsRecorder::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// The underlying broker client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Whether a dispatch loop is running.
    pub async fn is_consuming(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

#[async_trait]
impl<C: LogClient> Transport for LogTransport<C> {
    fn mode(&self) -> TransportMode {
        TransportMode::Log
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.connected {
            return Ok(());
        }

        tracing::info!(
            mode = %TransportMode::Log,
            broker = self.client.name(),
            brokers = %self.config.brokers,
            client_id = %self.config.client_id,
            "Connecting to log broker"
        );

        with_retry(&self.config.connect_retry, "connect log broker", || {
            self.client.probe()
        })
        .await
        .map_err(|e| match e {
            TransportError::ConnectionError { .. } => e,
            other => TransportError::ConnectionError {
                mode: TransportMode::Log,
                reason: other.to_string(),
            },
        })?;

        lifecycle.connected = true;
        tracing::info!(mode = %TransportMode::Log, "Log broker connected");
        Ok(())
    }

    async fn publish(&self, event: Event) -> TransportResult<()> {
        if !self.lifecycle.lock().await.connected {
            return Err(TransportError::NotConnected);
        }

        let topic = event.topic;
        let key = event.partition_key();
        let payload = serde_json::to_vec(&event).map_err(|e| TransportError::PublishError {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let (partition, offset) = self
            .client
            .append(topic.as_str(), &key, payload)
            .await
            .map_err(|e| match e {
                TransportError::PublishError { .. } => e,
                other => TransportError::PublishError {
                    topic: topic.to_string(),
                    reason: other.to_string(),
                },
            })?;

        self.stats.record_published();
        tracing::debug!(
            topic = %topic,
            event_id = %event.id,
            key = %key,
            partition,
            offset,
            "Event appended to log"
        );
        Ok(())
    }

    async fn subscribe(&self, router: Arc<TopicRouter>) -> TransportResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.connected {
            return Err(TransportError::NotConnected);
        }
        if lifecycle.worker.is_some() {
            return Err(TransportError::SubscribeError(
                "already subscribed; routes are fixed at startup".to_string(),
            ));
        }

        let topics: Vec<String> = router
            .topics()
            .into_iter()
            .map(|topic| topic.as_str().to_string())
            .collect();
        if topics.is_empty() {
            tracing::warn!(group = %self.config.group_id, "Router has no topics; nothing to consume");
            return Ok(());
        }

        let consumer = self
            .client
            .consumer(&self.config.group_id, &topics, self.config.from_beginning)
            .await?;

        tracing::info!(
            mode = %TransportMode::Log,
            group = %self.config.group_id,
            topics = ?topics,
            from_beginning = self.config.from_beginning,
            "Consumer subscribed"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            client: self.client.clone(),
            router,
            stats: self.stats.clone(),
            group: self.config.group_id.clone(),
            handler_retry: self.config.handler_retry.clone(),
            backoff: self.config.connect_retry.clone(),
            dead_letter: self.config.dead_letter,
        };

        lifecycle.worker = Some(tokio::spawn(dispatch_loop(
            consumer,
            dispatcher,
            shutdown_rx,
        )));
        lifecycle.shutdown = Some(shutdown_tx);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        // Handlers may publish while the loop drains, so the lock is not held
        // across the join.
        let (shutdown, worker) = {
            let mut lifecycle = self.lifecycle.lock().await;
            (lifecycle.shutdown.take(), lifecycle.worker.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.connected {
            lifecycle.connected = false;
            self.client.close().await?;
            tracing::info!(mode = %TransportMode::Log, "Log transport disconnected");
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// Per-record processing shared by the dispatch loop.
struct Dispatcher<C: LogClient> {
    client: Arc<C>,
    router: Arc<TopicRouter>,
    stats: Arc<StatsRecorder>,
    group: String,
    handler_retry: RetryConfig,
    /// Pause schedule after consumer errors and unparked records
    backoff: RetryConfig,
    dead_letter: bool,
}

impl<C: LogClient> Dispatcher<C> {
    /// Handle one record. Returns whether its offset may be committed.
    async fn process(&self, record: &LogRecord) -> bool {
        let topic: Topic = match record.topic.parse() {
            Ok(topic) => topic,
            Err(e) => {
                tracing::warn!(topic = %record.topic, error = %e, "Skipping record on unknown topic");
                return true;
            }
        };
        if !self.router.routes(topic) {
            return true;
        }
        if record.payload.is_empty() {
            tracing::debug!(
                topic = %topic,
                partition = record.partition,
                offset = record.offset,
                "Skipping empty record"
            );
            return true;
        }

        let value: serde_json::Value = match serde_json::from_slice(&record.payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(
                    topic = %topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Record is not JSON"
                );
                self.stats.record_handler_failure();
                return self.give_up(record, topic, &e.to_string()).await;
            }
        };

        let event = Event::from_json(topic, value);
        let result = with_retry_if(
            &self.handler_retry,
            topic.as_str(),
            || self.router.dispatch(&event),
            |e| !matches!(e, HandlerError::InvalidPayload(_)),
        )
        .await;

        match result {
            Ok(_) => {
                self.stats.record_delivered();
                tracing::debug!(
                    topic = %topic,
                    event_id = %event.id,
                    partition = record.partition,
                    offset = record.offset,
                    "Record handled"
                );
                true
            }
            Err(e) => {
                self.stats.record_handler_failure();
                let error = TransportError::HandlerError { topic, source: e };
                tracing::error!(
                    topic = %topic,
                    event_id = %event.id,
                    partition = record.partition,
                    offset = record.offset,
                    error = %error,
                    "Handler failed on every attempt"
                );
                self.give_up(record, topic, &error.to_string()).await
            }
        }
    }

    /// Park a record that cannot be handled. Returns false when it must stay
    /// uncommitted because the dead-letter write failed.
    async fn give_up(&self, record: &LogRecord, topic: Topic, error: &str) -> bool {
        if !self.dead_letter {
            tracing::error!(
                topic = %topic,
                partition = record.partition,
                offset = record.offset,
                "Dropping record; dead-letter topic disabled"
            );
            return true;
        }

        let payload = serde_json::from_slice(&record.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&record.payload).into_owned())
        });
        let letter = DeadLetter {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            group: self.group.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
            payload,
        };
        let dlq = topic.dead_letter();
        let key = record.key.clone().unwrap_or_else(|| record.offset.to_string());

        let bytes = match serde_json::to_vec(&letter) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(topic = %dlq, error = %e, "Failed to encode dead letter");
                return false;
            }
        };

        match self.client.append(&dlq, &key, bytes).await {
            Ok((partition, offset)) => {
                self.stats.record_dead_lettered();
                tracing::warn!(
                    topic = %topic,
                    dead_letter_topic = %dlq,
                    partition,
                    offset,
                    "Record moved to dead-letter topic"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    topic = %topic,
                    dead_letter_topic = %dlq,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to dead-letter record; leaving it uncommitted"
                );
                false
            }
        }
    }
}

/// Sleep out the backoff for `failures`. Returns false if shutdown was
/// requested meanwhile.
async fn pause(backoff: &RetryConfig, failures: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff.delay_after(failures)) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn dispatch_loop<C: LogClient>(
    mut consumer: Box<dyn LogConsumer>,
    dispatcher: Dispatcher<C>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(group = %dispatcher.group, "Dispatch loop started");

    // Consecutive consumer errors or unparked records; reset once a record settles
    let mut failures: u32 = 0;
    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = consumer.next() => next,
        };

        let record = match next {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                failures = failures.saturating_add(1);
                tracing::warn!(group = %dispatcher.group, error = %e, failures, "Consumer error");
                if !pause(&dispatcher.backoff, failures, &mut shutdown).await {
                    break;
                }
                continue;
            }
            None => {
                tracing::info!(group = %dispatcher.group, "Consumer closed");
                break;
            }
        };

        if !dispatcher.process(&record).await {
            failures = failures.saturating_add(1);
            if let Err(e) = consumer.rewind(&record).await {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Rewind failed; record is redelivered after the next rebalance"
                );
            }
            if !pause(&dispatcher.backoff, failures, &mut shutdown).await {
                break;
            }
            continue;
        }
        failures = 0;

        if let Err(e) = consumer.commit(&record).await {
            tracing::warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed; record may be redelivered"
            );
        }
    }

    tracing::info!(group = %dispatcher.group, "Dispatch loop stopped");
}
