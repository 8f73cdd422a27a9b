//! Kafka-compatible broker client.
//!
//! Publishes through a `FutureProducer` and reads through one
//! `StreamConsumer` per group member with auto-commit disabled; offsets are
//! committed by the dispatch loop once a record is settled.

use super::{LogClient, LogConsumer, LogRecord};
use crate::bus::{TransportError, TransportMode, TransportResult};
use crate::config::LogConfig;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

/// Broker metadata round-trip budget for `probe`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for repositioning a partition after an unsettled record.
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a Kafka-compatible broker.
pub struct KafkaLog {
    producer: FutureProducer,
    brokers: String,
    client_id: String,
    send_timeout: Duration,
}

impl KafkaLog {
    /// Create the producer side. No network traffic happens until `probe`.
    pub fn new(config: &LogConfig) -> TransportResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| TransportError::ConfigurationError(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %config.brokers,
            client_id = %config.client_id,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            brokers: config.brokers.clone(),
            client_id: config.client_id.clone(),
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl LogClient for KafkaLog {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn probe(&self) -> TransportResult<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(PROBE_TIMEOUT))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| TransportError::ConnectionError {
            mode: TransportMode::Log,
            reason: e.to_string(),
        })?
        .map(|brokers| tracing::debug!(brokers, "Broker metadata fetched"))
        .map_err(|e| TransportError::ConnectionError {
            mode: TransportMode::Log,
            reason: e.to_string(),
        })
    }

    async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> TransportResult<(i32, i64)> {
        let record = FutureRecord::to(topic).payload(&payload).key(key);

        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| TransportError::PublishError {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn consumer(
        &self,
        group: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> TransportResult<Box<dyn LogConsumer>> {
        let offset_reset = if from_beginning { "earliest" } else { "latest" };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| TransportError::SubscribeError(format!("Failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| TransportError::SubscribeError(e.to_string()))?;

        tracing::info!(
            group,
            topics = ?topics,
            auto_offset_reset = offset_reset,
            "Kafka consumer joined group"
        );

        Ok(Box::new(KafkaConsumer { consumer }))
    }

    async fn close(&self) -> TransportResult<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| TransportError::ConnectionError {
                mode: TransportMode::Log,
                reason: e.to_string(),
            })?
            .map_err(|e| TransportError::ConnectionError {
                mode: TransportMode::Log,
                reason: format!("flush failed: {e}"),
            })
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn next(&mut self) -> Option<TransportResult<LogRecord>> {
        let record = match self.consumer.recv().await {
            Ok(message) => Ok(LogRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                // Tombstones arrive as empty records and are skipped by the dispatcher
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(e) => Err(TransportError::SubscribeError(e.to_string())),
        };
        Some(record)
    }

    async fn commit(&mut self, record: &LogRecord) -> TransportResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| TransportError::SubscribeError(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| TransportError::SubscribeError(e.to_string()))
    }

    async fn rewind(&mut self, record: &LogRecord) -> TransportResult<()> {
        self.consumer
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .map_err(|e| TransportError::SubscribeError(e.to_string()))
    }
}
