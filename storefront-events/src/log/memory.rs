//! In-process partitioned log.
//!
//! Behaves like a single-node broker: topics are created on first use, keys
//! are hashed onto a fixed number of partitions, and consumer groups keep
//! committed offsets that survive a consumer going away. Clones share the
//! same broker, so a test can publish through one transport and consume
//! through another.
//!
//! Each group has at most one active member at a time and that member reads
//! every partition of its topics.

use super::{LogClient, LogConsumer, LogRecord};
use crate::bus::{TransportError, TransportMode, TransportResult};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Partition count used by [`MemoryLog::default`].
pub const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, i32), i64>,
    active_groups: HashSet<String>,
}

struct Broker {
    partitions: usize,
    state: Mutex<BrokerState>,
    appended: Notify,
}

impl Broker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn partitions_of(&mut self, topic: &str, count: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }
}

/// In-memory broker handle.
#[derive(Clone)]
pub struct MemoryLog {
    broker: Arc<Broker>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryLog {
    /// Create a broker whose topics have `partitions` partitions.
    pub fn new(partitions: usize) -> Self {
        Self {
            broker: Arc::new(Broker {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState {
                    reachable: true,
                    ..Default::default()
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// Simulate the broker going away or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.state().reachable = reachable;
        self.broker.appended.notify_waiters();
    }

    /// Partition `key` is placed on.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.broker.partitions as u64) as i32
    }

    /// All records of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        let state = self.broker.state();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, record)| LogRecord {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                })
            })
            .collect()
    }

    /// Committed position of `group` on one partition.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.broker
            .state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn unreachable() -> TransportError {
        TransportError::ConnectionError {
            mode: TransportMode::Log,
            reason: "broker unreachable".to_string(),
        }
    }
}

#[async_trait]
impl LogClient for MemoryLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn probe(&self) -> TransportResult<()> {
        if self.broker.state().reachable {
            Ok(())
        } else {
            Err(Self::unreachable())
        }
    }

    async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> TransportResult<(i32, i64)> {
        let partition = self.partition_for(key);
        let offset = {
            let mut state = self.broker.state();
            if !state.reachable {
                return Err(TransportError::PublishError {
                    topic: topic.to_string(),
                    reason: "broker unreachable".to_string(),
                });
            }
            let log = &mut state.partitions_of(topic, self.broker.partitions)[partition as usize];
            log.push(StoredRecord {
                key: Some(key.to_string()),
                payload,
            });
            (log.len() - 1) as i64
        };

        self.broker.appended.notify_waiters();
        Ok((partition, offset))
    }

    async fn consumer(
        &self,
        group: &str,
        topics: &[String],
        from_beginning: bool,
    ) -> TransportResult<Box<dyn LogConsumer>> {
        let mut state = self.broker.state();
        if !state.reachable {
            return Err(TransportError::SubscribeError("broker unreachable".to_string()));
        }
        if !state.active_groups.insert(group.to_string()) {
            return Err(TransportError::SubscribeError(format!(
                "group {group} already has an active member"
            )));
        }

        let mut positions = Vec::new();
        for topic in topics {
            let partitions = self.broker.partitions;
            let ends: Vec<i64> = state
                .partitions_of(topic, partitions)
                .iter()
                .map(|log| log.len() as i64)
                .collect();

            for (partition, end) in ends.into_iter().enumerate() {
                let partition = partition as i32;
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.clone(), partition))
                    .copied();
                let start = match committed {
                    Some(offset) => offset,
                    None if from_beginning => 0,
                    None => end,
                };
                positions.push(Position {
                    topic: topic.clone(),
                    partition,
                    next: start,
                });
            }
        }

        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            group: group.to_string(),
            positions,
            cursor: 0,
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

struct Position {
    topic: String,
    partition: i32,
    next: i64,
}

struct MemoryConsumer {
    broker: Arc<Broker>,
    group: String,
    positions: Vec<Position>,
    /// Round-robin start so one busy partition does not starve the others
    cursor: usize,
}

impl MemoryConsumer {
    fn poll(&mut self) -> Option<LogRecord> {
        let state = self.broker.state();
        if !state.reachable || self.positions.is_empty() {
            return None;
        }

        let count = self.positions.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let position = &mut self.positions[index];
            let stored = state
                .topics
                .get(&position.topic)
                .and_then(|partitions| partitions.get(position.partition as usize))
                .and_then(|log| log.get(position.next as usize));

            if let Some(stored) = stored {
                let record = LogRecord {
                    topic: position.topic.clone(),
                    partition: position.partition,
                    offset: position.next,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                };
                position.next += 1;
                self.cursor = (index + 1) % count;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn next(&mut self) -> Option<TransportResult<LogRecord>> {
        let broker = self.broker.clone();
        loop {
            let appended = broker.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.poll() {
                return Some(Ok(record));
            }
            appended.await;
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> TransportResult<()> {
        let mut state = self.broker.state();
        if !state.reachable {
            return Err(TransportError::SubscribeError("broker unreachable".to_string()));
        }
        state.committed.insert(
            (self.group.clone(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    async fn rewind(&mut self, record: &LogRecord) -> TransportResult<()> {
        if let Some(position) = self
            .positions
            .iter_mut()
            .find(|p| p.topic == record.topic && p.partition == record.partition)
        {
            position.next = position.next.min(record.offset);
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.broker.state().active_groups.remove(&self.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventHandler, FnHandler, HandlerError, Transport};
    use crate::config::BusConfig;
    use crate::log::{DeadLetter, LogTransport};
    use crate::retry::RetryConfig;
    use crate::router::TopicRouter;
    use crate::types::{Event, Service, Topic};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn log_config(group: &str) -> crate::config::LogConfig {
        let mut config = BusConfig::local(group, 0).log;
        config.connect_retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };
        config.handler_retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };
        config
    }

    fn forwarding_router(topic: Topic, tx: mpsc::UnboundedSender<Event>) -> Arc<TopicRouter> {
        let handler: Arc<dyn EventHandler> = Arc::new(FnHandler::new(move |event: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        }));
        Arc::new(TopicRouter::builder().route(topic, handler).build().unwrap())
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    async fn wait_for(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_publish_then_consume() {
        let broker = MemoryLog::default();
        let producer = LogTransport::new(broker.clone(), log_config("catalog-service"));
        let consumer = LogTransport::new(broker.clone(), log_config("search-service"));
        producer.connect().await.unwrap();
        consumer.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer
            .subscribe(forwarding_router(Topic::ProductCreated, tx))
            .await
            .unwrap();

        let event = Event::new(
            Topic::ProductCreated,
            Service::Catalog,
            json!({"id": "p1", "name": "Lamp", "price": 1999}),
        );
        producer.publish(event.clone()).await.unwrap();

        let delivered = recv(&mut rx).await;
        assert_eq!(delivered.id, event.id);
        assert_eq!(delivered.payload["name"], "Lamp");
        assert_eq!(producer.stats().published, 1);

        consumer.disconnect().await.unwrap();
        assert_eq!(consumer.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_replays_history_for_new_group() {
        let broker = MemoryLog::default();
        let producer = LogTransport::new(broker.clone(), log_config("catalog-service"));
        producer.connect().await.unwrap();

        for i in 0..3 {
            producer
                .publish_payload(Topic::ProductCreated, Service::Catalog, json!({"id": i}))
                .await
                .unwrap();
        }

        // Consumer starts after the events were published
        let consumer = LogTransport::new(broker.clone(), log_config("search-service"));
        consumer.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer
            .subscribe(forwarding_router(Topic::ProductCreated, tx))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv(&mut rx).await.payload["id"].as_i64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);

        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_start_skips_history() {
        let broker = MemoryLog::default();
        let producer = LogTransport::new(broker.clone(), log_config("catalog-service"));
        producer.connect().await.unwrap();
        producer
            .publish_payload(Topic::ProductDeleted, Service::Catalog, json!({"id": "old"}))
            .await
            .unwrap();

        let mut config = log_config("search-service");
        config.from_beginning = false;
        let consumer = LogTransport::new(broker.clone(), config);
        consumer.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer
            .subscribe(forwarding_router(Topic::ProductDeleted, tx))
            .await
            .unwrap();

        producer
            .publish_payload(Topic::ProductDeleted, Service::Catalog, json!({"id": "new"}))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.payload["id"], "new");
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_group_resumes_from_committed_offset() {
        let broker = MemoryLog::new(1);
        let producer = LogTransport::new(broker.clone(), log_config("catalog-service"));
        producer.connect().await.unwrap();
        producer
            .publish_payload(Topic::ProductCreated, Service::Catalog, json!({"n": 1}))
            .await
            .unwrap();

        let first = LogTransport::new(broker.clone(), log_config("search-service"));
        first.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        first
            .subscribe(forwarding_router(Topic::ProductCreated, tx))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.payload["n"], 1);
        wait_for(|| {
            broker.committed_offset("search-service", "product.created", 0) == Some(1)
        })
        .await;
        first.disconnect().await.unwrap();

        producer
            .publish_payload(Topic::ProductCreated, Service::Catalog, json!({"n": 2}))
            .await
            .unwrap();

        // Same group after a restart: only the uncommitted record arrives
        let second = LogTransport::new(broker.clone(), log_config("search-service"));
        second.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        second
            .subscribe(forwarding_router(Topic::ProductCreated, tx))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.payload["n"], 2);
        second.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_key_keeps_order() {
        let broker = MemoryLog::new(4);
        let producer = LogTransport::new(broker.clone(), log_config("order-service"));
        producer.connect().await.unwrap();

        for n in 0..10 {
            let event = Event::new(Topic::OrderCreated, Service::Order, json!({"n": n}))
                .with_key("user-42");
            producer.publish(event).await.unwrap();
        }

        let consumer = LogTransport::new(broker.clone(), log_config("email-service"));
        consumer.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer
            .subscribe(forwarding_router(Topic::OrderCreated, tx))
            .await
            .unwrap();

        for n in 0..10 {
            assert_eq!(recv(&mut rx).await.payload["n"], n);
        }
        consumer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_when_broker_unreachable() {
        let broker = MemoryLog::default();
        broker.set_reachable(false);

        let transport = LogTransport::new(broker, log_config("order-service"));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionError {
                mode: TransportMode::Log,
                ..
            }
        ));

        // Nothing was consumed and publishing is refused
        let event = Event::new(Topic::OrderCreated, Service::Order, json!({}));
        assert!(matches!(
            transport.publish(event).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_recovers_within_budget() {
        let broker = MemoryLog::default();
        broker.set_reachable(false);

        let mut config = log_config("order-service");
        config.connect_retry = RetryConfig {
            max_attempts: 50,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
        };
        let transport = LogTransport::new(broker.clone(), config);

        let restore = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restore.set_reachable(true);
        });

        assert!(transport.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_handler_is_dead_lettered() {
        let broker = MemoryLog::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(FnHandler::new(move |_event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Downstream("mail server down".to_string()))
            }
        }));
        let router = Arc::new(
            TopicRouter::builder()
                .route(Topic::UserCreated, handler)
                .build()
                .unwrap(),
        );

        let transport = LogTransport::new(broker.clone(), log_config("email-service"));
        transport.connect().await.unwrap();
        transport.subscribe(router).await.unwrap();
        transport
            .publish_payload(
                Topic::UserCreated,
                Service::Auth,
                json!({"email": "a@example.com", "username": "ada"}),
            )
            .await
            .unwrap();

        wait_for(|| !broker.records("user.created.dlq").is_empty()).await;
        transport.disconnect().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let stats = transport.stats();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.delivered, 0);

        let letters = broker.records("user.created.dlq");
        let letter: DeadLetter = serde_json::from_slice(&letters[0].payload).unwrap();
        assert_eq!(letter.topic, "user.created");
        assert_eq!(letter.group, "email-service");
        assert!(letter.error.contains("mail server down"));
        assert_eq!(letter.payload["payload"]["username"], "ada");

        // The failed record was committed, so the loop moved past it
        let original = &broker.records("user.created")[0];
        assert_eq!(
            broker.committed_offset("email-service", "user.created", original.partition),
            Some(original.offset + 1)
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_is_not_retried() {
        let broker = MemoryLog::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(FnHandler::new(move |_event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::InvalidPayload("missing orderRef".to_string()))
            }
        }));
        let router = Arc::new(
            TopicRouter::builder()
                .route(Topic::PaymentSuccessful, handler)
                .build()
                .unwrap(),
        );

        let transport = LogTransport::new(broker.clone(), log_config("order-service"));
        transport.connect().await.unwrap();
        transport.subscribe(router).await.unwrap();
        transport
            .publish_payload(Topic::PaymentSuccessful, Service::Payment, json!({}))
            .await
            .unwrap();

        wait_for(|| !broker.records("payment.successful.dlq").is_empty()).await;
        transport.disconnect().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparked_record_stays_uncommitted_until_dead_lettered() {
        let broker = MemoryLog::new(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let outage = broker.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(FnHandler::new(move |_event: Event| {
            let counter = counter.clone();
            let outage = outage.clone();
            async move {
                // The broker disappears while the first delivery is in flight
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    outage.set_reachable(false);
                }
                Err(HandlerError::InvalidPayload("missing orderRef".to_string()))
            }
        }));
        let router = Arc::new(
            TopicRouter::builder()
                .route(Topic::PaymentSuccessful, handler)
                .build()
                .unwrap(),
        );

        let transport = LogTransport::new(broker.clone(), log_config("order-service"));
        transport.connect().await.unwrap();
        transport.subscribe(router).await.unwrap();
        transport
            .publish_payload(Topic::PaymentSuccessful, Service::Payment, json!({}))
            .await
            .unwrap();

        wait_for(|| transport.stats().handler_failures == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.records("payment.successful.dlq").is_empty());
        assert_eq!(
            broker.committed_offset("order-service", "payment.successful", 0),
            None
        );

        broker.set_reachable(true);
        wait_for(|| !broker.records("payment.successful.dlq").is_empty()).await;
        wait_for(|| {
            broker.committed_offset("order-service", "payment.successful", 0) == Some(1)
        })
        .await;
        transport.disconnect().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(transport.stats().dead_lettered, 1);
        assert_eq!(broker.records("payment.successful.dlq").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_record_is_skipped_and_committed() {
        let broker = MemoryLog::new(1);
        broker.append("user.created", "u1", Vec::new()).await.unwrap();
        broker
            .append(
                "user.created",
                "u2",
                serde_json::to_vec(&json!({"email": "c@example.com", "username": "cy"})).unwrap(),
            )
            .await
            .unwrap();

        let transport = LogTransport::new(broker.clone(), log_config("email-service"));
        transport.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport
            .subscribe(forwarding_router(Topic::UserCreated, tx))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.payload["username"], "cy");
        wait_for(|| broker.committed_offset("email-service", "user.created", 0) == Some(2)).await;
        transport.disconnect().await.unwrap();

        let stats = transport.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.handler_failures, 0);
        assert!(broker.records("user.created.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_bare_payload_is_wrapped() {
        let broker = MemoryLog::default();
        // A producer that writes the payload without an envelope
        broker
            .append(
                "user.created",
                "u1",
                serde_json::to_vec(&json!({"email": "b@example.com", "username": "bo"})).unwrap(),
            )
            .await
            .unwrap();

        let transport = LogTransport::new(broker.clone(), log_config("email-service"));
        transport.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport
            .subscribe(forwarding_router(Topic::UserCreated, tx))
            .await
            .unwrap();

        let event = recv(&mut rx).await;
        assert_eq!(event.topic, Topic::UserCreated);
        assert!(event.source.is_none());
        assert_eq!(event.payload["username"], "bo");
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_subscribe_is_rejected() {
        let transport = LogTransport::new(MemoryLog::default(), log_config("email-service"));
        transport.connect().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = forwarding_router(Topic::UserCreated, tx);

        transport.subscribe(router.clone()).await.unwrap();
        assert!(transport.is_consuming().await);
        assert!(matches!(
            transport.subscribe(router).await,
            Err(TransportError::SubscribeError(_))
        ));

        transport.disconnect().await.unwrap();
        assert!(!transport.is_consuming().await);
        // Idempotent
        transport.disconnect().await.unwrap();
    }
}
