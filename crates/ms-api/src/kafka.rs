//! Broker adapters: inbound requests, outbound events, and the bridge that
//! feeds outbound events back into the local hub for streaming.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::events::{EventKind, ProgressEvent};
use crate::hub::EventHub;
use crate::publisher::EventPublisher;
use crate::queue::{
    Delivery, DeliveryHandle, MessageSource, OffsetTracker, QueueError, RequestIntake, Result,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_RETRY: Duration = Duration::from_millis(300);

impl From<KafkaError> for QueueError {
    fn from(e: KafkaError) -> Self {
        QueueError::Broker(e.to_string())
    }
}

fn consumer(brokers: &str, group_id: &str, offset_reset: &str) -> Result<StreamConsumer> {
    let consumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", offset_reset)
        .create()?;
    Ok(consumer)
}

fn producer(brokers: &str) -> Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()?;
    Ok(producer)
}

async fn send(producer: &FutureProducer, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
    producer
        .send(FutureRecord::to(topic).key(key).payload(payload), SEND_TIMEOUT)
        .await
        .map(|_| ())
        .map_err(|(e, _)| e.into())
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Request consumer with manual commit.
///
/// Handlers finish out of order, so commits go through an [`OffsetTracker`]
/// and never move a partition past a request that is still being handled.
pub struct KafkaSource {
    consumer: StreamConsumer,
    offsets: Mutex<OffsetTracker>,
}

impl KafkaSource {
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let consumer = consumer(&config.brokers, &config.group_id, "earliest")?;
        consumer.subscribe(&[config.consumer_topic.as_str()])?;
        info!(
            topic = %config.consumer_topic,
            group_id = %config.group_id,
            "kafka request consumer subscribed"
        );
        Ok(Self {
            consumer,
            offsets: Mutex::new(OffsetTracker::default()),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next(&self) -> Result<Delivery> {
        loop {
            let message = match self.consumer.recv().await {
                Ok(message) => message,
                Err(error) => {
                    warn!(?error, "kafka recv error");
                    tokio::time::sleep(RECV_RETRY).await;
                    continue;
                }
            };

            self.offsets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .delivered(message.topic(), message.partition(), message.offset());

            let key = message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default();
            return Ok(Delivery {
                key,
                payload: message.payload().unwrap_or_default().to_vec(),
                handle: DeliveryHandle::Kafka {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                },
            });
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<()> {
        let DeliveryHandle::Kafka {
            topic,
            partition,
            offset,
        } = &delivery.handle
        else {
            return Err(QueueError::Broker("delivery did not come from kafka".into()));
        };

        let position = self
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed(topic, *partition, *offset);
        let Some(position) = position else {
            debug!(%topic, partition, offset, "earlier request still in flight, commit deferred");
            return Ok(());
        };

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, *partition, Offset::Offset(position))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn release(&self, delivery: Delivery) -> Result<()> {
        let DeliveryHandle::Kafka {
            topic,
            partition,
            offset,
        } = delivery.handle
        else {
            return Err(QueueError::Broker("delivery did not come from kafka".into()));
        };

        self.consumer
            .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        debug!(%topic, partition, offset, "rewound partition for redelivery");
        Ok(())
    }
}

/// Publishes `server.create` requests from the HTTP intake.
pub struct KafkaIntake {
    producer: FutureProducer,
    topic: String,
}

impl KafkaIntake {
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            producer: producer(&config.brokers)?,
            topic: config.consumer_topic.clone(),
        })
    }
}

#[async_trait]
impl RequestIntake for KafkaIntake {
    async fn submit(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        send(&self.producer, &self.topic, key, &payload).await
    }
}

// ── Outbound ─────────────────────────────────────────────────────────

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            producer: producer(&config.brokers)?,
            topic: config.producer_topic.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, kind: EventKind, event: ProgressEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode event");
                return;
            }
        };
        if let Err(error) = send(&self.producer, &self.topic, kind.key(), &payload).await {
            warn!(key = kind.key(), server_id = %event.server_id, %error, "failed to publish event");
        }
    }
}

/// Feed the outbound topic into `hub` until the consumer fails to start.
///
/// Each process uses its own consumer group so every instance streams every
/// event, starting from the newest offset.
pub async fn bridge_events(config: KafkaConfig, hub: EventHub) -> Result<()> {
    let group_id = format!("{}-events-{}", config.group_id, uuid::Uuid::new_v4());
    let consumer = consumer(&config.brokers, &group_id, "latest")?;
    consumer.subscribe(&[config.producer_topic.as_str()])?;
    info!(topic = %config.producer_topic, %group_id, "event bridge subscribed");

    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(error) => {
                warn!(?error, "event bridge recv error");
                tokio::time::sleep(RECV_RETRY).await;
                continue;
            }
        };

        match serde_json::from_slice::<ProgressEvent>(message.payload().unwrap_or_default()) {
            Ok(event) => hub.publish(event),
            Err(error) => warn!(%error, offset = message.offset(), "skipping undecodable event"),
        }

        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(?error, "event bridge failed to commit");
        }
    }
}
