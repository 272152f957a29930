use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Broker-specific token identifying a delivery for commit or release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    Memory(u64),
    #[cfg(feature = "kafka")]
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

/// One inbound message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: String,
    pub payload: Vec<u8>,
    pub handle: DeliveryHandle,
}

/// Per-partition commit positions for deliveries handled out of order.
///
/// The position committed for a partition never passes an offset that was
/// delivered but not yet completed. Released offsets stay outstanding until
/// their redelivery completes.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    outstanding: BTreeSet<i64>,
    highest_completed: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    pub fn delivered(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partition(topic, partition).outstanding.insert(offset);
    }

    /// Mark `offset` handled. Returns the next position to commit, if it moved.
    pub fn completed(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partition(topic, partition);
        offsets.outstanding.remove(&offset);
        offsets.highest_completed = offsets.highest_completed.max(Some(offset));

        let position = match offsets.outstanding.first() {
            Some(&lowest) => lowest,
            None => offsets.highest_completed? + 1,
        };
        if offsets.committed.is_some_and(|c| c >= position) {
            return None;
        }
        offsets.committed = Some(position);
        Some(position)
    }

    fn partition(&mut self, topic: &str, partition: i32) -> &mut PartitionOffsets {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
    }
}

/// At-least-once inbound queue with manual commit.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Wait for the next delivery.
    async fn next(&self) -> Result<Delivery>;

    /// Mark a delivery processed; it will not be redelivered.
    async fn commit(&self, delivery: &Delivery) -> Result<()>;

    /// Give a delivery back uncommitted so it is delivered again.
    async fn release(&self, delivery: Delivery) -> Result<()>;
}

/// Producer side of the inbound queue, used by the HTTP intake.
#[async_trait]
pub trait RequestIntake: Send + Sync + 'static {
    async fn submit(&self, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// In-process queue for single-node use and tests.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    next_id: AtomicU64,
    committed: Mutex<Vec<u64>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: &str, payload: impl Into<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending_mut().push_back(Delivery {
            key: key.to_string(),
            payload: payload.into(),
            handle: DeliveryHandle::Memory(id),
        });
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.pending_mut().len()
    }

    /// Ids of committed deliveries, in commit order.
    pub fn committed(&self) -> Vec<u64> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn pending_mut(&self) -> std::sync::MutexGuard<'_, VecDeque<Delivery>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn next(&self) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.pending_mut().pop_front() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<()> {
        if let DeliveryHandle::Memory(id) = delivery.handle {
            self.committed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(id);
        }
        Ok(())
    }

    async fn release(&self, delivery: Delivery) -> Result<()> {
        self.pending_mut().push_front(delivery);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl RequestIntake for MemoryQueue {
    async fn submit(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.push(key, payload);
        Ok(())
    }
}
