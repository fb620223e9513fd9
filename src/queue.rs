use crate::job::{QueueMessage, Receipt};
use crate::HarvestError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Most entries a queue accepts in one send or delete call.
pub const QUEUE_BATCH_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Unique within its batch.
    pub id: String,
    pub body: String,
    pub delay_secs: u32,
    pub attributes: Vec<(String, String)>,
}

/// A per-entry failure reported by a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The stream asked us to slow down; worth one more try.
    Throttled,
    Failed { code: String, message: String },
}

#[async_trait]
pub trait QueueLenLike: Send + Sync {
    /// Visible plus delayed messages.
    async fn depth(&self) -> Result<u64, HarvestError>;
}

#[async_trait]
pub trait QueueProducerLike: QueueLenLike {
    /// Sends up to [`QUEUE_BATCH_LIMIT`] messages and returns the entries that failed.
    async fn send_batch(&self, entries: Vec<OutboundMessage>) -> Result<Vec<EntryFailure>, HarvestError>;
}

#[async_trait]
pub trait QueueConsumerLike: QueueLenLike {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, HarvestError>;
    /// Deletes up to [`QUEUE_BATCH_LIMIT`] messages and returns the entries that failed.
    async fn delete_batch(&self, receipts: &[Receipt]) -> Result<Vec<EntryFailure>, HarvestError>;
}

#[async_trait]
pub trait DeliveryStreamLike: Send + Sync {
    /// One outcome per record, index-aligned with `records`.
    async fn put_batch(&self, records: &[String]) -> Result<Vec<DeliveryOutcome>, HarvestError>;
}

/// Deletes receipts in chunks of [`QUEUE_BATCH_LIMIT`], logging instead of failing.
pub async fn delete_all<Q: QueueConsumerLike + ?Sized>(queue: &Q, receipts: &[Receipt]) -> usize {
    let mut failed = 0;
    for chunk in receipts.chunks(QUEUE_BATCH_LIMIT) {
        match queue.delete_batch(chunk).await {
            Ok(failures) if failures.is_empty() => {}
            Ok(failures) => {
                failed += failures.len();
                tracing::warn!(failed = failures.len(), total = chunk.len(), ?failures, "delete failed for some messages");
            }
            Err(e) => {
                failed += chunk.len();
                tracing::warn!(error = %e, total = chunk.len(), "delete call failed");
            }
        }
    }
    failed
}

/// Sends messages in chunks of [`QUEUE_BATCH_LIMIT`]; returns every entry that failed.
pub async fn send_all<Q: QueueProducerLike + ?Sized>(queue: &Q, entries: Vec<OutboundMessage>) -> Vec<EntryFailure> {
    let mut failures = Vec::new();
    for chunk in entries.chunks(QUEUE_BATCH_LIMIT) {
        match queue.send_batch(chunk.to_vec()).await {
            Ok(failed) => failures.extend(failed),
            Err(e) => {
                tracing::warn!(error = %e, total = chunk.len(), "send call failed");
                failures.extend(chunk.iter().map(|entry| EntryFailure {
                    id: entry.id.clone(),
                    code: "SendError".to_string(),
                    message: e.to_string(),
                }));
            }
        }
    }
    failures
}

// In-memory queue and stream. Used by tests.

#[derive(Default)]
struct MockQueueInner {
    pending: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    sent_batches: Vec<Vec<OutboundMessage>>,
    deleted: Vec<Receipt>,
    failing_send_calls: HashSet<usize>,
    send_calls: usize,
    depth_override: Option<u64>,
    next_id: usize,
}

#[derive(Default)]
pub struct MockQueue {
    inner: Mutex<MockQueueInner>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: QueueMessage) {
        self.lock().pending.push_back(message);
    }

    /// Convenience for seeding: one message per body with fresh ids.
    pub fn push_bodies<'a>(&self, bodies: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.lock();
        for body in bodies {
            inner.next_id += 1;
            let id = format!("msg-{}", inner.next_id);
            let receipt = format!("receipt-{}", inner.next_id);
            inner.pending.push_back(QueueMessage::new(&id, &receipt, body));
        }
    }

    /// Every send call made so far, in order.
    pub fn sent_batches(&self) -> Vec<Vec<OutboundMessage>> {
        self.lock().sent_batches.clone()
    }

    pub fn deleted(&self) -> Vec<Receipt> {
        self.lock().deleted.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// The nth send call (0-based) reports all of its entries as failed.
    pub fn fail_send_call(&self, call: usize) {
        self.lock().failing_send_calls.insert(call);
    }

    pub fn set_depth(&self, depth: Option<u64>) {
        self.lock().depth_override = depth;
    }

    /// Puts every undeleted in-flight message back, as a visibility timeout would.
    pub fn expire_visibility(&self) {
        let mut inner = self.lock();
        let mut returned: Vec<QueueMessage> = inner.in_flight.drain().map(|(_, m)| m).collect();
        returned.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        inner.pending.extend(returned);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockQueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueLenLike for MockQueue {
    async fn depth(&self) -> Result<u64, HarvestError> {
        let inner = self.lock();
        Ok(inner.depth_override.unwrap_or(inner.pending.len() as u64))
    }
}

#[async_trait]
impl QueueProducerLike for MockQueue {
    async fn send_batch(&self, entries: Vec<OutboundMessage>) -> Result<Vec<EntryFailure>, HarvestError> {
        if entries.len() > QUEUE_BATCH_LIMIT {
            return Err(HarvestError::Queue(format!("batch of {} exceeds limit", entries.len())));
        }
        let ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        if ids.len() != entries.len() {
            return Err(HarvestError::Queue("batch entry ids are not unique".to_string()));
        }

        let mut inner = self.lock();
        let call = inner.send_calls;
        inner.send_calls += 1;
        inner.sent_batches.push(entries.clone());

        if inner.failing_send_calls.contains(&call) {
            return Ok(entries
                .into_iter()
                .map(|e| EntryFailure {
                    id: e.id,
                    code: "InternalError".to_string(),
                    message: "injected failure".to_string(),
                })
                .collect());
        }

        for entry in entries {
            inner.next_id += 1;
            let id = format!("msg-{}", inner.next_id);
            let receipt = format!("receipt-{}", inner.next_id);
            let mut message = QueueMessage::new(&id, &receipt, &entry.body);
            for (name, value) in entry.attributes {
                message = message.with_attribute(&name, &value);
            }
            inner.pending.push_back(message);
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl QueueConsumerLike for MockQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<QueueMessage>, HarvestError> {
        let mut inner = self.lock();
        let take = usize::min(max_messages, inner.pending.len());
        let batch: Vec<QueueMessage> = inner.pending.drain(0..take).collect();
        for message in &batch {
            inner.in_flight.insert(message.receipt_token.clone(), message.clone());
        }
        Ok(batch)
    }

    async fn delete_batch(&self, receipts: &[Receipt]) -> Result<Vec<EntryFailure>, HarvestError> {
        let mut inner = self.lock();
        let mut failures = Vec::new();
        for receipt in receipts {
            if inner.in_flight.remove(&receipt.receipt_token).is_some() {
                inner.deleted.push(receipt.clone());
            } else {
                failures.push(EntryFailure {
                    id: receipt.message_id.clone(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: "unknown receipt".to_string(),
                });
            }
        }
        Ok(failures)
    }
}

#[derive(Default)]
struct MemoryStreamInner {
    records: Vec<String>,
    calls: Vec<usize>,
    throttle_next: usize,
    reject_containing: Option<String>,
}

/// Delivery stream that keeps records in memory.
#[derive(Default)]
pub struct MemoryStream {
    inner: Mutex<MemoryStreamInner>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` records put are answered with a throttling error.
    pub fn throttle_next(&self, n: usize) {
        self.lock().throttle_next = n;
    }

    /// Records containing `needle` are rejected permanently.
    pub fn reject_containing(&self, needle: &str) {
        self.lock().reject_containing = Some(needle.to_string());
    }

    pub fn records(&self) -> Vec<String> {
        self.lock().records.clone()
    }

    /// Size of each put call, in order.
    pub fn calls(&self) -> Vec<usize> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStreamInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DeliveryStreamLike for MemoryStream {
    async fn put_batch(&self, records: &[String]) -> Result<Vec<DeliveryOutcome>, HarvestError> {
        let mut inner = self.lock();
        inner.calls.push(records.len());
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            if inner.throttle_next > 0 {
                inner.throttle_next -= 1;
                outcomes.push(DeliveryOutcome::Throttled);
                continue;
            }
            let rejected = inner
                .reject_containing
                .as_deref()
                .map(|needle| record.contains(needle))
                .unwrap_or(false);
            if rejected {
                outcomes.push(DeliveryOutcome::Failed {
                    code: "InvalidArgumentException".to_string(),
                    message: "rejected".to_string(),
                });
            } else {
                inner.records.push(record.clone());
                outcomes.push(DeliveryOutcome::Delivered);
            }
        }
        Ok(outcomes)
    }
}
