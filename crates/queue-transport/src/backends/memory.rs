//! In-memory queue backend for testing and development.
//!
//! This backend provides a fully functional in-process queue service that:
//! - Implements visibility timeouts, receipt handles and delivery delays
//! - Stamps every message with a backend send time from an injected clock
//! - Records every call so tests can assert on exact backend traffic
//! - Supports failure injection for batch entries and visibility changes
//!
//! All connections opened from one backend share the same queues.

use crate::backend::{
    BackendConnector, BackendError, BatchEntry, BatchEntryFailure, BatchSendOutcome, QueueBackend,
    QueueMessage, ReceiveRequest,
};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const BASE_URL: &str = "https://memory.queue.local/000000000000";

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct SharedState {
    queues: HashMap<String, InMemoryQueue>,
    calls: RecordedCalls,
    rejected_entry_ids: HashSet<String>,
    failing_visibility_changes: usize,
    next_receipt: u64,
    next_message: u64,
}

#[derive(Default)]
struct InMemoryQueue {
    messages: Vec<StoredMessage>,
}

/// A message stored in a queue with delivery metadata
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    sent_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}

/// One recorded batch send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub queue_url: String,
    pub entries: Vec<BatchEntry>,
}

/// Snapshot of every call made against the backend
#[derive(Debug, Clone, Default)]
pub struct RecordedCalls {
    pub created_queues: Vec<String>,
    pub queue_url_lookups: Vec<String>,
    pub batches: Vec<RecordedBatch>,
    pub receives: usize,
    pub deleted_receipts: Vec<String>,
    pub visibility_changes: Vec<(String, Duration)>,
    pub deleted_queues: Vec<String>,
    pub connections_opened: usize,
    pub connections_closed: usize,
}

// ============================================================================
// InMemoryQueueBackend
// ============================================================================

/// In-memory queue backend
///
/// Cloning yields another handle to the same queues. Each handle returned by
/// [`BackendConnector::connect`] can be closed independently.
#[derive(Clone)]
pub struct InMemoryQueueBackend {
    shared: Arc<Mutex<SharedState>>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

impl InMemoryQueueBackend {
    /// Create backend whose timestamps come from the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedState {
                queues: HashMap::new(),
                calls: RecordedCalls::default(),
                rejected_entry_ids: HashSet::new(),
                failing_visibility_changes: 0,
                next_receipt: 0,
                next_message: 0,
            })),
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create backend with the given queues already present
    pub fn with_queues(clock: Arc<dyn Clock>, names: &[&str]) -> Self {
        let backend = Self::new(clock);
        {
            let mut state = backend.state();
            for name in names {
                state.queues.insert(name.to_string(), InMemoryQueue::default());
            }
        }
        backend
    }

    /// Endpoint URL this backend assigns to a queue name
    pub fn queue_url_for(name: &str) -> String {
        format!("{}/{}", BASE_URL, name)
    }

    /// Snapshot of recorded calls
    pub fn calls(&self) -> RecordedCalls {
        self.state().calls.clone()
    }

    /// Check whether a queue exists
    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    /// Number of messages stored in a queue, visible or not
    pub fn message_count(&self, name: &str) -> usize {
        self.state()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Number of messages currently visible to consumers
    pub fn visible_count(&self, name: &str) -> usize {
        let now = self.clock.now();
        self.state()
            .queues
            .get(name)
            .map(|q| q.messages.iter().filter(|m| m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Place a message directly into a queue, bypassing the send path
    ///
    /// Lets tests control the backend send timestamp. The message is visible
    /// immediately.
    pub fn inject(
        &self,
        queue: &str,
        body: &str,
        attributes: HashMap<String, String>,
        sent_at: DateTime<Utc>,
    ) -> Result<String, BackendError> {
        let visible_at = self.clock.now();
        let mut state = self.state();
        let message_id = Self::next_message_id(&mut state);
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::QueueDoesNotExist(queue.to_string()))?;
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            attributes,
            sent_at,
            visible_at,
            receipt_handle: None,
        });
        Ok(message_id)
    }

    /// Make future batch sends reject entries with this id
    pub fn reject_entry(&self, entry_id: &str) {
        self.state().rejected_entry_ids.insert(entry_id.to_string());
    }

    /// Make the next `count` visibility changes fail with a network error
    pub fn fail_visibility_changes(&self, count: usize) {
        self.state().failing_visibility_changes = count;
    }

    fn state(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    fn next_message_id(state: &mut SharedState) -> String {
        state.next_message += 1;
        format!("mem-{:08}", state.next_message)
    }

    fn queue_name(queue_url: &str) -> Result<&str, BackendError> {
        queue_url
            .strip_prefix(BASE_URL)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .ok_or_else(|| BackendError::QueueDoesNotExist(queue_url.to_string()))
    }

    fn queue_mut<'a>(
        state: &'a mut SharedState,
        queue_url: &str,
    ) -> Result<&'a mut InMemoryQueue, BackendError> {
        let name = Self::queue_name(queue_url)?;
        state
            .queues
            .get_mut(name)
            .ok_or_else(|| BackendError::QueueDoesNotExist(queue_url.to_string()))
    }

    fn take_visible(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, BackendError> {
        let now = self.clock.now();
        let visibility = to_chrono(request.visibility_timeout);
        let mut state = self.state();
        let first_receipt = state.next_receipt;
        let queue = Self::queue_mut(&mut state, queue_url)?;

        let mut received = Vec::new();
        let mut receipt = first_receipt;
        for message in queue
            .messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(request.max_messages as usize)
        {
            receipt += 1;
            let handle = format!("receipt-{}-{}", message.message_id, receipt);
            message.receipt_handle = Some(handle.clone());
            message.visible_at = now + visibility;
            received.push(QueueMessage {
                message_id: message.message_id.clone(),
                receipt_handle: handle,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                sent_timestamp: Some(message.sent_at),
            });
        }
        state.next_receipt = receipt;
        Ok(received)
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn create_queue(&self, name: &str) -> Result<String, BackendError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.calls.created_queues.push(name.to_string());
        state.queues.entry(name.to_string()).or_default();
        Ok(Self::queue_url_for(name))
    }

    async fn get_queue_url(&self, name: &str) -> Result<String, BackendError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.calls.queue_url_lookups.push(name.to_string());
        if state.queues.contains_key(name) {
            Ok(Self::queue_url_for(name))
        } else {
            Err(BackendError::QueueDoesNotExist(name.to_string()))
        }
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchSendOutcome, BackendError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state();
        state.calls.batches.push(RecordedBatch {
            queue_url: queue_url.to_string(),
            entries: entries.clone(),
        });

        let rejected = state.rejected_entry_ids.clone();
        let mut stored = Vec::new();
        let mut outcome = BatchSendOutcome::default();
        for entry in entries {
            if rejected.contains(&entry.id) {
                outcome.failed.push(BatchEntryFailure {
                    id: entry.id,
                    code: "InvalidParameterValue".to_string(),
                    message: "entry rejected".to_string(),
                    sender_fault: true,
                });
                continue;
            }
            let delay = chrono::Duration::seconds(i64::from(entry.delay_seconds.unwrap_or(0)));
            stored.push(StoredMessage {
                message_id: Self::next_message_id(&mut state),
                body: entry.body,
                attributes: entry.attributes,
                sent_at: now,
                visible_at: now + delay,
                receipt_handle: None,
            });
            outcome.successful.push(entry.id);
        }

        Self::queue_mut(&mut state, queue_url)?.messages.extend(stored);
        Ok(outcome)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, BackendError> {
        self.ensure_open()?;
        self.state().calls.receives += 1;

        let received = self.take_visible(queue_url, request)?;
        if !received.is_empty() || request.wait_time.is_zero() {
            return Ok(received);
        }

        tokio::time::sleep(request.wait_time).await;
        self.take_visible(queue_url, request)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.calls.deleted_receipts.push(receipt_handle.to_string());
        let queue = Self::queue_mut(&mut state, queue_url)?;
        let position = queue
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| BackendError::InvalidReceipt(receipt_handle.to_string()))?;
        queue.messages.remove(position);
        Ok(())
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        receipt_handles: Vec<String>,
    ) -> Result<usize, BackendError> {
        self.ensure_open()?;
        let mut state = self.state();
        state
            .calls
            .deleted_receipts
            .extend(receipt_handles.iter().cloned());
        let queue = Self::queue_mut(&mut state, queue_url)?;
        let before = queue.messages.len();
        queue.messages.retain(|m| {
            m.receipt_handle
                .as_ref()
                .map_or(true, |h| !receipt_handles.contains(h))
        });
        Ok(before - queue.messages.len())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state();
        state
            .calls
            .visibility_changes
            .push((receipt_handle.to_string(), visibility_timeout));

        if state.failing_visibility_changes > 0 {
            state.failing_visibility_changes -= 1;
            return Err(BackendError::Network("injected failure".to_string()));
        }

        let queue = Self::queue_mut(&mut state, queue_url)?;
        let message = queue
            .messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| BackendError::InvalidReceipt(receipt_handle.to_string()))?;
        message.visible_at = now + to_chrono(visibility_timeout);
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut state = self.state();
        state.calls.deleted_queues.push(queue_url.to_string());
        let name = Self::queue_name(queue_url)?.to_string();
        state
            .queues
            .remove(&name)
            .map(|_| ())
            .ok_or(BackendError::QueueDoesNotExist(queue_url.to_string()))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state().calls.connections_closed += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConnector for InMemoryQueueBackend {
    async fn connect(&self) -> Result<Arc<dyn QueueBackend>, BackendError> {
        self.state().calls.connections_opened += 1;
        Ok(Arc::new(Self {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}
