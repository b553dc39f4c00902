//! Outbound batching.
//!
//! Messages sent within a unit are held in a unit item until the unit
//! commits. The commit hook, registered once per unit, groups the pending
//! messages by destination and dispatches every group concurrently as batch
//! sends. A group larger than the batch limit is sent as consecutive chunks.
//!
//! A flush succeeds only if every entry of every batch was accepted.

use crate::backend::{BackendConnector, BatchEntry, QueueBackend, MAX_DELAY_SECONDS};
use crate::clock::Clock;
use crate::connection::UnitConnection;
use crate::error::{DispatchError, EntryFailure, TransportError};
use crate::message::{encode_body, headers, parse_timestamp, OutgoingMessage, TransportMessage};
use crate::resolver::AddressResolver;
use crate::unit::TransactionContext;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;

/// Longest batch entry id the backend accepts
const MAX_ENTRY_ID_LEN: usize = 80;

/// Messages waiting for their unit to commit
#[derive(Default)]
pub struct PendingMessages {
    messages: Mutex<Vec<OutgoingMessage>>,
}

impl PendingMessages {
    fn push(&self, message: OutgoingMessage) {
        self.lock().push(message);
    }

    fn take(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of messages not yet dispatched
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutgoingMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Accumulates outgoing messages per unit and dispatches them on commit
#[derive(Clone)]
pub struct OutboundBatcher {
    resolver: AddressResolver,
    clock: Arc<dyn Clock>,
    max_batch_size: usize,
    pending_key: String,
    connection_key: String,
    connector: Arc<dyn BackendConnector>,
}

impl OutboundBatcher {
    /// Create batcher
    ///
    /// `pending_key` and `connection_key` name the unit items this batcher
    /// stores its pending list and its connection under.
    pub fn new(
        resolver: AddressResolver,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn BackendConnector>,
        max_batch_size: usize,
        pending_key: impl Into<String>,
        connection_key: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            clock,
            max_batch_size: max_batch_size.max(1),
            pending_key: pending_key.into(),
            connection_key: connection_key.into(),
            connector,
        }
    }

    /// Hold a message until `unit` commits
    ///
    /// A unit that already completed, aborted or was disposed is rejected,
    /// since its commit hook can no longer run.
    pub fn enqueue(
        &self,
        message: OutgoingMessage,
        unit: &TransactionContext,
    ) -> Result<(), TransportError> {
        unit.ensure_active()?;
        let connection = UnitConnection::for_unit(unit, &self.connection_key, &self.connector)?;
        let pending = unit.get_or_add(&self.pending_key, |unit| {
            let pending = Arc::new(PendingMessages::default());
            let batcher = self.clone();
            let to_flush = Arc::clone(&pending);
            unit.on_committed(move || async move {
                let messages = to_flush.take();
                if messages.is_empty() {
                    return Ok(());
                }
                let backend = connection.backend().await?;
                batcher.dispatch(backend.as_ref(), messages).await
            });
            PendingHandle(pending)
        })?;

        debug!(
            unit_id = %unit.id(),
            destination = %message.destination(),
            "Queued outgoing message"
        );
        pending.0.push(message);
        Ok(())
    }

    /// Dispatch whatever `unit` has pending right now
    pub async fn flush(&self, unit: &TransactionContext) -> Result<(), TransportError> {
        let Some(pending) = unit.get::<PendingHandle>(&self.pending_key)? else {
            return Ok(());
        };
        let messages = pending.0.take();
        if messages.is_empty() {
            return Ok(());
        }

        let connection = UnitConnection::for_unit(unit, &self.connection_key, &self.connector)?;
        let backend = connection.backend().await?;
        self.dispatch(backend.as_ref(), messages).await
    }

    /// Number of messages `unit` has waiting
    pub fn pending_len(&self, unit: &TransactionContext) -> Result<usize, TransportError> {
        Ok(unit
            .get::<PendingHandle>(&self.pending_key)?
            .map_or(0, |pending| pending.0.len()))
    }

    /// Group messages by destination and send every group concurrently
    pub async fn dispatch(
        &self,
        backend: &dyn QueueBackend,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), TransportError> {
        let count = messages.len();
        let now = self.clock.now();
        let groups = group_by_destination(messages);
        debug!(messages = count, destinations = groups.len(), "Dispatching outgoing messages");

        let results = join_all(
            groups
                .into_iter()
                .map(|(destination, group)| self.send_group(backend, destination, group, now)),
        )
        .await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(rejected) => failures.extend(rejected),
                Err(e) => {
                    error!(error = %e, "Outgoing batch could not be sent");
                    return Err(e);
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        let err = DispatchError::new(failures);
        error!(
            failed = err.failures().len(),
            error = %err,
            "Outgoing messages rejected by queue service"
        );
        Err(err.into())
    }

    async fn send_group(
        &self,
        backend: &dyn QueueBackend,
        destination: String,
        messages: Vec<TransportMessage>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntryFailure>, TransportError> {
        let queue_url = self.resolver.resolve(&destination, backend).await?;

        let mut failures = Vec::new();
        for chunk in messages.chunks(self.max_batch_size) {
            let entries = build_entries(chunk, now);
            let message_ids: HashMap<String, String> = entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .attributes
                        .get(headers::MESSAGE_ID)
                        .map(|id| (entry.id.clone(), id.clone()))
                })
                .collect();
            let outcome = backend
                .send_message_batch(&queue_url, entries)
                .await
                .map_err(|e| e.into_transport_error("send batch", &destination))?;

            debug!(
                queue_url = %queue_url,
                sent = outcome.successful.len(),
                failed = outcome.failed.len(),
                "Sent batch"
            );
            failures.extend(outcome.failed.into_iter().map(|f| EntryFailure {
                destination: destination.clone(),
                message_id: message_ids.get(&f.id).cloned(),
                entry_id: f.id,
                code: f.code,
                message: f.message,
                sender_fault: f.sender_fault,
            }));
        }
        Ok(failures)
    }
}

/// Unit item holding the pending list shared with the commit hook
struct PendingHandle(Arc<PendingMessages>);

/// Group messages by destination, keeping first-seen destination order
fn group_by_destination(messages: Vec<OutgoingMessage>) -> Vec<(String, Vec<TransportMessage>)> {
    let mut order: Vec<(String, Vec<TransportMessage>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for outgoing in messages {
        let (destination, message) = outgoing.into_parts();
        match index.get(&destination) {
            Some(&i) => order[i].1.push(message),
            None => {
                index.insert(destination.clone(), order.len());
                order.push((destination, vec![message]));
            }
        }
    }
    order
}

/// Build the batch entries for one chunk
///
/// Headers become string attributes and the body is base64 encoded. The
/// message id header is used as entry id when it is a valid, unused id.
pub fn build_entries(messages: &[TransportMessage], now: DateTime<Utc>) -> Vec<BatchEntry> {
    let mut used_ids = HashSet::new();
    messages
        .iter()
        .map(|message| {
            let id = message
                .message_id()
                .filter(|id| is_valid_entry_id(id) && !used_ids.contains(*id))
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            used_ids.insert(id.clone());

            BatchEntry {
                id,
                body: encode_body(message.body()),
                attributes: message.headers().clone(),
                delay_seconds: delay_seconds(message.header(headers::DEFERRED_UNTIL), now),
            }
        })
        .collect()
}

/// Delivery delay for a deferred-until header value
///
/// `ceil(deferred_until - now)` whole seconds, clamped to the backend's
/// delay range. No header means no delay.
pub fn delay_seconds(deferred_until: Option<&str>, now: DateTime<Utc>) -> Option<i32> {
    let raw = deferred_until?;
    let until = match parse_timestamp(headers::DEFERRED_UNTIL, raw) {
        Ok(until) => until,
        Err(e) => {
            warn!(error = %e, "Sending without delay");
            return None;
        }
    };

    let remaining = until - now;
    if remaining <= chrono::Duration::zero() {
        return Some(0);
    }

    let mut seconds = remaining.num_seconds();
    if remaining > chrono::Duration::seconds(seconds) {
        seconds += 1;
    }
    Some(seconds.min(MAX_DELAY_SECONDS) as i32)
}

fn is_valid_entry_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ENTRY_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
