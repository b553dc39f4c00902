//! Transport facade.
//!
//! [`Transport`] is the public surface of the crate. It composes the address
//! resolver, the outbound batcher, the expiry evaluator and the lease manager
//! and ties them to a [`TransactionContext`]:
//!
//! - `send` queues a message in the unit; it is dispatched when the unit commits
//! - `receive` takes at most one message from the input queue and leases it;
//!   completing the unit deletes the message, aborting it makes the message
//!   visible again right away
//!
//! Queue administration (`create_queue`, `purge`, `delete_queue`) uses a
//! short-lived connection of its own.

use crate::backend::{BackendConnector, QueueBackend, ReceiveRequest, MAX_BATCH_ENTRIES};
use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::connection::UnitConnection;
use crate::error::TransportError;
use crate::expiry::ExpiryEvaluator;
use crate::lease::{Lease, LeaseSettings};
use crate::message::{decode_body, OutgoingMessage, TransportMessage};
use crate::outbound::OutboundBatcher;
use crate::resolver::AddressResolver;
use crate::unit::TransactionContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Visibility timeout of messages received while purging
const PURGE_VISIBILITY: Duration = Duration::from_secs(30);

/// Long-poll wait of each purge receive
const PURGE_WAIT: Duration = Duration::from_secs(1);

/// Consecutive empty receives after which a purged queue counts as drained
const PURGE_EMPTY_RECEIVES: usize = 3;

// ============================================================================
// MessageTransport Trait
// ============================================================================

/// Send and receive seam for hosts of the transport
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Address of the input queue, `None` for a send-only transport
    fn address(&self) -> Option<&str>;

    /// Queue a message for dispatch when `unit` commits
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        unit: &TransactionContext,
    ) -> Result<(), TransportError>;

    /// Receive at most one message within `unit`
    async fn receive(
        &self,
        unit: &TransactionContext,
        cancellation: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;
}

// ============================================================================
// Transport
// ============================================================================

/// Queue-backed message transport
pub struct Transport {
    config: TransportConfig,
    connector: Arc<dyn BackendConnector>,
    resolver: AddressResolver,
    outbound: OutboundBatcher,
    expiry: ExpiryEvaluator,
    lease_settings: LeaseSettings,
    connection_key: String,
    input_queue_url: OnceCell<String>,
}

impl Transport {
    /// Create transport
    ///
    /// # Errors
    /// Returns [`TransportError::AddressFormat`] for a malformed input queue
    /// address and [`TransportError::Configuration`] for invalid settings.
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn BackendConnector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransportError> {
        if let Some(input) = &config.input_queue {
            AddressResolver::validate(input)?;
        }
        config.validate()?;

        let instance = uuid::Uuid::new_v4();
        let connection_key = format!("queue-transport/{}/connection", instance);
        let resolver = AddressResolver::new();
        let outbound = OutboundBatcher::new(
            resolver.clone(),
            Arc::clone(&clock),
            Arc::clone(&connector),
            config.max_batch_size.min(MAX_BATCH_ENTRIES),
            format!("queue-transport/{}/outgoing", instance),
            connection_key.clone(),
        );

        Ok(Self {
            lease_settings: LeaseSettings::new(config.lease_duration()),
            expiry: ExpiryEvaluator::new(clock),
            config,
            connector,
            resolver,
            outbound,
            connection_key,
            input_queue_url: OnceCell::new(),
        })
    }

    /// Prepare the input queue
    ///
    /// Creates the input queue when `create_queues` is set, then resolves its
    /// endpoint. Does nothing for a send-only transport.
    ///
    /// # Errors
    /// Any failure is wrapped in [`TransportError::Initialization`].
    pub async fn initialize(&self) -> Result<(), TransportError> {
        let Some(input) = self.config.input_queue.as_deref() else {
            info!("Send-only transport; no input queue to initialize");
            return Ok(());
        };

        let url = self
            .input_queue_url
            .get_or_try_init(|| async {
                let backend = self.admin_backend(input).await?;
                let result = self.prepare_input_queue(backend.as_ref(), input).await;
                close_admin_backend(backend.as_ref()).await;
                result
            })
            .await
            .map_err(|e| TransportError::Initialization {
                address: input.to_string(),
                source: Box::new(e),
            })?;

        info!(input_queue = %input, queue_url = %url, "Transport initialized");
        Ok(())
    }

    async fn prepare_input_queue(
        &self,
        backend: &dyn QueueBackend,
        input: &str,
    ) -> Result<String, TransportError> {
        if self.config.create_queues {
            let name = AddressResolver::queue_name(input)?;
            backend
                .create_queue(&name)
                .await
                .map_err(|e| e.into_transport_error("create queue", input))?;
            debug!(queue = %name, "Ensured input queue exists");
        }
        self.resolver.resolve(input, backend).await
    }

    /// Resolved endpoint of the input queue, once initialized
    pub fn input_queue_url(&self) -> Option<&str> {
        self.input_queue_url.get().map(String::as_str)
    }

    /// Configuration the transport was built with
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Queue `message` for `destination`; it is sent when `unit` commits
    pub fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        unit: &TransactionContext,
    ) -> Result<(), TransportError> {
        if destination.is_empty() {
            return Err(TransportError::argument("destination", "must not be empty"));
        }
        AddressResolver::validate(destination)?;
        self.outbound
            .enqueue(OutgoingMessage::new(destination, message), unit)
    }

    /// Receive at most one message from the input queue
    ///
    /// Returns `Ok(None)` when no message arrives within the receive wait,
    /// when `cancellation` fires during the wait, or when the received message
    /// had already expired (it is deleted). A live message stays leased until
    /// `unit` completes (delete), aborts (release) or is disposed.
    ///
    /// # Errors
    /// Returns [`TransportError::Unit`] if `unit` is no longer active.
    pub async fn receive(
        &self,
        unit: &TransactionContext,
        cancellation: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let queue_url = self
            .input_queue_url
            .get()
            .ok_or(TransportError::NotInitialized)?
            .clone();
        unit.ensure_active()?;

        let connection = UnitConnection::for_unit(unit, &self.connection_key, &self.connector)?;
        let backend = connection.backend().await?;
        let request = ReceiveRequest {
            max_messages: 1,
            wait_time: self.config.receive_wait(),
            visibility_timeout: self.lease_settings.lease_duration(),
        };

        let received = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!(queue_url = %queue_url, "Receive cancelled");
                return Ok(None);
            }
            result = backend.receive_messages(&queue_url, &request) => {
                result.map_err(|e| e.into_transport_error("receive", &queue_url))?
            }
        };

        let Some(message) = received.into_iter().next() else {
            return Ok(None);
        };

        if let Err(e) = unit.ensure_active() {
            warn!(
                unit_id = %unit.id(),
                message_id = %message.message_id,
                "Unit ended while receiving; releasing message"
            );
            if let Err(release) = backend
                .change_message_visibility(&queue_url, &message.receipt_handle, Duration::ZERO)
                .await
            {
                warn!(error = %release, queue_url = %queue_url, "Failed to release message");
            }
            return Err(e);
        }

        if self.expiry.is_expired(&message) {
            info!(
                message_id = %message.message_id,
                queue_url = %queue_url,
                "Discarding expired message"
            );
            backend
                .delete_message(&queue_url, &message.receipt_handle)
                .await
                .map_err(|e| e.into_transport_error("delete expired message", &queue_url))?;
            return Ok(None);
        }

        let body = decode_body(&message.body)?;

        let lease = Lease::start(
            Arc::clone(&backend),
            queue_url,
            message.receipt_handle,
            message.message_id.clone(),
            self.lease_settings,
        );
        let on_complete = Arc::clone(&lease);
        unit.on_completed(move || async move { on_complete.acknowledge().await });
        let on_abort = Arc::clone(&lease);
        unit.on_aborted(move || async move { on_abort.release().await });
        unit.on_disposed(move || async move { lease.dispose().await });

        debug!(unit_id = %unit.id(), message_id = %message.message_id, "Received message");
        Ok(Some(TransportMessage::new(message.attributes, body)))
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Create a queue, returning its endpoint URL
    ///
    /// For an endpoint URL address the last path segment is the queue name.
    pub async fn create_queue(&self, address: &str) -> Result<String, TransportError> {
        let name = AddressResolver::queue_name(address)?;
        let backend = self.admin_backend(address).await?;
        let result = backend
            .create_queue(&name)
            .await
            .map_err(|e| e.into_transport_error("create queue", address));
        close_admin_backend(backend.as_ref()).await;

        let url = result?;
        info!(queue = %name, queue_url = %url, "Queue created");
        Ok(url)
    }

    /// Delete every message currently in a queue, returning how many were removed
    ///
    /// Purging a queue that does not exist does nothing.
    pub async fn purge(&self, address: &str) -> Result<usize, TransportError> {
        AddressResolver::validate(address)?;
        let backend = self.admin_backend(address).await?;
        let result = self.drain(backend.as_ref(), address).await;
        close_admin_backend(backend.as_ref()).await;

        match result {
            Ok(removed) => {
                info!(address = %address, removed, "Queue purged");
                Ok(removed)
            }
            Err(e) if e.is_queue_missing() => {
                info!(address = %address, "Queue does not exist; nothing to purge");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn drain(&self, backend: &dyn QueueBackend, address: &str) -> Result<usize, TransportError> {
        let queue_url = self.resolver.resolve(address, backend).await?;
        let request = ReceiveRequest {
            max_messages: MAX_BATCH_ENTRIES as u32,
            wait_time: PURGE_WAIT,
            visibility_timeout: PURGE_VISIBILITY,
        };

        let mut removed = 0;
        let mut empty_receives = 0;
        while empty_receives < PURGE_EMPTY_RECEIVES {
            let batch = backend
                .receive_messages(&queue_url, &request)
                .await
                .map_err(|e| e.into_transport_error("receive", &queue_url))?;
            if batch.is_empty() {
                empty_receives += 1;
                continue;
            }
            empty_receives = 0;

            let handles = batch.into_iter().map(|m| m.receipt_handle).collect();
            removed += backend
                .delete_message_batch(&queue_url, handles)
                .await
                .map_err(|e| e.into_transport_error("delete batch", &queue_url))?;
        }
        Ok(removed)
    }

    /// Delete a queue and everything in it
    pub async fn delete_queue(&self, address: &str) -> Result<(), TransportError> {
        AddressResolver::validate(address)?;
        let backend = self.admin_backend(address).await?;
        let result = async {
            let queue_url = self
                .resolver
                .resolve(address, backend.as_ref())
                .await
                .map_err(|e| match e {
                    e if e.is_queue_missing() => TransportError::QueueMissing {
                        address: address.to_string(),
                    },
                    e => e,
                })?;
            backend
                .delete_queue(&queue_url)
                .await
                .map_err(|e| e.into_transport_error("delete queue", address))
        }
        .await;
        close_admin_backend(backend.as_ref()).await;

        result?;
        info!(address = %address, "Queue deleted");
        Ok(())
    }

    async fn admin_backend(&self, address: &str) -> Result<Arc<dyn QueueBackend>, TransportError> {
        self.connector
            .connect()
            .await
            .map_err(|e| e.into_transport_error("connect", address))
    }
}

async fn close_admin_backend(backend: &dyn QueueBackend) {
    if let Err(e) = backend.close().await {
        warn!(error = %e, "Failed to close admin connection");
    }
}

#[async_trait]
impl MessageTransport for Transport {
    fn address(&self) -> Option<&str> {
        self.config.input_queue.as_deref()
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        unit: &TransactionContext,
    ) -> Result<(), TransportError> {
        Transport::send(self, destination, message, unit)
    }

    async fn receive(
        &self,
        unit: &TransactionContext,
        cancellation: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        Transport::receive(self, unit, cancellation).await
    }
}
