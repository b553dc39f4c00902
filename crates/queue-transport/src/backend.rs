//! Queue service boundary.
//!
//! The transport never talks to a queue service directly. Everything it needs
//! from the remote side is expressed by [`QueueBackend`], one connection to the
//! service, and [`BackendConnector`], which opens such connections. Concrete
//! implementations live in [`crate::backends`].

use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of entries in one batch call
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Maximum delivery delay the backend accepts, in seconds
pub const MAX_DELAY_SECONDS: i64 = 900;

/// Maximum long-poll wait the backend accepts, in seconds
pub const MAX_WAIT_SECONDS: u64 = 20;

/// Maximum visibility timeout the backend accepts, in seconds (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u64 = 43_200;

// ============================================================================
// Error Types
// ============================================================================

/// Errors reported by a queue backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Queue does not exist: {0}")]
    QueueDoesNotExist(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Queue service error: {code} - {message}")]
    Service { code: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Connection is closed")]
    Closed,
}

impl BackendError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueDoesNotExist(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::Service { .. } => true, // Most service errors are throttling or 5xx
            Self::Network(_) => true,
            Self::Configuration(_) => false,
            Self::Closed => false,
        }
    }

    /// Attach operation context and map to a transport error
    pub fn into_transport_error(self, operation: &'static str, address: &str) -> TransportError {
        match self {
            Self::QueueDoesNotExist(_) => TransportError::QueueMissing {
                address: address.to_string(),
            },
            source => TransportError::Backend {
                operation,
                address: address.to_string(),
                source,
            },
        }
    }
}

// ============================================================================
// Request and Response Types
// ============================================================================

/// One message in a batch send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Id unique within the batch
    pub id: String,
    /// Text-safe message body
    pub body: String,
    /// String message attributes
    pub attributes: HashMap<String, String>,
    /// Delivery delay in whole seconds, if any
    pub delay_seconds: Option<i32>,
}

/// An entry the backend rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryFailure {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

/// Per-entry result of a batch send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSendOutcome {
    /// Ids of accepted entries
    pub successful: Vec<String>,
    /// Rejected entries
    pub failed: Vec<BatchEntryFailure>,
}

/// Parameters of one receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned
    pub max_messages: u32,
    /// How long to wait for a message to arrive
    pub wait_time: Duration,
    /// Visibility timeout applied to received messages
    pub visibility_timeout: Duration,
}

/// A message as the backend delivers it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Backend-assigned message id
    pub message_id: String,
    /// Handle identifying this particular receipt of the message
    pub receipt_handle: String,
    /// Text-safe message body
    pub body: String,
    /// String message attributes
    pub attributes: HashMap<String, String>,
    /// Time the backend accepted the message
    pub sent_timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// Backend Traits
// ============================================================================

/// One connection to a queue service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create queue and return its endpoint URL (idempotent)
    async fn create_queue(&self, name: &str) -> Result<String, BackendError>;

    /// Look up the endpoint URL of a queue by name
    async fn get_queue_url(&self, name: &str) -> Result<String, BackendError>;

    /// Send entries to one queue in a single call
    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchSendOutcome, BackendError>;

    /// Receive messages, hiding them for the requested visibility timeout
    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, BackendError>;

    /// Delete one received message
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), BackendError>;

    /// Delete received messages in one call, returning how many were deleted
    async fn delete_message_batch(
        &self,
        queue_url: &str,
        receipt_handles: Vec<String>,
    ) -> Result<usize, BackendError>;

    /// Change how long a received message stays invisible from now on
    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), BackendError>;

    /// Delete a queue and every message in it
    async fn delete_queue(&self, queue_url: &str) -> Result<(), BackendError>;

    /// Release resources held by this connection
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Opens backend connections
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Arc<dyn QueueBackend>, BackendError>;
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
