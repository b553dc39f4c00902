//! Error types for transport operations.

use crate::backend::BackendError;
use std::fmt;
use thiserror::Error;

/// Comprehensive error type for all transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid argument '{name}': {message}")]
    Argument { name: String, message: String },

    #[error("Invalid address '{address}': {message}")]
    AddressFormat { address: String, message: String },

    #[error("Could not resolve queue endpoint for '{address}': {source}")]
    Resolution {
        address: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Queue does not exist: {address}")]
    QueueMissing { address: String },

    #[error("Lease renewal failed for message {message_id}: {source}")]
    LeaseRenewal {
        message_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Could not initialize input queue '{address}': {source}")]
    Initialization {
        address: String,
        #[source]
        source: Box<TransportError>,
    },

    #[error("Transport has no input queue and can only send")]
    NotInitialized,

    #[error("{operation} failed for '{address}': {source}")]
    Backend {
        operation: &'static str,
        address: String,
        #[source]
        source: BackendError,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transaction context error: {message}")]
    Unit { message: String },
}

impl TransportError {
    /// Build an argument error
    pub fn argument(name: &str, message: impl Into<String>) -> Self {
        Self::Argument {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Argument { .. } => false,
            Self::AddressFormat { .. } => false,
            Self::Resolution { source, .. } => source.is_transient(),
            Self::Dispatch(err) => err.is_transient(),
            Self::QueueMissing { .. } => false,
            Self::LeaseRenewal { source, .. } => source.is_transient(),
            Self::Initialization { source, .. } => source.is_transient(),
            Self::NotInitialized => false,
            Self::Backend { source, .. } => source.is_transient(),
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Unit { .. } => false,
        }
    }

    /// Check if the error means the addressed queue does not exist
    ///
    /// Covers both an explicit `QueueMissing` and a resolution failure caused
    /// by the backend reporting an unknown queue.
    pub fn is_queue_missing(&self) -> bool {
        match self {
            Self::QueueMissing { .. } => true,
            Self::Resolution { source, .. } => matches!(source, BackendError::QueueDoesNotExist(_)),
            _ => false,
        }
    }
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// A single batch entry the backend refused to accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    /// Destination address the entry was sent to
    pub destination: String,
    /// Batch entry id reported by the backend
    pub entry_id: String,
    /// Message id header of the rejected message, which differs from
    /// `entry_id` when the header was not usable as an entry id
    pub message_id: Option<String>,
    /// Backend error code
    pub code: String,
    /// Backend error message
    pub message: String,
    /// Whether the backend attributes the failure to the sender
    pub sender_fault: bool,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry '{}'", self.entry_id)?;
        if let Some(message_id) = &self.message_id {
            write!(f, " (message '{}')", message_id)?;
        }
        write!(
            f,
            " to '{}': {} - {} (sender fault: {})",
            self.destination, self.code, self.message, self.sender_fault
        )
    }
}

/// Aggregated failures of one outbound flush
///
/// A flush either dispatches every pending message or fails as a whole with
/// one sub-error per rejected entry.
#[derive(Debug, Clone, Error)]
#[error("{} outgoing message(s) could not be sent: {}", .failures.len(), summarize(.failures))]
pub struct DispatchError {
    failures: Vec<EntryFailure>,
}

impl DispatchError {
    /// Create dispatch error from per-entry failures
    pub fn new(failures: Vec<EntryFailure>) -> Self {
        Self { failures }
    }

    /// Get the individual entry failures
    pub fn failures(&self) -> &[EntryFailure] {
        &self.failures
    }

    /// A flush is worth retrying only if no failure was the sender's fault
    pub fn is_transient(&self) -> bool {
        !self.failures.iter().any(|f| f.sender_fault)
    }
}

fn summarize(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors during message encoding/decoding
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Message body is not valid base64: {message}")]
    InvalidBody { message: String },

    #[error("Header '{key}' has invalid timestamp value '{value}'")]
    InvalidTimestamp { key: String, value: String },

    #[error("Invalid time span '{value}'")]
    InvalidTimeSpan { value: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
