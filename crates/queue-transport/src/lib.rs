//! # Queue Transport
//!
//! Queue-backed message transport over AWS SQS. Moves opaque, header-tagged
//! payloads between logical addresses with at-least-once delivery.
//!
//! This library provides:
//! - Address to queue endpoint resolution with a process-wide cache
//! - Outbound batching per destination, dispatched when a unit commits
//! - Visibility leases with background renewal on received messages
//! - Deferred delivery and time-to-be-received expiry
//! - Acknowledgement driven by unit completion or abort
//!
//! ## Module Organization
//!
//! - [`transport`] - Public send/receive and queue administration surface
//! - [`unit`] - Transactional unit of work and its lifecycle hooks
//! - [`message`] - Message types, reserved headers and wire formats
//! - [`backend`] - Queue service boundary traits
//! - [`backends`] - SQS and in-memory backends
//! - [`resolver`], [`outbound`], [`lease`], [`expiry`] - Transport internals
//! - [`config`] - Layered configuration
//! - [`error`] - Error types for all transport operations

// Module declarations
pub mod backend;
pub mod backends;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod expiry;
pub mod lease;
pub mod message;
pub mod outbound;
pub mod resolver;
pub mod transport;
pub mod unit;

// Re-export commonly used types at crate root for convenience
pub use backend::{BackendConnector, BackendError, QueueBackend};
pub use backends::{InMemoryQueueBackend, SqsBackend, SqsConnector};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SqsSettings, TransportConfig};
pub use error::{
    ConfigurationError, DispatchError, EntryFailure, SerializationError, TransportError,
};
pub use lease::{Lease, LeaseSettings, LeaseState};
pub use message::{headers, OutgoingMessage, TransportMessage};
pub use transport::{MessageTransport, Transport};
pub use unit::{TransactionContext, UnitState};
