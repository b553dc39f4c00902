//! Queue backend implementations.
//!
//! - [`sqs`]: AWS SQS through `aws-sdk-sqs`
//! - [`memory`]: in-process queues for tests and local development

pub mod memory;
pub mod sqs;

pub use memory::InMemoryQueueBackend;
pub use sqs::{SqsBackend, SqsConnector};
