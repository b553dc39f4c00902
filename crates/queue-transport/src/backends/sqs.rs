//! AWS SQS backend.
//!
//! [`SqsConnector`] loads the AWS SDK configuration once (region and endpoint
//! override from [`SqsSettings`], credentials from the default provider chain)
//! and hands out one [`SqsBackend`] client per connection.

use crate::backend::{
    BackendConnector, BackendError, BatchEntry, BatchEntryFailure, BatchSendOutcome, QueueBackend,
    QueueMessage, ReceiveRequest, MAX_VISIBILITY_TIMEOUT_SECONDS, MAX_WAIT_SECONDS,
};
use crate::config::SqsSettings;
use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message, MessageAttributeValue, MessageSystemAttributeName,
    SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// Error codes SQS reports for an unknown queue
const QUEUE_MISSING_CODES: &[&str] = &["AWS.SimpleQueueService.NonExistentQueue", "QueueDoesNotExist"];

/// Error codes SQS reports for a stale or malformed receipt handle
const INVALID_RECEIPT_CODES: &[&str] = &["ReceiptHandleIsInvalid", "InvalidReceiptHandle"];

// ============================================================================
// Connector
// ============================================================================

/// Opens SQS connections from a shared SDK configuration
#[derive(Clone)]
pub struct SqsConnector {
    sdk_config: aws_config::SdkConfig,
}

impl SqsConnector {
    /// Load the SDK configuration for the given settings
    pub async fn from_settings(settings: &SqsSettings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        debug!(
            region = ?sdk_config.region(),
            endpoint_override = settings.endpoint_url.is_some(),
            "Loaded AWS SDK configuration"
        );
        Self { sdk_config }
    }

    /// Use an already loaded SDK configuration
    pub fn from_sdk_config(sdk_config: aws_config::SdkConfig) -> Self {
        Self { sdk_config }
    }
}

#[async_trait]
impl BackendConnector for SqsConnector {
    async fn connect(&self) -> Result<Arc<dyn QueueBackend>, BackendError> {
        Ok(Arc::new(SqsBackend::new(Client::new(&self.sdk_config))))
    }
}

// ============================================================================
// Backend
// ============================================================================

/// One SQS client connection
#[derive(Debug, Clone)]
pub struct SqsBackend {
    client: Client,
}

impl SqsBackend {
    /// Wrap an SDK client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn create_queue(&self, name: &str) -> Result<String, BackendError> {
        let output = self
            .client
            .create_queue()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, name))?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateQueue", "QueueUrl"))
    }

    async fn get_queue_url(&self, name: &str) -> Result<String, BackendError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, name))?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| missing_field("GetQueueUrl", "QueueUrl"))
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchSendOutcome, BackendError> {
        let entries = entries
            .into_iter()
            .map(to_sdk_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;

        Ok(BatchSendOutcome {
            successful: output.successful().iter().map(|s| s.id().to_string()).collect(),
            failed: output
                .failed()
                .iter()
                .map(|f| BatchEntryFailure {
                    id: f.id().to_string(),
                    code: f.code().to_string(),
                    message: f.message().unwrap_or("unknown").to_string(),
                    sender_fault: f.sender_fault(),
                })
                .collect(),
        })
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, BackendError> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(request.max_messages.clamp(1, 10) as i32)
            .wait_time_seconds(whole_seconds(request.wait_time, MAX_WAIT_SECONDS))
            .visibility_timeout(whole_seconds(
                request.visibility_timeout,
                MAX_VISIBILITY_TIMEOUT_SECONDS,
            ))
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;

        Ok(output.messages().iter().filter_map(from_sdk_message).collect())
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), BackendError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;
        Ok(())
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        receipt_handles: Vec<String>,
    ) -> Result<usize, BackendError> {
        if receipt_handles.is_empty() {
            return Ok(0);
        }

        let entries = receipt_handles
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(format!("del_{}", i))
                    .receipt_handle(handle)
                    .build()
                    .map_err(|e| BackendError::Configuration(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;

        for failure in output.failed() {
            warn!(
                queue_url = %queue_url,
                entry = %failure.id(),
                code = %failure.code(),
                "Batch delete entry failed"
            );
        }
        Ok(output.successful().len())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), BackendError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(whole_seconds(
                visibility_timeout,
                MAX_VISIBILITY_TIMEOUT_SECONDS,
            ))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), BackendError> {
        self.client
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, queue_url))?;
        Ok(())
    }
}

// ============================================================================
// Conversion Helpers
// ============================================================================

fn to_sdk_entry(entry: BatchEntry) -> Result<SendMessageBatchRequestEntry, BackendError> {
    let attributes = entry
        .attributes
        .into_iter()
        .map(|(key, value)| {
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map(|attribute| (key, attribute))
                .map_err(|e| BackendError::Configuration(e.to_string()))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    SendMessageBatchRequestEntry::builder()
        .id(entry.id)
        .message_body(entry.body)
        .set_delay_seconds(entry.delay_seconds)
        .set_message_attributes(if attributes.is_empty() {
            None
        } else {
            Some(attributes)
        })
        .build()
        .map_err(|e| BackendError::Configuration(e.to_string()))
}

fn from_sdk_message(message: &Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle() else {
        warn!(message_id = ?message.message_id(), "Skipping message without receipt handle");
        return None;
    };

    let attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .string_value()
                        .map(|v| (key.clone(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let sent_timestamp = message
        .attributes()
        .and_then(|system| system.get(&MessageSystemAttributeName::SentTimestamp))
        .and_then(|raw| parse_sent_timestamp(raw));

    Some(QueueMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        receipt_handle: receipt_handle.to_string(),
        body: message.body().unwrap_or_default().to_string(),
        attributes,
        sent_timestamp,
    })
}

/// Parse the `SentTimestamp` system attribute (epoch milliseconds)
fn parse_sent_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Whole seconds of `duration`, capped at `max`
fn whole_seconds(duration: Duration, max: u64) -> i32 {
    duration.as_secs().min(max) as i32
}

fn missing_field(operation: &str, field: &str) -> BackendError {
    BackendError::Service {
        code: "MissingField".to_string(),
        message: format!("{} response has no {}", operation, field),
    }
}

/// Classify an SQS service error by its code
fn classify_service_error(code: &str, message: &str, target: &str) -> BackendError {
    if QUEUE_MISSING_CODES.contains(&code) {
        BackendError::QueueDoesNotExist(target.to_string())
    } else if INVALID_RECEIPT_CODES.contains(&code) {
        BackendError::InvalidReceipt(message.to_string())
    } else {
        BackendError::Service {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>, target: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service) = &err {
        let code = service.err().code().unwrap_or("Unknown");
        let message = service.err().message().unwrap_or_default();
        return classify_service_error(code, message, target);
    }
    BackendError::Network(DisplayErrorContext(&err).to_string())
}
