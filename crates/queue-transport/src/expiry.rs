//! Message expiry evaluation.
//!
//! A message carrying a time-to-be-received header is expired when either the
//! sender's clock or the backend's clock says it is older than that span:
//!
//! 1. `now - sent-time header > ttl`
//! 2. `now - backend sent timestamp > ttl`
//!
//! The two checks are combined with a logical OR.

use crate::backend::QueueMessage;
use crate::clock::Clock;
use crate::message::{headers, parse_time_span, parse_timestamp};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "expiry_tests.rs"]
mod tests;

/// Decides whether received messages have outlived their time-to-be-received
#[derive(Clone)]
pub struct ExpiryEvaluator {
    clock: Arc<dyn Clock>,
}

impl ExpiryEvaluator {
    /// Create evaluator reading time from the given clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Evaluate a message against a single read of the clock
    pub fn is_expired(&self, message: &QueueMessage) -> bool {
        is_expired(message, self.clock.now())
    }
}

/// Check whether a message is expired at `now`
///
/// Messages without a time-to-be-received header never expire. A header that
/// does not parse is treated as absent.
pub fn is_expired(message: &QueueMessage, now: DateTime<Utc>) -> bool {
    let Some(raw_ttl) = message.attributes.get(headers::TIME_TO_BE_RECEIVED) else {
        return false;
    };

    let ttl = match parse_time_span(raw_ttl) {
        Ok(ttl) => ttl,
        Err(e) => {
            warn!(
                message_id = %message.message_id,
                error = %e,
                "Ignoring unparsable time-to-be-received header"
            );
            return false;
        }
    };

    let expired_by_sender = message
        .attributes
        .get(headers::SENT_TIME)
        .and_then(|raw| match parse_timestamp(headers::SENT_TIME, raw) {
            Ok(sent) => Some(sent),
            Err(e) => {
                debug!(message_id = %message.message_id, error = %e, "Skipping sender clock expiry check");
                None
            }
        })
        .is_some_and(|sent| now - sent > ttl);

    let expired_by_backend = message
        .sent_timestamp
        .is_some_and(|sent| now - sent > ttl);

    expired_by_sender || expired_by_backend
}
