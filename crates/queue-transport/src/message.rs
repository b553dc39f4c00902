//! Message types carried by the transport, reserved header keys and the
//! text formats used to put them on the wire.

use crate::error::SerializationError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::HashMap;

/// Reserved header keys with transport-level meaning
pub mod headers {
    /// Unique identifier of the message
    pub const MESSAGE_ID: &str = "msg-id";

    /// Earliest time the message may be delivered (ISO-8601 with offset)
    pub const DEFERRED_UNTIL: &str = "deferred-until";

    /// Maximum age of the message as a time span (`[d.]hh:mm:ss[.fffffff]`)
    pub const TIME_TO_BE_RECEIVED: &str = "time-to-be-received";

    /// Time the sender produced the message (ISO-8601, round-trip precision)
    pub const SENT_TIME: &str = "sent-time";
}

// ============================================================================
// Message Types
// ============================================================================

/// An opaque payload with string headers
///
/// Transport messages are immutable once built; the transport never looks
/// inside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    headers: HashMap<String, String>,
    body: Bytes,
}

impl TransportMessage {
    /// Create new message from headers and body
    pub fn new(headers: HashMap<String, String>, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Create message with a fresh random message id and no other headers
    pub fn with_generated_id(body: impl Into<Bytes>) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            headers::MESSAGE_ID.to_string(),
            uuid::Uuid::new_v4().to_string(),
        );
        Self::new(headers, body)
    }

    /// Return a copy of this message with one header added or replaced
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get all headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Get a single header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Get the message id header, if set
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Get message body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Split message into headers and body
    pub fn into_parts(self) -> (HashMap<String, String>, Bytes) {
        (self.headers, self.body)
    }
}

/// A message waiting in a transactional unit for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    destination: String,
    message: TransportMessage,
}

impl OutgoingMessage {
    /// Create outgoing message for a destination address
    pub fn new(destination: impl Into<String>, message: TransportMessage) -> Self {
        Self {
            destination: destination.into(),
            message,
        }
    }

    /// Get destination address
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Get the message
    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// Split into destination and message
    pub fn into_parts(self) -> (String, TransportMessage) {
        (self.destination, self.message)
    }
}

// ============================================================================
// Wire Formats
// ============================================================================

/// Encode a body for transport as standard base64 text
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode a body received as base64 text back into raw bytes
pub fn decode_body(text: &str) -> Result<Bytes, SerializationError> {
    STANDARD
        .decode(text)
        .map(Bytes::from)
        .map_err(|e| SerializationError::InvalidBody {
            message: e.to_string(),
        })
}

/// Format a timestamp the way the reserved time headers carry it
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Parse an ISO-8601 timestamp header, normalizing the offset to UTC
pub fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>, SerializationError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SerializationError::InvalidTimestamp {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Format a duration as `[-][d.]hh:mm:ss[.fffffff]`
pub fn format_time_span(span: Duration) -> String {
    let negative = span < Duration::zero();
    let span = if negative { -span } else { span };

    let total_seconds = span.num_seconds();
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    let ticks = (span - Duration::seconds(total_seconds))
        .num_nanoseconds()
        .unwrap_or(0)
        / 100;

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    if days > 0 {
        text.push_str(&format!("{}.", days));
    }
    text.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    if ticks > 0 {
        text.push_str(&format!(".{:07}", ticks));
    }
    text
}

/// Parse a time span written as `[-]d`, `[-][d.]hh:mm` or `[-][d.]hh:mm:ss[.fffffff]`
pub fn parse_time_span(value: &str) -> Result<Duration, SerializationError> {
    let invalid = || SerializationError::InvalidTimeSpan {
        value: value.to_string(),
    };

    let trimmed = value.trim();
    let (negative, text) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if text.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = text.split(':').collect();
    let span = match parts.as_slice() {
        [days] => Duration::days(parse_component(days, u32::MAX).ok_or_else(invalid)?),
        [day_hours, minutes] => {
            let (days, hours) = split_days(day_hours).ok_or_else(invalid)?;
            Duration::days(days)
                + Duration::hours(hours)
                + Duration::minutes(parse_component(minutes, 59).ok_or_else(invalid)?)
        }
        [day_hours, minutes, seconds] => {
            let (days, hours) = split_days(day_hours).ok_or_else(invalid)?;
            let (whole, fraction) = match seconds.split_once('.') {
                Some((whole, fraction)) => (whole, Some(fraction)),
                None => (*seconds, None),
            };
            let nanos = match fraction {
                Some(digits) => parse_fraction(digits).ok_or_else(invalid)?,
                None => 0,
            };
            Duration::days(days)
                + Duration::hours(hours)
                + Duration::minutes(parse_component(minutes, 59).ok_or_else(invalid)?)
                + Duration::seconds(parse_component(whole, 59).ok_or_else(invalid)?)
                + Duration::nanoseconds(nanos)
        }
        _ => return Err(invalid()),
    };

    Ok(if negative { -span } else { span })
}

fn split_days(text: &str) -> Option<(i64, i64)> {
    match text.split_once('.') {
        Some((days, hours)) => Some((
            parse_component(days, u32::MAX)?,
            parse_component(hours, 23)?,
        )),
        None => Some((0, parse_component(text, 23)?)),
    }
}

fn parse_component(text: &str, max: u32) -> Option<i64> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u32 = text.parse().ok()?;
    (value <= max).then_some(i64::from(value))
}

fn parse_fraction(digits: &str) -> Option<i64> {
    if digits.is_empty() || digits.len() > 9 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let padded = format!("{:0<9}", digits);
    padded.parse().ok()
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
