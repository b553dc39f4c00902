//! Common test utilities for queue-transport integration tests
//!
//! This module provides:
//! - A harness wiring a [`Transport`] to an in-memory backend and a manual clock
//! - Helpers for sending through a full unit lifecycle
//! - One-time tracing setup writing to the test output

use chrono::{DateTime, TimeZone, Utc};
use queue_transport::{
    InMemoryQueueBackend, ManualClock, TransactionContext, Transport, TransportConfig,
    TransportMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

/// Install a tracing subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("queue_transport=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Fixed start time of every harness clock
#[allow(dead_code)]
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
}

// ============================================================================
// Harness
// ============================================================================

/// Transport over an in-memory backend
#[allow(dead_code)]
pub struct Harness {
    pub backend: InMemoryQueueBackend,
    pub clock: Arc<ManualClock>,
    pub transport: Transport,
}

#[allow(dead_code)]
impl Harness {
    /// Initialized transport receiving from "input", with the given extra queues
    pub async fn new(queues: &[&str]) -> Self {
        Self::with_config(
            TransportConfig {
                input_queue: Some("input".to_string()),
                receive_wait_seconds: 0,
                ..TransportConfig::default()
            },
            queues,
        )
        .await
    }

    /// Initialized transport with explicit configuration
    pub async fn with_config(config: TransportConfig, queues: &[&str]) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(start_time()));
        let backend = InMemoryQueueBackend::with_queues(clock.clone(), queues);
        let transport = Transport::new(config, Arc::new(backend.clone()), clock.clone())
            .expect("valid transport configuration");
        transport.initialize().await.expect("transport initializes");
        Self {
            backend,
            clock,
            transport,
        }
    }

    /// Send messages in one unit and drive it to completion
    pub async fn send_committed(&self, messages: Vec<(&str, TransportMessage)>) {
        let unit = TransactionContext::new();
        for (destination, message) in messages {
            self.transport
                .send(destination, message, &unit)
                .expect("send accepted");
        }
        unit.complete().await.expect("unit commits");
        unit.dispose().await.expect("unit disposes");
    }

    /// Receive within `unit` without cancellation
    pub async fn receive(&self, unit: &TransactionContext) -> Option<TransportMessage> {
        self.transport
            .receive(unit, &CancellationToken::new())
            .await
            .expect("receive succeeds")
    }

    /// Put a raw message on the input queue with the given headers and backend send time
    pub fn inject_input(&self, headers: &[(&str, String)], sent_at: DateTime<Utc>) -> String {
        let attributes: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.backend
            .inject("input", "aGVsbG8=", attributes, sent_at)
            .expect("input queue exists")
    }
}
