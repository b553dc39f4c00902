//! Tests for the transport facade.

use super::*;
use crate::backends::memory::InMemoryQueueBackend;
use crate::clock::ManualClock;
use crate::message::headers;
use chrono::{TimeZone, Utc};

struct Fixture {
    backend: InMemoryQueueBackend,
    transport: Transport,
}

fn config(input: Option<&str>) -> TransportConfig {
    TransportConfig {
        input_queue: input.map(str::to_string),
        receive_wait_seconds: 0,
        ..TransportConfig::default()
    }
}

fn fixture_with(config: TransportConfig, queues: &[&str]) -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap()));
    let backend = InMemoryQueueBackend::with_queues(clock.clone(), queues);
    let transport = Transport::new(config, Arc::new(backend.clone()), clock).unwrap();
    Fixture { backend, transport }
}

async fn initialized(queues: &[&str]) -> Fixture {
    let f = fixture_with(config(Some("input")), queues);
    f.transport.initialize().await.unwrap();
    f
}

// ============================================================================
// Construction and Initialization
// ============================================================================

mod initialization_tests {
    use super::*;

    #[test]
    fn test_malformed_input_address_is_rejected() {
        let backend = InMemoryQueueBackend::default();
        let result = Transport::new(
            config(Some("not/a/url")),
            Arc::new(backend),
            Arc::new(ManualClock::default()),
        );

        assert!(matches!(result, Err(TransportError::AddressFormat { .. })));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = config(None);
        settings.max_batch_size = 0;

        let result = Transport::new(
            settings,
            Arc::new(InMemoryQueueBackend::default()),
            Arc::new(ManualClock::default()),
        );

        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_initialize_creates_and_resolves_input_queue() {
        let f = fixture_with(config(Some("input")), &[]);
        assert_eq!(f.transport.input_queue_url(), None);

        f.transport.initialize().await.unwrap();

        assert!(f.backend.has_queue("input"));
        assert_eq!(
            f.transport.input_queue_url(),
            Some(InMemoryQueueBackend::queue_url_for("input").as_str())
        );
        let calls = f.backend.calls();
        assert_eq!(calls.created_queues, vec!["input".to_string()]);
        assert_eq!(calls.connections_opened, calls.connections_closed);
    }

    #[tokio::test]
    async fn test_initialize_without_queue_creation_fails_for_missing_queue() {
        let mut settings = config(Some("input"));
        settings.create_queues = false;
        let f = fixture_with(settings, &[]);

        let err = f.transport.initialize().await.unwrap_err();

        match err {
            TransportError::Initialization { address, source } => {
                assert_eq!(address, "input");
                assert!(source.is_queue_missing());
            }
            other => panic!("Expected Initialization error, got: {:?}", other),
        }
        assert!(f.backend.calls().created_queues.is_empty());
    }

    #[tokio::test]
    async fn test_send_only_transport_cannot_receive() {
        let f = fixture_with(config(None), &["orders"]);
        f.transport.initialize().await.unwrap();
        let unit = TransactionContext::new();

        let result = f.transport.receive(&unit, &CancellationToken::new()).await;

        assert!(matches!(result, Err(TransportError::NotInitialized)));
        assert_eq!(f.transport.address(), None);
        assert_eq!(f.backend.calls().connections_opened, 0);
    }
}

// ============================================================================
// Send
// ============================================================================

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_validates_destination() {
        let f = initialized(&["orders"]).await;
        let unit = TransactionContext::new();
        let message = TransportMessage::with_generated_id("x");

        assert!(matches!(
            f.transport.send("", message.clone(), &unit),
            Err(TransportError::Argument { .. })
        ));
        assert!(matches!(
            f.transport.send("orders/eu", message, &unit),
            Err(TransportError::AddressFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_through_trait_object() {
        let f = initialized(&["orders"]).await;
        let transport: &dyn MessageTransport = &f.transport;
        let unit = TransactionContext::new();

        transport
            .send("orders", TransportMessage::with_generated_id("x"), &unit)
            .await
            .unwrap();
        unit.complete().await.unwrap();
        unit.dispose().await.unwrap();

        assert_eq!(transport.address(), Some("input"));
        assert_eq!(f.backend.message_count("orders"), 1);
    }
}

// ============================================================================
// Receive
// ============================================================================

mod receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_receive_returns_none_without_polling() {
        let f = initialized(&[]).await;
        let unit = TransactionContext::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let received = f.transport.receive(&unit, &cancel).await.unwrap();

        assert!(received.is_none());
        assert_eq!(f.backend.calls().receives, 0);
    }

    /// Verify cancellation interrupts a long-poll wait.
    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let mut settings = config(Some("input"));
        settings.receive_wait_seconds = 20;
        let f = fixture_with(settings, &[]);
        f.transport.initialize().await.unwrap();
        let unit = TransactionContext::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let received = f.transport.receive(&unit, &cancel).await.unwrap();

        assert!(received.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_received_message_round_trips_headers_and_body() {
        let f = initialized(&["input"]).await;
        let send_unit = TransactionContext::new();
        let outgoing = TransportMessage::new(Default::default(), b"\x01\x02payload".to_vec())
            .with_header(headers::MESSAGE_ID, "m-1")
            .with_header("content-type", "application/octet-stream");
        f.transport.send("input", outgoing.clone(), &send_unit).unwrap();
        send_unit.complete().await.unwrap();
        send_unit.dispose().await.unwrap();

        let unit = TransactionContext::new();
        let received = f
            .transport
            .receive(&unit, &CancellationToken::new())
            .await
            .unwrap()
            .expect("a message");

        assert_eq!(received, outgoing);
        unit.complete().await.unwrap();
        unit.dispose().await.unwrap();
        assert_eq!(f.backend.message_count("input"), 0);
    }

    #[tokio::test]
    async fn test_invalid_body_is_a_serialization_error() {
        let f = initialized(&["input"]).await;
        f.backend
            .inject("input", "***", Default::default(), Utc::now())
            .unwrap();
        let unit = TransactionContext::new();

        let result = f.transport.receive(&unit, &CancellationToken::new()).await;

        assert!(matches!(result, Err(TransportError::Serialization(_))));
    }

    /// Verify disposing without completion leaves the message leased but undeleted.
    #[tokio::test]
    async fn test_dispose_without_completion_keeps_message() {
        let f = initialized(&["input"]).await;
        let send_unit = TransactionContext::new();
        f.transport
            .send("input", TransportMessage::with_generated_id("x"), &send_unit)
            .unwrap();
        send_unit.complete().await.unwrap();

        let unit = TransactionContext::new();
        let received = f.transport.receive(&unit, &CancellationToken::new()).await.unwrap();
        assert!(received.is_some());
        unit.dispose().await.unwrap();

        let calls = f.backend.calls();
        assert!(calls.deleted_receipts.is_empty());
        assert!(calls.visibility_changes.is_empty());
        assert_eq!(f.backend.message_count("input"), 1);
        assert_eq!(f.backend.visible_count("input"), 0);
    }
}

// ============================================================================
// Administration
// ============================================================================

mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_queue_from_url_uses_last_segment() {
        let f = fixture_with(config(None), &[]);

        let url = f
            .transport
            .create_queue("https://sqs.eu-west-1.amazonaws.com/123456789012/billing")
            .await
            .unwrap();

        assert_eq!(url, InMemoryQueueBackend::queue_url_for("billing"));
        assert!(f.backend.has_queue("billing"));
    }

    /// Verify purge keeps polling until several receives in a row come back empty.
    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_every_message() {
        let f = fixture_with(config(None), &["orders"]);
        for i in 0..25 {
            f.backend
                .inject("orders", &format!("m{}", i), Default::default(), Utc::now())
                .unwrap();
        }

        let removed = f.transport.purge("orders").await.unwrap();

        assert_eq!(removed, 25);
        assert_eq!(f.backend.message_count("orders"), 0);
        assert_eq!(f.backend.calls().receives, 3 + PURGE_EMPTY_RECEIVES);
    }

    #[tokio::test]
    async fn test_purge_of_missing_queue_is_noop() {
        let f = fixture_with(config(None), &[]);

        assert_eq!(f.transport.purge("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_queue() {
        let f = fixture_with(config(None), &["orders"]);

        f.transport.delete_queue("orders").await.unwrap();

        assert!(!f.backend.has_queue("orders"));
        assert!(matches!(
            f.transport.delete_queue("never-existed").await,
            Err(TransportError::QueueMissing { .. })
        ));
    }
}

// ============================================================================
// Finished Units
// ============================================================================

mod finished_unit_tests {
    use super::*;

    async fn finished_units() -> Vec<TransactionContext> {
        let completed = TransactionContext::new();
        completed.complete().await.unwrap();
        let aborted = TransactionContext::new();
        aborted.abort().await.unwrap();
        let disposed = TransactionContext::new();
        disposed.dispose().await.unwrap();
        vec![completed, aborted, disposed]
    }

    /// Verify a send after the unit committed fails instead of being dropped.
    #[tokio::test]
    async fn test_send_after_commit_is_rejected() {
        let f = initialized(&["orders"]).await;
        let unit = TransactionContext::new();
        f.transport
            .send("orders", TransportMessage::with_generated_id("a"), &unit)
            .unwrap();
        unit.complete().await.unwrap();

        let late = f
            .transport
            .send("orders", TransportMessage::with_generated_id("b"), &unit);
        unit.dispose().await.unwrap();

        assert!(matches!(late, Err(TransportError::Unit { .. })));
        assert_eq!(f.backend.calls().batches.len(), 1);
        assert_eq!(f.backend.message_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_send_on_finished_units_is_rejected() {
        let f = initialized(&["orders"]).await;

        for unit in finished_units().await {
            let result = f
                .transport
                .send("orders", TransportMessage::with_generated_id("x"), &unit);
            assert!(
                matches!(result, Err(TransportError::Unit { .. })),
                "unit in state {:?} accepted a send",
                unit.state()
            );
        }

        let calls = f.backend.calls();
        assert!(calls.batches.is_empty());
        assert_eq!(calls.connections_opened, calls.connections_closed);
    }

    /// Verify receive on a finished unit takes no message and starts no lease.
    #[tokio::test(start_paused = true)]
    async fn test_receive_on_finished_units_is_rejected() {
        let f = initialized(&["input"]).await;
        f.backend
            .inject("input", "aGVsbG8=", Default::default(), Utc::now())
            .unwrap();

        for unit in finished_units().await {
            let result = f.transport.receive(&unit, &CancellationToken::new()).await;
            assert!(
                matches!(result, Err(TransportError::Unit { .. })),
                "unit in state {:?} received a message",
                unit.state()
            );
        }
        tokio::time::sleep(Duration::from_secs(300)).await;

        let calls = f.backend.calls();
        assert_eq!(calls.receives, 0);
        assert!(calls.visibility_changes.is_empty());
        assert_eq!(f.backend.visible_count("input"), 1);
    }

    /// Verify a message that arrives after the unit ended during the wait is released.
    #[tokio::test(start_paused = true)]
    async fn test_unit_aborted_during_wait_releases_message() {
        let mut settings = config(Some("input"));
        settings.receive_wait_seconds = 20;
        let f = fixture_with(settings, &[]);
        f.transport.initialize().await.unwrap();
        let unit = TransactionContext::new();
        let cancel = CancellationToken::new();

        let (received, _) = tokio::join!(f.transport.receive(&unit, &cancel), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            unit.abort().await.unwrap();
            f.backend
                .inject("input", "aGVsbG8=", Default::default(), Utc::now())
                .unwrap();
        });

        assert!(matches!(received, Err(TransportError::Unit { .. })));
        let calls = f.backend.calls();
        assert_eq!(calls.visibility_changes.len(), 1);
        assert_eq!(calls.visibility_changes[0].1, Duration::ZERO);
        assert!(calls.deleted_receipts.is_empty());
        assert_eq!(f.backend.visible_count("input"), 1);
        unit.dispose().await.unwrap();
    }
}
