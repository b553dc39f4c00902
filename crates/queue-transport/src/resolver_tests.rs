//! Tests for address validation and endpoint resolution.

use super::*;
use crate::backend::{BackendError, MockQueueBackend};

const ORDERS_URL: &str = "https://sqs.eu-west-1.amazonaws.com/123456789012/orders";

mod validation_tests {
    use super::*;

    #[test]
    fn test_bare_names_and_urls_are_valid() {
        assert!(AddressResolver::validate("orders").is_ok());
        assert!(AddressResolver::validate("orders-dlq.fifo").is_ok());
        assert!(AddressResolver::validate(ORDERS_URL).is_ok());
        assert!(AddressResolver::validate("http://localhost:4566/000000000000/orders").is_ok());
    }

    #[test]
    fn test_empty_address_is_an_argument_error() {
        assert!(matches!(
            AddressResolver::validate(""),
            Err(TransportError::Argument { .. })
        ));
        assert!(matches!(
            AddressResolver::validate("   "),
            Err(TransportError::Argument { .. })
        ));
    }

    /// Verify that slash-containing non-URLs are rejected.
    #[test]
    fn test_malformed_addresses_are_rejected() {
        for address in ["queues/orders", "/orders", "ftp://host/orders", "https://"] {
            assert!(
                matches!(
                    AddressResolver::validate(address),
                    Err(TransportError::AddressFormat { .. })
                ),
                "'{}' should be rejected",
                address
            );
        }
    }

    #[test]
    fn test_queue_name_from_url_uses_last_segment() {
        assert_eq!(AddressResolver::queue_name(ORDERS_URL).unwrap(), "orders");
        assert_eq!(
            AddressResolver::queue_name("https://sqs.local/1/billing/").unwrap(),
            "billing"
        );
        assert_eq!(AddressResolver::queue_name("orders").unwrap(), "orders");
        assert!(AddressResolver::queue_name("https://sqs.local/").is_err());
    }
}

mod resolve_tests {
    use super::*;

    /// Verify that URL addresses resolve unchanged with no backend call.
    #[tokio::test]
    async fn test_url_address_skips_backend() {
        let resolver = AddressResolver::new();
        let mut backend = MockQueueBackend::new();
        backend.expect_get_queue_url().never();

        let resolved = resolver.resolve(ORDERS_URL, &backend).await.unwrap();

        assert_eq!(resolved, ORDERS_URL);
        assert_eq!(resolver.cached_len().await, 0);
    }

    /// Verify that a name is looked up once, then served from cache in any case.
    #[tokio::test]
    async fn test_name_is_looked_up_once() {
        let resolver = AddressResolver::new();
        let mut backend = MockQueueBackend::new();
        backend
            .expect_get_queue_url()
            .withf(|name| name == "Orders")
            .times(1)
            .returning(|_| Ok(ORDERS_URL.to_string()));

        let first = resolver.resolve("Orders", &backend).await.unwrap();
        let second = resolver.resolve("orders", &backend).await.unwrap();
        let third = resolver.resolve("ORDERS", &backend).await.unwrap();

        assert_eq!(first, ORDERS_URL);
        assert_eq!(second, ORDERS_URL);
        assert_eq!(third, ORDERS_URL);
        assert_eq!(resolver.cached_len().await, 1);
    }

    #[tokio::test]
    async fn test_clones_share_the_cache() {
        let resolver = AddressResolver::new();
        let shared = resolver.clone();
        let mut backend = MockQueueBackend::new();
        backend
            .expect_get_queue_url()
            .times(1)
            .returning(|_| Ok(ORDERS_URL.to_string()));

        resolver.resolve("orders", &backend).await.unwrap();
        shared.resolve("orders", &backend).await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_failure_is_a_resolution_error_and_not_cached() {
        let resolver = AddressResolver::new();
        let mut backend = MockQueueBackend::new();
        backend
            .expect_get_queue_url()
            .times(2)
            .returning(|name| Err(BackendError::QueueDoesNotExist(name.to_string())));

        let err = resolver.resolve("missing", &backend).await.unwrap_err();
        assert!(matches!(err, TransportError::Resolution { ref address, .. } if address == "missing"));
        assert!(err.is_queue_missing());

        assert!(resolver.resolve("missing", &backend).await.is_err());
        assert_eq!(resolver.cached_len().await, 0);
    }
}
