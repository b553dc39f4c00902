//! Tests for the transactional unit of work.

use super::*;

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(log: &Log, entry: &str) -> impl FnOnce() -> futures::future::Ready<Result<(), TransportError>> {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    move || {
        log.lock().unwrap().push(entry);
        futures::future::ready(Ok(()))
    }
}

fn failing(log: &Log, entry: &str) -> impl FnOnce() -> futures::future::Ready<Result<(), TransportError>> {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    move || {
        log.lock().unwrap().push(entry.clone());
        futures::future::ready(Err(TransportError::Unit { message: entry }))
    }
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

// ============================================================================
// Unit Item Tests
// ============================================================================

mod item_tests {
    use super::*;

    #[test]
    fn test_get_or_add_creates_once() {
        let unit = TransactionContext::new();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let first = unit
            .get_or_add("counter", |_| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Mutex::new(5u32)
            })
            .unwrap();
        let second = unit
            .get_or_add("counter", |_| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Mutex::new(0u32)
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.lock().unwrap(), 5);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_or_add_rejects_type_mismatch() {
        let unit = TransactionContext::new();
        unit.get_or_add("slot", |_| 1u32).unwrap();

        let result = unit.get_or_add("slot", |_| "text".to_string());

        assert!(matches!(result, Err(TransportError::Unit { .. })));
    }

    #[tokio::test]
    async fn test_factory_can_register_hooks() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();

        unit.get_or_add("with-hook", |u| {
            u.on_committed(recorder(&log, "flush"));
        })
        .unwrap();
        unit.get_or_add("with-hook", |u| {
            u.on_committed(recorder(&log, "second flush"));
        })
        .unwrap();
        unit.complete().await.unwrap();

        assert_eq!(entries(&log), vec!["flush"]);
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    /// Verify committed runs before completed and aborted hooks are skipped.
    #[tokio::test]
    async fn test_complete_runs_committed_then_completed() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_completed(recorder(&log, "completed"));
        unit.on_aborted(recorder(&log, "aborted"));
        unit.on_committed(recorder(&log, "committed"));

        unit.complete().await.unwrap();
        unit.dispose().await.unwrap();

        assert_eq!(entries(&log), vec!["committed", "completed"]);
        assert_eq!(unit.state(), UnitState::Disposed);
    }

    /// Verify a failing commit runs aborted hooks instead of completed ones.
    #[tokio::test]
    async fn test_commit_failure_aborts() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_committed(failing(&log, "commit"));
        unit.on_committed(recorder(&log, "never"));
        unit.on_completed(recorder(&log, "completed"));
        unit.on_aborted(recorder(&log, "aborted"));

        let result = unit.complete().await;

        assert!(matches!(result, Err(TransportError::Unit { .. })));
        assert_eq!(entries(&log), vec!["commit", "aborted"]);
        assert_eq!(unit.state(), UnitState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_skips_commit_hooks() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_committed(recorder(&log, "committed"));
        unit.on_aborted(recorder(&log, "aborted"));

        unit.abort().await.unwrap();

        assert_eq!(entries(&log), vec!["aborted"]);
    }

    /// Verify each ending can be reached only once.
    #[tokio::test]
    async fn test_second_ending_is_rejected() {
        let unit = TransactionContext::new();
        unit.complete().await.unwrap();

        assert!(matches!(unit.complete().await, Err(TransportError::Unit { .. })));
        assert!(matches!(unit.abort().await, Err(TransportError::Unit { .. })));
    }

    #[tokio::test]
    async fn test_disposed_hooks_run_in_reverse_order_once() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_disposed(recorder(&log, "client"));
        unit.on_disposed(recorder(&log, "lease"));

        unit.dispose().await.unwrap();
        unit.dispose().await.unwrap();

        assert_eq!(entries(&log), vec!["lease", "client"]);
    }

    #[tokio::test]
    async fn test_dispose_without_ending_skips_other_phases() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_committed(recorder(&log, "committed"));
        unit.on_aborted(recorder(&log, "aborted"));
        unit.on_disposed(recorder(&log, "disposed"));

        unit.dispose().await.unwrap();

        assert_eq!(entries(&log), vec!["disposed"]);
        assert!(matches!(unit.complete().await, Err(TransportError::Unit { .. })));
    }

    /// Verify every completed hook runs even if an earlier one fails.
    #[tokio::test]
    async fn test_completed_hook_failure_does_not_skip_others() {
        let unit = TransactionContext::new();
        let log: Log = Arc::default();
        unit.on_completed(failing(&log, "first"));
        unit.on_completed(recorder(&log, "second"));

        let result = unit.complete().await;

        assert!(result.is_err());
        assert_eq!(entries(&log), vec!["first", "second"]);
        assert_eq!(unit.state(), UnitState::Completed);
    }

    #[tokio::test]
    async fn test_ensure_active_rejects_every_ended_state() {
        let active = TransactionContext::new();
        assert!(active.ensure_active().is_ok());

        let completed = TransactionContext::new();
        completed.complete().await.unwrap();
        let aborted = TransactionContext::new();
        aborted.abort().await.unwrap();
        let disposed = TransactionContext::new();
        disposed.dispose().await.unwrap();

        for unit in [completed, aborted, disposed] {
            assert!(matches!(unit.ensure_active(), Err(TransportError::Unit { .. })));
        }
    }
}
