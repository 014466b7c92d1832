use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::retry_with_backoff;
use crate::BackendError;
use crate::BackoffPolicy;
use crate::Error;

fn fast_policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 1000,
        base_delay_ms: 1,
        max_delay_ms: 2,
    }
}

#[tokio::test]
async fn succeeds_after_transient_failures() {
    let calls = AtomicUsize::new(0);
    let result = retry_with_backoff(&fast_policy(5), || {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(Error::Backend(BackendError::ConnectionLost))
            } else {
                Ok(42)
            }
        }
    })
    .await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_error_surfaces_immediately() {
    let calls = AtomicUsize::new(0);
    let result: crate::Result<()> = retry_with_backoff(&fast_policy(5), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Backend(BackendError::NoNode("/x".to_string()))) }
    })
    .await;
    assert!(matches!(
        result,
        Err(Error::Backend(BackendError::NoNode(_)))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhaustion_reports_attempt_count() {
    let calls = AtomicUsize::new(0);
    let result: crate::Result<()> = retry_with_backoff(&fast_policy(3), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Backend(BackendError::ConnectionLost)) }
    })
    .await;
    match result {
        Err(Error::Backend(BackendError::RetryExhausted { attempts, .. })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_are_cut_off_by_the_per_attempt_budget() {
    let policy = BackoffPolicy {
        max_retries: 2,
        timeout_ms: 10,
        base_delay_ms: 1,
        max_delay_ms: 2,
    };
    let result: crate::Result<()> = retry_with_backoff(&policy, || async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    })
    .await;
    match result {
        Err(Error::Backend(BackendError::RetryExhausted { attempts, last })) => {
            assert_eq!(attempts, 2);
            assert!(last.contains("timed out"), "unexpected last error: {last}");
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
}
