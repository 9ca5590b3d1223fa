use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use llmwire::{LlmError, RetryPolicy};

fn rate_limited() -> LlmError {
    LlmError::Upstream {
        status: 429,
        message: "rate_limit_error: slow down".to_string(),
        retry_after: None,
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(500), Duration::from_secs(30))
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_three_times_then_success() {
    let calls = AtomicU32::new(0);
    let value = policy(4)
        .execute(&CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(rate_limited())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("fourth attempt succeeds");
    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhausted_after_max_attempts() {
    let calls = AtomicU32::new(0);
    let err = policy(2)
        .execute(&CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(rate_limited()) }
        })
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match err {
        LlmError::RetryExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(source.is_rate_limited());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_sets_the_delay() {
    let started = tokio::time::Instant::now();
    policy(2)
        .execute(&CancellationToken::new(), |attempt| async move {
            if attempt == 0 {
                Err(LlmError::Upstream {
                    status: 503,
                    message: "overloaded".to_string(),
                    retry_after: Some(Duration::from_secs(7)),
                })
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
    let waited = started.elapsed();
    // the hint plus at most 10% jitter
    assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(7_700), "waited {waited:?}");
}

#[tokio::test]
async fn test_cancel_during_backoff_returns_promptly() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let slow = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));

    let task = {
        let cancel = cancel.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            slow.execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(rate_limited()) }
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cancel must interrupt the backoff sleep")
        .expect("task joins");
    assert!(matches!(result, Err(LlmError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_attempt() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let result = policy(3)
        .execute(&cancel, |_| std::future::pending::<Result<(), LlmError>>())
        .await;
    assert!(result.unwrap_err().is_cancelled());
}
