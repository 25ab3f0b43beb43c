//! C5 (retry layer) — exponential backoff retry per spec.md §4.5, applied
//! only to [`crate::errors::ErrorKind::retryable`] failures.
//!
//! No teacher precedent beyond Cargo.toml comments naming "retry" as an
//! abstract feature; built fresh in the corpus's idiom (plain async
//! function over a closure, matching how `durableengine.rs` drives a task
//! to completion in the teacher).

use std::time::Duration;

use crate::errors::ErrorKind;
use crate::workflow::RetryPolicy;

/// Run `attempt` until it succeeds, its error is non-retryable, or the
/// policy's `max_retry_count` is exhausted. Returns the final attempt's
/// result along with how many retries were actually performed.
pub async fn run_with_retry<T, E, F, Fut>(policy: &RetryPolicy, classify: impl Fn(&E) -> ErrorKind, mut attempt: F) -> (std::result::Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let initial_delay = crate::config::parse_duration(&policy.initial_delay).unwrap_or(Duration::from_millis(100));
    let max_delay = crate::config::parse_duration(&policy.max_delay).unwrap_or(Duration::from_secs(30));

    let mut delay = initial_delay;
    let mut retries = 0;

    loop {
        let result = attempt().await;
        match result {
            Ok(value) => return (Ok(value), retries),
            Err(err) => {
                if retries >= policy.max_retry_count || !classify(&err).retryable() {
                    return (Err(err), retries);
                }
                tokio::time::sleep(delay).await;
                retries += 1;
                delay = Duration::from_secs_f64((delay.as_secs_f64() * policy.multiplier).min(max_delay.as_secs_f64()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: "1ms".to_string(),
            max_delay: "10ms".to_string(),
            multiplier: 2.0,
            max_retry_count: 3,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let (result, retries) = run_with_retry(
            &policy(),
            |_: &Flaky| ErrorKind::NetworkError,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Flaky)
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let (result, retries) = run_with_retry(
            &policy(),
            |_: &Flaky| ErrorKind::ValidationError,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<i32, _>(Flaky) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(retries, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_retry_count() {
        let attempts = AtomicU32::new(0);
        let (result, retries) = run_with_retry(
            &policy(),
            |_: &Flaky| ErrorKind::Timeout,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<i32, _>(Flaky) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(retries, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
