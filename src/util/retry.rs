use crate::util::errors::{Error, Result};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Suspend for `duration` or until the token fires, whichever comes first.
pub async fn sleep_for(token: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled(format!(
            "sleep of {duration:?} interrupted by shutdown"
        ))),
        _ = sleep(duration) => Ok(()),
    }
}

/// Run `op` up to `attempts` times, sleeping `interval` between attempts.
///
/// Stops early when `op` succeeds, when `can_retry` rejects the error, or
/// when the token fires. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut, P>(
    token: &CancellationToken,
    what: &str,
    attempts: u32,
    interval: Duration,
    mut op: F,
    can_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!("{what} aborted by shutdown")));
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= attempts || !can_retry(&err) {
                    return Err(err);
                }
                debug!(what, attempt, error = %err, "operation failed, backing off");
                sleep_for(token, interval).await?;
            }
        }
    }
}

/// Poll `pred` every `interval` for up to `timeout_after`.
///
/// True iff the predicate succeeded before the deadline; cancellation and
/// timeout both yield false.
pub async fn retry_until<F, Fut>(
    token: &CancellationToken,
    interval: Duration,
    timeout_after: Duration,
    mut pred: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        loop {
            if pred().await {
                return true;
            }
            sleep(interval).await;
        }
    };
    tokio::select! {
        _ = token.cancelled() => false,
        satisfied = timeout(timeout_after, poll) => satisfied.unwrap_or(false),
    }
}

pub fn always_retry(_: &Error) -> bool {
    true
}

pub fn retry_unless_not_found(err: &Error) -> bool {
    !err.is_not_found()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test]
    async fn sleep_for_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_for(&token, Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn sleep_for_returns_cancelled_error() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let err = sleep_for(&token, Duration::from_secs(30)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let value = retry(
            &token,
            "flaky",
            3,
            Duration::from_millis(5),
            move || {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Invariant("not yet".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            always_retry,
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempt_limit() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<()> = retry(
            &token,
            "hopeless",
            3,
            Duration::from_millis(1),
            move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Invariant("still broken".into()))
                }
            },
            always_retry,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_when_predicate_rejects() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<()> = retry(
            &token,
            "missing secret",
            3,
            Duration::from_millis(1),
            move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("secret absent".into()))
                }
            },
            retry_unless_not_found,
        )
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_aborts_on_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = retry(
            &token,
            "cancelled before start",
            3,
            Duration::from_millis(1),
            || async { Ok(()) },
            always_retry,
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn retry_until_succeeds_before_deadline() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let satisfied = retry_until(&token, Duration::from_millis(5), Duration::from_secs(5), move || {
            let counted = counted.clone();
            async move { counted.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;
        assert!(satisfied);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_until_times_out() {
        let token = CancellationToken::new();
        let satisfied = retry_until(
            &token,
            Duration::from_millis(5),
            Duration::from_millis(20),
            || async { false },
        )
        .await;
        assert!(!satisfied);
    }

    #[tokio::test]
    async fn retry_until_false_on_cancellation() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let satisfied = retry_until(&token, Duration::from_millis(5), Duration::from_secs(30), || async {
            false
        })
        .await;
        assert!(!satisfied);
    }
}
