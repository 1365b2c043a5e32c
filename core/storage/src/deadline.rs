//! Deadlines for remote calls.

use std::future::Future;
use std::time::Duration;

use storekeep_common::{Error, Result};

/// Default bound for a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline.
///
/// The future is dropped when the deadline passes, which aborts the
/// underlying request, and the call fails with [`Error::Timeout`] instead of
/// a generic network error.
pub async fn with_deadline<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, ?limit, "Remote call exceeded deadline");
            Err(Error::Timeout(format!(
                "{} did not complete within {:?}",
                operation, limit
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_deadline(Duration::from_secs(1), "fast", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<()> = with_deadline(Duration::from_millis(20), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_inner_error_is_not_masked() {
        let result: Result<()> = with_deadline(Duration::from_secs(1), "failing", async {
            Err(Error::Network("refused".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Network(_))));
    }
}
