//! Generic retry-list helper used by every `track<Kind>` discovery loop
//!.

use crate::error::DiscoveryError;
use crate::lister::Lister;
use backon::{ExponentialBuilder, Retryable};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Either the wrapped lister's own error, or an indication that the
/// parent context was cancelled mid-retry.
#[derive(Debug)]
pub enum RetryError<E> {
    Inner(E),
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Inner(e) => write!(f, "{e}"),
            RetryError::Cancelled => write!(f, "listing was cancelled"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Inner(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Wrap `lister.list()` in exponential backoff capped at 5s per step.
///
/// `is_terminal` classifies the lister's own errors: when it returns
/// `true` the error is returned immediately without further retries (for
/// example, "kind not registered" -- that GVK simply does not exist in
/// the API server). Context cancellation (`cancel`) always aborts
/// immediately and is reported as [`RetryError::Cancelled`], regardless
/// of `is_terminal`.
pub async fn retry_list<K, L>(
    lister: &L,
    is_terminal: impl Fn(&L::Error) -> bool + Send + Sync,
    cancel: &CancellationToken,
) -> Result<Vec<K>, RetryError<L::Error>>
where
    L: Lister<K>,
{
    let backoff = ExponentialBuilder::default()
        .with_max_delay(MAX_BACKOFF)
        .without_max_times();

    let attempt = || async {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RetryError::Cancelled),
            result = lister.list() => result.map_err(RetryError::Inner),
        }
    };

    attempt
        .retry(backoff)
        .when(|e| !matches!(e, RetryError::Cancelled) && !matches!(e, RetryError::Inner(inner) if is_terminal(inner)))
        .notify(|err, dur| {
            warn!(error = %err, backoff = ?dur, "list failed, retrying after backoff");
        })
        .await
}

/// Terminal predicate for [`DiscoveryError`]: treats "kind not registered"
/// (and context cancellation) as terminal, everything else as retryable.
#[must_use]
pub fn retry_unless_unregistered(err: &DiscoveryError) -> bool {
    err.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyLister {
        fail_times: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Lister<u8> for FlakyLister {
        type Error = &'static str;

        async fn list(&self) -> Result<Vec<u8>, Self::Error> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err("transient")
            } else {
                Ok(vec![1, 2, 3])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let lister = FlakyLister {
            fail_times: 2,
            attempts: attempts.clone(),
        };
        let cancel = CancellationToken::new();
        let result = retry_list(&lister, |_| false, &cancel).await;
        assert!(matches!(result, Ok(items) if items == vec![1, 2, 3]));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let lister = FlakyLister {
            fail_times: usize::MAX,
            attempts: attempts.clone(),
        };
        let cancel = CancellationToken::new();
        let result = retry_list(&lister, |_| true, &cancel).await;
        assert!(matches!(result, Err(RetryError::Inner("transient"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let lister = FlakyLister {
            fail_times: usize::MAX,
            attempts: attempts.clone(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = retry_list(&lister, |_| false, &cancel).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
