//! Keyed task supervisor: schedules a task under a key at most once.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Runs at most one task per key, ever.
///
/// `Go(key, fn)` is a no-op (not an error) if `key` has already been
/// scheduled, whether it is still running, finished, or was cancelled --
/// keys are single-use: once a key has been scheduled, no later `Go` call
/// for the same key is honored, even after `Cancel`.
///
/// The internal key map is a plain [`parking_lot::Mutex`]; it is never
/// held while a scheduled task body runs.
pub struct SingleRunner<E> {
    parent: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<Result<(), E>>>>,
}

impl<E> SingleRunner<E>
where
    E: Send + 'static,
{
    /// Bind a new runner to `parent`: cancelling `parent` cancels every
    /// task this runner has scheduled.
    #[must_use]
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            tokens: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Schedule `make_fut(token)` under `key`, unless `key` has already
    /// been scheduled (in which case this silently does nothing).
    pub fn go<K, F, Fut>(&self, key: K, make_fut: F)
    where
        K: Into<String>,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let key = key.into();
        let token = {
            let mut tokens = self.tokens.lock();
            if tokens.contains_key(&key) {
                trace!(%key, "single-runner: already scheduled, ignoring");
                return;
            }
            let token = self.parent.child_token();
            tokens.insert(key.clone(), token.clone());
            token
        };
        let fut = make_fut(token);
        let handle = tokio::spawn(fut);
        self.handles.lock().push(handle);
    }

    /// Cancel the task scheduled under `key`, if any. `key` remains
    /// resident in the map afterwards, so a later `go` for the same key
    /// is still a no-op.
    pub fn cancel(&self, key: &str) {
        let tokens = self.tokens.lock();
        if let Some(token) = tokens.get(key) {
            token.cancel();
        } else {
            trace!(key, "single-runner: cancel of unknown key ignored");
        }
    }

    /// `true` if `key` has ever been scheduled on this runner (running,
    /// finished, or cancelled).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    /// Await every scheduled task, then cancel any that are still live
    /// (in practice this only matters if the parent token was never
    /// cancelled itself) and return the first error any of them produced.
    ///
    /// Safe to call multiple times: each call only drains the handles
    /// that were outstanding when it started.
    pub async fn wait(&self) -> Result<(), E> {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "single-runner task panicked or was aborted");
                }
            }
        }
        for token in self.tokens.lock().values() {
            token.cancel();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn second_go_for_same_key_is_a_silent_noop() {
        let runner: SingleRunner<()> = SingleRunner::new(CancellationToken::new());
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let runs = runs.clone();
            runner.go("kind-a", move |_token| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        runner.wait().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_the_task_and_blocks_rescheduling() {
        let runner: SingleRunner<()> = SingleRunner::new(CancellationToken::new());
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();
        runner.go("kind-a", move |token| async move {
            token.cancelled().await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.cancel("kind-a");
        runner.wait().await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let ran_again = Arc::new(AtomicUsize::new(0));
        let r = ran_again.clone();
        runner.go("kind-a", move |_| async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        runner.wait().await.unwrap();
        assert_eq!(ran_again.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_returns_first_error() {
        let runner: SingleRunner<&'static str> = SingleRunner::new(CancellationToken::new());
        runner.go("ok", |_| async { Ok(()) });
        runner.go("bad", |_| async { Err("boom") });
        let result = runner.wait().await;
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test]
    async fn parent_cancellation_propagates_to_children() {
        let parent = CancellationToken::new();
        let runner: SingleRunner<()> = SingleRunner::new(parent.clone());
        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        runner.go("kind-a", move |token| async move {
            token.cancelled().await;
            o.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        parent.cancel();
        runner.wait().await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
