//! Stage locks
//!
//! Backends only implement a non-blocking `try_acquire`; waiting, backoff
//! and timeouts are shared by all of them through `LockManager::acquire`.

mod cluster;
mod http;
mod local;

pub use cluster::ClusterLockManager;
pub use http::HttpLockManager;
pub use local::LocalLockManager;

use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const WAIT_WARNING_AFTER: Duration = Duration::from_secs(10);

/// Proof of holding a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub key: String,
    pub id: Uuid,
}

impl LockHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// How long and whether to wait for a held lock
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Give up after this long (`None` = wait indefinitely)
    pub timeout: Option<Duration>,
    /// Fail immediately if the lock is held
    pub non_blocking: bool,
}

impl LockOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            non_blocking: false,
        }
    }

    pub fn non_blocking() -> Self {
        Self {
            timeout: None,
            non_blocking: true,
        }
    }
}

/// Mutual exclusion per key among all builders sharing a backend
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock if nobody holds it
    async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>>;

    /// Release a held lock. Releasing twice, or after the lease was lost,
    /// is not an error.
    async fn release(&self, handle: &LockHandle) -> KilnResult<()>;

    /// Backend name for display
    fn backend_name(&self) -> &'static str;

    /// Take the lock, waiting with exponential backoff while it is held
    async fn acquire(&self, key: &str, opts: LockOptions) -> KilnResult<LockHandle> {
        let (_never, cancel) = watch::channel(false);
        self.acquire_or_cancel(key, opts, cancel).await
    }

    /// `acquire` that stops waiting once `cancel` turns true.
    ///
    /// Cancellation is honored between attempts. An attempt already sent to
    /// the backend runs to completion, and a lock it was granted is released
    /// before `Cancelled` is returned.
    async fn acquire_or_cancel(
        &self,
        key: &str,
        opts: LockOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> KilnResult<LockHandle> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut warned = false;

        loop {
            if *cancel.borrow() {
                return Err(KilnError::Cancelled);
            }

            let granted = self.try_acquire(key).await?;
            if let Some(handle) = granted {
                if *cancel.borrow() {
                    debug!("Releasing lock {} granted after cancellation", key);
                    if let Err(e) = self.release(&handle).await {
                        warn!("Failed to release lock {}: {}", key, e);
                    }
                    return Err(KilnError::Cancelled);
                }
                debug!("Acquired lock {} after {:?}", key, started.elapsed());
                return Ok(handle);
            }

            if opts.non_blocking {
                return Err(KilnError::LockBusy {
                    key: key.to_string(),
                });
            }

            let waited = started.elapsed();
            let mut delay = backoff;
            if let Some(timeout) = opts.timeout {
                if waited >= timeout {
                    return Err(KilnError::LockTimeout {
                        key: key.to_string(),
                        waited,
                    });
                }
                delay = delay.min(timeout - waited);
            }

            if !warned && waited >= WAIT_WARNING_AFTER {
                warn!("Still waiting for lock {} ({:?})", key, waited);
                warned = true;
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(KilnError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Resolves once the flag turns true; never if the sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Held for the first `busy_for` attempts
    struct Flaky {
        busy_for: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LockManager for Flaky {
        async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok((attempt >= self.busy_for).then(|| LockHandle::new(key)))
        }

        async fn release(&self, _handle: &LockHandle) -> KilnResult<()> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn flaky(busy_for: usize) -> Flaky {
        Flaky {
            busy_for,
            attempts: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn acquire_retries_until_free() {
        let locks = flaky(3);
        let handle = locks.acquire("k", LockOptions::default()).await.unwrap();
        assert_eq!(handle.key, "k");
        assert_eq!(locks.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_blocking_fails_fast() {
        let locks = flaky(1);
        let err = locks.acquire("k", LockOptions::non_blocking()).await.unwrap_err();
        assert!(matches!(err, KilnError::LockBusy { key } if key == "k"));
        assert_eq!(locks.attempts.load(Ordering::SeqCst), 1);
    }

    /// Grants every request, but only after `delay`
    #[derive(Default)]
    struct Slow {
        delay: Duration,
        released: AtomicUsize,
    }

    #[async_trait]
    impl LockManager for Slow {
        async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(LockHandle::new(key)))
        }

        async fn release(&self, _handle: &LockHandle) -> KilnResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn cancel_while_waiting_stops_retrying() {
        let locks = std::sync::Arc::new(flaky(usize::MAX));
        let (cancel, receiver) = watch::channel(false);

        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire_or_cancel("k", LockOptions::default(), receiver)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, KilnError::Cancelled));
        let attempts = locks.attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(locks.attempts.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn lock_granted_after_cancel_is_released() {
        let locks = std::sync::Arc::new(Slow {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let (cancel, receiver) = watch::channel(false);

        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire_or_cancel("k", LockOptions::default(), receiver)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, KilnError::Cancelled));
        assert_eq!(locks.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_never_tries() {
        let locks = flaky(0);
        let (_cancel, receiver) = watch::channel(true);
        let err = locks
            .acquire_or_cancel("k", LockOptions::default(), receiver)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Cancelled));
        assert_eq!(locks.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_is_bounded() {
        let locks = flaky(usize::MAX);
        let started = Instant::now();
        let err = locks
            .acquire("k", LockOptions::with_timeout(Duration::from_millis(300)))
            .await
            .unwrap_err();

        assert!(matches!(err, KilnError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
