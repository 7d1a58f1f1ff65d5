//! Host-scoped locks on `flock(2)`
//!
//! Every key maps to a file under the locks directory. A lock is held for
//! as long as its file stays open; the kernel drops it when the process
//! exits, so a crashed builder never leaves a stale lock behind.

use crate::error::{KilnError, KilnResult};
use crate::storage::lock::{LockHandle, LockManager};
use crate::storage::resource_name;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub struct LocalLockManager {
    locks_dir: PathBuf,
    held: Mutex<HashMap<Uuid, File>>,
}

impl LocalLockManager {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", resource_name("kiln", key)))
    }

    fn service_error(key: &str, reason: impl Into<String>) -> KilnError {
        KilnError::LockService {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>> {
        std::fs::create_dir_all(&self.locks_dir)
            .map_err(|e| KilnError::io(format!("creating {}", self.locks_dir.display()), e))?;

        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Self::service_error(key, format!("opening {}: {}", path.display(), e)))?;

        if !try_flock(&file).map_err(|e| Self::service_error(key, e.to_string()))? {
            return Ok(None);
        }

        let handle = LockHandle::new(key);
        self.held
            .lock()
            .map_err(|_| Self::service_error(key, "lock table poisoned"))?
            .insert(handle.id, file);

        debug!("Locked {}", path.display());
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> KilnResult<()> {
        let file = self
            .held
            .lock()
            .map_err(|_| Self::service_error(&handle.key, "lock table poisoned"))?
            .remove(&handle.id);

        // Closing the file drops the flock; the file itself stays so that
        // concurrent openers always lock the same inode.
        if let Some(file) = file {
            drop(file);
            debug!("Unlocked {}", handle.key);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(unix)]
fn try_flock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and open for the whole call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> std::io::Result<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "host locks require a unix platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::lock::LockOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn same_key_is_exclusive_across_managers() {
        let temp = TempDir::new().unwrap();
        let first = LocalLockManager::new(temp.path().to_path_buf());
        let second = LocalLockManager::new(temp.path().to_path_buf());

        let handle = first.try_acquire("stage-abc").await.unwrap().unwrap();
        assert!(second.try_acquire("stage-abc").await.unwrap().is_none());
        assert!(first.try_acquire("stage-abc").await.unwrap().is_none());

        first.release(&handle).await.unwrap();
        assert!(second.try_acquire("stage-abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let temp = TempDir::new().unwrap();
        let locks = LocalLockManager::new(temp.path().to_path_buf());

        assert!(locks.try_acquire("stage-a").await.unwrap().is_some());
        assert!(locks.try_acquire("stage-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let locks = LocalLockManager::new(temp.path().to_path_buf());

        let handle = locks.try_acquire("stage-a").await.unwrap().unwrap();
        locks.release(&handle).await.unwrap();
        locks.release(&handle).await.unwrap();
        assert!(locks.try_acquire("stage-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(LocalLockManager::new(temp.path().to_path_buf()));
        let handle = locks.try_acquire("stage-a").await.unwrap().unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("stage-a", LockOptions::with_timeout(Duration::from_secs(10)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        locks.release(&handle).await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second.id, handle.id);
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let locks = LocalLockManager::new(temp.path().to_path_buf());
        let _held = locks.try_acquire("stage-a").await.unwrap().unwrap();

        let err = locks
            .acquire("stage-a", LockOptions::with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::LockTimeout { .. }));
    }
}
