//! Lease locks stored as cluster objects
//!
//! A lock is an object holding `holder`, `lock_id` and `expires_at`. The
//! holder renews the lease every third of its duration; a lease nobody
//! renewed past `expires_at` may be taken over. Objects are never deleted:
//! release just clears the holder.

use crate::error::{KilnError, KilnResult};
use crate::storage::cluster::{ClusterObject, ClusterObjectStore, WriteOutcome};
use crate::storage::lock::{LockHandle, LockManager};
use crate::storage::resource_name;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const HOLDER: &str = "holder";
const LOCK_ID: &str = "lock_id";
const EXPIRES_AT: &str = "expires_at";
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

pub struct ClusterLockManager {
    store: Arc<dyn ClusterObjectStore>,
    holder: String,
    lease: Duration,
    renewals: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl ClusterLockManager {
    pub fn new(store: Arc<dyn ClusterObjectStore>, holder: String, lease: Duration) -> Self {
        Self {
            store,
            holder,
            lease: lease.max(MIN_RENEW_PERIOD * 3),
            renewals: Mutex::new(HashMap::new()),
        }
    }

    fn object_name(key: &str) -> String {
        resource_name("kiln-lock", key)
    }

    fn lease_data(holder: &str, lock_id: Uuid, lease: Duration) -> BTreeMap<String, String> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut data = BTreeMap::new();
        data.insert(HOLDER.to_string(), holder.to_string());
        data.insert(LOCK_ID.to_string(), lock_id.to_string());
        data.insert(EXPIRES_AT.to_string(), expires_at.to_rfc3339());
        data
    }

    /// Whether an existing lock object can be claimed
    fn is_free(object: &ClusterObject, now: DateTime<Utc>) -> bool {
        if object.field(HOLDER).is_empty() {
            return true;
        }
        match DateTime::parse_from_rfc3339(object.field(EXPIRES_AT)) {
            Ok(expires_at) => expires_at.with_timezone(&Utc) <= now,
            // Unreadable lease: treat as expired rather than wedge forever
            Err(_) => true,
        }
    }

    fn spawn_renewal(&self, name: String, lock_id: Uuid) -> JoinHandle<()> {
        let store = self.store.clone();
        let holder = self.holder.clone();
        let lease = self.lease;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 3);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match renew(store.as_ref(), &name, &holder, lock_id, lease).await {
                    Ok(true) => debug!("Renewed lease {}", name),
                    Ok(false) => {
                        warn!("Lost lease {} to another builder", name);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease {}: {}", name, e),
                }
            }
        })
    }

    fn renewals(&self) -> KilnResult<std::sync::MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>>> {
        self.renewals
            .lock()
            .map_err(|_| KilnError::Internal("lease table poisoned".to_string()))
    }
}

/// Extend a lease we still own. `Ok(false)` when it is no longer ours.
async fn renew(
    store: &dyn ClusterObjectStore,
    name: &str,
    holder: &str,
    lock_id: Uuid,
    lease: Duration,
) -> KilnResult<bool> {
    let Some(mut object) = store.get(name).await? else {
        return Ok(false);
    };
    if object.field(LOCK_ID) != lock_id.to_string() {
        return Ok(false);
    }

    object.data = ClusterLockManager::lease_data(holder, lock_id, lease);
    // On conflict the next tick re-reads and decides
    if store.replace(&object).await? == WriteOutcome::Conflict {
        debug!("Lease {} changed during renewal", name);
    }
    Ok(true)
}

#[async_trait]
impl LockManager for ClusterLockManager {
    async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>> {
        let name = Self::object_name(key);
        let handle = LockHandle::new(key);
        let data = Self::lease_data(&self.holder, handle.id, self.lease);

        let outcome = match self.store.get(&name).await? {
            None => self.store.create(&ClusterObject::new(&name, data)).await?,
            Some(existing) => {
                if !Self::is_free(&existing, Utc::now()) {
                    debug!("Lock {} held by {}", key, existing.field(HOLDER));
                    return Ok(None);
                }
                if !existing.field(HOLDER).is_empty() {
                    warn!(
                        "Taking over expired lease {} from {}",
                        key,
                        existing.field(HOLDER)
                    );
                }
                let claimed = ClusterObject {
                    data,
                    ..existing
                };
                self.store.replace(&claimed).await?
            }
        };

        if outcome == WriteOutcome::Conflict {
            return Ok(None);
        }

        let renewal = self.spawn_renewal(name, handle.id);
        self.renewals()?.insert(handle.id, renewal);
        debug!("Acquired cluster lock {} in {}", key, self.store.namespace());
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> KilnResult<()> {
        let renewal = self.renewals()?.remove(&handle.id);
        if let Some(renewal) = renewal {
            renewal.abort();
        }

        let name = Self::object_name(&handle.key);
        let Some(mut object) = self.store.get(&name).await? else {
            return Ok(());
        };
        if object.field(LOCK_ID) != handle.id.to_string() {
            return Ok(());
        }

        object.data.insert(HOLDER.to_string(), String::new());
        object.data.insert(LOCK_ID.to_string(), String::new());
        object.data.insert(EXPIRES_AT.to_string(), String::new());

        match self.store.replace(&object).await? {
            WriteOutcome::Written => debug!("Released cluster lock {}", handle.key),
            WriteOutcome::Conflict => debug!("Cluster lock {} changed before release", handle.key),
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }
}

impl Drop for ClusterLockManager {
    fn drop(&mut self) {
        if let Ok(renewals) = self.renewals.get_mut() {
            for (_, renewal) in renewals.drain() {
                renewal.abort();
            }
        }
    }
}
