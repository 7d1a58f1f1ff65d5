//! Stage synchronization backends
//!
//! Locks and the stages storage cache share one synchronization target,
//! resolved once at startup into concrete backends.

pub mod cache;
pub mod cluster;
mod http;
pub mod lock;

pub use cache::{
    CacheEntry, ClusterStagesStorageCache, FileStagesStorageCache, HttpStagesStorageCache,
    StagesStorageCache,
};
pub use cluster::{ClusterObject, ClusterObjectStore, InMemoryObjectStore, KubeObjectStore, WriteOutcome};
pub use lock::{
    ClusterLockManager, HttpLockManager, LocalLockManager, LockHandle, LockManager, LockOptions,
};

use crate::config::{ClusterConfig, ConfigManager};
use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sentinel selecting host-local synchronization
pub const LOCAL_SYNCHRONIZATION: &str = "local";

const KUBERNETES_PREFIX: &str = "kubernetes://";
const LOCK_MANAGER_PATH: &str = "lock-manager";
const STAGES_STORAGE_CACHE_PATH: &str = "stages-storage-cache";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where stage locks and cache entries are shared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynchronizationTarget {
    /// This host only
    Local,
    /// Objects in a cluster namespace
    Kubernetes { namespace: String },
    /// Remote synchronization service
    Http { address: String },
}

impl SynchronizationTarget {
    /// Resolve a synchronization string
    pub fn parse(value: &str) -> KilnResult<Self> {
        let value = value.trim();

        if value == LOCAL_SYNCHRONIZATION {
            return Ok(Self::Local);
        }

        if let Some(namespace) = value.strip_prefix(KUBERNETES_PREFIX) {
            let namespace = namespace.trim_end_matches('/');
            if namespace.is_empty() || namespace.contains('/') {
                return Err(KilnError::UnknownSynchronization(value.to_string()));
            }
            return Ok(Self::Kubernetes {
                namespace: namespace.to_string(),
            });
        }

        let host = value
            .strip_prefix("http://")
            .or_else(|| value.strip_prefix("https://"));
        match host {
            Some(host) if !host.trim_end_matches('/').is_empty() => Ok(Self::Http {
                address: value.trim_end_matches('/').to_string(),
            }),
            _ => Err(KilnError::UnknownSynchronization(value.to_string())),
        }
    }
}

impl fmt::Display for SynchronizationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "{}", LOCAL_SYNCHRONIZATION),
            Self::Kubernetes { namespace } => write!(f, "{}{}", KUBERNETES_PREFIX, namespace),
            Self::Http { address } => write!(f, "{}", address),
        }
    }
}

/// Host directories used by local backends and the builder
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Local stages storage cache
    pub cache_dir: PathBuf,
    /// Host lock files
    pub locks_dir: PathBuf,
    /// Scratch build contexts
    pub builds_dir: PathBuf,
}

impl StoragePaths {
    /// Lay out all directories under one root
    pub fn under(root: PathBuf) -> Self {
        Self {
            cache_dir: root.join("stages-storage-cache").join("1"),
            locks_dir: root.join("locks"),
            builds_dir: root.join("builds"),
        }
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::under(ConfigManager::state_dir())
    }
}

/// Build the lock manager for a synchronization target
pub fn create_lock_manager(
    target: &SynchronizationTarget,
    paths: &StoragePaths,
    cluster: &ClusterConfig,
) -> KilnResult<Arc<dyn LockManager>> {
    debug!("Using {} lock manager", target);
    Ok(match target {
        SynchronizationTarget::Local => Arc::new(LocalLockManager::new(paths.locks_dir.clone())),
        SynchronizationTarget::Kubernetes { namespace } => Arc::new(ClusterLockManager::new(
            kube_store(namespace, cluster),
            holder_identity(),
            Duration::from_secs(cluster.lease_secs),
        )),
        SynchronizationTarget::Http { address } => Arc::new(HttpLockManager::new(
            format!("{}/{}", address, LOCK_MANAGER_PATH),
            holder_identity(),
            HTTP_TIMEOUT,
        )),
    })
}

/// Build the stages storage cache for a synchronization target
pub fn create_stages_storage_cache(
    target: &SynchronizationTarget,
    paths: &StoragePaths,
    cluster: &ClusterConfig,
) -> KilnResult<Arc<dyn StagesStorageCache>> {
    debug!("Using {} stages storage cache", target);
    Ok(match target {
        SynchronizationTarget::Local => Arc::new(FileStagesStorageCache::new(paths.cache_dir.clone())),
        SynchronizationTarget::Kubernetes { namespace } => {
            Arc::new(ClusterStagesStorageCache::new(kube_store(namespace, cluster)))
        }
        SynchronizationTarget::Http { address } => Arc::new(HttpStagesStorageCache::new(
            format!("{}/{}", address, STAGES_STORAGE_CACHE_PATH),
            HTTP_TIMEOUT,
        )),
    })
}

fn kube_store(namespace: &str, cluster: &ClusterConfig) -> Arc<dyn ClusterObjectStore> {
    Arc::new(KubeObjectStore::new(
        &cluster.api_url,
        namespace,
        cluster.token.clone(),
        HTTP_TIMEOUT,
    ))
}

/// Identity recorded as the holder of locks taken by this process
pub fn holder_identity() -> String {
    let short_id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}/{}/{}", hostname(), std::process::id(), &short_id[..8])
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for writes of its full length
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).to_string();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Name usable as a file name and as a cluster object name.
///
/// Keys already in `[a-z0-9.-]` map to `<prefix>-<key>`; anything else is
/// normalized and suffixed with a hash of the original key so that distinct
/// keys never share a name.
pub(crate) fn resource_name(prefix: &str, key: &str) -> String {
    const MAX_KEY_LEN: usize = 200;

    let normalized: String = key
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();

    if normalized == key && !key.is_empty() && key.len() <= MAX_KEY_LEN {
        return format!("{}-{}", prefix, key);
    }

    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let mut head: String = normalized.chars().take(MAX_KEY_LEN - 17).collect();
    head = head.trim_matches(|c| c == '-' || c == '.').to_string();
    if head.is_empty() {
        format!("{}-{}", prefix, &digest[..16])
    } else {
        format!("{}-{}-{}", prefix, head, &digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_local() {
        assert_eq!(SynchronizationTarget::parse("local").unwrap(), SynchronizationTarget::Local);
    }

    #[test]
    fn parse_kubernetes() {
        assert_eq!(
            SynchronizationTarget::parse("kubernetes://ci").unwrap(),
            SynchronizationTarget::Kubernetes {
                namespace: "ci".to_string()
            }
        );
        assert!(SynchronizationTarget::parse("kubernetes://").is_err());
    }

    #[test]
    fn parse_http() {
        assert_eq!(
            SynchronizationTarget::parse("https://sync.example.com/").unwrap(),
            SynchronizationTarget::Http {
                address: "https://sync.example.com".to_string()
            }
        );
        assert!(SynchronizationTarget::parse("http://").is_err());
    }

    #[test]
    fn parse_unknown_is_configuration_error() {
        for value in ["", "ftp://host", "Local", "kube://ns"] {
            let err = SynchronizationTarget::parse(value).unwrap_err();
            assert!(matches!(err, KilnError::UnknownSynchronization(_)), "{}", value);
        }
    }

    #[test]
    fn target_display_round_trips() {
        for value in ["local", "kubernetes://ci", "http://10.0.0.1:8080"] {
            let target = SynchronizationTarget::parse(value).unwrap();
            assert_eq!(target.to_string(), value);
        }
    }

    #[test]
    fn storage_paths_layout() {
        let paths = StoragePaths::under(PathBuf::from("/state"));
        assert_eq!(paths.cache_dir, PathBuf::from("/state/stages-storage-cache/1"));
        assert_eq!(paths.locks_dir, PathBuf::from("/state/locks"));
    }

    #[test]
    fn resource_name_keeps_simple_keys() {
        assert_eq!(resource_name("kiln-lock", "stage-abc123"), "kiln-lock-stage-abc123");
    }

    #[test]
    fn resource_name_disambiguates_normalized_keys() {
        let a = resource_name("kiln-lock", "Shop/Stage");
        let b = resource_name("kiln-lock", "shop-stage");
        assert_ne!(a, b);
        assert!(a.starts_with("kiln-lock-shop-stage-"));
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn holder_identity_is_unique_per_call() {
        assert_ne!(holder_identity(), holder_identity());
    }

    #[tokio::test]
    async fn local_factories() {
        let temp = TempDir::new().unwrap();
        let paths = StoragePaths::under(temp.path().to_path_buf());
        let cluster = ClusterConfig::default();

        let locks = create_lock_manager(&SynchronizationTarget::Local, &paths, &cluster).unwrap();
        let cache =
            create_stages_storage_cache(&SynchronizationTarget::Local, &paths, &cluster).unwrap();

        assert_eq!(locks.backend_name(), "local");
        assert_eq!(cache.backend_name(), "local");
    }

    #[test]
    fn remote_factories_use_service_paths() {
        let temp = TempDir::new().unwrap();
        let paths = StoragePaths::under(temp.path().to_path_buf());
        let target = SynchronizationTarget::parse("http://sync:8080").unwrap();

        let locks = create_lock_manager(&target, &paths, &ClusterConfig::default()).unwrap();
        assert_eq!(locks.backend_name(), "http");
    }
}
