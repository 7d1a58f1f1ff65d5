//! Stages storage cache
//!
//! Maps a stage signature to the artifact built for it. Entries are written
//! once and never updated: two entries for the same signature describe
//! equivalent artifacts, so racing writers are harmless.

mod cluster;
mod file;
mod http;

pub use cluster::ClusterStagesStorageCache;
pub use file::FileStagesStorageCache;
pub use http::HttpStagesStorageCache;

use crate::builder::ArtifactRef;
use crate::error::{KilnError, KilnResult};
use crate::stage::StageKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached stage artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub signature: String,
    pub image: String,
    pub stage: StageKind,
    pub artifact: ArtifactRef,
    /// Builder that produced the artifact
    pub builder: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        signature: impl Into<String>,
        image: impl Into<String>,
        stage: StageKind,
        artifact: ArtifactRef,
        builder: impl Into<String>,
    ) -> Self {
        Self {
            signature: signature.into(),
            image: image.into(),
            stage,
            artifact,
            builder: builder.into(),
            created_at: Utc::now(),
        }
    }

    /// Reject entries stored under a different signature than requested
    pub(crate) fn verified(self, signature: &str) -> KilnResult<Self> {
        if self.signature != signature {
            return Err(cache_error(
                signature,
                format!("stored entry belongs to signature {}", self.signature),
            ));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait StagesStorageCache: Send + Sync {
    /// Entry for `signature`, `None` only when nothing is stored
    async fn get(&self, signature: &str) -> KilnResult<Option<CacheEntry>>;

    /// Store an entry; storing the same signature twice is allowed
    async fn put(&self, signature: &str, entry: &CacheEntry) -> KilnResult<()>;

    /// Backend name for display
    fn backend_name(&self) -> &'static str;
}

pub(crate) fn cache_error(signature: &str, reason: impl Into<String>) -> KilnError {
    KilnError::CacheService {
        signature: signature.to_string(),
        reason: reason.into(),
    }
}

/// Signatures are hex; anything else must not reach a path or URL
pub(crate) fn check_signature(signature: &str) -> KilnResult<()> {
    if signature.is_empty() || !signature.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(cache_error(signature, "malformed signature"));
    }
    Ok(())
}

pub(crate) fn check_entry(signature: &str, entry: &CacheEntry) -> KilnResult<()> {
    check_signature(signature)?;
    if entry.signature != signature {
        return Err(KilnError::Internal(format!(
            "cache entry for {} stored under {}",
            entry.signature, signature
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_entry(signature: &str) -> CacheEntry {
    CacheEntry::new(
        signature,
        "backend",
        StageKind::Install,
        ArtifactRef::new(format!("kiln-stages/shop:{}", signature)),
        "podman",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_rejects_foreign_entry() {
        let err = sample_entry("aaa").verified("bbb").unwrap_err();
        assert!(matches!(err, KilnError::CacheService { .. }));
        assert!(sample_entry("aaa").verified("aaa").is_ok());
    }

    #[test]
    fn malformed_signature_is_rejected() {
        assert!(check_signature("../etc/passwd").is_err());
        assert!(check_signature("").is_err());
        assert!(check_signature("abc123").is_ok());
    }

    #[test]
    fn put_under_wrong_key_is_internal() {
        let err = check_entry("bbb", &sample_entry("aaa")).unwrap_err();
        assert!(matches!(err, KilnError::Internal(_)));
    }

    #[test]
    fn entry_json_shape() {
        let json = serde_json::to_value(sample_entry("abc")).unwrap();
        assert_eq!(json["stage"], "install");
        assert_eq!(json["artifact"], "kiln-stages/shop:abc");
        assert!(json["created_at"].is_string());
    }
}
