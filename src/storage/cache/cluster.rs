//! Stage cache as objects in a cluster namespace

use crate::error::KilnResult;
use crate::storage::cache::{cache_error, check_entry, check_signature, CacheEntry, StagesStorageCache};
use crate::storage::cluster::{ClusterObject, ClusterObjectStore, WriteOutcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const ENTRY_FIELD: &str = "entry";

pub struct ClusterStagesStorageCache {
    store: Arc<dyn ClusterObjectStore>,
}

impl ClusterStagesStorageCache {
    pub fn new(store: Arc<dyn ClusterObjectStore>) -> Self {
        Self { store }
    }

    fn object_name(signature: &str) -> String {
        format!("kiln-stage-{}", signature.to_ascii_lowercase())
    }
}

#[async_trait]
impl StagesStorageCache for ClusterStagesStorageCache {
    async fn get(&self, signature: &str) -> KilnResult<Option<CacheEntry>> {
        check_signature(signature)?;

        let Some(object) = self.store.get(&Self::object_name(signature)).await? else {
            return Ok(None);
        };
        let raw = object
            .data
            .get(ENTRY_FIELD)
            .ok_or_else(|| cache_error(signature, format!("object {} has no entry", object.name)))?;

        let entry: CacheEntry = serde_json::from_str(raw)
            .map_err(|e| cache_error(signature, format!("corrupt entry: {}", e)))?;
        entry.verified(signature).map(Some)
    }

    async fn put(&self, signature: &str, entry: &CacheEntry) -> KilnResult<()> {
        check_entry(signature, entry)?;

        let mut data = BTreeMap::new();
        data.insert(ENTRY_FIELD.to_string(), serde_json::to_string(entry)?);
        let object = ClusterObject::new(Self::object_name(signature), data);

        match self.store.create(&object).await? {
            WriteOutcome::Written => debug!("Stored stage {} in {}", signature, self.store.namespace()),
            WriteOutcome::Conflict => debug!("Stage {} was already stored", signature),
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }
}
