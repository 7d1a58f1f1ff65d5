//! Stage cache as JSON files in a host directory

use crate::error::{KilnError, KilnResult};
use crate::storage::cache::{cache_error, check_entry, check_signature, CacheEntry, StagesStorageCache};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

pub struct FileStagesStorageCache {
    dir: PathBuf,
}

impl FileStagesStorageCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, signature: &str) -> PathBuf {
        self.dir.join(format!("{}.json", signature))
    }
}

#[async_trait]
impl StagesStorageCache for FileStagesStorageCache {
    async fn get(&self, signature: &str) -> KilnResult<Option<CacheEntry>> {
        check_signature(signature)?;
        let path = self.entry_path(signature);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(cache_error(
                    signature,
                    format!("reading {}: {}", path.display(), e),
                ))
            }
        };

        let entry: CacheEntry = serde_json::from_str(&content)
            .map_err(|e| cache_error(signature, format!("corrupt entry {}: {}", path.display(), e)))?;
        entry.verified(signature).map(Some)
    }

    async fn put(&self, signature: &str, entry: &CacheEntry) -> KilnResult<()> {
        check_entry(signature, entry)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", self.dir.display()), e))?;

        // Write to a private temp file, then rename over the final name so
        // readers never observe a partial entry
        let path = self.entry_path(signature);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", signature, uuid::Uuid::new_v4().simple()));
        let content = serde_json::to_string_pretty(entry)?;

        if let Err(e) = fs::write(&tmp, content).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(cache_error(signature, format!("writing {}: {}", tmp.display(), e)));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(cache_error(signature, format!("storing {}: {}", path.display(), e)));
        }

        debug!("Stored stage {} in {}", signature, self.dir.display());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
