//! Client for a remote stages storage cache service

use crate::error::KilnResult;
use crate::storage::cache::{cache_error, check_entry, check_signature, CacheEntry, StagesStorageCache};
use crate::storage::http::{JsonClient, Method};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct HttpStagesStorageCache {
    endpoint: String,
    client: JsonClient,
}

impl HttpStagesStorageCache {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: JsonClient::new(timeout, None),
        }
    }

    fn entry_url(&self, signature: &str) -> String {
        format!("{}/{}", self.endpoint, signature)
    }
}

#[async_trait]
impl StagesStorageCache for HttpStagesStorageCache {
    async fn get(&self, signature: &str) -> KilnResult<Option<CacheEntry>> {
        check_signature(signature)?;

        let reply = self
            .client
            .get(self.entry_url(signature))
            .await
            .map_err(|e| cache_error(signature, e))?;

        match reply.status {
            404 => Ok(None),
            200 => {
                let entry: CacheEntry = reply.json().map_err(|e| cache_error(signature, e))?;
                entry.verified(signature).map(Some)
            }
            _ => Err(cache_error(signature, reply.describe())),
        }
    }

    async fn put(&self, signature: &str, entry: &CacheEntry) -> KilnResult<()> {
        check_entry(signature, entry)?;

        let reply = self
            .client
            .send(Method::Put, self.entry_url(signature), entry)
            .await
            .map_err(|e| cache_error(signature, e))?;

        if !reply.is_success() {
            return Err(cache_error(signature, reply.describe()));
        }
        debug!("Stored stage {} remotely", signature);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KilnError;
    use crate::storage::cache::sample_entry;
    use crate::storage::http::test_server;

    fn cache(address: &str) -> HttpStagesStorageCache {
        HttpStagesStorageCache::new(format!("{}/stages-storage-cache", address), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn not_found_is_a_miss() {
        let server = test_server::serve(vec![(404, "")]);
        assert!(cache(&server.address).get("abc").await.unwrap().is_none());
        assert_eq!(
            server.requests.lock().unwrap()[0].path,
            "/stages-storage-cache/abc"
        );
    }

    #[tokio::test]
    async fn found_entry_is_returned() {
        let body = serde_json::to_string(&sample_entry("abc")).unwrap();
        let server = test_server::serve(vec![(200, body.as_str())]);

        let entry = cache(&server.address).get("abc").await.unwrap().unwrap();
        assert_eq!(entry.signature, "abc");
    }

    #[tokio::test]
    async fn server_error_is_not_a_miss() {
        let server = test_server::serve(vec![(503, "unavailable")]);
        let err = cache(&server.address).get("abc").await.unwrap_err();
        assert!(matches!(err, KilnError::CacheService { .. }));
    }

    #[tokio::test]
    async fn unreachable_service_is_not_a_miss() {
        let err = cache(&test_server::closed_address()).get("abc").await.unwrap_err();
        assert!(matches!(err, KilnError::CacheService { .. }));
    }

    #[tokio::test]
    async fn put_sends_entry() {
        let server = test_server::serve(vec![(204, "")]);
        cache(&server.address).put("abc", &sample_entry("abc")).await.unwrap();

        let requests = server.requests.lock().unwrap();
        assert_eq!(requests[0].method, "PUT");
        assert!(requests[0].body.contains("\"signature\":\"abc\""));
    }
}
