//! Named objects in a shared cluster namespace
//!
//! Cluster locks and cluster cache entries are stored as small key/value
//! objects. Writes are conditional: `create` fails if the name exists and
//! `replace` fails unless the caller saw the current resource version.

use crate::error::{KilnError, KilnResult};
use crate::storage::http::{HttpReply, JsonClient, Method};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Key/value object stored in the namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterObject {
    pub name: String,
    /// Version observed when read; required by `replace`
    pub resource_version: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl ClusterObject {
    pub fn new(name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            resource_version: None,
            data,
        }
    }

    pub fn field(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or_default()
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another writer got there first
    Conflict,
}

/// Object storage in one cluster namespace
#[async_trait]
pub trait ClusterObjectStore: Send + Sync {
    async fn get(&self, name: &str) -> KilnResult<Option<ClusterObject>>;

    /// Create a new object; `Conflict` if the name is taken
    async fn create(&self, object: &ClusterObject) -> KilnResult<WriteOutcome>;

    /// Replace an object at the version it was read at
    async fn replace(&self, object: &ClusterObject) -> KilnResult<WriteOutcome>;

    fn namespace(&self) -> &str;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMap {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

impl ConfigMap {
    fn from_object(object: &ClusterObject) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), "kiln".to_string());

        Self {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata: ObjectMeta {
                name: object.name.clone(),
                resource_version: object.resource_version.clone(),
                labels,
            },
            data: object.data.clone(),
        }
    }

    fn into_object(self) -> ClusterObject {
        ClusterObject {
            name: self.metadata.name,
            resource_version: self.metadata.resource_version,
            data: self.data,
        }
    }
}

/// ConfigMaps through the Kubernetes REST API
pub struct KubeObjectStore {
    collection_url: String,
    namespace: String,
    client: JsonClient,
}

impl KubeObjectStore {
    /// `api_url` is the API server address, e.g. a `kubectl proxy` endpoint
    pub fn new(api_url: &str, namespace: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            collection_url: format!(
                "{}/api/v1/namespaces/{}/configmaps",
                api_url.trim_end_matches('/'),
                namespace
            ),
            namespace: namespace.to_string(),
            client: JsonClient::new(timeout, token),
        }
    }

    fn api_error(operation: &str, name: &str, reason: impl Into<String>) -> KilnError {
        KilnError::ClusterApi {
            operation: format!("{} configmap {}", operation, name),
            reason: reason.into(),
        }
    }

    fn write_outcome(operation: &str, name: &str, reply: HttpReply) -> KilnResult<WriteOutcome> {
        match (operation, reply.status) {
            (_, 200 | 201) => Ok(WriteOutcome::Written),
            (_, 409) => Ok(WriteOutcome::Conflict),
            // Deleted since it was read. On create a 404 means the namespace is missing.
            ("replace", 404) => Ok(WriteOutcome::Conflict),
            _ => Err(Self::api_error(operation, name, reply.describe())),
        }
    }
}

#[async_trait]
impl ClusterObjectStore for KubeObjectStore {
    async fn get(&self, name: &str) -> KilnResult<Option<ClusterObject>> {
        let reply = self
            .client
            .get(format!("{}/{}", self.collection_url, name))
            .await
            .map_err(|e| Self::api_error("get", name, e))?;

        match reply.status {
            404 => Ok(None),
            200 => {
                let config_map: ConfigMap = reply.json().map_err(|e| Self::api_error("get", name, e))?;
                Ok(Some(config_map.into_object()))
            }
            _ => Err(Self::api_error("get", name, reply.describe())),
        }
    }

    async fn create(&self, object: &ClusterObject) -> KilnResult<WriteOutcome> {
        let mut body = ConfigMap::from_object(object);
        body.metadata.resource_version = None;

        let reply = self
            .client
            .send(Method::Post, self.collection_url.clone(), &body)
            .await
            .map_err(|e| Self::api_error("create", &object.name, e))?;

        Self::write_outcome("create", &object.name, reply)
    }

    async fn replace(&self, object: &ClusterObject) -> KilnResult<WriteOutcome> {
        if object.resource_version.is_none() {
            return Err(KilnError::Internal(format!(
                "replacing configmap {} without a resource version",
                object.name
            )));
        }

        let reply = self
            .client
            .send(
                Method::Put,
                format!("{}/{}", self.collection_url, object.name),
                &ConfigMap::from_object(object),
            )
            .await
            .map_err(|e| Self::api_error("replace", &object.name, e))?;

        Self::write_outcome("replace", &object.name, reply)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Process-local object store with the same conditional-write rules
#[derive(Default)]
pub struct InMemoryObjectStore {
    namespace: String,
    objects: Mutex<HashMap<String, ClusterObject>>,
    next_version: Mutex<u64>,
}

impl InMemoryObjectStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump_version(&self) -> KilnResult<String> {
        let mut next = self
            .next_version
            .lock()
            .map_err(|_| KilnError::Internal("object store version lock poisoned".to_string()))?;
        *next += 1;
        Ok(next.to_string())
    }

    fn objects(&self) -> KilnResult<std::sync::MutexGuard<'_, HashMap<String, ClusterObject>>> {
        self.objects
            .lock()
            .map_err(|_| KilnError::Internal("object store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ClusterObjectStore for InMemoryObjectStore {
    async fn get(&self, name: &str) -> KilnResult<Option<ClusterObject>> {
        Ok(self.objects()?.get(name).cloned())
    }

    async fn create(&self, object: &ClusterObject) -> KilnResult<WriteOutcome> {
        let mut objects = self.objects()?;
        if objects.contains_key(&object.name) {
            return Ok(WriteOutcome::Conflict);
        }

        let mut stored = object.clone();
        stored.resource_version = Some(self.bump_version()?);
        objects.insert(stored.name.clone(), stored);
        debug!("Created object {}/{}", self.namespace, object.name);
        Ok(WriteOutcome::Written)
    }

    async fn replace(&self, object: &ClusterObject) -> KilnResult<WriteOutcome> {
        let mut objects = self.objects()?;
        let Some(current) = objects.get(&object.name) else {
            return Ok(WriteOutcome::Conflict);
        };
        if current.resource_version != object.resource_version {
            return Ok(WriteOutcome::Conflict);
        }

        let mut stored = object.clone();
        stored.resource_version = Some(self.bump_version()?);
        objects.insert(stored.name.clone(), stored);
        Ok(WriteOutcome::Written)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
