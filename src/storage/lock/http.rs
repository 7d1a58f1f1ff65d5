//! Client for a remote lock service
//!
//! `POST <endpoint>/acquire` answers 200 with a handle or 409 while the
//! lock is held; `POST <endpoint>/release` answers 200, or 404 if the lock
//! is already gone.

use crate::error::{KilnError, KilnResult};
use crate::storage::http::{JsonClient, Method};
use crate::storage::lock::{LockHandle, LockManager};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct AcquireRequest<'a> {
    key: &'a str,
    holder: &'a str,
    non_blocking: bool,
}

pub struct HttpLockManager {
    endpoint: String,
    holder: String,
    client: JsonClient,
}

impl HttpLockManager {
    pub fn new(endpoint: String, holder: String, timeout: Duration) -> Self {
        Self {
            endpoint,
            holder,
            client: JsonClient::new(timeout, None),
        }
    }

    fn service_error(key: &str, reason: impl Into<String>) -> KilnError {
        KilnError::LockService {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LockManager for HttpLockManager {
    async fn try_acquire(&self, key: &str) -> KilnResult<Option<LockHandle>> {
        let request = AcquireRequest {
            key,
            holder: &self.holder,
            non_blocking: true,
        };

        let reply = self
            .client
            .send(Method::Post, format!("{}/acquire", self.endpoint), &request)
            .await
            .map_err(|e| Self::service_error(key, e))?;

        match reply.status {
            200 => {
                let handle: LockHandle = reply.json().map_err(|e| Self::service_error(key, e))?;
                if handle.key != key {
                    return Err(Self::service_error(
                        key,
                        format!("service granted a lock for {}", handle.key),
                    ));
                }
                debug!("Acquired remote lock {}", key);
                Ok(Some(handle))
            }
            409 => Ok(None),
            _ => Err(Self::service_error(key, reply.describe())),
        }
    }

    async fn release(&self, handle: &LockHandle) -> KilnResult<()> {
        let reply = self
            .client
            .send(Method::Post, format!("{}/release", self.endpoint), handle)
            .await
            .map_err(|e| Self::service_error(&handle.key, e))?;

        match reply.status {
            200 | 204 | 404 => {
                debug!("Released remote lock {}", handle.key);
                Ok(())
            }
            _ => Err(Self::service_error(&handle.key, reply.describe())),
        }
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}
