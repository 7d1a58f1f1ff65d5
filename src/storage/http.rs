//! Blocking HTTP client shared by the remote and cluster backends
//!
//! `ureq` is synchronous, so every request runs on the blocking pool.
//! Non-2xx statuses are returned to the caller rather than turned into
//! errors: each backend decides what a 404 or 409 means.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Response status and body
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_str(&self.body).map_err(|e| format!("invalid response body: {}", e))
    }

    /// Short description for error messages
    pub fn describe(&self) -> String {
        let body = self.body.trim();
        if body.is_empty() {
            format!("unexpected status {}", self.status)
        } else {
            let snippet: String = body.chars().take(200).collect();
            format!("unexpected status {}: {}", self.status, snippet)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Method {
    Post,
    Put,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

#[derive(Clone)]
pub(crate) struct JsonClient {
    agent: ureq::Agent,
    token: Option<String>,
}

impl JsonClient {
    pub fn new(timeout: Duration, token: Option<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, token }
    }

    pub async fn get(&self, url: String) -> Result<HttpReply, String> {
        let agent = self.agent.clone();
        let token = self.token.clone();

        run_blocking(move || {
            let mut request = agent.get(&url).header("Accept", "application/json");
            if let Some(token) = token {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
            let response = request.call().map_err(|e| format!("GET {}: {}", url, e))?;
            read_reply(response)
        })
        .await
    }

    pub async fn send<B>(&self, method: Method, url: String, body: &B) -> Result<HttpReply, String>
    where
        B: Serialize + ?Sized,
    {
        let agent = self.agent.clone();
        let token = self.token.clone();
        let body = serde_json::to_string(body).map_err(|e| format!("encoding request: {}", e))?;

        run_blocking(move || {
            let mut request = match method {
                Method::Post => agent.post(&url),
                Method::Put => agent.put(&url),
            };
            request = request
                .header("Accept", "application/json")
                .header("Content-Type", "application/json");
            if let Some(token) = token {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
            // A sized body goes out with Content-Length rather than chunked
            let response = request
                .send(body.as_bytes())
                .map_err(|e| format!("{} {}: {}", method.as_str(), url, e))?;
            read_reply(response)
        })
        .await
    }
}

fn read_reply(mut response: ureq::http::Response<ureq::Body>) -> Result<HttpReply, String> {
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| format!("reading response: {}", e))?;
    Ok(HttpReply { status, body })
}

async fn run_blocking<F>(f: F) -> Result<HttpReply, String>
where
    F: FnOnce() -> Result<HttpReply, String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("request task failed: {}", e))?
}
