//! Authenticated JSON requests with a per-call deadline.

use crate::error::{Result, SyncError};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Thin wrapper over `reqwest::Client` shared by both service clients.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("note-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            timeout,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start a request carrying the bearer token.
    ///
    /// Fails with `AuthMissing` before touching the network when no token is set.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        if self.token.is_empty() {
            return Err(SyncError::AuthMissing);
        }
        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json"))
    }

    /// Send `request` and decode a JSON body.
    ///
    /// Non-2xx statuses become `RequestFailed`; exceeding the deadline
    /// becomes `Timeout`.
    pub async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let call = async {
            let response = request.send().await?;
            let status = response.status();
            debug!(url = %response.url(), status = status.as_u16(), "Remote response");

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(SyncError::RequestFailed {
                    status: status.as_u16(),
                    message,
                });
            }

            let bytes = response.bytes().await?;
            serde_json::from_slice::<T>(&bytes).map_err(SyncError::from)
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Like [`execute`](Self::execute) for endpoints whose body is irrelevant.
    pub async fn execute_empty(&self, request: RequestBuilder) -> Result<()> {
        let call = async {
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(SyncError::RequestFailed {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                })
            }
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }
}
