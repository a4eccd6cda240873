use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::lifecycle::{SharedResource, SharedResourceRegistry, ShutdownParticipant};
use crate::types::{CoreError, Result};

/// Classifier of the registry-managed client returned by [`HttpClient::shared`].
pub const SHARED_CLIENT_CLASSIFIER: &str = "coreutils-fiber";

const NO_CACHE: &str = "no-cache, no-store";
const MAX_STALE: &str = "max-stale=3600";

pub(crate) fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Thin asynchronous HTTP client. Once stopped it refuses new requests.
pub struct HttpClient {
    inner: reqwest::Client,
    running: AtomicBool,
}

impl HttpClient {
    /// A private client, not tracked by any registry.
    pub fn isolated() -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()?;
        Ok(Self::from_client(inner))
    }

    pub fn from_client(inner: reqwest::Client) -> Self {
        Self {
            inner,
            running: AtomicBool::new(true),
        }
    }

    /// The process-wide client kept in `registry`, created on first use and
    /// stopped with the other shutdown participants.
    pub fn shared(registry: &SharedResourceRegistry) -> Result<Arc<Self>> {
        registry
            .get_or_create(Some(SHARED_CLIENT_CLASSIFIER), || match Self::isolated() {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::error!("Failed to build shared HTTP client: {}", e);
                    None
                }
            })?
            .ok_or_else(|| CoreError::Internal("shared HTTP client unavailable".to_string()))
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub async fn get(&self, url: &str, accept: &str, no_cache: bool) -> Result<Response> {
        let accept = require("media type", accept)?;
        let request = self
            .request(Method::GET, url)?
            .header(ACCEPT, accept)
            .header(CACHE_CONTROL, if no_cache { NO_CACHE } else { MAX_STALE });
        self.send(request).await
    }

    /// GET with `Accept: application/json`, decoding a successful body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, no_cache: bool) -> Result<T> {
        let response = self
            .get(url, "application/json", no_cache)
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    pub async fn post(&self, url: &str, media_type: &str, body: impl Into<String>) -> Result<Response> {
        self.send_body(Method::POST, url, media_type, body.into()).await
    }

    pub async fn put(&self, url: &str, media_type: &str, body: impl Into<String>) -> Result<Response> {
        self.send_body(Method::PUT, url, media_type, body.into()).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        let request = self.request(Method::DELETE, url)?;
        self.send(request).await
    }

    async fn send_body(&self, method: Method, url: &str, media_type: &str, body: String) -> Result<Response> {
        let media_type = require("media type", media_type)?;
        let request = self
            .request(method, url)?
            .header(CONTENT_TYPE, format!("{}; charset=utf-8", media_type))
            .body(body);
        self.send(request).await
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        if !self.is_running() {
            return Err(CoreError::ClientStopped);
        }
        let url = url::Url::parse(require("URL", url)?)?;
        Ok(self.inner.request(method, url))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        tracing::debug!(
            url = %response.url(),
            status = response.status().as_u16(),
            "HTTP request completed"
        );
        Ok(response)
    }
}

fn require<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CoreError::invalid(format!("{} cannot be blank", what)));
    }
    Ok(value)
}

impl ShutdownParticipant for HttpClient {
    fn name(&self) -> &str {
        "http_client"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn init(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("HTTP client stopped");
        }
        Ok(())
    }
}

impl SharedResource for HttpClient {
    fn as_participant(self: Arc<Self>) -> Option<Arc<dyn ShutdownParticipant>> {
        Some(self)
    }
}
