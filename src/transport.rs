//! Transport adapter for the autosave endpoint.
//!
//! ## Wire contract
//!
//! | Path                                    | Method | Body          |
//! |-----------------------------------------|--------|---------------|
//! | `{base}/{document_id}/autosave`         | `POST` | `SaveRequest` |
//!
//! Any 2xx counts as success; the body is parsed into a [`SaveReceipt`] on a
//! best-effort basis. Everything else is a [`DraftError`] and feeds the
//! agent's retry loop.
//!
//! The beacon path posts the same body from a detached task. Delivery is
//! at-most-once and unconfirmed: no response is read and nothing is retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::errors::DraftError;
use crate::state::Payload;

/// Why a request was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveTrigger {
    Periodic,
    PageUnload,
}

/// Identifies the client instance to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    /// Fresh per agent, so server-side audit logs can group saves
    pub session_id: Uuid,
}

impl ClientInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            session_id: Uuid::new_v4(),
        }
    }

    /// Value for the `User-Agent` header.
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Metadata envelope sent alongside every draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub timestamp: DateTime<Utc>,
    pub client: ClientInfo,
    pub trigger: SaveTrigger,
}

/// Body of `POST {base}/{document_id}/autosave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub content: Payload,
    pub metadata: SaveMetadata,
}

impl SaveRequest {
    pub fn new(content: Payload, client: &ClientInfo, trigger: SaveTrigger) -> Self {
        Self {
            content,
            metadata: SaveMetadata {
                timestamp: Utc::now(),
                client: client.clone(),
                trigger,
            },
        }
    }
}

/// What the endpoint said about a successful save. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveReceipt {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub response_id: Option<i64>,
    #[serde(default)]
    pub last_auto_save: Option<String>,
    #[serde(default)]
    pub auto_save_count: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SaveReceipt {
    /// Parse a 2xx body. Empty or unexpected bodies yield an empty receipt.
    pub fn from_body(body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        serde_json::from_slice(body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "autosave response body is not a receipt");
            Self::default()
        })
    }
}

/// Abstraction over the persistence endpoint.
/// Real implementation: `HttpTransport`. Tests use a scripted in-memory double.
#[async_trait]
pub trait SaveTransport: Send + Sync {
    /// Durable save. Resolves once the endpoint has answered or the send failed.
    async fn save(&self, document_id: &str, request: &SaveRequest)
    -> Result<SaveReceipt, DraftError>;

    /// Fire-and-forget delivery for host teardown. Must not block.
    fn send_beacon(&self, document_id: &str, request: SaveRequest);
}

/// Caller-supplied bearer token lookup, consulted on every request.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// No authentication.
pub struct NoToken;

impl TokenSource for NoToken {
    fn token(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone()).filter(|t| !t.is_empty())
    }
}

/// Token read from an environment variable at request time.
pub struct EnvToken(pub String);

impl TokenSource for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.0).ok().filter(|t| !t.is_empty())
    }
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenSource>,
    user_agent: String,
    beacons: TaskTracker,
}

impl HttpTransport {
    /// Transport with the client's default timeout behaviour.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::from_client(reqwest::Client::new(), base_url)
    }

    /// Transport whose requests give up after `timeout`.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DraftError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DraftError::Transport)?;
        Ok(Self::from_client(client, base_url))
    }

    fn from_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: Arc::new(NoToken),
            user_agent: ClientInfo::current().user_agent(),
            beacons: TaskTracker::new(),
        }
    }

    pub fn with_token_source(mut self, token: impl TokenSource + 'static) -> Self {
        self.token = Arc::new(token);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/{document_id}/autosave`, tolerating a trailing slash on the base.
    ///
    /// The id is pushed as a single percent-encoded path segment.
    pub fn autosave_url(&self, document_id: &str) -> Result<reqwest::Url, DraftError> {
        let invalid = |reason: String| DraftError::InvalidEndpoint {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(document_id)
            .push("autosave");
        Ok(url)
    }

    fn post(&self, document_id: &str, body: Vec<u8>) -> Result<reqwest::RequestBuilder, DraftError> {
        let mut builder = self
            .client
            .post(self.autosave_url(document_id)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .body(body);
        if let Some(token) = self.token.token() {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// Give outstanding beacons up to `grace` to finish.
    ///
    /// Returns `true` when every beacon completed in time. Intended for
    /// process shutdown; beacons still running afterwards are abandoned.
    pub async fn wait_for_beacons(&self, grace: Duration) -> bool {
        self.beacons.close();
        let finished = tokio::time::timeout(grace, self.beacons.wait())
            .await
            .is_ok();
        self.beacons.reopen();
        finished
    }

    /// Number of beacons still in flight.
    pub fn pending_beacons(&self) -> usize {
        self.beacons.len()
    }
}

#[async_trait]
impl SaveTransport for HttpTransport {
    async fn save(
        &self,
        document_id: &str,
        request: &SaveRequest,
    ) -> Result<SaveReceipt, DraftError> {
        let body = serde_json::to_vec(request).map_err(DraftError::Encode)?;
        let response = self
            .post(document_id, body)?
            .send()
            .await
            .map_err(DraftError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DraftError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.unwrap_or_default();
        Ok(SaveReceipt::from_body(&body))
    }

    fn send_beacon(&self, document_id: &str, request: SaveRequest) {
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(document_id, error = %e, "dropping unload beacon: encode failed");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(document_id, "dropping unload beacon: no async runtime");
            return;
        };

        let builder = match self.post(document_id, body) {
            Ok(builder) => builder,
            Err(e) => {
                tracing::warn!(document_id, error = %e, "dropping unload beacon: bad endpoint");
                return;
            }
        };
        let document_id = document_id.to_string();
        self.beacons.spawn_on(
            async move {
                // Result intentionally unread: delivery is unconfirmed.
                if let Err(e) = builder.send().await {
                    tracing::debug!(document_id, error = %e, "unload beacon not delivered");
                }
            },
            &handle,
        );
    }
}
