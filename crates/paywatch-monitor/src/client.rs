//! HTTP adapters for the external collaborators.
//!
//! [`HttpCollaboratorClient`] talks to the payment ledger and the providers'
//! status gateway; [`HttpNotifier`] posts notifications as JSON to an alerting
//! webhook. Both share one pooled `reqwest::Client` per instance and map
//! transport failures onto [`MonitorError`] so periodic stages can log and
//! retry on the next cycle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use paywatch_core::models::{IntentId, ProviderName};
use reqwest::Response;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    collaborators::{
        IntentSource, Notification, Notifier, NotifyAck, OpenIntent, ProviderStatus,
        ProviderStatusQuery,
    },
    error::{MonitorError, Result},
};

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration shared by the HTTP adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the collaborator API, without trailing slash.
    pub base_url: String,
    /// Timeout for each request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Bearer token sent on every request, if the collaborator needs one.
    pub bearer_token: Option<String>,
}

impl ClientConfig {
    /// Creates a configuration for `base_url` with default settings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::default() }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: "Paywatch-Monitor/1.0".to_string(),
            bearer_token: None,
        }
    }
}

fn build_client(config: &ClientConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(&config.user_agent)
        .build()
        .map_err(|e| MonitorError::configuration(format!("failed to build HTTP client: {e}")))
}

fn map_send_error(error: &reqwest::Error, timeout: Duration) -> MonitorError {
    if error.is_timeout() {
        return MonitorError::timeout(timeout.as_secs());
    }
    if error.is_connect() {
        return MonitorError::collaborator(format!("connection failed: {error}"));
    }
    MonitorError::collaborator(error.to_string())
}

/// Turns a non-2xx response into `CollaboratorStatus`, keeping a bounded
/// prefix of the body.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    };
    Err(MonitorError::collaborator_status(status.as_u16(), body))
}

/// Client for the payment ledger and provider status APIs.
///
/// - `GET {base}/intents/open?provider=..&older_than=..` lists open intents
/// - `GET {base}/providers/{provider}/intents/{intent}/status` re-fetches one
#[derive(Debug, Clone)]
pub struct HttpCollaboratorClient {
    client: reqwest::Client,
    config: ClientConfig,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ProviderStatus,
}

impl HttpCollaboratorClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Configuration` if the HTTP client cannot be
    /// built from the settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut request = self.client.get(self.url(path)).query(query);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response =
            request.send().await.map_err(|e| map_send_error(&e, self.config.timeout))?;
        let response = ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| MonitorError::collaborator(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl IntentSource for HttpCollaboratorClient {
    async fn list_open_intents(
        &self,
        provider: &ProviderName,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<OpenIntent>> {
        let span = info_span!("list_open_intents", provider = %provider);

        async move {
            let intents: Vec<OpenIntent> = self
                .get_json(
                    "/intents/open",
                    &[
                        ("provider", provider.to_string()),
                        ("older_than", older_than.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    ],
                )
                .await?;

            tracing::debug!(count = intents.len(), "fetched open intents");
            Ok(intents)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ProviderStatusQuery for HttpCollaboratorClient {
    async fn query_status(
        &self,
        provider: &ProviderName,
        intent: &IntentId,
    ) -> Result<ProviderStatus> {
        let span = info_span!("query_provider_status", provider = %provider, intent = %intent);

        async move {
            let path = format!("/providers/{provider}/intents/{intent}/status");
            let response: StatusResponse = self.get_json(&path, &[]).await?;

            tracing::debug!(status = %response.status, "provider status fetched");
            Ok(response.status)
        }
        .instrument(span)
        .await
    }
}

/// Notifier that posts each notification as JSON to an alerting webhook.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    config: ClientConfig,
}

#[derive(Debug, Deserialize)]
struct NotifyResponse {
    #[serde(default)]
    reference: Option<String>,
}

impl HttpNotifier {
    /// Creates a notifier posting to `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Configuration` if the HTTP client cannot be
    /// built from the settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck> {
        let span = info_span!(
            "http_notify",
            provider = %notification.provider(),
            fingerprint = %notification.fingerprint,
            level = %notification.level,
        );

        async move {
            let mut request = self
                .client
                .post(&self.config.base_url)
                .json(notification)
                .header("X-Paywatch-Fingerprint", &notification.fingerprint)
                .header("X-Paywatch-Escalation-Level", notification.escalation_level.to_string())
                .header("X-Paywatch-Sent-At", Utc::now().to_rfc3339());
            if let Some(token) = &self.config.bearer_token {
                request = request.bearer_auth(token);
            }

            let response =
                request.send().await.map_err(|e| map_send_error(&e, self.config.timeout))?;
            let response = ensure_success(response).await?;

            // Transports may answer with an empty body
            let reference = match response.bytes().await {
                Ok(bytes) if !bytes.is_empty() => serde_json::from_slice::<NotifyResponse>(&bytes)
                    .ok()
                    .and_then(|body| body.reference),
                _ => None,
            };

            tracing::info!("notification delivered");
            Ok(NotifyAck { accepted: true, reference })
        }
        .instrument(span)
        .await
    }
}
