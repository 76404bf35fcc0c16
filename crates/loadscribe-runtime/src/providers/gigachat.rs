//! GigaChat provider.
//!
//! Access goes through an OAuth2 client-credentials exchange: the client id
//! and secret are sent as basic auth to the auth endpoint together with a
//! fresh `RqUID`, and the returned access token is then used as a bearer
//! token against the chat completions API. Tokens are cached until shortly
//! before they expire.

use super::{
    factory::ProviderFactory,
    openai::{post_chat, ChatRequest},
    secrets::{ApiCredential, CredentialLookup, CredentialSource},
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
};
use crate::http;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_API_BASE_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";
pub const DEFAULT_MODEL: &str = "GigaChat-Pro";

pub const CLIENT_ID: CredentialLookup =
    CredentialLookup::new("client_id", "GIGACHAT_CLIENT_ID", "GigaChat client id");
pub const CLIENT_SECRET: CredentialLookup =
    CredentialLookup::new("client_secret", "GIGACHAT_CLIENT_SECRET", "GigaChat client secret");

/// Tokens are refreshed this long before their stated expiry.
const EXPIRY_MARGIN_MS: i64 = 60_000;

/// Lifetime assumed when the auth response carries no expiry.
const DEFAULT_TOKEN_LIFETIME_MS: i64 = 30 * 60 * 1000;

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Endpoint settings for a GigaChat provider.
#[derive(Debug, Clone)]
pub struct GigaChatEndpoints {
    pub auth_url: String,
    pub api_base_url: String,
    pub scope: String,
    pub model: String,
}

impl Default for GigaChatEndpoints {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

struct CachedToken {
    token: ApiCredential,
    expires_at_ms: i64,
}

impl CachedToken {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms + EXPIRY_MARGIN_MS < self.expires_at_ms
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    expires_at: Option<i64>,
}

/// GigaChat provider with a cached OAuth token.
pub struct GigaChatProvider {
    client_id: ApiCredential,
    client_secret: ApiCredential,
    endpoints: GigaChatEndpoints,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for GigaChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GigaChatProvider")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl GigaChatProvider {
    pub fn new(
        client_id: ApiCredential,
        client_secret: ApiCredential,
        endpoints: GigaChatEndpoints,
        verify_tls: bool,
    ) -> Result<Self, ProviderError> {
        let client = http::build_client_with(CLIENT_TIMEOUT, verify_tls)
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client_id,
            client_secret,
            endpoints,
            client,
            token: Mutex::new(None),
        })
    }

    /// Build from `llm.options`.
    ///
    /// `verify_ssl` defaults to false: the GigaChat endpoints present a
    /// certificate chain most trust stores lack.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let client_id = CLIENT_ID.resolve(config)?;
        let client_secret = CLIENT_SECRET.resolve(config)?;

        let text = |key: &str, default: &str| {
            config[key]
                .as_str()
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        let endpoints = GigaChatEndpoints {
            auth_url: text("auth_url", DEFAULT_AUTH_URL),
            api_base_url: text("api_base_url", DEFAULT_API_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            scope: text("scope", DEFAULT_SCOPE),
            model: text("model", DEFAULT_MODEL),
        };
        let verify_tls = config["verify_ssl"].as_bool().unwrap_or(false);

        Self::new(client_id, client_secret, endpoints, verify_tls)
    }

    /// Return a valid access token, requesting a new one when needed.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now_ms)) {
            return Ok(token.token.expose().to_string());
        }

        let issued = self.request_token(now_ms).await?;
        let value = issued.token.expose().to_string();
        *cached = Some(issued);
        Ok(value)
    }

    async fn request_token(&self, now_ms: i64) -> Result<CachedToken, ProviderError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(auth_url = %self.endpoints.auth_url, rq_uid = %request_id, "Requesting GigaChat access token");

        let response = self
            .client
            .post(&self.endpoints.auth_url)
            .basic_auth(self.client_id.expose(), Some(self.client_secret.expose()))
            .header("RqUID", request_id)
            .header("Accept", "application/json")
            .form(&[
                ("scope", self.endpoints.scope.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .timeout(AUTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(AUTH_TIMEOUT)
                } else {
                    ProviderError::HttpError(e.to_string())
                }
            })?;

        let response = http::check_status(response, "gigachat oauth")
            .await
            .map_err(|e| match e.status {
                status if status >= 500 => ProviderError::ApiError {
                    status,
                    message: e.snippet,
                },
                _ => ProviderError::AuthError(e.snippet),
            })?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::AuthError("no access_token in response".to_string()))?;
        let expires_at_ms = body
            .expires_at
            .unwrap_or(now_ms + DEFAULT_TOKEN_LIFETIME_MS);

        info!(expires_at_ms, "Obtained GigaChat access token");
        Ok(CachedToken {
            token: ApiCredential::new(token, CredentialSource::Issued, "GigaChat access token"),
            expires_at_ms,
        })
    }

    /// Drop the cached token so the next call re-authenticates.
    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl LlmProvider for GigaChatProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let token = self.access_token().await?;
        let model = config.model_or(self.endpoints.model.as_str());

        let request = ChatRequest {
            model,
            messages: &messages,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            stream: false,
        };

        let result = post_chat(
            &self.client,
            &self.endpoints.api_base_url,
            &token,
            &request,
            config.timeout,
        )
        .await;

        if let Err(ProviderError::AuthError(_)) = &result {
            self.invalidate_token().await;
        }
        result
    }

    async fn health_check(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    fn name(&self) -> &str {
        "gigachat"
    }
}

/// Factory for GigaChat providers.
///
/// ## Options
/// ```json
/// {
///   "client_id": "...",        // falls back to GIGACHAT_CLIENT_ID
///   "client_secret": "...",    // falls back to GIGACHAT_CLIENT_SECRET
///   "auth_url": "https://ngw.devices.sberbank.ru:9443/api/v2/oauth",
///   "api_base_url": "https://gigachat.devices.sberbank.ru/api/v1",
///   "scope": "GIGACHAT_API_PERS",
///   "model": "GigaChat-Pro",
///   "verify_ssl": false
/// }
/// ```
pub struct GigaChatProviderFactory;

impl ProviderFactory for GigaChatProviderFactory {
    fn kind(&self) -> &'static str {
        "gigachat"
    }

    fn build(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(GigaChatProvider::from_config(config)?))
    }

    fn check_options(&self, config: &JsonValue) -> Result<(), ProviderError> {
        for lookup in [CLIENT_ID, CLIENT_SECRET] {
            if !lookup.is_available(config) {
                return Err(lookup.missing());
            }
        }
        for key in ["auth_url", "api_base_url"] {
            if let Some(url) = config[key].as_str() {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ProviderError::NotConfigured(format!(
                        "{} must start with http:// or https://",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn default_options(&self) -> JsonValue {
        serde_json::json!({
            "auth_url": DEFAULT_AUTH_URL,
            "api_base_url": DEFAULT_API_BASE_URL,
            "scope": DEFAULT_SCOPE,
            "model": DEFAULT_MODEL,
            "verify_ssl": false
        })
    }

}
