//! OpenAI-compatible chat completions provider.
//!
//! Serves the `openai`, `perplexity` and `openai_compatible` provider types.
//! They differ only in default base URL, key variable and default model.
//!
//! ## Security
//!
//! The API key lives in an [`ApiCredential`] and is exposed only when the
//! `Authorization` header is set.

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialLookup, CredentialSource},
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
use crate::http;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Whole-request ceiling set on the client; each completion request sets its
/// own, usually shorter, timeout from [`CompletionConfig`].
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

/// OpenAI-compatible provider.
pub struct OpenAiCompatibleProvider {
    name: &'static str,
    credential: ApiCredential,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl OpenAiCompatibleProvider {
    /// Create a provider for an explicit endpoint.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_credential(
            "openai_compatible",
            ApiCredential::new(api_key, CredentialSource::Programmatic, "LLM API key"),
            base_url.into(),
            default_model.into(),
        )
    }

    fn with_credential(
        name: &'static str,
        credential: ApiCredential,
        base_url: String,
        default_model: String,
    ) -> Result<Self, ProviderError> {
        let client = http::build_client(CLIENT_TIMEOUT)
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            name,
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Chat completions request body.
#[derive(Debug, Serialize)]
pub(super) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// POST a chat completion request and map the reply.
///
/// Shared with the GigaChat provider, whose chat endpoint speaks the same
/// format behind a different bearer token.
pub(super) async fn post_chat(
    client: &reqwest::Client,
    base_url: &str,
    bearer: &str,
    request: &ChatRequest<'_>,
    timeout: Duration,
) -> Result<CompletionResponse, ProviderError> {
    let response = client
        .post(format!("{}/chat/completions", base_url))
        .bearer_auth(bearer)
        .timeout(timeout)
        .json(request)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(timeout)
            } else {
                ProviderError::HttpError(e.to_string())
            }
        })?;

    let status = response.status();

    if status == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }

    let response = http::check_status(response, "chat completions")
        .await
        .map_err(|e| match e.status {
            401 | 403 => ProviderError::AuthError(e.snippet),
            status => ProviderError::ApiError {
                status,
                message: e.snippet,
            },
        })?;

    let body: ChatResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::ParseError(e.to_string()))?;

    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;

    let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
    });

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        usage,
        model: body.model.unwrap_or_else(|| request.model.to_string()),
        stop_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = config.model_or(self.default_model.as_str());
        if model.is_empty() {
            return Err(ProviderError::NotConfigured(format!(
                "{}: no model configured (set llm.model)",
                self.name
            )));
        }

        let request = ChatRequest {
            model,
            messages: &messages,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            stream: false,
        };

        debug!(provider = self.name, model, messages = messages.len(), "Sending chat completion");
        post_chat(
            &self.client,
            &self.base_url,
            self.credential.expose(),
            &request,
            config.timeout,
        )
        .await
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Factory for the OpenAI-compatible provider types.
///
/// ## Options
/// ```json
/// {
///   "api_key": "sk-...",            // falls back to the type's env variable
///   "base_url": "https://...",       // required for openai_compatible
///   "model": "gpt-4o-mini"           // used when llm.model is not set
/// }
/// ```
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProviderFactory {
    provider_type: &'static str,
    default_base_url: Option<&'static str>,
    key_env: &'static str,
    default_model: &'static str,
}

impl OpenAiCompatibleProviderFactory {
    pub fn openai() -> Self {
        Self {
            provider_type: "openai",
            default_base_url: Some("https://api.openai.com/v1"),
            key_env: "OPENAI_API_KEY",
            default_model: "gpt-4o-mini",
        }
    }

    pub fn perplexity() -> Self {
        Self {
            provider_type: "perplexity",
            default_base_url: Some("https://api.perplexity.ai"),
            key_env: "PERPLEXITY_API_KEY",
            default_model: "sonar",
        }
    }

    /// Any endpoint speaking the chat completions format.
    pub fn generic() -> Self {
        Self {
            provider_type: "openai_compatible",
            default_base_url: None,
            key_env: "LLM_API_KEY",
            default_model: "gpt-4o-mini",
        }
    }

    fn api_key(&self) -> CredentialLookup {
        CredentialLookup::new("api_key", self.key_env, "LLM API key")
    }

    fn base_url<'a>(&self, config: &'a JsonValue) -> Result<&'a str, ProviderError> {
        let url = config["base_url"]
            .as_str()
            .filter(|u| !u.is_empty())
            .or(self.default_base_url)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "{}: 'base_url' is required in llm.options",
                    self.provider_type
                ))
            })?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProviderError::NotConfigured(
                "base_url must start with http:// or https://".to_string(),
            ));
        }
        Ok(url)
    }
}

impl ProviderFactory for OpenAiCompatibleProviderFactory {
    fn kind(&self) -> &'static str {
        self.provider_type
    }

    fn build(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        let base_url = self.base_url(config)?.to_string();
        let credential = self.api_key().resolve(config)?;
        let default_model = config["model"]
            .as_str()
            .unwrap_or(self.default_model)
            .to_string();

        let provider = OpenAiCompatibleProvider::with_credential(
            self.provider_type,
            credential,
            base_url,
            default_model,
        )?;
        Ok(Arc::new(provider))
    }

    fn check_options(&self, config: &JsonValue) -> Result<(), ProviderError> {
        self.base_url(config)?;
        let key = self.api_key();
        if !key.is_available(config) {
            return Err(key.missing());
        }
        Ok(())
    }

    fn default_options(&self) -> JsonValue {
        match self.default_base_url {
            Some(url) => serde_json::json!({ "base_url": url, "model": self.default_model }),
            None => serde_json::json!({ "model": self.default_model }),
        }
    }
}
