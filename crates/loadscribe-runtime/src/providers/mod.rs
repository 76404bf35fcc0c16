//! LLM provider abstractions for loadscribe-runtime.
//!
//! Every provider speaks the chat-completions shape: a list of role-tagged
//! messages in, one text completion out. Two implementations ship:
//! [`OpenAiCompatibleProvider`] (OpenAI, Perplexity and any compatible
//! endpoint) and [`GigaChatProvider`] (OAuth2 token, then the same wire format).
//!
//! ## Security
//!
//! All providers keep credentials in [`ApiCredential`]; see [`secrets`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use loadscribe_core::config::LlmConfig;
use loadscribe_core::ConfigError;

mod factory;
mod gigachat;
mod openai;
pub mod secrets;

pub use factory::{ProviderCheck, ProviderFactory, ProviderRegistry};
pub use gigachat::{GigaChatEndpoints, GigaChatProvider, GigaChatProviderFactory};
pub use openai::{OpenAiCompatibleProvider, OpenAiCompatibleProviderFactory};
pub use secrets::{ApiCredential, CredentialLookup, CredentialSource};


/// Errors from LLM providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Transport failures, timeouts, rate limits and 5xx are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::HttpError(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_) => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            ProviderError::ParseError(_)
            | ProviderError::AuthError(_)
            | ProviderError::NotConfigured(_) => false,
        }
    }
}

/// Sampling settings sent with every request of a session.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Empty means the provider's own default model.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 2048,
            temperature: 0.0,
            top_p: 0.7,
            timeout: Duration::from_secs(120),
        }
    }
}

impl CompletionConfig {
    pub fn from_llm_config(llm: &LlmConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            model: llm.model.clone().unwrap_or_default(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            top_p: llm.top_p,
            timeout: llm.timeout()?,
        })
    }

    /// `model` when set, otherwise `fallback`.
    pub fn model_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.model.is_empty() {
            fallback
        } else {
            &self.model
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    /// Model name reported by the backend.
    pub model: String,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Rough token count used for budget checks before a call.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

/// A chat-completions backend.
///
/// Callers go through [`LlmSession`](crate::session::LlmSession), which
/// serializes calls and adds retries and usage tracking.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Whether credentials are present; does not contact the backend.
    async fn health_check(&self) -> bool;

    fn name(&self) -> &str;

    fn estimate_tokens(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}
