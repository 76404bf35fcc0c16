//! Explicit LLM session.
//!
//! A session owns everything one run needs to talk to a model: the provider
//! handle, completion settings, retry policy and usage tracker. Calls are
//! serialized by an async mutex, so a session can be shared across tasks
//! while the provider sees at most one request at a time.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loadscribe_core::config::LlmConfig;
use loadscribe_core::ConfigError;

use crate::providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
    ProviderRegistry,
};
use crate::resilience::{BudgetTracker, LlmUsage, RetryPolicy};

/// Errors from a session call.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Token budget exhausted: ~{estimated} tokens needed, {remaining} left")]
    BudgetExhausted { estimated: u64, remaining: u64 },
}

/// Provider handle plus the policy around every call to it.
pub struct LlmSession {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
    retry: RetryPolicy,
    budget: Arc<BudgetTracker>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for LlmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSession")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmSession {
    /// Session with the default retry policy and no token budget.
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self {
            provider,
            config,
            retry: RetryPolicy::default(),
            budget: Arc::new(BudgetTracker::default()),
            lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetTracker>) -> Self {
        self.budget = budget;
        self
    }

    /// Build the provider named by `llm.provider` and wrap it.
    pub fn from_config(
        registry: &ProviderRegistry,
        llm: &LlmConfig,
    ) -> Result<Self, SessionBuildError> {
        let provider = registry.create(&llm.provider, &llm.options.to_value())?;
        let config = CompletionConfig::from_llm_config(llm)?;
        let retry = RetryPolicy::from_llm_config(llm)?;

        info!(
            provider = provider.name(),
            model = %config.model,
            attempts = retry.max_attempts,
            "LLM session ready"
        );

        Ok(Self::new(provider, config)
            .with_retry(retry)
            .with_budget(Arc::new(BudgetTracker::new(llm.token_budget))))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn usage(&self) -> LlmUsage {
        self.budget.usage()
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Send `messages` and return the completion text.
    ///
    /// `scope` labels the call in logs and usage accounting.
    pub async fn complete(
        &self,
        scope: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, SessionError> {
        Ok(self.complete_full(scope, messages).await?.content)
    }

    /// Like [`complete`](Self::complete), returning usage and stop reason too.
    pub async fn complete_full(
        &self,
        scope: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<CompletionResponse, SessionError> {
        let _guard = self.lock.lock().await;

        let estimated = messages
            .iter()
            .map(|m| u64::from(self.provider.estimate_tokens(&m.content)))
            .sum::<u64>()
            + u64::from(self.config.max_tokens);
        if !self.budget.can_afford(estimated) {
            let remaining = self.budget.remaining().unwrap_or(0);
            warn!(scope, estimated, remaining, "Skipping model call: token budget exhausted");
            return Err(SessionError::BudgetExhausted {
                estimated,
                remaining,
            });
        }

        let provider = &self.provider;
        let config = &self.config;
        let started = Instant::now();
        debug!(scope, provider = provider.name(), estimated, "Calling model");

        let result = self
            .retry
            .run(scope, || provider.complete(messages.clone(), config))
            .await;

        match result {
            Ok(response) => {
                self.budget.record_usage(scope, &response.usage);
                info!(
                    scope,
                    model = %response.model,
                    tokens = response.usage.total(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Model call completed"
                );
                Ok(response)
            }
            Err(e) => {
                self.budget.record_failure(scope);
                warn!(scope, error = %e, "Model call failed after retries");
                Err(e.into())
            }
        }
    }
}

/// Errors while assembling a session from configuration.
#[derive(Error, Debug)]
pub enum SessionBuildError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
