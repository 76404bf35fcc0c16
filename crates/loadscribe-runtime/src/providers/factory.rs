//! Named LLM backends.
//!
//! `llm.provider` picks a factory and `llm.options` is handed to it as JSON.
//! Factories can check their options without building anything, so a
//! missing key is reported by `check-config` before any metrics are fetched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use loadscribe_core::config::LlmConfig;

use super::{LlmProvider, ProviderError};

/// Builds one kind of provider from `llm.options`.
pub trait ProviderFactory: Send + Sync {
    /// The `llm.provider` value selecting this factory.
    fn kind(&self) -> &'static str;

    fn build(&self, options: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    fn check_options(&self, options: &JsonValue) -> Result<(), ProviderError>;

    /// Values used for options left out of the configuration.
    fn default_options(&self) -> JsonValue {
        JsonValue::Object(Default::default())
    }
}

/// Outcome of checking `llm.provider` and `llm.options`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCheck {
    pub provider: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

/// Factories by kind.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// OpenAI, Perplexity, any chat-completions endpoint and GigaChat.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(super::OpenAiCompatibleProviderFactory::openai()));
        registry.register(Arc::new(super::OpenAiCompatibleProviderFactory::perplexity()));
        registry.register(Arc::new(super::OpenAiCompatibleProviderFactory::generic()));
        registry.register(Arc::new(super::GigaChatProviderFactory));
        registry
    }

    /// A later factory of the same kind replaces the earlier one.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn create(
        &self,
        kind: &str,
        options: &JsonValue,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.lookup(kind)?.build(options)
    }

    /// Check the configured provider without contacting it.
    pub fn check(&self, llm: &LlmConfig) -> ProviderCheck {
        let result = self
            .lookup(&llm.provider)
            .and_then(|factory| factory.check_options(&llm.options.to_value()));
        ProviderCheck {
            provider: llm.provider.clone(),
            ok: result.is_ok(),
            problem: result.err().map(|e| e.to_string()),
        }
    }

    pub fn default_options(&self, kind: &str) -> Option<JsonValue> {
        self.factories.get(kind).map(|f| f.default_options())
    }

    fn lookup(&self, kind: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(kind).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "llm.provider '{}' is not one of {}",
                kind,
                self.kinds().join(", ")
            ))
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatMessage, CompletionConfig, CompletionResponse, TokenUsage};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoProvider {
        label: String,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                usage: TokenUsage::default(),
                model: "echo".to_string(),
                stop_reason: None,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            &self.label
        }
    }

    struct EchoFactory;

    impl ProviderFactory for EchoFactory {
        fn kind(&self) -> &'static str {
            "echo"
        }

        fn build(&self, options: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
            self.check_options(options)?;
            let label = options["label"].as_str().unwrap_or_default().to_string();
            Ok(Arc::new(EchoProvider { label }))
        }

        fn check_options(&self, options: &JsonValue) -> Result<(), ProviderError> {
            match options["label"].as_str() {
                Some(_) => Ok(()),
                None => Err(ProviderError::NotConfigured("'label' is required".to_string())),
            }
        }
    }

    fn llm(provider: &str, options: JsonValue) -> LlmConfig {
        serde_json::from_value(json!({"provider": provider, "options": options})).unwrap()
    }

    #[tokio::test]
    async fn test_registered_factory_builds_provider() {
        let mut registry = ProviderRegistry::empty();
        registry.register(Arc::new(EchoFactory));

        let provider = registry.create("echo", &json!({"label": "e1"})).unwrap();
        assert_eq!(provider.name(), "e1");

        let reply = provider
            .complete(vec![ChatMessage::user("ping")], &CompletionConfig::default())
            .await
            .unwrap();
        assert_eq!(reply.content, "ping");
    }

    #[test]
    fn test_unknown_kind_lists_available() {
        let registry = ProviderRegistry::with_defaults();
        match registry.create("claude", &json!({})) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("'claude'"));
                assert!(msg.contains("gigachat, openai, openai_compatible, perplexity"));
            }
            other => panic!("expected NotConfigured, got {:?}", other.map(|p| p.name().to_string())),
        }
    }

    #[test]
    fn test_check_reports_problem_without_building() {
        let mut registry = ProviderRegistry::empty();
        registry.register(Arc::new(EchoFactory));

        let good = registry.check(&llm("echo", json!({"label": "x"})));
        assert!(good.ok);
        assert_eq!(good.problem, None);

        let bad = registry.check(&llm("echo", json!({})));
        assert!(!bad.ok);
        assert!(bad.problem.unwrap().contains("label"));

        let unknown = registry.check(&llm("nope", json!({})));
        assert_eq!(unknown.provider, "nope");
        assert!(!unknown.ok);
    }

    #[test]
    fn test_builtin_defaults() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec!["gigachat", "openai", "openai_compatible", "perplexity"]
        );
        assert_eq!(registry.default_options("gigachat").unwrap()["model"], "GigaChat-Pro");
        assert!(registry.default_options("echo").is_none());
        assert!(format!("{:?}", registry).contains("perplexity"));
    }
}
