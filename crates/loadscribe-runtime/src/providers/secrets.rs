//! Credentials held by the runtime.
//!
//! LLM keys, GigaChat client secrets, Confluence and Grafana passwords and
//! issued OAuth tokens are all kept in an [`ApiCredential`], which never
//! prints its value. Provider options name their credentials through a
//! [`CredentialLookup`]: a key in `llm.options` with an environment fallback.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;

use super::ProviderError;

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    /// Handed out by an auth endpoint at runtime.
    Issued,
    Programmatic,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Config => "config",
            CredentialSource::Environment => "environment",
            CredentialSource::Issued => "issued",
            CredentialSource::Programmatic => "programmatic",
        }
    }
}

/// A secret value with a human-readable name for error messages.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    pub fn from_config_secret(secret: &SecretString, name: &'static str) -> Self {
        Self {
            value: secret.clone(),
            source: CredentialSource::Config,
            name,
        }
    }

    /// Only for setting a header or form field.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("name", &self.name)
            .field("source", &self.source.as_str())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// A credential option: `key` in `llm.options`, else the `env` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialLookup {
    pub key: &'static str,
    pub env: &'static str,
    pub name: &'static str,
}

impl CredentialLookup {
    pub const fn new(key: &'static str, env: &'static str, name: &'static str) -> Self {
        Self { key, env, name }
    }

    /// Resolve against `options` and the process environment.
    pub fn resolve(&self, options: &JsonValue) -> Result<ApiCredential, ProviderError> {
        self.resolve_with(options, |var| std::env::var(var).ok())
    }

    /// Resolve with a caller-supplied environment.
    pub fn resolve_with<F>(&self, options: &JsonValue, env: F) -> Result<ApiCredential, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = options[self.key].as_str().filter(|v| !v.is_empty()) {
            return Ok(ApiCredential::new(value, CredentialSource::Config, self.name));
        }
        match env(self.env).filter(|v| !v.is_empty()) {
            Some(value) => Ok(ApiCredential::new(value, CredentialSource::Environment, self.name)),
            None => Err(self.missing()),
        }
    }

    /// The error [`resolve`](Self::resolve) returns when neither source is set.
    pub fn missing(&self) -> ProviderError {
        ProviderError::NotConfigured(format!(
            "{} required: set llm.options.{} or {}",
            self.name, self.key, self.env
        ))
    }

    pub fn is_available(&self, options: &JsonValue) -> bool {
        self.resolve(options).is_ok()
    }
}
