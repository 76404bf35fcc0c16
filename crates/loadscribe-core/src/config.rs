//! Report configuration loaded from YAML.
//!
//! ```yaml
//! wiki:
//!   url: https://confluence.example.com
//!   username: reporter
//! metrics_source:
//!   type: prometheus
//!   prometheus_url: http://prometheus:9090
//! services:
//!   NSI:
//!     template_page_id: "682908703"
//!     parent_page_id: "882999920"
//! ```
//!
//! Environment variables override the file after parsing, see
//! [`ReportConfig::apply_env_overrides`].

use chrono::{FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::context_pack::{PackOptions, DEFAULT_ANOMALY_Z, DEFAULT_TOP_N};

const DEFAULT_DOMAINS_YAML: &str = include_str!("../defaults/domains.yaml");

pub const ENV_CONFLUENCE_URL: &str = "CONFLUENCE_URL";
pub const ENV_CONFLUENCE_USERNAME: &str = "CONFLUENCE_USERNAME";
pub const ENV_CONFLUENCE_PASSWORD: &str = "CONFLUENCE_PASSWORD";
pub const ENV_GRAFANA_BASE_URL: &str = "GRAFANA_BASE_URL";
pub const ENV_GRAFANA_API_KEY: &str = "GRAFANA_API_KEY";
pub const ENV_PROMETHEUS_URL: &str = "PROMETHEUS_URL";
pub const ENV_LOKI_URL: &str = "LOKI_URL";

/// Input format for report start/end times.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown service: '{0}'")]
    UnknownService(String),

    #[error("Unknown domain: '{0}'")]
    UnknownDomain(String),
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Parse a human-readable duration such as `1m` or `30s`.
pub fn parse_duration(field: &str, text: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(text.trim()).map_err(|e| invalid(field, e.to_string()))
}

/// Confluence connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WikiConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: SecretString,
}

/// Grafana used for panel rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrafanaConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: SecretString,

    /// Bearer token; preferred over basic credentials when set.
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
}

fn default_loki_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LokiConfig {
    /// Full `query_range` endpoint.
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_loki_limit")]
    pub limit: usize,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            limit: default_loki_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSourceKind {
    #[default]
    Prometheus,
    GrafanaProxy,
}

impl MetricsSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricsSourceKind::Prometheus => "prometheus",
            MetricsSourceKind::GrafanaProxy => "grafana_proxy",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Basic,
    Bearer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrafanaAuth {
    #[serde(default)]
    pub method: AuthMethod,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: SecretString,

    #[serde(default, skip_serializing)]
    pub token: SecretString,
}

/// Any one of `id`, `uid` or `name` identifies the Prometheus data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceRef {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

impl DatasourceRef {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.uid.as_deref().map_or(true, str::is_empty)
            && self.name.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrafanaProxyConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub auth: GrafanaAuth,

    #[serde(default)]
    pub datasource: DatasourceRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSourceConfig {
    #[serde(default, rename = "type")]
    pub kind: MetricsSourceKind,

    #[serde(default)]
    pub prometheus_url: String,

    #[serde(default)]
    pub grafana: Option<GrafanaProxyConfig>,
}

/// Provider-specific options handed to the provider factory.
///
/// Values may hold credentials, so Debug shows keys only.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderOptions(pub Map<String, Value>);

impl ProviderOptions {
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOptions")
            .field("keys", &self.0.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn default_provider() -> String {
    "openai_compatible".to_string()
}
fn default_attempts() -> u32 {
    3
}
fn default_call_retries() -> u32 {
    3
}
fn default_llm_retry_delay() -> String {
    "1s".to_string()
}
fn default_llm_timeout() -> String {
    "120s".to_string()
}
fn default_top_p() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub model: Option<String>,

    /// Independent generations per question (self-consistency).
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Attempts per model call before a transport error is returned.
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,

    #[serde(default = "default_llm_retry_delay")]
    pub retry_delay: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Total token budget for one run; unlimited when absent.
    #[serde(default)]
    pub token_budget: Option<u64>,

    #[serde(default)]
    pub options: ProviderOptions,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            attempts: default_attempts(),
            call_retries: default_call_retries(),
            retry_delay: default_llm_retry_delay(),
            timeout: default_llm_timeout(),
            temperature: 0.0,
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            token_budget: None,
            options: ProviderOptions::default(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("llm.timeout", &self.timeout)
    }

    pub fn retry_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration("llm.retry_delay", &self.retry_delay)
    }
}

fn default_true() -> bool {
    true
}
fn default_step() -> String {
    "1m".to_string()
}
fn default_resample() -> String {
    "10m".to_string()
}
fn default_top_n() -> usize {
    DEFAULT_TOP_N
}
fn default_anomaly_z() -> f64 {
    DEFAULT_ANOMALY_Z
}
fn default_utc_offset() -> i32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Query resolution.
    #[serde(default = "default_step")]
    pub step: String,

    /// Bucket width for resampling.
    #[serde(default = "default_resample")]
    pub resample: String,

    #[serde(default = "default_top_n")]
    pub top_n: usize,

    #[serde(default = "default_anomaly_z")]
    pub anomaly_z: f64,

    /// Hours east of UTC used for table headers and time parsing.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,

    /// Replaces the built-in overall prompt. May place domain answers with
    /// `{answer_<domain>}` and the remaining ones with `{answers}`.
    #[serde(default)]
    pub overall_prompt: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            step: default_step(),
            resample: default_resample(),
            top_n: default_top_n(),
            anomaly_z: default_anomaly_z(),
            utc_offset_hours: default_utc_offset(),
            overall_prompt: None,
        }
    }
}

impl AnalysisConfig {
    pub fn step(&self) -> Result<Duration, ConfigError> {
        parse_duration("analysis.step", &self.step)
    }

    pub fn resample(&self) -> Result<Duration, ConfigError> {
        parse_duration("analysis.resample", &self.resample)
    }

    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            top_n: self.top_n,
            anomaly_z: self.anomaly_z,
        }
    }
}

fn default_concurrency() -> usize {
    8
}
fn default_wiki_attempts() -> u32 {
    3
}
fn default_wiki_retry_delay() -> String {
    "1s".to_string()
}
fn default_http_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_wiki_attempts")]
    pub wiki_update_attempts: u32,

    #[serde(default = "default_wiki_retry_delay")]
    pub wiki_retry_delay: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            wiki_update_attempts: default_wiki_attempts(),
            wiki_retry_delay: default_wiki_retry_delay(),
            http_timeout: default_http_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn wiki_retry_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration("runtime.wiki_retry_delay", &self.wiki_retry_delay)
    }

    pub fn http_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("runtime.http_timeout", &self.http_timeout)
    }
}

/// One range query within a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub title: String,

    #[serde(alias = "promql")]
    pub expr: String,

    #[serde(default)]
    pub label_keys: Vec<String>,
}

/// A named group of queries analysed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Overrides the built-in prompt for this domain.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Placeholder name; `answer_<name>` when absent.
    #[serde(default)]
    pub placeholder: Option<String>,

    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

impl DomainConfig {
    /// The built-in JVM, database, Kafka and microservices domains.
    pub fn defaults() -> Result<Vec<DomainConfig>, ConfigError> {
        Ok(serde_yaml::from_str(DEFAULT_DOMAINS_YAML)?)
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    pub fn placeholder_name(&self) -> String {
        self.placeholder
            .clone()
            .unwrap_or_else(|| format!("answer_{}", self.name))
    }
}

/// A dashboard panel rendered to an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub name: String,

    /// Render path relative to the Grafana base URL.
    #[serde(alias = "grafana_url")]
    pub path: String,

    /// Panels sharing a group are placed in one tabs macro at `$$group$$`.
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub placeholder: String,

    #[serde(alias = "filter_query")]
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(alias = "page_sample_id")]
    pub template_page_id: String,

    #[serde(alias = "page_parent_id")]
    pub parent_page_id: String,

    #[serde(default, alias = "metrics")]
    pub panels: Vec<PanelConfig>,

    #[serde(default)]
    pub logs: Vec<LogConfig>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub wiki: WikiConfig,

    #[serde(default)]
    pub grafana: GrafanaConfig,

    #[serde(default)]
    pub loki: LokiConfig,

    #[serde(default)]
    pub metrics_source: MetricsSourceConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Built-in domains are used when absent.
    #[serde(default)]
    pub domains: Option<Vec<DomainConfig>>,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl ReportConfig {
    /// Parse and validate, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: ReportConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse, apply overrides from `lookup`, then validate.
    pub fn from_yaml_with_env<F>(yaml: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: ReportConfig = serde_yaml::from_str(yaml)?;
        config.apply_env_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Read a file, apply process environment overrides, then validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_with_env(&contents, |key| std::env::var(key).ok())
    }

    /// Overwrite connection settings from environment variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get(ENV_CONFLUENCE_URL) {
            self.wiki.url = v;
        }
        if let Some(v) = get(ENV_CONFLUENCE_USERNAME) {
            self.wiki.username = v;
        }
        if let Some(v) = get(ENV_CONFLUENCE_PASSWORD) {
            self.wiki.password = SecretString::from(v);
        }
        if let Some(v) = get(ENV_GRAFANA_BASE_URL) {
            self.grafana.base_url = v;
        }
        if let Some(v) = get(ENV_GRAFANA_API_KEY) {
            self.grafana.api_key = Some(SecretString::from(v));
        }
        if let Some(v) = get(ENV_PROMETHEUS_URL) {
            self.metrics_source.prometheus_url = v;
        }
        if let Some(v) = get(ENV_LOKI_URL) {
            self.loki.url = v;
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::MissingField("services".to_string()));
        }

        for (name, service) in &self.services {
            if service.template_page_id.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "services.{}.template_page_id",
                    name
                )));
            }
            if service.parent_page_id.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "services.{}.parent_page_id",
                    name
                )));
            }
        }

        for domain in self.domains()? {
            if domain.name.trim().is_empty() {
                return Err(ConfigError::MissingField("domains[].name".to_string()));
            }
            for query in &domain.queries {
                if query.expr.trim().is_empty() {
                    return Err(invalid(
                        &format!("domains.{}.queries", domain.name),
                        format!("query '{}' has an empty expression", query.title),
                    ));
                }
            }
        }

        if self.analysis.step()?.is_zero() {
            return Err(invalid("analysis.step", "must be greater than zero"));
        }
        if self.analysis.resample()?.is_zero() {
            return Err(invalid("analysis.resample", "must be greater than zero"));
        }
        if !(-14..=14).contains(&self.analysis.utc_offset_hours) {
            return Err(invalid("analysis.utc_offset_hours", "must be within -14..=14"));
        }

        if self.llm.attempts < 1 {
            return Err(invalid("llm.attempts", "must be at least 1"));
        }
        self.llm.timeout()?;
        self.llm.retry_delay()?;

        if self.runtime.concurrency == 0 {
            return Err(invalid("runtime.concurrency", "must be at least 1"));
        }
        self.runtime.wiki_retry_delay()?;
        self.runtime.http_timeout()?;

        if self.metrics_source.kind == MetricsSourceKind::GrafanaProxy
            && self.metrics_source.grafana.is_none()
        {
            return Err(ConfigError::MissingField("metrics_source.grafana".to_string()));
        }

        Ok(())
    }

    /// Configured domains, or the built-in set.
    pub fn domains(&self) -> Result<Vec<DomainConfig>, ConfigError> {
        match &self.domains {
            Some(domains) => Ok(domains.clone()),
            None => DomainConfig::defaults(),
        }
    }

    pub fn domain(&self, name: &str) -> Result<DomainConfig, ConfigError> {
        self.domains()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownDomain(name.to_string()))
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig, ConfigError> {
        self.services
            .get(name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Non-secret overview for diagnostics.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            metrics_source_type: self.metrics_source.kind.as_str().to_string(),
            prometheus_url: self.metrics_source.prometheus_url.clone(),
            wiki_url: self.wiki.url.clone(),
            llm_provider: self.llm.provider.clone(),
            llm_model: self.llm.model.clone(),
            step: self.analysis.step.clone(),
            resample: self.analysis.resample.clone(),
            analysis_enabled: self.analysis.enabled,
            domains: self
                .domains()
                .map(|ds| ds.into_iter().map(|d| d.name).collect())
                .unwrap_or_default(),
            services: self.services.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub metrics_source_type: String,
    pub prometheus_url: String,
    pub wiki_url: String,
    pub llm_provider: String,
    pub llm_model: Option<String>,
    pub step: String,
    pub resample: String,
    pub analysis_enabled: bool,
    pub domains: Vec<String>,
    pub services: Vec<String>,
}

/// Parse a report time: epoch milliseconds, or `YYYY-MM-DDTHH:MM` in `offset`.
pub fn parse_time_ms(text: &str, offset: &FixedOffset) -> Result<i64, ConfigError> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(ms);
    }

    let naive = NaiveDateTime::parse_from_str(text, TIME_FORMAT).map_err(|e| {
        invalid(
            "time",
            format!("'{}' is neither epoch ms nor {}: {}", text, TIME_FORMAT, e),
        )
    })?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| invalid("time", format!("'{}' is ambiguous", text)))
}
