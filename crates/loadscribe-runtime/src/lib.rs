//! # loadscribe-runtime
//!
//! Everything in loadscribe that talks to the network.
//!
//! `loadscribe-core` decides what a report says; this crate fetches the
//! inputs and publishes the result:
//! - metrics from Prometheus or a Grafana data-source proxy ([`collectors`])
//! - panel images from the Grafana renderer and log lines from Loki
//! - model calls through an explicit [`LlmSession`] and the
//!   [`ResponseValidator`]
//! - the Confluence page itself ([`wiki`], [`report`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use loadscribe_core::ReportConfig;
//! use loadscribe_runtime::{analysis_pipeline, ReportBuilder};
//! use std::sync::Arc;
//!
//! let config = ReportConfig::from_yaml_file("loadscribe.yaml")?;
//! let pipeline = Arc::new(analysis_pipeline(&config)?);
//! let builder = ReportBuilder::from_config(&config)?.with_analysis(pipeline);
//!
//! let outcome = builder.build("checkout", start_ms, end_ms).await?;
//! println!("report page {}", outcome.page_id);
//! ```

use std::sync::Arc;

use thiserror::Error;

use loadscribe_core::ConfigError;
use loadscribe_core::ReportConfig;

pub mod analysis;
pub mod cache;
pub mod collectors;
pub mod http;
pub mod prompts;
pub mod providers;
pub mod report;
pub mod resilience;
pub mod session;
pub mod validator;
pub mod wiki;

pub use analysis::{AnalysisError, AnalysisPipeline, AnalysisReport, DomainAnalysis};
pub use cache::DatasourceCache;
pub use collectors::{CollectorError, MetricsSource};
pub use providers::{LlmProvider, ProviderError, ProviderRegistry};
pub use report::{ReportBuilder, ReportOutcome};
pub use session::{LlmSession, SessionBuildError, SessionError};
pub use validator::ResponseValidator;
pub use wiki::{ConfluenceClient, WikiError};

/// Errors from assembling or running a report.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Wiki(#[from] WikiError),

    #[error(transparent)]
    Session(#[from] SessionBuildError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Unknown service: '{0}'")]
    UnknownService(String),
}

/// Metrics source, model session and pipeline for `config`, using the
/// default provider registry.
pub fn analysis_pipeline(config: &ReportConfig) -> Result<AnalysisPipeline, RuntimeError> {
    analysis_pipeline_with(config, &ProviderRegistry::with_defaults())
}

/// Same as [`analysis_pipeline`] with a caller-supplied registry.
pub fn analysis_pipeline_with(
    config: &ReportConfig,
    registry: &ProviderRegistry,
) -> Result<AnalysisPipeline, RuntimeError> {
    let client = http::build_client(config.runtime.http_timeout()?)?;
    let source = collectors::metrics_source_from_config(config, client, DatasourceCache::default())?;
    let session = LlmSession::from_config(registry, &config.llm)?;
    Ok(AnalysisPipeline::from_config(config, source, Arc::new(session))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
metrics_source:
  type: prometheus
  prometheus_url: http://prometheus:9090
llm:
  provider: openai_compatible
  options:
    base_url: http://llm.local/v1
    api_key: test-key
services:
  checkout:
    template_page_id: "100"
    parent_page_id: "10"
"#;

    #[test]
    fn test_pipeline_from_config_uses_default_domains() {
        let config = ReportConfig::from_yaml(CONFIG).unwrap();
        let pipeline = analysis_pipeline(&config).unwrap();
        let names: Vec<&str> = pipeline.domains().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["jvm", "database", "kafka", "ms"]);
    }

    #[test]
    fn test_unknown_provider_is_reported() {
        let yaml = CONFIG.replace("openai_compatible", "no_such_provider");
        let config = ReportConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            analysis_pipeline(&config),
            Err(RuntimeError::Session(_))
        ));
    }
}
