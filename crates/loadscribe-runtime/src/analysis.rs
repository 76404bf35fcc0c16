//! Analysis pipeline: metrics per domain, one model pass per domain, then an
//! overall pass over the domain answers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};

use loadscribe_core::config::{ConfigError, DomainConfig, ReportConfig};
use loadscribe_core::render::{
    analysis_storage, analysis_text, escape_xml, frames_markdown, storage_table, text_storage,
};
use loadscribe_core::{AnalysisResult, Candidate, ContextPack, Frame, PackOptions};

use crate::collectors::{collect_frames, CollectorError, MetricsSource};
use crate::prompts::{analysis_messages, domain_prompt, overall_prompt, DomainAnswer, OVERALL_PROMPT};
use crate::session::{LlmSession, SessionError};
use crate::validator::ResponseValidator;

/// Placeholder receiving the overall answer.
pub const FINAL_PLACEHOLDER: &str = "final_answer";

/// Older templates use this name for the overall answer.
pub const FINAL_PLACEHOLDER_ALIAS: &str = "answer_llm";

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to serialize context pack: {0}")]
    Pack(#[from] serde_json::Error),
}

/// Query resolution, bucketing and rendering settings.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub step: Duration,
    pub resample: Duration,
    pub top_n: usize,
    pub offset: FixedOffset,
    pub pack: PackOptions,
}

impl AnalysisSettings {
    pub fn from_config(config: &ReportConfig) -> Result<Self, ConfigError> {
        let analysis = &config.analysis;
        Ok(Self {
            step: analysis.step()?,
            resample: analysis.resample()?,
            top_n: analysis.top_n,
            offset: analysis.offset(),
            pack: analysis.pack_options(),
        })
    }
}

/// One domain's tables and the model's reading of them.
#[derive(Debug, Clone)]
pub struct DomainAnalysis {
    pub name: String,
    pub title: String,
    pub placeholder: String,
    pub frames: Vec<Frame>,
    pub markdown: String,
    pub tables_storage: String,
    pub candidate: Candidate,
}

impl DomainAnalysis {
    pub fn structured(&self) -> Option<&AnalysisResult> {
        self.candidate.parsed.as_ref()
    }

    /// Plain-text answer, as substituted into the overall prompt.
    pub fn answer_text(&self) -> String {
        match self.structured() {
            Some(result) => analysis_text(result),
            None => self.candidate.text.clone(),
        }
    }

    /// Tables followed by the analysis, as page storage.
    pub fn storage(&self) -> String {
        format!(
            "{}<h3>Analysis of {}</h3>{}",
            self.tables_storage,
            escape_xml(&self.title),
            candidate_storage(&self.candidate)
        )
    }
}

/// Structured rendering when parsed, the raw text otherwise.
fn candidate_storage(candidate: &Candidate) -> String {
    match &candidate.parsed {
        Some(result) => analysis_storage(result),
        None => text_storage(&candidate.text),
    }
}

/// Every domain plus the overall answer.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub domains: Vec<DomainAnalysis>,
    pub overall: Candidate,
}

#[derive(Debug, Serialize)]
struct StructuredEntry<'a> {
    parsed: bool,
    result: Option<&'a AnalysisResult>,
    text: &'a str,
}

impl AnalysisReport {
    pub fn overall_storage(&self) -> String {
        match &self.overall.parsed {
            Some(result) => analysis_storage(result),
            None => format!("<h3>LLM summary</h3>{}", text_storage(&self.overall.text)),
        }
    }

    /// `(placeholder name, storage)` pairs in page order: domains first,
    /// then the overall answer under both of its names.
    pub fn placeholders(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .domains
            .iter()
            .map(|d| (d.placeholder.clone(), d.storage()))
            .collect();

        let overall = self.overall_storage();
        out.push((FINAL_PLACEHOLDER.to_string(), overall.clone()));
        out.push((FINAL_PLACEHOLDER_ALIAS.to_string(), overall));
        out
    }

    /// JSON for API callers: placeholder map plus structured results.
    pub fn to_json(&self) -> Value {
        let placeholders: BTreeMap<String, String> = self
            .placeholders()
            .into_iter()
            .map(|(name, storage)| (loadscribe_core::markup::placeholder(&name), storage))
            .collect();

        let mut structured: BTreeMap<&str, StructuredEntry<'_>> = self
            .domains
            .iter()
            .map(|d| (d.name.as_str(), entry(&d.candidate)))
            .collect();
        structured.insert("final", entry(&self.overall));

        json!({
            "placeholders": placeholders,
            "structured": structured,
        })
    }
}

fn entry(candidate: &Candidate) -> StructuredEntry<'_> {
    StructuredEntry {
        parsed: candidate.is_parsed(),
        result: candidate.parsed.as_ref(),
        text: &candidate.text,
    }
}

/// Runs the domain passes and the overall pass.
pub struct AnalysisPipeline {
    source: Arc<dyn MetricsSource>,
    session: Arc<LlmSession>,
    validator: ResponseValidator,
    settings: AnalysisSettings,
    domains: Vec<DomainConfig>,
    overall_template: String,
}

impl std::fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("source", &self.source.name())
            .field("validator", &self.validator)
            .field("settings", &self.settings)
            .field("domains", &self.domains.iter().map(|d| &d.name).collect::<Vec<_>>())
            .finish()
    }
}

impl AnalysisPipeline {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        session: Arc<LlmSession>,
        validator: ResponseValidator,
        settings: AnalysisSettings,
        domains: Vec<DomainConfig>,
    ) -> Self {
        Self {
            source,
            session,
            validator,
            settings,
            domains,
            overall_template: OVERALL_PROMPT.to_string(),
        }
    }

    /// Use `template` instead of the built-in overall prompt.
    pub fn with_overall_prompt(mut self, template: impl Into<String>) -> Self {
        self.overall_template = template.into();
        self
    }

    pub fn from_config(
        config: &ReportConfig,
        source: Arc<dyn MetricsSource>,
        session: Arc<LlmSession>,
    ) -> Result<Self, ConfigError> {
        let pipeline = Self::new(
            source,
            session,
            ResponseValidator::new(config.llm.attempts as usize),
            AnalysisSettings::from_config(config)?,
            config.domains()?,
        );
        Ok(match config.analysis.overall_prompt.as_deref() {
            Some(template) if !template.trim().is_empty() => pipeline.with_overall_prompt(template),
            _ => pipeline,
        })
    }

    pub fn domains(&self) -> &[DomainConfig] {
        &self.domains
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// Collect, render and analyse one domain.
    #[instrument(skip(self, domain), fields(domain = %domain.name))]
    pub async fn analyze_domain(
        &self,
        domain: &DomainConfig,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<DomainAnalysis, AnalysisError> {
        let settings = &self.settings;
        let frames = collect_frames(
            self.source.as_ref(),
            &domain.queries,
            start_ms,
            end_ms,
            settings.step,
            settings.resample,
        )
        .await?;

        let markdown = frames_markdown(&frames, settings.top_n, &settings.offset);
        let tables_storage: String = frames
            .iter()
            .map(|frame| {
                format!(
                    "<h4>{}</h4>{}",
                    escape_xml(&frame.title),
                    storage_table(frame, settings.top_n, &settings.offset)
                )
            })
            .collect();

        let pack = ContextPack::build(&domain.name, &frames, settings.pack).to_json()?;
        let messages = analysis_messages(&domain_prompt(domain), &pack);
        let candidate = self
            .validator
            .validate(&self.session, &domain.name, messages)
            .await?;

        info!(
            frames = frames.len(),
            parsed = candidate.is_parsed(),
            "Domain analysed"
        );

        Ok(DomainAnalysis {
            name: domain.name.clone(),
            title: domain.display_title().to_string(),
            placeholder: domain.placeholder_name(),
            frames,
            markdown,
            tables_storage,
            candidate,
        })
    }

    /// Overall pass over already analysed domains.
    pub async fn analyze_overall(
        &self,
        domains: &[DomainAnalysis],
    ) -> Result<Candidate, AnalysisError> {
        let texts: Vec<String> = domains.iter().map(DomainAnalysis::answer_text).collect();
        let answers: Vec<DomainAnswer<'_>> = domains
            .iter()
            .zip(&texts)
            .map(|(d, text)| DomainAnswer {
                name: &d.name,
                title: &d.title,
                text,
            })
            .collect();
        let prompt = overall_prompt(&self.overall_template, &answers);

        let candidate = self
            .validator
            .validate(&self.session, "overall", analysis_messages(&prompt, ""))
            .await?;
        Ok(candidate)
    }

    /// Every configured domain, then the overall pass.
    pub async fn run(&self, start_ms: i64, end_ms: i64) -> Result<AnalysisReport, AnalysisError> {
        let mut domains = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            domains.push(self.analyze_domain(domain, start_ms, end_ms).await?);
        }

        let overall = self.analyze_overall(&domains).await?;
        for (scope, used) in self.session.budget().scopes() {
            debug!(
                scope = %scope,
                llm_calls = used.llm_calls,
                failed_calls = used.failed_calls,
                total_tokens = used.total_tokens,
                "Model usage"
            );
        }
        let usage = self.session.usage();
        info!(
            domains = domains.len(),
            llm_calls = usage.llm_calls,
            total_tokens = usage.total_tokens,
            "Analysis complete"
        );

        Ok(AnalysisReport { domains, overall })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{session, ScriptedProvider};
    use async_trait::async_trait;
    use loadscribe_core::config::QueryConfig;
    use loadscribe_core::QueryResponse;

    struct StaticSource;

    #[async_trait]
    impl MetricsSource for StaticSource {
        async fn query_range(
            &self,
            _query: &str,
            _start_ms: i64,
            _end_ms: i64,
            _step: Duration,
        ) -> Result<QueryResponse, CollectorError> {
            Ok(QueryResponse::from_json(
                r#"{"status": "success", "data": {"result": [
                    {"metric": {"area": "heap"}, "values": [[0, "100"], [600, "120"]]}
                ]}}"#,
            )?)
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            step: Duration::from_secs(60),
            resample: Duration::from_secs(600),
            top_n: 10,
            offset: FixedOffset::east_opt(0).unwrap(),
            pack: PackOptions::default(),
        }
    }

    fn domain(name: &str) -> DomainConfig {
        DomainConfig {
            name: name.to_string(),
            title: Some(name.to_uppercase()),
            prompt: None,
            placeholder: None,
            queries: vec![QueryConfig {
                title: format!("{} memory", name),
                expr: "jvm_memory_used_bytes".to_string(),
                label_keys: vec!["area".to_string()],
            }],
        }
    }

    fn pipeline(provider: Arc<ScriptedProvider>, domains: Vec<DomainConfig>) -> AnalysisPipeline {
        AnalysisPipeline::new(
            Arc::new(StaticSource),
            Arc::new(session(provider)),
            ResponseValidator::new(1),
            settings(),
            domains,
        )
    }

    #[tokio::test]
    async fn test_run_fills_overall_prompt_with_domain_answers() {
        let provider = ScriptedProvider::new([
            r#"{"verdict": "heap stable", "confidence": 0.8}"#,
            r#"{"verdict": "overall fine", "confidence": 0.7}"#,
        ]);
        let pipeline = pipeline(provider.clone(), vec![domain("jvm")]);

        let report = pipeline.run(0, 1_200_000).await.unwrap();
        assert_eq!(report.domains.len(), 1);
        assert_eq!(report.domains[0].placeholder, "answer_jvm");
        assert_eq!(
            report.domains[0].structured().map(|r| r.verdict.as_str()),
            Some("heap stable")
        );
        assert_eq!(
            report.overall.parsed.as_ref().map(|r| r.verdict.as_str()),
            Some("overall fine")
        );

        let requests = provider.requests.lock();
        assert_eq!(requests.len(), 2);
        let domain_request = &requests[0][1].content;
        assert!(domain_request.contains("\"domain\":\"jvm\""));
        let overall_request = &requests[1][1].content;
        assert!(overall_request.contains("### JVM\nVerdict: heap stable"));
        assert!(!overall_request.contains("{answer"));
    }

    #[tokio::test]
    async fn test_custom_domain_reaches_overall_request() {
        let provider = ScriptedProvider::new([
            r#"{"verdict": "redis eviction storm"}"#,
            r#"{"verdict": "cache bound"}"#,
        ]);
        pipeline(provider.clone(), vec![domain("redis")])
            .run(0, 1_200_000)
            .await
            .unwrap();

        let requests = provider.requests.lock();
        let overall_request = &requests[1][1].content;
        assert!(overall_request.contains("### REDIS\nVerdict: redis eviction storm"));
        assert!(!overall_request.contains("{answer_"));
    }

    #[tokio::test]
    async fn test_configured_overall_template() {
        let provider = ScriptedProvider::new([r#"{"verdict": "lag grows"}"#, r#"{"verdict": "ok"}"#]);
        pipeline(provider.clone(), vec![domain("kafka")])
            .with_overall_prompt("Messaging said: {answer_kafka}. JVM said: {answer_jvm}.")
            .run(0, 1_200_000)
            .await
            .unwrap();

        let requests = provider.requests.lock();
        let overall_request = &requests[1][1].content;
        assert!(overall_request.starts_with("Messaging said: Verdict: lag grows"));
        assert!(overall_request.contains("JVM said: (not analysed in this run)."));
    }

    #[tokio::test]
    async fn test_placeholders_cover_domains_and_final_answer() {
        let provider = ScriptedProvider::new([
            r#"{"verdict": "ok"}"#,
            "not json at all",
            "still not json",
        ]);
        let pipeline = pipeline(provider, vec![domain("kafka")]);
        let report = pipeline.run(0, 1_200_000).await.unwrap();

        let placeholders = report.placeholders();
        let names: Vec<&str> = placeholders.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["answer_kafka", FINAL_PLACEHOLDER, FINAL_PLACEHOLDER_ALIAS]);

        let (_, kafka) = &placeholders[0];
        assert!(kafka.contains("<table>"));
        assert!(kafka.contains("<h3>Analysis of KAFKA</h3>"));

        let (_, overall) = &placeholders[1];
        assert!(overall.starts_with("<h3>LLM summary</h3>"));
        assert!(overall.contains("not json at all"));
    }

    #[tokio::test]
    async fn test_to_json_shape() {
        let provider = ScriptedProvider::new([r#"{"verdict": "ok"}"#, r#"{"verdict": "ok"}"#]);
        let report = pipeline(provider, vec![domain("ms")]).run(0, 1).await.unwrap();

        let value = report.to_json();
        assert!(value["placeholders"]["$$answer_ms$$"].is_string());
        assert!(value["placeholders"]["$$final_answer$$"].is_string());
        assert_eq!(value["structured"]["ms"]["parsed"], true);
        assert_eq!(value["structured"]["final"]["result"]["verdict"], "ok");
    }
}
