//! Report builder: copy the template page and fill its placeholders.
//!
//! Panel images and log excerpts are independent of each other and run on a
//! bounded pool. Analysis placeholders are applied afterwards, one at a time.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{FixedOffset, Offset, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use loadscribe_core::config::{LogConfig, PanelConfig, ReportConfig, ServiceConfig};
use loadscribe_core::markup::{
    find_placeholders, image_attachment, image_filename, log_filename, tabs_macro,
    view_file_macro, LOG_VIEWER_HEIGHT,
};

use crate::analysis::AnalysisPipeline;
use crate::collectors::{CollectorError, GrafanaRenderer, LokiClient};
use crate::http;
use crate::wiki::{ConfluenceClient, WikiError};
use crate::RuntimeError;

/// Placeholder name recorded when the analysis pipeline itself fails.
pub const ANALYSIS_STEP: &str = "analysis";

/// Errors of a single placeholder job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Wiki(#[from] WikiError),
}

/// A placeholder that could not be filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceholderFailure {
    pub placeholder: String,
    pub error: String,
}

/// What a report run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportOutcome {
    pub page_id: String,
    pub title: String,
    /// Placeholders replaced, in completion order.
    pub updated: Vec<String>,
    pub failures: Vec<PlaceholderFailure>,
}

impl ReportOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, placeholder: String, result: Result<(), String>) {
        match result {
            Ok(()) => self.updated.push(placeholder),
            Err(error) => {
                warn!(page_id = %self.page_id, placeholder = %placeholder, error = %error, "Placeholder not filled");
                self.failures.push(PlaceholderFailure { placeholder, error });
            }
        }
    }
}

/// One unit of placeholder work.
#[derive(Debug)]
pub enum Job<'a> {
    Panel(&'a PanelConfig),
    Tabs {
        group: &'a str,
        panels: Vec<&'a PanelConfig>,
    },
    Log(&'a LogConfig),
}

impl Job<'_> {
    pub fn placeholder(&self) -> &str {
        match self {
            Job::Panel(panel) => panel.name.as_str(),
            Job::Tabs { group, .. } => *group,
            Job::Log(log) => placeholder_name(&log.placeholder),
        }
    }
}

/// Log placeholders may be configured with or without the `$$` markers.
fn placeholder_name(configured: &str) -> &str {
    configured.trim().trim_matches('$')
}

/// Jobs for a service: ungrouped panels, one tabs job per group in order of
/// first appearance, then logs.
pub fn plan_jobs(service: &ServiceConfig) -> Vec<Job<'_>> {
    let mut jobs = Vec::new();
    let mut groups: Vec<(&str, Vec<&PanelConfig>)> = Vec::new();

    for panel in &service.panels {
        match panel.group.as_deref().filter(|g| !g.is_empty()) {
            None => jobs.push(Job::Panel(panel)),
            Some(group) => match groups.iter_mut().find(|(name, _)| *name == group) {
                Some((_, members)) => members.push(panel),
                None => groups.push((group, vec![panel])),
            },
        }
    }

    jobs.extend(
        groups
            .into_iter()
            .map(|(group, panels)| Job::Tabs { group, panels }),
    );
    jobs.extend(service.logs.iter().map(Job::Log));
    jobs
}

/// The page being filled and the time range it reports on.
#[derive(Debug, Clone, Copy)]
struct Target<'a> {
    service: &'a str,
    page_id: &'a str,
    start_ms: i64,
    end_ms: i64,
}

/// Builds report pages for configured services.
#[derive(Debug)]
pub struct ReportBuilder {
    wiki: ConfluenceClient,
    renderer: GrafanaRenderer,
    loki: Option<LokiClient>,
    analysis: Option<Arc<AnalysisPipeline>>,
    services: BTreeMap<String, ServiceConfig>,
    concurrency: usize,
    offset: FixedOffset,
}

impl ReportBuilder {
    pub fn new(
        wiki: ConfluenceClient,
        renderer: GrafanaRenderer,
        services: BTreeMap<String, ServiceConfig>,
    ) -> Self {
        Self {
            wiki,
            renderer,
            loki: None,
            analysis: None,
            services,
            concurrency: 8,
            offset: Utc.fix(),
        }
    }

    /// Clients for every backend named in `config`. Analysis is attached
    /// separately with [`with_analysis`](Self::with_analysis).
    pub fn from_config(config: &ReportConfig) -> Result<Self, RuntimeError> {
        let client = http::build_client(config.runtime.http_timeout()?)?;

        let wiki = ConfluenceClient::from_config(&config.wiki, client.clone())?.with_stale_retry(
            config.runtime.wiki_update_attempts,
            config.runtime.wiki_retry_delay()?,
        );
        let renderer = GrafanaRenderer::from_config(&config.grafana, client.clone());
        let offset = config.analysis.offset();
        let loki = if config.loki.url.is_empty() {
            None
        } else {
            Some(LokiClient::from_config(&config.loki, offset, client)?)
        };

        let mut builder = Self::new(wiki, renderer, config.services.clone())
            .with_concurrency(config.runtime.concurrency)
            .with_offset(offset);
        builder.loki = loki;
        Ok(builder)
    }

    pub fn with_loki(mut self, loki: LokiClient) -> Self {
        self.loki = Some(loki);
        self
    }

    pub fn with_analysis(mut self, pipeline: Arc<AnalysisPipeline>) -> Self {
        self.analysis = Some(pipeline);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Produce the report page for `service` over `[start_ms, end_ms]`.
    ///
    /// Only failing to create the page is an error. Every placeholder that
    /// could not be filled is listed in the outcome.
    #[instrument(skip(self))]
    pub async fn build(
        &self,
        service: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ReportOutcome, RuntimeError> {
        let started = Instant::now();
        let config = self
            .services
            .get(service)
            .ok_or_else(|| RuntimeError::UnknownService(service.to_string()))?;

        let page = self
            .wiki
            .copy_page(&config.template_page_id, &config.parent_page_id, &self.offset)
            .await?;
        let mut outcome = ReportOutcome {
            page_id: page.id.clone(),
            title: page.title.clone(),
            ..Default::default()
        };

        let target = Target {
            service,
            page_id: &page.id,
            start_ms,
            end_ms,
        };

        let jobs = plan_jobs(config);
        info!(page_id = %page.id, jobs = jobs.len(), concurrency = self.concurrency, "Filling report page");

        let pending: Vec<_> = jobs.iter().map(|job| self.run_labeled(job, target)).collect();
        let results: Vec<(String, Result<(), String>)> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (placeholder, result) in results {
            outcome.record(placeholder, result);
        }

        if let Some(pipeline) = &self.analysis {
            self.apply_analysis(pipeline, target, &mut outcome).await;
        }

        info!(
            page_id = %outcome.page_id,
            updated = outcome.updated.len(),
            failed = outcome.failures.len(),
            elapsed = %humantime::format_duration(started.elapsed()),
            "Report built"
        );
        Ok(outcome)
    }

    async fn run_labeled(&self, job: &Job<'_>, target: Target<'_>) -> (String, Result<(), String>) {
        let result = self.run_job(job, target).await.map_err(|e| e.to_string());
        (job.placeholder().to_string(), result)
    }

    async fn run_job(&self, job: &Job<'_>, target: Target<'_>) -> Result<(), JobError> {
        let content = match job {
            Job::Panel(panel) => {
                let filename = self.upload_panel(panel, target).await?;
                image_attachment(&filename)
            }
            Job::Tabs { panels, .. } => {
                let mut tabs = Vec::with_capacity(panels.len());
                for panel in panels {
                    let filename = self.upload_panel(panel, target).await?;
                    tabs.push((panel.name.clone(), image_attachment(&filename)));
                }
                tabs_macro(&tabs)
            }
            Job::Log(log) => self.upload_log(log, target).await?,
        };

        self.wiki
            .update_placeholder(target.page_id, job.placeholder(), &content)
            .await?;
        Ok(())
    }

    /// Render a panel and attach it; returns the attachment name.
    async fn upload_panel(
        &self,
        panel: &PanelConfig,
        target: Target<'_>,
    ) -> Result<String, JobError> {
        let image = self
            .renderer
            .render_panel(&panel.path, target.start_ms, target.end_ms)
            .await?;
        let filename = image_filename(&panel.name, target.service, target.page_id);
        self.wiki
            .upload_attachment(target.page_id, &filename, image, "image/jpeg")
            .await?;
        Ok(filename)
    }

    /// Fetch log lines and attach them, even when there are none. Returns the
    /// placeholder content: the file viewer, or nothing for an empty log.
    async fn upload_log(&self, log: &LogConfig, target: Target<'_>) -> Result<String, JobError> {
        let loki = self
            .loki
            .as_ref()
            .ok_or_else(|| CollectorError::NotConfigured("loki.url is empty".to_string()))?;

        let lines = loki
            .fetch_lines(&log.filter, target.start_ms, target.end_ms)
            .await?;
        let filename = log_filename(
            target.service,
            placeholder_name(&log.placeholder),
            target.page_id,
        );
        self.wiki
            .upload_attachment(
                target.page_id,
                &filename,
                lines.join("\n").into_bytes(),
                "text/plain",
            )
            .await?;

        if lines.is_empty() {
            info!(placeholder = %log.placeholder, file = %filename, "No log lines in range");
            return Ok(String::new());
        }
        Ok(view_file_macro(&filename, LOG_VIEWER_HEIGHT))
    }

    /// Run the pipeline and write its placeholders that the page carries.
    async fn apply_analysis(
        &self,
        pipeline: &AnalysisPipeline,
        target: Target<'_>,
        outcome: &mut ReportOutcome,
    ) {
        let report = match pipeline.run(target.start_ms, target.end_ms).await {
            Ok(report) => report,
            Err(e) => {
                outcome.record(ANALYSIS_STEP.to_string(), Err(e.to_string()));
                return;
            }
        };

        let present: HashSet<String> = match self.wiki.get_page(target.page_id).await {
            Ok(page) => find_placeholders(page.storage()).into_iter().collect(),
            Err(e) => {
                outcome.record(ANALYSIS_STEP.to_string(), Err(e.to_string()));
                return;
            }
        };

        for (name, content) in report.placeholders() {
            if !present.contains(&name) {
                info!(placeholder = %name, "Template has no slot for analysis output");
                continue;
            }
            let result = self
                .wiki
                .update_placeholder(target.page_id, &name, &content)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());
            outcome.record(name, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel(name: &str, group: Option<&str>) -> PanelConfig {
        PanelConfig {
            name: name.to_string(),
            path: format!("/render/d-solo/x/{}", name),
            group: group.map(str::to_string),
        }
    }

    fn service() -> ServiceConfig {
        ServiceConfig {
            template_page_id: "100".to_string(),
            parent_page_id: "10".to_string(),
            panels: vec![
                panel("rps", None),
                panel("cpu", Some("resources")),
                panel("latency", None),
                panel("memory", Some("resources")),
                panel("threads", Some("jvm")),
            ],
            logs: vec![LogConfig {
                placeholder: "$$errors_log$$".to_string(),
                filter: r#"{app="api"} |= "ERROR""#.to_string(),
            }],
        }
    }

    #[test]
    fn test_plan_groups_panels_and_keeps_order() {
        let service = service();
        let jobs = plan_jobs(&service);
        let names: Vec<&str> = jobs.iter().map(Job::placeholder).collect();
        assert_eq!(names, vec!["rps", "latency", "resources", "jvm", "errors_log"]);

        match &jobs[2] {
            Job::Tabs { panels, .. } => {
                let members: Vec<&str> = panels.iter().map(|p| p.name.as_str()).collect();
                assert_eq!(members, vec!["cpu", "memory"]);
            }
            other => panic!("expected tabs, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_group_is_ungrouped() {
        let service = ServiceConfig {
            panels: vec![panel("rps", Some(""))],
            logs: Vec::new(),
            ..service()
        };
        assert!(matches!(plan_jobs(&service)[0], Job::Panel(_)));
    }

    #[test]
    fn test_outcome_records_failures() {
        let mut outcome = ReportOutcome {
            page_id: "1".to_string(),
            ..Default::default()
        };
        outcome.record("rps".to_string(), Ok(()));
        outcome.record("cpu".to_string(), Err("grafana renderer returned HTTP 500".to_string()));

        assert_eq!(outcome.updated, vec!["rps"]);
        assert_eq!(outcome.failures[0].placeholder, "cpu");
        assert!(!outcome.is_complete());
    }

    proptest::proptest! {
        #[test]
        fn test_every_panel_is_planned_once(
            groups in proptest::collection::vec(proptest::option::of(0u8..3), 0..12)
        ) {
            let panels: Vec<PanelConfig> = groups
                .iter()
                .enumerate()
                .map(|(i, g)| panel(&format!("p{}", i), g.map(|g| format!("g{}", g)).as_deref()))
                .collect();
            let service = ServiceConfig { panels, logs: Vec::new(), ..service() };

            let mut planned: Vec<String> = Vec::new();
            for job in plan_jobs(&service) {
                match job {
                    Job::Panel(p) => planned.push(p.name.clone()),
                    Job::Tabs { panels, .. } => planned.extend(panels.iter().map(|p| p.name.clone())),
                    Job::Log(_) => {}
                }
            }
            planned.sort();
            let mut expected: Vec<String> = service.panels.iter().map(|p| p.name.clone()).collect();
            expected.sort();
            proptest::prop_assert_eq!(planned, expected);
        }
    }
}
