//! Collectors for metrics, dashboard images and logs.
//!
//! Metrics come through the [`MetricsSource`] seam: either straight from
//! Prometheus or through a Grafana data-source proxy. Panel images come from
//! the Grafana renderer and log lines from Loki.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use loadscribe_core::config::{MetricsSourceKind, QueryConfig, ReportConfig};
use loadscribe_core::{Frame, QueryResponse, Series, SeriesError};

use crate::cache::DatasourceCache;
use crate::http::StatusError;

mod grafana;
mod loki;
mod prometheus;

pub use grafana::{GrafanaCredentials, GrafanaProxySource, GrafanaRenderer};
pub use loki::{format_log_line, LokiClient, LokiResponse};
pub use prometheus::PrometheusSource;

/// Errors from metric, dashboard and log backends.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Request to {target} failed: {message}")]
    Http { target: String, message: String },

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("Invalid response from {target}: {message}")]
    InvalidResponse { target: String, message: String },

    #[error("Grafana data source not found: {0}")]
    DatasourceNotFound(String),

    #[error("Collector not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Series(#[from] SeriesError),
}

impl CollectorError {
    pub(crate) fn http(target: &str, err: reqwest::Error) -> Self {
        CollectorError::Http {
            target: target.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(target: &str, message: impl ToString) -> Self {
        CollectorError::InvalidResponse {
            target: target.to_string(),
            message: message.to_string(),
        }
    }
}

/// A backend that answers Prometheus range queries.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Run `query` over `[start_ms, end_ms]` with resolution `step`.
    async fn query_range(
        &self,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step: Duration,
    ) -> Result<QueryResponse, CollectorError>;

    /// Source name for logs.
    fn name(&self) -> &str;
}

/// Query parameters shared by Prometheus and the Grafana proxy.
pub(crate) fn range_params(
    query: &str,
    start_ms: i64,
    end_ms: i64,
    step: Duration,
) -> [(&'static str, String); 4] {
    [
        ("query", query.to_string()),
        ("start", format_seconds(start_ms)),
        ("end", format_seconds(end_ms)),
        ("step", step.as_secs().max(1).to_string()),
    ]
}

/// Epoch milliseconds as fractional epoch seconds.
fn format_seconds(ms: i64) -> String {
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{:.3}", ms as f64 / 1000.0)
    }
}

/// Build the metrics source selected by `metrics_source.type`.
pub fn metrics_source_from_config(
    config: &ReportConfig,
    client: reqwest::Client,
    cache: DatasourceCache,
) -> Result<Arc<dyn MetricsSource>, CollectorError> {
    let source = &config.metrics_source;
    match source.kind {
        MetricsSourceKind::Prometheus => {
            if source.prometheus_url.is_empty() {
                return Err(CollectorError::NotConfigured(
                    "metrics_source.prometheus_url is empty".to_string(),
                ));
            }
            Ok(Arc::new(PrometheusSource::new(
                &source.prometheus_url,
                client,
            )))
        }
        MetricsSourceKind::GrafanaProxy => {
            let grafana = source.grafana.as_ref().ok_or_else(|| {
                CollectorError::NotConfigured(
                    "metrics_source.grafana is required for grafana_proxy".to_string(),
                )
            })?;
            Ok(Arc::new(GrafanaProxySource::from_config(grafana, client, cache)?))
        }
    }
}

/// Run every query of a domain and resample the results into frames.
///
/// Frames come back in query order. A query whose response is not
/// `success` yields an empty frame.
pub async fn collect_frames(
    source: &dyn MetricsSource,
    queries: &[QueryConfig],
    start_ms: i64,
    end_ms: i64,
    step: Duration,
    resample: Duration,
) -> Result<Vec<Frame>, CollectorError> {
    let mut frames = Vec::with_capacity(queries.len());

    for query in queries {
        let response = source.query_range(&query.expr, start_ms, end_ms, step).await?;
        if !response.is_success() {
            info!(
                source = source.name(),
                title = %query.title,
                error = response.error.as_deref().unwrap_or(""),
                "Query did not succeed, no series"
            );
        }

        let series = Series::from_response(&response, &query.label_keys);
        let frame = Frame::resample(&query.title, &series, resample.as_secs())?;
        debug!(
            title = %query.title,
            series = frame.columns.len(),
            buckets = frame.timestamps.len(),
            "Frame built"
        );
        frames.push(frame);
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FixedSource {
        body: &'static str,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsSource for FixedSource {
        async fn query_range(
            &self,
            query: &str,
            _start_ms: i64,
            _end_ms: i64,
            _step: Duration,
        ) -> Result<QueryResponse, CollectorError> {
            self.queries.lock().push(query.to_string());
            Ok(QueryResponse::from_json(self.body)?)
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    const BODY: &str = r#"{
        "status": "success",
        "data": {"resultType": "matrix", "result": [
            {"metric": {"pod": "a"}, "values": [[600, "1"], [660, "3"], [1200, "5"]]},
            {"metric": {"pod": "b"}, "values": [[600, "10"]]}
        ]}
    }"#;

    fn query(title: &str) -> QueryConfig {
        QueryConfig {
            title: title.to_string(),
            expr: format!("rate({}[1m])", title),
            label_keys: vec!["pod".to_string()],
        }
    }

    #[test]
    fn test_range_params() {
        let params = range_params("up", 1_700_000_000_000, 1_700_000_060_500, Duration::from_secs(60));
        assert_eq!(params[1].1, "1700000000");
        assert_eq!(params[2].1, "1700000060.500");
        assert_eq!(params[3].1, "60");

        let params = range_params("up", 0, 0, Duration::from_millis(10));
        assert_eq!(params[3].1, "1");
    }

    #[tokio::test]
    async fn test_collect_frames_in_query_order() {
        let source = FixedSource {
            body: BODY,
            queries: Mutex::new(Vec::new()),
        };

        let frames = collect_frames(
            &source,
            &[query("cpu"), query("heap")],
            0,
            1_200_000,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].title, "cpu");
        assert_eq!(frames[1].title, "heap");
        assert_eq!(frames[0].timestamps, vec![600, 1200]);
        assert_eq!(frames[0].columns[0].values, vec![Some(2.0), Some(5.0)]);
        assert_eq!(frames[0].columns[1].values, vec![Some(10.0), None]);
        assert_eq!(source.queries.lock()[1], "rate(heap[1m])");
    }

    #[tokio::test]
    async fn test_failed_query_yields_empty_frame() {
        let source = FixedSource {
            body: r#"{"status": "error", "error": "bad query"}"#,
            queries: Mutex::new(Vec::new()),
        };
        let frames = collect_frames(
            &source,
            &[query("cpu")],
            0,
            1,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
        .await
        .unwrap();
        assert!(frames[0].is_empty());
    }

    #[tokio::test]
    async fn test_zero_resample_is_an_error() {
        let source = FixedSource {
            body: BODY,
            queries: Mutex::new(Vec::new()),
        };
        let result = collect_frames(&source, &[query("cpu")], 0, 1, Duration::from_secs(60), Duration::ZERO).await;
        assert!(matches!(result, Err(CollectorError::Series(SeriesError::ZeroInterval))));
    }

    #[test]
    fn test_prometheus_source_requires_url() {
        let config: ReportConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        let result = metrics_source_from_config(&config, reqwest::Client::new(), DatasourceCache::default());
        assert!(matches!(result, Err(CollectorError::NotConfigured(_))));
    }
}
