//! Direct Prometheus range queries.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use loadscribe_core::QueryResponse;

use super::{range_params, CollectorError, MetricsSource};
use crate::http;

/// `GET {url}/api/v1/query_range` against a Prometheus-compatible server.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    base_url: String,
    client: reqwest::Client,
}

impl PrometheusSource {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/v1/query_range", self.base_url)
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn query_range(
        &self,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step: Duration,
    ) -> Result<QueryResponse, CollectorError> {
        debug!(query, start_ms, end_ms, "Prometheus query_range");

        let response = self
            .client
            .get(self.endpoint())
            .query(&range_params(query, start_ms, end_ms, step))
            .send()
            .await
            .map_err(|e| CollectorError::http("prometheus", e))?;
        let response = http::check_status(response, "prometheus").await?;

        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::http("prometheus", e))?;
        QueryResponse::from_json(&body).map_err(|e| CollectorError::invalid("prometheus", e))
    }

    fn name(&self) -> &str {
        "prometheus"
    }
}
