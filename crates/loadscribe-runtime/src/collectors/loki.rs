//! Loki log excerpts.

use chrono::{FixedOffset, TimeZone};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use loadscribe_core::config::LokiConfig;

use super::CollectorError;
use crate::http;

/// Timestamp layout of an exported log line.
const LINE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Body of a Loki `query_range` response for a streams query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LokiResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: LokiData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LokiData {
    #[serde(default)]
    pub result: Vec<LokiStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LokiStream {
    #[serde(default)]
    pub stream: BTreeMap<String, String>,
    /// `[nanosecond timestamp, line]` pairs.
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

impl LokiResponse {
    /// Every line of every stream as `"<time> - <line>"`, ordered by time.
    ///
    /// Entries whose timestamp does not parse are dropped.
    pub fn lines(&self, offset: &FixedOffset) -> Vec<String> {
        let mut entries: Vec<(i64, &str)> = self
            .data
            .result
            .iter()
            .flat_map(|stream| stream.values.iter())
            .filter_map(|(ts, line)| ts.parse::<i64>().ok().map(|ns| (ns, line.as_str())))
            .collect();
        entries.sort_by_key(|(ns, _)| *ns);

        entries
            .into_iter()
            .map(|(ns, line)| format_log_line(ns, line, offset))
            .collect()
    }
}

/// Render one entry as `"<local time> - <line>"`.
pub fn format_log_line(timestamp_ns: i64, line: &str, offset: &FixedOffset) -> String {
    let time = offset.timestamp_nanos(timestamp_ns);
    format!("{} - {}", time.format(LINE_TIME_FORMAT), line)
}

/// Fetches log lines for a LogQL filter.
#[derive(Debug, Clone)]
pub struct LokiClient {
    url: String,
    limit: usize,
    offset: FixedOffset,
    client: reqwest::Client,
}

impl LokiClient {
    /// `url` is the full `query_range` endpoint.
    pub fn new(url: &str, limit: usize, offset: FixedOffset, client: reqwest::Client) -> Self {
        Self {
            url: url.to_string(),
            limit,
            offset,
            client,
        }
    }

    pub fn from_config(
        config: &LokiConfig,
        offset: FixedOffset,
        client: reqwest::Client,
    ) -> Result<Self, CollectorError> {
        if config.url.is_empty() {
            return Err(CollectorError::NotConfigured("loki.url is empty".to_string()));
        }
        Ok(Self::new(&config.url, config.limit, offset, client))
    }

    /// Lines matching `filter` within `[start_ms, end_ms]`, oldest first.
    pub async fn fetch_lines(
        &self,
        filter: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<String>, CollectorError> {
        let params = [
            ("query", filter.to_string()),
            ("start", (start_ms * 1_000_000).to_string()),
            ("end", (end_ms * 1_000_000).to_string()),
            ("limit", self.limit.to_string()),
        ];

        let response = self
            .client
            .get(&self.url)
            .query(&params)
            .send()
            .await
            .map_err(|e| CollectorError::http("loki", e))?;
        let response = http::check_status(response, "loki").await?;

        let body: LokiResponse = response
            .json()
            .await
            .map_err(|e| CollectorError::invalid("loki", e))?;

        let lines = body.lines(&self.offset);
        debug!(filter, lines = lines.len(), "Fetched Loki lines");
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msk() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    #[test]
    fn test_format_log_line_in_offset() {
        // 2025-02-21T08:30:00.250Z
        let ns = 1_740_126_600_250_000_000;
        assert_eq!(
            format_log_line(ns, "GET /api 200", &msk()),
            "2025-02-21 11:30:00.250 - GET /api 200"
        );
    }

    #[test]
    fn test_lines_merged_across_streams_by_time() {
        let body: LokiResponse = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": {"resultType": "streams", "result": [
                {"stream": {"app": "a"}, "values": [
                    ["1740126603000000000", "third"],
                    ["1740126601000000000", "first"]
                ]},
                {"stream": {"app": "b"}, "values": [
                    ["1740126602000000000", "second"],
                    ["not-a-number", "dropped"]
                ]}
            ]}
        }))
        .unwrap();

        let lines = body.lines(&msk());
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("- first"));
        assert!(lines[1].ends_with("- second"));
        assert!(lines[2].ends_with("- third"));
    }

    #[test]
    fn test_empty_result() {
        let body: LokiResponse =
            serde_json::from_str(r#"{"status": "success", "data": {"result": []}}"#).unwrap();
        assert!(body.lines(&msk()).is_empty());
    }

    #[test]
    fn test_from_config_requires_url() {
        let result = LokiClient::from_config(&LokiConfig::default(), msk(), reqwest::Client::new());
        assert!(matches!(result, Err(CollectorError::NotConfigured(_))));
    }
}
