//! Metric series and resampled frames.
//!
//! A range query returns one raw series per label set. Series are keyed by a
//! label string built from a fixed list of label keys, so several raw series
//! can collapse into one (their samples are summed). A [`Frame`] then buckets
//! every series onto a common time grid.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Label value used when a series lacks one of the requested keys.
pub const MISSING_LABEL: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeriesError {
    #[error("Invalid query response: {0}")]
    InvalidResponse(String),

    #[error("Resample interval must be greater than zero")]
    ZeroInterval,
}

/// Body of a Prometheus `query_range` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,

    #[serde(default)]
    pub data: Option<QueryData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    #[serde(default, rename = "resultType")]
    pub result_type: String,

    #[serde(default)]
    pub result: Vec<RawSeries>,
}

/// One label set with its `[timestamp, "value"]` samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,

    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

impl QueryResponse {
    pub fn from_json(text: &str) -> Result<Self, SeriesError> {
        serde_json::from_str(text).map_err(|e| SeriesError::InvalidResponse(e.to_string()))
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    fn raw_series(&self) -> &[RawSeries] {
        match &self.data {
            Some(data) if self.is_success() => &data.result,
            _ => &[],
        }
    }
}

/// Build the `key=value|key=value` label for a raw series.
pub fn label_string(metric: &BTreeMap<String, String>, label_keys: &[String]) -> String {
    label_keys
        .iter()
        .map(|key| {
            let value = metric.get(key).map(String::as_str).unwrap_or(MISSING_LABEL);
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// A labeled sequence of `(timestamp seconds, value)` samples, time ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

impl Series {
    /// Collapse a query response into series keyed by `label_keys`.
    ///
    /// Samples sharing a label and timestamp are summed. Unparseable values
    /// are skipped. A non-success response yields nothing.
    pub fn from_response(response: &QueryResponse, label_keys: &[String]) -> Vec<Series> {
        // label -> timestamp (ms) -> summed value
        let mut grouped: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();

        for raw in response.raw_series() {
            let label = label_string(&raw.metric, label_keys);
            let samples = grouped.entry(label).or_default();

            for (ts, value) in &raw.values {
                let Ok(value) = value.trim().parse::<f64>() else {
                    continue;
                };
                let key = (ts * 1000.0).round() as i64;
                *samples.entry(key).or_insert(0.0) += value;
            }
        }

        grouped
            .into_iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(label, samples)| Series {
                label,
                points: samples
                    .into_iter()
                    .map(|(ms, value)| (ms as f64 / 1000.0, value))
                    .collect(),
            })
            .collect()
    }
}

/// Summary statistics of a column, over finite values only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

/// One series aligned on the frame's time grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub label: String,
    pub values: Vec<Option<f64>>,
}

impl Column {
    pub fn finite_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().flatten().copied().filter(|v| v.is_finite())
    }

    pub fn stats(&self) -> Option<ColumnStats> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut last = f64::NAN;

        for value in self.finite_values() {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
            last = value;
        }

        if count == 0 {
            return None;
        }

        Some(ColumnStats {
            mean: sum / count as f64,
            min,
            max,
            last,
        })
    }

    pub fn mean(&self) -> Option<f64> {
        self.stats().map(|s| s.mean)
    }
}

/// Resampled, time-aligned set of series for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub title: String,
    /// Bucket start times in epoch seconds, ascending.
    pub timestamps: Vec<i64>,
    pub columns: Vec<Column>,
}

impl Frame {
    pub fn empty(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            timestamps: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Bucket every series to `interval_secs` and average each bucket.
    ///
    /// The grid holds only buckets where at least one series has a point.
    /// Intervals with no data at all are not filled in; a series missing
    /// from a bucket another series has gets `None` there.
    pub fn resample(
        title: impl Into<String>,
        series: &[Series],
        interval_secs: u64,
    ) -> Result<Frame, SeriesError> {
        if interval_secs == 0 {
            return Err(SeriesError::ZeroInterval);
        }
        let interval = interval_secs as i64;

        let bucket_of = |ts: f64| (ts.floor() as i64).div_euclid(interval) * interval;

        let mut grid: BTreeSet<i64> = BTreeSet::new();
        let mut per_series: Vec<(String, BTreeMap<i64, (f64, usize)>)> = Vec::with_capacity(series.len());

        for s in series {
            let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
            for &(ts, value) in &s.points {
                let bucket = bucket_of(ts);
                grid.insert(bucket);
                if !value.is_finite() {
                    continue;
                }
                let entry = buckets.entry(bucket).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
            per_series.push((s.label.clone(), buckets));
        }

        let timestamps: Vec<i64> = grid.into_iter().collect();
        let columns = per_series
            .into_iter()
            .map(|(label, buckets)| Column {
                label,
                values: timestamps
                    .iter()
                    .map(|ts| buckets.get(ts).map(|(sum, count)| sum / *count as f64))
                    .collect(),
            })
            .collect();

        Ok(Frame {
            title: title.into(),
            timestamps,
            columns,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() || self.timestamps.is_empty()
    }

    /// Columns ordered by descending mean, limited to `top_n`.
    ///
    /// Columns with no finite values sort last. Equal means keep label order.
    pub fn top_columns(&self, top_n: usize) -> Vec<&Column> {
        let mut ranked: Vec<(&Column, Option<f64>)> =
            self.columns.iter().map(|c| (c, c.mean())).collect();

        ranked.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        ranked.into_iter().take(top_n).map(|(c, _)| c).collect()
    }
}
