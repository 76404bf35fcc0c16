//! Condensed JSON summary of a domain's frames, sent to the model as data
//! context.

use serde::{Deserialize, Serialize};

use crate::series::{Column, Frame};

pub const DEFAULT_TOP_N: usize = 10;
pub const DEFAULT_ANOMALY_Z: f64 = 2.0;

/// Fewer finite points than this never produce anomaly windows.
pub const MIN_ANOMALY_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackOptions {
    pub top_n: usize,
    pub anomaly_z: f64,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            anomaly_z: DEFAULT_ANOMALY_Z,
        }
    }
}

/// A maximal run of buckets deviating from the column mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyWindow {
    pub start: i64,
    pub end: i64,
    pub peak: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub label: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<AnomalyWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub title: String,
    pub series: Vec<SeriesSummary>,

    /// Series left out by the top-N cut or for having no finite values.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub omitted: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    pub domain: String,
    pub frames: Vec<FrameSummary>,
}

impl ContextPack {
    pub fn build(domain: impl Into<String>, frames: &[Frame], options: PackOptions) -> Self {
        let frames = frames
            .iter()
            .map(|frame| summarize_frame(frame, options))
            .collect();

        Self {
            domain: domain.into(),
            frames,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn summarize_frame(frame: &Frame, options: PackOptions) -> FrameSummary {
    let series: Vec<SeriesSummary> = frame
        .top_columns(options.top_n)
        .into_iter()
        .filter_map(|column| {
            let stats = column.stats()?;
            Some(SeriesSummary {
                label: column.label.clone(),
                mean: round4(stats.mean),
                min: round4(stats.min),
                max: round4(stats.max),
                last: round4(stats.last),
                anomalies: anomaly_windows(&frame.timestamps, column, options.anomaly_z),
            })
        })
        .collect();
    let omitted = frame.columns.len().saturating_sub(series.len());

    FrameSummary {
        title: frame.title.clone(),
        series,
        omitted,
    }
}

/// Runs of buckets whose z-score against the column mean exceeds `threshold`.
pub fn anomaly_windows(timestamps: &[i64], column: &Column, threshold: f64) -> Vec<AnomalyWindow> {
    let finite: Vec<f64> = column.finite_values().collect();
    if finite.len() < MIN_ANOMALY_POINTS {
        return Vec::new();
    }

    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut current: Option<(AnomalyWindow, f64)> = None;

    for (ts, value) in timestamps.iter().zip(&column.values) {
        let deviation = value
            .filter(|v| v.is_finite())
            .map(|v| (v, (v - mean).abs() / std_dev))
            .filter(|(_, z)| *z > threshold);

        match (deviation, current.as_mut()) {
            (Some((v, z)), Some((window, peak_z))) => {
                window.end = *ts;
                if z > *peak_z {
                    window.peak = round4(v);
                    *peak_z = z;
                }
            }
            (Some((v, z)), None) => {
                current = Some((
                    AnomalyWindow {
                        start: *ts,
                        end: *ts,
                        peak: round4(v),
                    },
                    z,
                ));
            }
            (None, _) => {
                if let Some((window, _)) = current.take() {
                    windows.push(window);
                }
            }
        }
    }

    if let Some((window, _)) = current {
        windows.push(window);
    }

    windows
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
