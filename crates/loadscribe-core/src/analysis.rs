//! Structured analysis produced by the model.
//!
//! An [`AnalysisResult`] only exists for the duration of one report build:
//! it is decoded from model output, rendered into the wiki page and dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    #[default]
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const UNKNOWN_COMPONENT: &str = "unknown";

fn default_component() -> String {
    UNKNOWN_COMPONENT.to_string()
}

/// A finding with optional severity, component and evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingDetail {
    pub summary: String,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default = "default_component")]
    pub component: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl FindingDetail {
    /// A finding carrying only a summary, every other field at its default.
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            severity: Severity::default(),
            component: default_component(),
            evidence: None,
        }
    }

    /// True when nothing beyond the summary was supplied.
    pub fn is_plain(&self) -> bool {
        self.severity == Severity::default()
            && self.component == UNKNOWN_COMPONENT
            && self.evidence.is_none()
    }
}

/// A finding as the model may supply it: a bare sentence or a detailed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Finding {
    Text(String),
    Detail(FindingDetail),
}

impl Finding {
    /// Normalize to a [`FindingDetail`]; a bare string becomes its summary.
    pub fn detail(&self) -> FindingDetail {
        match self {
            Finding::Text(text) => FindingDetail::new(text.clone()),
            Finding::Detail(detail) => detail.clone(),
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Finding::Text(text) => text,
            Finding::Detail(detail) => &detail.summary,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Finding::Text(_) => Severity::default(),
            Finding::Detail(detail) => detail.severity,
        }
    }
}

impl From<&str> for Finding {
    fn from(text: &str) -> Self {
        Finding::Text(text.to_string())
    }
}

impl From<FindingDetail> for Finding {
    fn from(detail: FindingDetail) -> Self {
        Finding::Detail(detail)
    }
}

/// The model's interpretation of a metric domain or of the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub verdict: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub findings: Vec<Finding>,

    /// Also accepted under the field name `actions`.
    #[serde(default, alias = "actions")]
    pub recommended_actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_components: Option<BTreeSet<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_performance: Option<Map<String, Value>>,
}

impl AnalysisResult {
    pub fn new(verdict: impl Into<String>) -> Self {
        Self {
            verdict: verdict.into(),
            confidence: None,
            findings: Vec::new(),
            recommended_actions: Vec::new(),
            affected_components: None,
            peak_performance: None,
        }
    }

    /// Set the confidence, clamped to [0, 1]. NaN is dropped.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            None
        } else {
            Some(confidence.clamp(0.0, 1.0))
        };
        self
    }

    pub fn with_finding(mut self, finding: impl Into<Finding>) -> Self {
        self.findings.push(finding.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.recommended_actions.push(action.into());
        self
    }

    /// Confidence used for ranking candidates; 0.0 when absent.
    pub fn confidence_score(&self) -> f64 {
        self.confidence
            .filter(|c| c.is_finite())
            .unwrap_or(0.0)
    }

    /// Verdict normalized for comparison between candidates.
    pub fn verdict_key(&self) -> String {
        self.verdict.trim().to_lowercase()
    }

    /// Highest severity among the findings, if any.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.findings.iter().map(Finding::severity).min()
    }
}
