//! Rendering of frames and analyses as markdown, plain text and Confluence
//! storage XHTML.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::fmt::Write as _;

use crate::analysis::{AnalysisResult, FindingDetail, Severity, UNKNOWN_COMPONENT};
use crate::series::{Column, Frame};

pub const NO_DATA: &str = "no data";

/// Escape text for inclusion in XHTML storage markup.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Bucket start as `HH:MM` in the given offset.
pub fn format_bucket(ts: i64, offset: &FixedOffset) -> String {
    match DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt.with_timezone(offset).format("%H:%M").to_string(),
        None => ts.to_string(),
    }
}

/// Insert `,` between groups of three digits in an unsigned integer string.
fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn with_separators(formatted: &str) -> String {
    let (sign, rest) = match formatted.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", formatted),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };
    match frac_part {
        Some(f) => format!("{}{}.{}", sign, group_thousands(int_part), f),
        None => format!("{}{}", sign, group_thousands(int_part)),
    }
}

/// How a row of numbers is printed, chosen from its largest magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberStyle {
    /// >= 1e6: integer with thousands separators.
    Integer,
    /// >= 1000: one decimal with thousands separators.
    OneDecimal,
    /// Four decimals.
    Fine,
}

impl NumberStyle {
    pub fn for_values(values: &[Option<f64>]) -> Self {
        let max_abs = values
            .iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(0.0f64, |acc, v| acc.max(v.abs()));

        if max_abs >= 1e6 {
            NumberStyle::Integer
        } else if max_abs >= 1000.0 {
            NumberStyle::OneDecimal
        } else {
            NumberStyle::Fine
        }
    }

    pub fn format(&self, value: f64) -> String {
        if !value.is_finite() {
            return String::new();
        }
        match self {
            NumberStyle::Integer => with_separators(&format!("{}", value.trunc() as i64)),
            NumberStyle::OneDecimal => with_separators(&format!("{:.1}", value)),
            NumberStyle::Fine => format!("{:.4}", value),
        }
    }
}

fn row_cells(column: &Column) -> Vec<String> {
    let style = NumberStyle::for_values(&column.values);
    column
        .values
        .iter()
        .map(|v| v.map(|v| style.format(v)).unwrap_or_default())
        .collect()
}

fn row_label(column: &Column) -> String {
    column.label.replace('|', "/")
}

/// Top-N series of a frame as a transposed markdown table.
pub fn markdown_table(frame: &Frame, top_n: usize, offset: &FixedOffset) -> String {
    if frame.is_empty() {
        return format!("_{}_\n", NO_DATA);
    }

    let mut out = String::new();
    out.push_str("| series |");
    for ts in &frame.timestamps {
        let _ = write!(out, " {} |", format_bucket(*ts, offset));
    }
    out.push('\n');

    out.push_str("|:---|");
    for _ in &frame.timestamps {
        out.push_str("---:|");
    }
    out.push('\n');

    for column in frame.top_columns(top_n) {
        let _ = write!(out, "| {} |", row_label(column));
        for cell in row_cells(column) {
            let _ = write!(out, " {} |", cell);
        }
        out.push('\n');
    }

    out
}

/// Markdown for a list of frames, one titled table each.
pub fn frames_markdown(frames: &[Frame], top_n: usize, offset: &FixedOffset) -> String {
    let mut out = String::new();
    for frame in frames {
        let _ = writeln!(out, "## {}\n", frame.title);
        let _ = writeln!(out, "### Top {} series by mean\n", top_n);
        out.push_str(&markdown_table(frame, top_n, offset));
        out.push('\n');
    }
    out
}

/// Same content as [`markdown_table`], as storage XHTML.
pub fn storage_table(frame: &Frame, top_n: usize, offset: &FixedOffset) -> String {
    if frame.is_empty() {
        return format!("<p><em>{}</em></p>", NO_DATA);
    }

    let mut out = String::from("<table><tbody><tr><th>series</th>");
    for ts in &frame.timestamps {
        let _ = write!(out, "<th>{}</th>", format_bucket(*ts, offset));
    }
    out.push_str("</tr>");

    for column in frame.top_columns(top_n) {
        let _ = write!(out, "<tr><td>{}</td>", escape_xml(&row_label(column)));
        for cell in row_cells(column) {
            let _ = write!(out, "<td>{}</td>", cell);
        }
        out.push_str("</tr>");
    }

    out.push_str("</tbody></table>");
    out
}

/// One finding on a single line. Defaults are not shown.
fn finding_line(detail: &FindingDetail) -> String {
    let mut line = String::new();
    if detail.severity != Severity::default() {
        let _ = write!(line, "[{}] ", detail.severity);
    }
    if detail.component != UNKNOWN_COMPONENT {
        let _ = write!(line, "{}: ", detail.component);
    }
    line.push_str(&detail.summary);
    if let Some(evidence) = &detail.evidence {
        let _ = write!(line, " (evidence: {})", evidence);
    }
    line
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn peak_line(result: &AnalysisResult) -> Option<String> {
    let peak = result.peak_performance.as_ref().filter(|p| !p.is_empty())?;
    Some(
        peak.iter()
            .map(|(k, v)| format!("{}={}", k, value_text(v)))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn components_line(result: &AnalysisResult) -> Option<String> {
    let components = result.affected_components.as_ref().filter(|c| !c.is_empty())?;
    Some(components.iter().cloned().collect::<Vec<_>>().join(", "))
}

/// Plain text, used when one analysis feeds another prompt.
pub fn analysis_text(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Verdict: {}", result.verdict);
    if let Some(confidence) = result.confidence {
        let _ = writeln!(out, "Confidence: {:.2}", confidence);
    }
    if !result.findings.is_empty() {
        out.push_str("Findings:\n");
        for finding in &result.findings {
            let _ = writeln!(out, "- {}", finding_line(&finding.detail()));
        }
    }
    if !result.recommended_actions.is_empty() {
        out.push_str("Recommended actions:\n");
        for action in &result.recommended_actions {
            let _ = writeln!(out, "- {}", action);
        }
    }
    if let Some(components) = components_line(result) {
        let _ = writeln!(out, "Affected components: {}", components);
    }
    if let Some(peak) = peak_line(result) {
        let _ = writeln!(out, "Peak performance: {}", peak);
    }
    out
}

pub fn analysis_markdown(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = write!(out, "**Verdict:** {}", result.verdict);
    if let Some(confidence) = result.confidence {
        let _ = write!(out, " (confidence {:.2})", confidence);
    }
    out.push_str("\n\n");

    if !result.findings.is_empty() {
        out.push_str("**Findings**\n\n");
        for finding in &result.findings {
            let _ = writeln!(out, "- {}", finding_line(&finding.detail()));
        }
        out.push('\n');
    }
    if !result.recommended_actions.is_empty() {
        out.push_str("**Recommended actions**\n\n");
        for action in &result.recommended_actions {
            let _ = writeln!(out, "- {}", action);
        }
        out.push('\n');
    }
    if let Some(components) = components_line(result) {
        let _ = writeln!(out, "**Affected components:** {}\n", components);
    }
    if let Some(peak) = peak_line(result) {
        let _ = writeln!(out, "**Peak performance:** {}\n", peak);
    }
    out
}

fn storage_list(items: impl Iterator<Item = String>) -> String {
    let mut out = String::from("<ul>");
    for item in items {
        let _ = write!(out, "<li>{}</li>", escape_xml(&item));
    }
    out.push_str("</ul>");
    out
}

pub fn analysis_storage(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = write!(out, "<p><strong>Verdict:</strong> {}", escape_xml(&result.verdict));
    if let Some(confidence) = result.confidence {
        let _ = write!(out, " (confidence {:.2})", confidence);
    }
    out.push_str("</p>");

    if !result.findings.is_empty() {
        out.push_str("<p><strong>Findings</strong></p>");
        out.push_str(&storage_list(
            result.findings.iter().map(|f| finding_line(&f.detail())),
        ));
    }
    if !result.recommended_actions.is_empty() {
        out.push_str("<p><strong>Recommended actions</strong></p>");
        out.push_str(&storage_list(result.recommended_actions.iter().cloned()));
    }
    if let Some(components) = components_line(result) {
        let _ = write!(
            out,
            "<p><strong>Affected components:</strong> {}</p>",
            escape_xml(&components)
        );
    }
    if let Some(peak) = peak_line(result) {
        let _ = write!(
            out,
            "<p><strong>Peak performance:</strong> {}</p>",
            escape_xml(&peak)
        );
    }
    out
}

/// Free text as storage paragraphs; blank text renders as "no data".
pub fn text_storage(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return format!("<p><em>{}</em></p>", NO_DATA);
    }

    text.split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            let lines: Vec<String> = p.trim().lines().map(escape_xml).collect();
            format!("<p>{}</p>", lines.join("<br />"))
        })
        .collect()
}
