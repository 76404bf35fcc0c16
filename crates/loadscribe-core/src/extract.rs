//! Decoding of model output into an [`AnalysisResult`].
//!
//! Two steps, nothing more:
//! 1. strict decode of the whole (trimmed) text;
//! 2. one fallback: the span from the first `{` to the last `}`.
//!
//! Both steps validate against the analysis schema before deserializing.
//! A fenced ```json block is handled by step 2 because the fence sits
//! outside the braces.

use serde_json::Value;
use thiserror::Error;

use crate::analysis::AnalysisResult;
use crate::schema::validate_analysis;

/// Why a piece of text did not decode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("No JSON object found in model output")]
    NoJsonObject,

    #[error("Malformed JSON: {0}")]
    Json(String),

    #[error("Schema validation failed: {}", .0.join("; "))]
    Schema(Vec<String>),
}

/// Decode model output into a validated analysis.
pub fn decode_analysis(text: &str) -> Result<AnalysisResult, DecodeError> {
    let trimmed = text.trim();

    let strict_error = match decode_json_str(trimmed) {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };

    let Some(span) = brace_span(text) else {
        return Err(match strict_error {
            DecodeError::Json(_) => DecodeError::NoJsonObject,
            other => other,
        });
    };

    if span == trimmed {
        return Err(strict_error);
    }

    tracing::debug!(span_len = span.len(), "Strict decode failed, trying brace span");
    decode_json_str(span)
}

/// Validate and deserialize an already parsed JSON value.
pub fn decode_value(value: Value) -> Result<AnalysisResult, DecodeError> {
    validate_analysis(&value).map_err(DecodeError::Schema)?;

    let result: AnalysisResult =
        serde_json::from_value(value).map_err(|e| DecodeError::Json(e.to_string()))?;

    if result.verdict.trim().is_empty() {
        return Err(DecodeError::Schema(vec!["verdict is blank".to_string()]));
    }

    Ok(result)
}

/// The text between the first `{` and the last `}`, inclusive.
pub fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn decode_json_str(text: &str) -> Result<AnalysisResult, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(value)
}
