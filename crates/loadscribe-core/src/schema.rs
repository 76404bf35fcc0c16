//! JSON Schema validation for model analyses.
//!
//! Every structured answer from the model is checked against
//! `schema/analysis.schema.json` before it is deserialized. Range checks
//! such as `confidence` in [0, 1] live in the schema, so an out-of-range
//! value makes the whole candidate unparsed rather than silently clamped.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded analysis schema (loaded at compile time).
const ANALYSIS_SCHEMA_JSON: &str = include_str!("../schema/analysis.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(ANALYSIS_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(SchemaError::LoadError(e.clone())),
    }
}

/// Validate an analysis JSON value against the schema.
///
/// Returns every violation formatted as `"<message> at <instance path>"`.
pub fn validate_analysis(value: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Raw schema text, used to brief the model during a critic pass.
pub fn analysis_schema_text() -> &'static str {
    ANALYSIS_SCHEMA_JSON
}
