//! # loadscribe-core
//!
//! Deterministic building blocks for load-test reports.
//!
//! This crate answers, without any I/O:
//! - What did the metrics look like? ([`series`], [`context_pack`])
//! - What did the model say? ([`extract`], [`consensus`])
//! - How does it land on the wiki page? ([`render`], [`markup`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use loadscribe_core::{decode_analysis, render::analysis_markdown};
//!
//! let result = decode_analysis("Sure! {\"verdict\": \"ok\", \"confidence\": 0.8}")?;
//! println!("{}", analysis_markdown(&result));
//! ```

pub mod analysis;
pub mod config;
pub mod consensus;
pub mod context_pack;
pub mod extract;
pub mod markup;
pub mod render;
pub mod schema;
pub mod series;

pub use analysis::{AnalysisResult, Finding, FindingDetail, Severity};
pub use config::{ConfigError, DomainConfig, ReportConfig, ServiceConfig};
pub use consensus::{select_candidate, Candidate};
pub use context_pack::{ContextPack, PackOptions};
pub use extract::{decode_analysis, DecodeError};
pub use markup::MarkupError;
pub use schema::validate_analysis;
pub use series::{Frame, QueryResponse, Series, SeriesError};
