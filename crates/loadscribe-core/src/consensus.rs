//! Self-consistency selection among independently generated candidates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::analysis::AnalysisResult;

/// One model response and its decoded form, if it decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    pub parsed: Option<AnalysisResult>,
}

impl Candidate {
    pub fn parsed(text: impl Into<String>, result: AnalysisResult) -> Self {
        Self {
            text: text.into(),
            parsed: Some(result),
        }
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parsed: None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed.is_some()
    }
}

/// Verdict held by strictly more than half of the parsed candidates.
///
/// Verdicts are compared trimmed and lowercased. Returns the normalized key.
pub fn majority_verdict(candidates: &[Candidate]) -> Option<String> {
    let parsed: Vec<&AnalysisResult> = candidates.iter().filter_map(|c| c.parsed.as_ref()).collect();
    if parsed.is_empty() {
        return None;
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for result in &parsed {
        *counts.entry(result.verdict_key()).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .find(|(_, count)| count * 2 > parsed.len())
        .map(|(verdict, _)| verdict)
}

/// Pick the best candidate.
///
/// The pool is the parsed candidates sharing the majority verdict, or every
/// parsed candidate when no majority exists, or every candidate when none
/// parsed. Within the pool the highest confidence wins and ties go to the
/// earliest candidate. Returns `None` only for an empty input.
pub fn select_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    if candidates.is_empty() {
        return None;
    }

    if !candidates.iter().any(Candidate::is_parsed) {
        return candidates.first();
    }

    let majority = majority_verdict(candidates);

    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in candidates {
        let Some(result) = &candidate.parsed else {
            continue;
        };
        if let Some(verdict) = &majority {
            if &result.verdict_key() != verdict {
                continue;
            }
        }

        let score = result.confidence_score();
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }

    best.map(|(candidate, _)| candidate)
}
