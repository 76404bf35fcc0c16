//! Token accounting for one run.
//!
//! `llm.token_budget` caps the tokens a run may spend. Usage is also kept
//! per scope: a domain name, `overall`, or `<scope>.critic` for repair passes.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::providers::TokenUsage;

/// Accumulated model usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub llm_calls: u32,
    /// Calls that still failed after their retries.
    pub failed_calls: u32,
}

impl LlmUsage {
    fn record(&mut self, usage: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(u64::from(usage.prompt_tokens));
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(u64::from(usage.completion_tokens));
        self.total_tokens = self.total_tokens.saturating_add(u64::from(usage.total()));
        self.llm_calls = self.llm_calls.saturating_add(1);
    }
}

#[derive(Debug, Default)]
struct Ledger {
    total: LlmUsage,
    scopes: BTreeMap<String, LlmUsage>,
}

impl Ledger {
    fn scope(&mut self, scope: &str) -> &mut LlmUsage {
        self.scopes.entry(scope.to_string()).or_default()
    }
}

/// Spending limit and usage ledger shared by a session's calls.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    limit: Option<u64>,
    ledger: Mutex<Ledger>,
}

impl BudgetTracker {
    /// `None` is unlimited.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            ledger: Mutex::default(),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Tokens left under the limit, `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        let spent = self.ledger.lock().total.total_tokens;
        self.limit.map(|limit| limit.saturating_sub(spent))
    }

    pub fn can_afford(&self, estimated_tokens: u64) -> bool {
        self.remaining().map_or(true, |left| left >= estimated_tokens)
    }

    pub fn record_usage(&self, scope: &str, usage: &TokenUsage) {
        let mut ledger = self.ledger.lock();
        ledger.total.record(usage);
        ledger.scope(scope).record(usage);
    }

    pub fn record_failure(&self, scope: &str) {
        let mut ledger = self.ledger.lock();
        ledger.total.failed_calls = ledger.total.failed_calls.saturating_add(1);
        let scoped = ledger.scope(scope);
        scoped.failed_calls = scoped.failed_calls.saturating_add(1);
    }

    pub fn usage(&self) -> LlmUsage {
        self.ledger.lock().total.clone()
    }

    pub fn scope_usage(&self, scope: &str) -> Option<LlmUsage> {
        self.ledger.lock().scopes.get(scope).cloned()
    }

    /// Usage of every scope seen so far, by name.
    pub fn scopes(&self) -> BTreeMap<String, LlmUsage> {
        self.ledger.lock().scopes.clone()
    }
}
