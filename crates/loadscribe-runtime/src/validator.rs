//! Response Validator: turns model text into a validated analysis.
//!
//! For each of `k` attempts a fresh response is requested for the same
//! prompt and decoded. A response that fails to decode gets exactly one
//! critic pass. The attempts are then reduced to one candidate by
//! [`select_candidate`].
//!
//! Malformed output never produces an error. Only failures of the model
//! call itself (after the session's retry budget) are returned.

use tracing::{debug, info, warn};

use loadscribe_core::{decode_analysis, select_candidate, Candidate};

use crate::prompts::critic_messages;
use crate::providers::ChatMessage;
use crate::session::{LlmSession, SessionError};

/// Independent generations per question unless configured otherwise.
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Self-consistency validator around an [`LlmSession`].
#[derive(Debug, Clone, Copy)]
pub struct ResponseValidator {
    attempts: usize,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

impl ResponseValidator {
    /// Values below 1 are treated as 1.
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Ask `attempts` times and select the best candidate.
    pub async fn validate(
        &self,
        session: &LlmSession,
        scope: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<Candidate, SessionError> {
        let mut candidates = Vec::with_capacity(self.attempts);

        for attempt in 1..=self.attempts {
            let text = session.complete(scope, messages.clone()).await?;
            let candidate = self.repair(session, scope, &text).await?;
            debug!(scope, attempt, parsed = candidate.is_parsed(), "Candidate collected");
            candidates.push(candidate);
        }

        let parsed = candidates.iter().filter(|c| c.is_parsed()).count();
        let chosen = select_candidate(&candidates)
            .cloned()
            .unwrap_or_else(|| Candidate::raw(String::new()));

        match &chosen.parsed {
            Some(result) => info!(
                scope,
                parsed,
                attempts = self.attempts,
                verdict = %result.verdict,
                confidence = result.confidence_score(),
                "Analysis validated"
            ),
            None => warn!(
                scope,
                attempts = self.attempts,
                "No attempt produced a valid analysis, keeping raw text"
            ),
        }

        Ok(chosen)
    }

    /// Decode `text`; on failure run one critic pass and decode its output.
    ///
    /// Returns the critic's text when the repair succeeded, otherwise the
    /// original text unparsed.
    pub async fn repair(
        &self,
        session: &LlmSession,
        scope: &str,
        text: &str,
    ) -> Result<Candidate, SessionError> {
        let error = match decode_analysis(text) {
            Ok(result) => return Ok(Candidate::parsed(text, result)),
            Err(e) => e,
        };
        debug!(scope, error = %error, "Decode failed, running critic pass");

        let rewritten = session
            .complete(&format!("{}.critic", scope), critic_messages(text))
            .await?;

        match decode_analysis(&rewritten) {
            Ok(result) => Ok(Candidate::parsed(rewritten, result)),
            Err(e) => {
                debug!(scope, error = %e, "Critic output did not decode either");
                Ok(Candidate::raw(text))
            }
        }
    }
}
