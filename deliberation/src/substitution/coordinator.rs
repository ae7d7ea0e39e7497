//! Juror substitution on failure
//!
//! The replacement is the next eligible candidate of the same index
//! sequence that produced the panel, skipping the current panel and anyone
//! already substituted out. Given the assignment record and the pool, the
//! choice is reproducible.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeliberationError, DeliberationResult};
use crate::panel::{JurorPool, PanelSelector};
use crate::session::DeliberationSession;
use crate::state::SubstitutionRecord;

/// How the substitution budget is counted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionScope {
    /// One budget for the whole session.
    #[default]
    Session,
    /// Budget resets at every round.
    Round,
}

impl fmt::Display for SubstitutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Round => write!(f, "round"),
        }
    }
}

impl std::str::FromStr for SubstitutionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "round" => Ok(Self::Round),
            other => Err(format!("unknown substitution scope: {}", other)),
        }
    }
}

/// What to do about a failed juror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstitutionDecision {
    /// Seat the replacement described by the record.
    Replace(SubstitutionRecord),
    /// Nobody eligible is left; the session must abort.
    NoCandidate,
}

/// Decides replacements and enforces the substitution budget
#[derive(Debug, Clone)]
pub struct SubstitutionCoordinator {
    selector: PanelSelector,
    max_substitutions: u32,
    scope: SubstitutionScope,
}

impl SubstitutionCoordinator {
    pub fn new(selector: PanelSelector, max_substitutions: u32, scope: SubstitutionScope) -> Self {
        Self {
            selector,
            max_substitutions,
            scope,
        }
    }

    pub fn scope(&self) -> SubstitutionScope {
        self.scope
    }

    /// Substitutions already charged against the budget.
    pub fn used(&self, session: &DeliberationSession) -> u32 {
        let used = match self.scope {
            SubstitutionScope::Session => session.substitutions.len(),
            SubstitutionScope::Round => session.substitutions_in_round(session.round),
        };
        used as u32
    }

    /// Decide how to handle `failed_juror` dropping out of `session`.
    ///
    /// Returns [`DeliberationError::SubstitutionBudgetExceeded`] when the
    /// budget is already spent; the caller records that as an abort.
    pub fn decide(
        &self,
        session: &DeliberationSession,
        failed_juror: &str,
        pool: &JurorPool,
        now: DateTime<Utc>,
    ) -> DeliberationResult<SubstitutionDecision> {
        if !session.panel.contains(failed_juror) {
            return Err(DeliberationError::JurorNotOnPanel {
                session_id: session.id.clone(),
                juror_id: failed_juror.to_string(),
            });
        }
        let Some(phase) = session.phase.active() else {
            return Err(DeliberationError::invalid_transition(
                &session.id,
                format!("cannot substitute in a {} session", session.phase),
            ));
        };

        let used = self.used(session);
        if used >= self.max_substitutions {
            warn!(
                session_id = %session.id,
                failed_juror,
                used,
                scope = %self.scope,
                "Substitution budget exhausted"
            );
            return Err(DeliberationError::SubstitutionBudgetExceeded {
                session_id: session.id.clone(),
                failures: used + 1,
            });
        }

        let mut excluded = session.removed_jurors();
        excluded.extend(session.panel.to_vec());

        let candidate = self.selector.next_candidate(
            &session.petition_id,
            session.seed.as_deref(),
            session.pool_generation,
            pool,
            &excluded,
        );

        match candidate {
            Some(replacement) => {
                debug!(
                    session_id = %session.id,
                    failed_juror,
                    replacement = %replacement,
                    phase = %phase,
                    round = session.round,
                    "Replacement selected"
                );
                Ok(SubstitutionDecision::Replace(SubstitutionRecord {
                    failed_juror: failed_juror.to_string(),
                    replacement_juror: replacement,
                    phase,
                    round: session.round,
                    recorded_at: now,
                }))
            }
            None => Ok(SubstitutionDecision::NoCandidate),
        }
    }
}
