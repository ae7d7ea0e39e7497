//! Engine configuration
//!
//! Defaults, then a TOML file, then `DELIBERATION_*` environment variables,
//! then CLI flags. Call [`DeliberationConfig::validate`] before use.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DeliberationError, DeliberationResult};
use crate::panel::{Capability, EligibilityPolicy};
use crate::state::SCHEMA_VERSION;
use crate::substitution::SubstitutionScope;

/// Hard ceiling on deliberation rounds
pub const MAX_ROUNDS_LIMIT: u32 = 3;

/// Configuration for the deliberation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    /// Rounds before a persistent split deadlocks
    pub max_rounds: u32,

    /// Wall-clock ceiling per session, in seconds
    pub session_timeout: u64,

    /// Substitutions allowed before the session aborts
    pub max_substitutions: u32,

    /// Whether the substitution budget is per session or per round
    pub substitution_scope: SubstitutionScope,

    /// Seed mixed into panel selection
    pub selection_seed: Option<String>,

    /// Capabilities a juror needs to be seated
    pub required_capabilities: Vec<Capability>,

    /// Record schema version written by this build
    pub schema_version: u32,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            max_rounds: MAX_ROUNDS_LIMIT,
            session_timeout: 3600,
            max_substitutions: 1,
            substitution_scope: SubstitutionScope::Session,
            selection_seed: None,
            required_capabilities: vec![Capability::Deliberate],
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl DeliberationConfig {
    /// Defaults overridden by `DELIBERATION_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> DeliberationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeliberationError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DeliberationResult<Self> {
        toml::from_str(content).map_err(|e| DeliberationError::InvalidConfig(e.to_string()))
    }

    /// Override fields from `DELIBERATION_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("DELIBERATION_MAX_ROUNDS") {
            if let Ok(n) = val.parse() {
                self.max_rounds = n;
            }
        }
        if let Ok(val) = std::env::var("DELIBERATION_SESSION_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.session_timeout = n;
            }
        }
        if let Ok(val) = std::env::var("DELIBERATION_MAX_SUBSTITUTIONS") {
            if let Ok(n) = val.parse() {
                self.max_substitutions = n;
            }
        }
        if let Ok(val) = std::env::var("DELIBERATION_SUBSTITUTION_SCOPE") {
            if let Ok(scope) = val.parse() {
                self.substitution_scope = scope;
            }
        }
        if let Ok(seed) = std::env::var("DELIBERATION_SELECTION_SEED") {
            self.selection_seed = (!seed.is_empty()).then_some(seed);
        }
    }

    pub fn validate(&self) -> DeliberationResult<()> {
        if self.max_rounds == 0 {
            return Err(DeliberationError::InvalidConfig(
                "max_rounds must be at least 1".into(),
            ));
        }
        if self.max_rounds > MAX_ROUNDS_LIMIT {
            return Err(DeliberationError::InvalidConfig(format!(
                "max_rounds {} exceeds the limit of {}",
                self.max_rounds, MAX_ROUNDS_LIMIT
            )));
        }
        if self.session_timeout == 0 {
            return Err(DeliberationError::InvalidConfig(
                "session_timeout must be positive".into(),
            ));
        }
        if self.schema_version > SCHEMA_VERSION {
            return Err(DeliberationError::InvalidConfig(format!(
                "schema_version {} is newer than supported {}",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_timeout as i64)
    }

    pub fn eligibility_policy(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            required: self.required_capabilities.iter().copied().collect(),
        }
    }
}
