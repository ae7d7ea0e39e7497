//! Juror pool, capabilities, and eligibility policy
//!
//! A juror is an id plus a capability set. Whether a juror may sit on a
//! panel is decided by an [`EligibilityPolicy`] lookup against those
//! capabilities, not by the juror's type.

use std::collections::BTreeSet;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::{JurorId, PoolGeneration};

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool provider unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// What a juror is cleared to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// May sit on a panel and vote.
    Deliberate,
    /// May lead cross-examination.
    CrossExamine,
    /// Read-only access to transcripts; never seated.
    Observe,
}

/// A reviewing agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Juror {
    pub id: JurorId,
    pub capabilities: BTreeSet<Capability>,
}

impl Juror {
    pub fn new(id: impl Into<JurorId>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// A juror cleared to deliberate and cross-examine.
    pub fn panelist(id: impl Into<JurorId>) -> Self {
        Self::new(id, [Capability::Deliberate, Capability::CrossExamine])
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Capabilities a juror must hold to be seated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityPolicy {
    pub required: BTreeSet<Capability>,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            required: [Capability::Deliberate].into_iter().collect(),
        }
    }
}

impl EligibilityPolicy {
    pub fn is_eligible(&self, juror: &Juror) -> bool {
        self.required.iter().all(|c| juror.has(*c))
    }
}

/// Snapshot of the pool at one generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurorPool {
    pub jurors: Vec<Juror>,
    pub generation: PoolGeneration,
}

impl JurorPool {
    pub fn new(jurors: Vec<Juror>, generation: PoolGeneration) -> Self {
        Self { jurors, generation }
    }

    /// Pool of plain panelists from bare ids.
    pub fn from_ids<I, S>(ids: I, generation: PoolGeneration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<JurorId>,
    {
        Self::new(ids.into_iter().map(Juror::panelist).collect(), generation)
    }

    /// Eligible juror ids in canonical (sorted, deduplicated) order.
    pub fn eligible_ids(&self, policy: &EligibilityPolicy) -> Vec<JurorId> {
        let ids: BTreeSet<&JurorId> = self
            .jurors
            .iter()
            .filter(|j| policy.is_eligible(j))
            .map(|j| &j.id)
            .collect();
        ids.into_iter().cloned().collect()
    }
}

/// Source of the current juror pool
#[async_trait]
pub trait JurorPoolProvider: Send + Sync {
    async fn snapshot(&self) -> PoolResult<JurorPool>;
}

/// Pool provider backed by a fixed, replaceable juror list
pub struct StaticPoolProvider {
    pool: RwLock<JurorPool>,
}

impl StaticPoolProvider {
    pub fn new(pool: JurorPool) -> Self {
        Self {
            pool: RwLock::new(pool),
        }
    }

    /// Replace the juror list and bump the generation marker.
    pub fn replace(&self, jurors: Vec<Juror>) -> PoolResult<PoolGeneration> {
        let mut pool = self.pool.write().map_err(|_| PoolError::LockPoisoned)?;
        pool.jurors = jurors;
        pool.generation += 1;
        info!(
            generation = pool.generation,
            size = pool.jurors.len(),
            "Juror pool replaced"
        );
        Ok(pool.generation)
    }
}

#[async_trait]
impl JurorPoolProvider for StaticPoolProvider {
    async fn snapshot(&self) -> PoolResult<JurorPool> {
        let pool = self.pool.read().map_err(|_| PoolError::LockPoisoned)?;
        Ok(pool.clone())
    }
}
