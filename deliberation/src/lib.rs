//! Panel Deliberation Engine
//!
//! Routes each petition to a deterministically chosen panel of three jurors
//! and drives them through a phased deliberation:
//!
//! ```text
//! ASSESS -> POSITION -> CROSS_EXAMINE -> VOTE -> COMPLETE(outcome)
//!                            ^             |
//!                            +-- 1-1-1 ----+   (up to 3 rounds, then ESCALATE)
//! ```
//!
//! Every completed phase is witnessed with a BLAKE3 hash of its transcript,
//! chained to the previous phase. Two of three agreeing ballots decide the
//! outcome and the outvoted ballot is kept as dissent. A session that runs
//! past its deadline is escalated; one that loses two jurors is aborted.
//! Every transition is one append-only ledger record, so the audit timeline
//! of any session can be rebuilt and verified after the fact.
//!
//! # Modules
//!
//! - [`panel`]: juror pool, eligibility and deterministic selection
//! - [`session`]: the session state machine and orchestrator
//! - [`witness`]: hash-chained phase witnessing and verification
//! - [`consensus`]: 2-of-3 resolution and deadlock handling
//! - [`substitution`]: juror replacement and the substitution budget
//! - [`timeout`]: clocks, scheduling and the session deadline
//! - [`audit`]: timeline reconstruction and portable exports
//! - [`disposition`]: terminal records for downstream routing
//! - [`state`]: record types, ledger and transcript storage
//!
//! # Usage
//!
//! ```ignore
//! use deliberation::{Collaborators, DeliberationConfig, SessionOrchestrator};
//!
//! let orchestrator = SessionOrchestrator::new(
//!     DeliberationConfig::from_env(),
//!     Collaborators::in_memory(pool),
//! )?;
//! let summary = orchestrator.assign_panel("P1").await?;
//! orchestrator.complete_phase(&summary.session_id, Phase::Assess, entries).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod audit;
pub mod config;
pub mod consensus;
pub mod disposition;
pub mod error;
pub mod panel;
pub mod session;
pub mod state;
pub mod substitution;
pub mod timeout;
pub mod witness;

// Re-export the engine surface
pub use config::DeliberationConfig;
pub use error::{DeliberationError, DeliberationResult};
pub use session::{
    Collaborators, DeliberationSession, SessionOrchestrator, SessionPhase, SessionState,
    SessionSummary,
};

// Re-export collaborator seams and their default backends
pub use disposition::{DispositionBus, DispositionRecord, DispositionSink};
pub use panel::{Capability, EligibilityPolicy, Juror, JurorPool, JurorPoolProvider, StaticPoolProvider};
pub use state::{InMemoryLedger, InMemoryTranscriptStore, Ledger, TranscriptStore};
pub use timeout::{Clock, ManualClock, ManualScheduler, Scheduler, SystemClock, TokioScheduler};

// Re-export record types
pub use audit::{AuditExport, AuditTimeline, TimelineEvent};
pub use state::{Outcome, Phase, TerminationReason, TranscriptEntry};
pub use witness::{ChainVerificationReport, WitnessEvent};
