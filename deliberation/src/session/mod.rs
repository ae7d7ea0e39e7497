//! Deliberation sessions
//!
//! - [`DeliberationSession`]: the per-session state machine, folded from
//!   ledger records
//! - [`SessionOrchestrator`]: the async entry point that validates, records
//!   and drives transitions

pub mod orchestrator;
pub mod state;

pub use orchestrator::{Collaborators, SessionOrchestrator, SessionState, SessionSummary};
pub use state::{DeliberationSession, SessionPhase};
