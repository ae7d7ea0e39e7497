//! Mid-session juror replacement

pub mod coordinator;

pub use coordinator::{SubstitutionCoordinator, SubstitutionDecision, SubstitutionScope};
