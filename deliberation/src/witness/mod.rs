//! Tamper-evident witness chain

pub mod chain;

pub use crate::state::ContentHash;
pub use chain::{
    BrokenLink, ChainVerificationReport, IntegrityFailure, WitnessChainBuilder, WitnessEvent,
};
