//! Juror pool and deterministic panel selection
//!
//! Selection is a pure function of `(petition id, seed, pool generation)`:
//! identical inputs always produce the same ordered panel, and the pool
//! snapshot's input order never matters.

pub mod pool;
pub mod selector;

pub use pool::{
    Capability, EligibilityPolicy, Juror, JurorPool, JurorPoolProvider, PoolError, PoolResult,
    StaticPoolProvider,
};
pub use selector::{CandidateStream, IndexSequence, InsufficientPool, Panel, PanelSelector, PANEL_SIZE};
