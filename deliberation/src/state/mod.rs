//! State persistence for deliberation sessions
//!
//! This module holds the record types every session is folded from and the
//! two storage seams the engine consumes:
//!
//! - [`Ledger`]: append-only, sequence-numbered records with a uniqueness
//!   constraint on petition id for session assignment
//! - [`TranscriptStore`]: content-addressed phase transcripts
//!
//! In-memory backends are always available. Enabling the `rocksdb-store`
//! feature adds [`RocksStore`], a durable backend implementing both seams
//! over one RocksDB instance with a column family per data type:
//!
//! - `records`: ledger records keyed by sequence
//! - `petitions`: petition id -> assignment sequence
//! - `sessions`: session id -> latest record sequence
//! - `transcripts`: content hash -> transcript bytes
//!
//! # Usage
//!
//! ```ignore
//! use deliberation::state::{InMemoryLedger, Ledger, RecordFilter};
//!
//! let ledger = InMemoryLedger::new();
//! let seq = ledger.append(record).await?;
//! let history = ledger.read(&RecordFilter::session(&session_id)).await?;
//! ```

pub mod ledger;
#[cfg(feature = "rocksdb-store")]
pub mod schema;
#[cfg(feature = "rocksdb-store")]
pub mod store;
pub mod transcript;
pub mod types;

// Re-export core types
pub use ledger::{
    InMemoryLedger, Ledger, LedgerError, LedgerRecord, LedgerResult, RecordFilter, RecordKind,
    RecordPayload, SCHEMA_VERSION,
};
#[cfg(feature = "rocksdb-store")]
pub use store::{RocksStore, SharedRocksStore, StoreError, StoreResult};
pub use transcript::{
    content_hash, ContentHash, InMemoryTranscriptStore, PhaseTranscript, TranscriptEntry,
    TranscriptError, TranscriptResult, TranscriptStore,
};
pub use types::{
    AssignmentRecord, DissentRecord, JurorId, Outcome, PetitionId, Phase, PoolGeneration,
    RoundAdvance, SessionId, SubstitutionRecord, TerminationReason, TerminationRecord, Vote,
    VoteTally,
};
