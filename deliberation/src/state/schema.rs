//! Column family definitions for the RocksDB store
//!
//! Each column family provides logical separation of data types
//! while sharing the same RocksDB instance.

/// Column family for ledger records, keyed by sequence
pub const CF_RECORDS: &str = "records";

/// Column family for the petition uniqueness index
pub const CF_PETITIONS: &str = "petitions";

/// Column family for the latest sequence of each session
pub const CF_SESSIONS: &str = "sessions";

/// Column family for content-addressed transcripts
pub const CF_TRANSCRIPTS: &str = "transcripts";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_RECORDS, CF_PETITIONS, CF_SESSIONS, CF_TRANSCRIPTS];

/// Key prefixes for compound keys
pub mod keys {
    /// Create a record key (zero-padded so lexical order is sequence order)
    pub fn record(sequence: u64) -> String {
        format!("rec:{:020}", sequence)
    }

    /// Create a petition index key
    pub fn petition(petition_id: &str) -> String {
        format!("pet:{}", petition_id)
    }

    /// Create a session head key
    pub fn session(session_id: &str) -> String {
        format!("ses:{}", session_id)
    }

    /// Parse the sequence number from a record key
    pub fn parse_record_sequence(key: &str) -> Option<u64> {
        key.strip_prefix("rec:")?.parse().ok()
    }
}
