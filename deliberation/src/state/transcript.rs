//! Content-addressed transcript storage
//!
//! Phase transcripts are retrievable only by their BLAKE3 content hash.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{JurorId, Phase, SessionId};

/// Hex-encoded BLAKE3 digest
pub type ContentHash = String;

/// Hash raw transcript bytes.
pub fn content_hash(content: &[u8]) -> ContentHash {
    blake3::hash(content).to_hex().to_string()
}

/// Error type for transcript store operations
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for transcript store operations
pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// One contribution to a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub juror_id: JurorId,
    pub content: String,
}

impl TranscriptEntry {
    pub fn new(juror_id: impl Into<JurorId>, content: impl Into<String>) -> Self {
        Self {
            juror_id: juror_id.into(),
            content: content.into(),
        }
    }
}

/// The full transcript of one phase of one round.
///
/// Session id, phase and round are part of the hashed body so two phases
/// never share a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTranscript {
    pub session_id: SessionId,
    pub phase: Phase,
    pub round: u32,
    pub entries: Vec<TranscriptEntry>,
}

impl PhaseTranscript {
    /// Canonical bytes that get stored and hashed.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Content-addressed store consumed by the engine
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Store content and return its hash.
    async fn put(&self, content: &[u8]) -> TranscriptResult<ContentHash>;

    /// Fetch content by hash; `None` if unknown.
    async fn get(&self, hash: &str) -> TranscriptResult<Option<Vec<u8>>>;
}

/// In-process transcript store, the default backend
#[derive(Default)]
pub struct InMemoryTranscriptStore {
    blobs: RwLock<HashMap<ContentHash, Vec<u8>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load content under a previously recorded hash without rehashing.
    ///
    /// Used when importing an exported audit bundle; verification later
    /// recomputes the hash and flags any mismatch.
    pub fn restore(&self, hash: &str, content: Vec<u8>) -> TranscriptResult<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| TranscriptError::LockPoisoned)?;
        blobs.insert(hash.to_string(), content);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn put(&self, content: &[u8]) -> TranscriptResult<ContentHash> {
        let hash = content_hash(content);
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| TranscriptError::LockPoisoned)?;
        blobs.entry(hash.clone()).or_insert_with(|| content.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> TranscriptResult<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| TranscriptError::LockPoisoned)?;
        Ok(blobs.get(hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_by_hash() {
        let store = InMemoryTranscriptStore::new();
        let hash = store.put(b"J1: the petition is in order").await.unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(b"J1: the petition is in order"));

        let content = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(content, b"J1: the petition is in order");
        assert!(store.get("deadbeef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identical_content_stored_once() {
        let store = InMemoryTranscriptStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_transcript_hash_depends_on_phase() {
        let assess = PhaseTranscript {
            session_id: "s1".into(),
            phase: Phase::Assess,
            round: 1,
            entries: vec![TranscriptEntry::new("J1", "ok")],
        };
        let position = PhaseTranscript {
            phase: Phase::Position,
            ..assess.clone()
        };
        assert_ne!(
            content_hash(&assess.canonical_bytes().unwrap()),
            content_hash(&position.canonical_bytes().unwrap())
        );
    }
}
