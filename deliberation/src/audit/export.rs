//! Portable audit bundles
//!
//! An export carries a session's raw records plus every transcript they
//! reference, keyed by the recorded hash, so verification can run offline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DeliberationResult;
use crate::state::{
    ContentHash, InMemoryTranscriptStore, Ledger, LedgerRecord, RecordFilter, SessionId,
    TranscriptStore,
};

/// Records and transcripts of one or more sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditExport {
    pub records: Vec<LedgerRecord>,
    pub transcripts: BTreeMap<ContentHash, String>,
}

impl AuditExport {
    /// Collect everything recorded for a session.
    pub async fn collect(
        ledger: &dyn Ledger,
        transcripts: &dyn TranscriptStore,
        session_id: &str,
    ) -> DeliberationResult<Self> {
        let records = ledger.read(&RecordFilter::session(session_id)).await?;
        let mut export = Self {
            records,
            transcripts: BTreeMap::new(),
        };
        let hashes: Vec<ContentHash> = export
            .records
            .iter()
            .filter_map(|r| r.content_hashes().map(|(own, _)| own.clone()))
            .collect();
        for hash in hashes {
            if let Some(bytes) = transcripts.get(&hash).await? {
                export
                    .transcripts
                    .insert(hash, String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        Ok(export)
    }

    /// Sessions present in the export, in first-seen order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = Vec::new();
        for record in &self.records {
            if !ids.contains(&record.session_id) {
                ids.push(record.session_id.clone());
            }
        }
        ids
    }

    pub fn records_for(&self, session_id: &str) -> Vec<LedgerRecord> {
        self.records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Load transcripts under their recorded hashes, without rehashing.
    pub fn transcript_store(&self) -> DeliberationResult<InMemoryTranscriptStore> {
        let store = InMemoryTranscriptStore::new();
        for (hash, content) in &self.transcripts {
            store.restore(hash, content.clone().into_bytes())?;
        }
        Ok(store)
    }

    pub fn to_json(&self) -> DeliberationResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> DeliberationResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
