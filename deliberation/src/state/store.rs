//! RocksDB-backed ledger and transcript store
//!
//! Records are stored as JSON for debuggability, keyed by zero-padded
//! sequence number. The petition index and the per-session head sequence live
//! in their own column families and are written in the same batch as the
//! record, under the write lock, so the uniqueness and head checks and the
//! insert are atomic for this process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use super::ledger::{Ledger, LedgerError, LedgerRecord, LedgerResult, RecordFilter, RecordKind};
use super::schema::{self, ALL_CFS};
use super::transcript::{content_hash, ContentHash, TranscriptError, TranscriptResult, TranscriptStore};

/// Error type for RocksDB store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Corrupt key: {0}")]
    CorruptKey(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockPoisoned => LedgerError::LockPoisoned,
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

impl From<StoreError> for TranscriptError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockPoisoned => TranscriptError::LockPoisoned,
            other => TranscriptError::Storage(other.to_string()),
        }
    }
}

/// Shared reference to RocksStore
pub type SharedRocksStore = Arc<RocksStore>;

/// Durable ledger + transcript store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
    last_sequence: AtomicU64,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        let last_sequence = Self::scan_last_sequence(&db)?;
        Self::backfill_session_heads(&db)?;

        info!(path = %path.display(), last_sequence, "Opened deliberation store");

        Ok(Self {
            db: RwLock::new(db),
            path,
            last_sequence: AtomicU64::new(last_sequence),
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedRocksStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn scan_last_sequence(db: &DB) -> StoreResult<u64> {
        let cf = db
            .cf_handle(schema::CF_RECORDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_RECORDS.to_string()))?;

        match db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(result) => {
                let (key, _) = result?;
                let key_str = String::from_utf8_lossy(&key).to_string();
                schema::keys::parse_record_sequence(&key_str)
                    .ok_or(StoreError::CorruptKey(key_str))
            }
            None => Ok(0),
        }
    }

    /// Stores written before the session index existed have records but no
    /// heads. Rebuild them once so conditional appends see the real history.
    fn backfill_session_heads(db: &DB) -> StoreResult<()> {
        let sessions = db
            .cf_handle(schema::CF_SESSIONS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_SESSIONS.to_string()))?;
        if db.iterator_cf(&sessions, IteratorMode::Start).next().is_some() {
            return Ok(());
        }
        let records = db
            .cf_handle(schema::CF_RECORDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_RECORDS.to_string()))?;

        let mut batch = WriteBatch::default();
        let mut rebuilt = 0usize;
        for result in db.iterator_cf(&records, IteratorMode::Start) {
            let (key, value) = result?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let sequence = schema::keys::parse_record_sequence(&key_str)
                .ok_or_else(|| StoreError::CorruptKey(key_str.clone()))?;
            let record = LedgerRecord::from_json(&String::from_utf8_lossy(&value))
                .map_err(|_| StoreError::CorruptKey(key_str))?;
            batch.put_cf(
                &sessions,
                schema::keys::session(&record.session_id).as_bytes(),
                sequence.to_string().as_bytes(),
            );
            rebuilt += 1;
        }
        if rebuilt > 0 {
            db.write(batch)?;
            info!(records = rebuilt, "Rebuilt session heads");
        }
        Ok(())
    }

    fn session_head(&self, db: &DB, session_id: &str) -> LedgerResult<u64> {
        let sessions = db
            .cf_handle(schema::CF_SESSIONS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_SESSIONS.to_string()))?;

        match db
            .get_cf(&sessions, schema::keys::session(session_id).as_bytes())
            .map_err(StoreError::from)?
        {
            Some(bytes) => String::from_utf8_lossy(&bytes).parse().map_err(|_| {
                LedgerError::Storage(format!("corrupt session head for {session_id}"))
            }),
            None => Ok(0),
        }
    }

    fn insert(&self, mut record: LedgerRecord, expected_last: Option<u64>) -> LedgerResult<u64> {
        let db = self.db.write().map_err(|_| LedgerError::LockPoisoned)?;

        if let Some(expected) = expected_last {
            let found = self.session_head(&db, &record.session_id)?;
            if found != expected {
                return Err(LedgerError::Conflict {
                    session_id: record.session_id.clone(),
                    expected,
                    found,
                });
            }
        }

        if record.kind() == RecordKind::SessionAssigned {
            if let Some(existing) = self.existing_assignment(&db, &record.petition_id)? {
                return Err(LedgerError::Duplicate {
                    petition_id: record.petition_id.clone(),
                    existing: Box::new(existing),
                });
            }
        }

        let records = db
            .cf_handle(schema::CF_RECORDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_RECORDS.to_string()))?;
        let petitions = db
            .cf_handle(schema::CF_PETITIONS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_PETITIONS.to_string()))?;
        let sessions = db
            .cf_handle(schema::CF_SESSIONS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_SESSIONS.to_string()))?;

        let sequence = self.last_sequence.load(Ordering::SeqCst) + 1;
        record.sequence = sequence;
        let json = record.to_json()?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&records, schema::keys::record(sequence).as_bytes(), json.as_bytes());
        batch.put_cf(
            &sessions,
            schema::keys::session(&record.session_id).as_bytes(),
            sequence.to_string().as_bytes(),
        );
        if record.kind() == RecordKind::SessionAssigned {
            batch.put_cf(
                &petitions,
                schema::keys::petition(&record.petition_id).as_bytes(),
                sequence.to_string().as_bytes(),
            );
        }
        db.write(batch).map_err(StoreError::from)?;
        self.last_sequence.store(sequence, Ordering::SeqCst);

        debug!(sequence, event_type = record.event_type(), "Record persisted");
        Ok(sequence)
    }

    fn existing_assignment(&self, db: &DB, petition_id: &str) -> LedgerResult<Option<LedgerRecord>> {
        let petitions = db
            .cf_handle(schema::CF_PETITIONS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_PETITIONS.to_string()))?;
        let records = db
            .cf_handle(schema::CF_RECORDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_RECORDS.to_string()))?;

        let Some(seq_bytes) = db
            .get_cf(&petitions, schema::keys::petition(petition_id).as_bytes())
            .map_err(StoreError::from)?
        else {
            return Ok(None);
        };

        let sequence: u64 = String::from_utf8_lossy(&seq_bytes)
            .parse()
            .map_err(|_| LedgerError::Storage(format!("corrupt petition index for {petition_id}")))?;

        match db
            .get_cf(&records, schema::keys::record(sequence).as_bytes())
            .map_err(StoreError::from)?
        {
            Some(bytes) => {
                let json = String::from_utf8_lossy(&bytes);
                Ok(Some(LedgerRecord::from_json(&json)?))
            }
            None => Err(LedgerError::Storage(format!(
                "petition index points at missing record {sequence}"
            ))),
        }
    }
}

#[async_trait]
impl Ledger for RocksStore {
    async fn append(&self, record: LedgerRecord) -> LedgerResult<u64> {
        self.insert(record, None)
    }

    async fn append_after(&self, record: LedgerRecord, expected_last: u64) -> LedgerResult<u64> {
        self.insert(record, Some(expected_last))
    }

    async fn read(&self, filter: &RecordFilter) -> LedgerResult<Vec<LedgerRecord>> {
        let db = self.db.read().map_err(|_| LedgerError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_RECORDS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_RECORDS.to_string()))?;

        // Keys sort by sequence, so a refresh can seek past what it has seen
        let start = filter
            .after_sequence
            .map(|seq| schema::keys::record(seq.saturating_add(1)));
        let mode = match &start {
            Some(key) => IteratorMode::From(key.as_bytes(), Direction::Forward),
            None => IteratorMode::Start,
        };

        let mut out = Vec::new();
        for result in db.iterator_cf(&cf, mode) {
            let (_, value) = result.map_err(StoreError::from)?;
            let record = LedgerRecord::from_json(&String::from_utf8_lossy(&value))?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TranscriptStore for RocksStore {
    async fn put(&self, content: &[u8]) -> TranscriptResult<ContentHash> {
        let hash = content_hash(content);
        let db = self.db.read().map_err(|_| TranscriptError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_TRANSCRIPTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_TRANSCRIPTS.to_string()))?;

        db.put_cf(&cf, hash.as_bytes(), content)
            .map_err(StoreError::from)?;
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> TranscriptResult<Option<Vec<u8>>> {
        let db = self.db.read().map_err(|_| TranscriptError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_TRANSCRIPTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_TRANSCRIPTS.to_string()))?;

        Ok(db.get_cf(&cf, hash.as_bytes()).map_err(StoreError::from)?)
    }
}
