//! Durable posting ledger.
//!
//! The ledger is the single source of truth for every frame's lifecycle. It
//! is a single JSON file rewritten atomically on every update: a crash during
//! an upsert leaves either the old or the new content on disk, never a torn
//! write. One file per running bot instance; no multi-process access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Current on-disk schema version
pub const LEDGER_SCHEMA_VERSION: u32 = 2;

/// Errors that can occur in the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger file is corrupt and cannot be parsed: {0}")]
    Corrupt(String),

    #[error("Ledger file uses schema version {found}, expected {expected}; run framebot-migrate")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("Invalid state transition for frame {sequence}: {from:?} -> {to:?}")]
    InvalidTransition {
        sequence: u64,
        from: FrameState,
        to: FrameState,
    },

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle state of a frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    /// Discovered but not yet posted; owned by the posting scheduler
    Pending,
    /// Posted to the page; owned by the best-of evaluator
    Posted,
    /// Evaluated below the reaction threshold; terminal
    EvaluatedForBestOf,
    /// Reposted into the best-of album; terminal
    Reposted,
    /// Skipped by operator intervention; terminal
    Skipped,
    /// Failed non-retryably (e.g. source file vanished); terminal
    Failed,
}

impl FrameState {
    /// Transition table for the frame lifecycle
    pub fn can_transition(self, to: FrameState) -> bool {
        use FrameState::*;
        match self {
            Pending => matches!(to, Posted | Failed | Skipped),
            Posted => matches!(to, EvaluatedForBestOf | Reposted),
            EvaluatedForBestOf | Reposted | Skipped | Failed => false,
        }
    }

    /// Terminal states are never advanced automatically
    pub fn is_terminal(self) -> bool {
        use FrameState::*;
        matches!(self, EvaluatedForBestOf | Reposted | Skipped | Failed)
    }
}

/// One entry per frame ever considered for posting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Unique, strictly increasing posting order; equals the source index
    pub sequence_number: u64,
    /// Source file on disk at the time of posting
    pub file_path: PathBuf,
    /// Graph post id, set after a successful post
    pub remote_post_id: Option<String>,
    /// Graph photo id, needed to attach comments
    pub remote_photo_id: Option<String>,
    /// Whether the mirrored variant was posted instead of the original
    pub was_mirrored: bool,
    /// Lifecycle state
    pub state: FrameState,
    /// Set exactly once, on the transition to Posted
    pub posted_at: Option<DateTime<Utc>>,
    /// Reaction count at evaluation time; refreshed in place
    pub reaction_count: Option<u64>,
    /// Caption used at posting time, reused for reposts and comments
    #[serde(default)]
    pub caption: String,
    /// Copy kept for best-of evaluation when the source gets deleted
    #[serde(default)]
    pub retained_path: Option<PathBuf>,
    /// Whether the alternate-frame comment has been attached
    #[serde(default)]
    pub alternate_posted: bool,
}

impl FrameRecord {
    /// Create a freshly discovered record in the Pending state
    pub fn pending(sequence_number: u64, file_path: PathBuf) -> Self {
        Self {
            sequence_number,
            file_path,
            remote_post_id: None,
            remote_photo_id: None,
            was_mirrored: false,
            state: FrameState::Pending,
            posted_at: None,
            reaction_count: None,
            caption: String::new(),
            retained_path: None,
            alternate_posted: false,
        }
    }

    /// Whether the best-of wait period has elapsed for this record
    pub fn wait_elapsed(&self, wait: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.posted_at {
            Some(posted_at) => now.signed_duration_since(posted_at) >= wait,
            None => false,
        }
    }
}

/// On-disk representation of the ledger file
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: u32,
    records: Vec<FrameRecord>,
}

/// Durable, crash-consistent store of all frame records
pub struct Ledger {
    path: PathBuf,
    records: Mutex<BTreeMap<u64, FrameRecord>>,
}

impl Ledger {
    /// Load the ledger from disk, or start empty if the file does not exist.
    ///
    /// Fails with [`LedgerError::Corrupt`] if the file exists but cannot be
    /// parsed; callers must not proceed with partial state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        let records = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: LedgerFile = serde_json::from_str(&raw)
                .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
            if file.schema_version != LEDGER_SCHEMA_VERSION {
                return Err(LedgerError::SchemaMismatch {
                    found: file.schema_version,
                    expected: LEDGER_SCHEMA_VERSION,
                });
            }
            let map: BTreeMap<u64, FrameRecord> = file
                .records
                .into_iter()
                .map(|r| (r.sequence_number, r))
                .collect();
            info!(path = %path.display(), records = map.len(), "Loaded ledger");
            map
        } else {
            info!(path = %path.display(), "No ledger file found, starting empty");
            BTreeMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Insert or update a record and durably persist the whole ledger.
    ///
    /// State changes are validated against the lifecycle transition table.
    pub fn upsert(&self, record: FrameRecord) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap();

        if let Some(existing) = records.get(&record.sequence_number) {
            if existing.state != record.state && !existing.state.can_transition(record.state) {
                return Err(LedgerError::InvalidTransition {
                    sequence: record.sequence_number,
                    from: existing.state,
                    to: record.state,
                });
            }
        }

        debug!(
            sequence = record.sequence_number,
            state = ?record.state,
            "Upserting ledger record"
        );

        records.insert(record.sequence_number, record);
        self.persist(&records)
    }

    /// Records in the given state, ascending by sequence number
    pub fn query(&self, state: FrameState) -> Vec<FrameRecord> {
        let records = self.records.lock().unwrap();
        records
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect()
    }

    /// Record for a specific sequence number
    pub fn get(&self, sequence_number: u64) -> Option<FrameRecord> {
        self.records.lock().unwrap().get(&sequence_number).cloned()
    }

    /// Lowest-sequence Pending record, if any
    pub fn next_pending(&self) -> Option<FrameRecord> {
        let records = self.records.lock().unwrap();
        records
            .values()
            .find(|r| r.state == FrameState::Pending)
            .cloned()
    }

    /// Highest sequence number ever recorded
    pub fn highest_sequence(&self) -> Option<u64> {
        self.records.lock().unwrap().keys().next_back().copied()
    }

    /// Number of records in the given state
    pub fn count(&self, state: FrameState) -> usize {
        let records = self.records.lock().unwrap();
        records.values().filter(|r| r.state == state).count()
    }

    /// Total number of records
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the ledger holds no records
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Write the full ledger atomically: temp file, fsync, rename.
    fn persist(&self, records: &BTreeMap<u64, FrameRecord>) -> Result<(), LedgerError> {
        let file = LedgerFile {
            schema_version: LEDGER_SCHEMA_VERSION,
            records: records.values().cloned().collect(),
        };
        let serialized = serde_json::to_vec_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&serialized)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

/// Write an arbitrary set of records to a ledger file with the same
/// atomic-rename discipline the live ledger uses. Used by the migration tool.
pub fn write_ledger_file(path: &Path, records: Vec<FrameRecord>) -> Result<(), LedgerError> {
    let mut sorted: BTreeMap<u64, FrameRecord> =
        records.into_iter().map(|r| (r.sequence_number, r)).collect();
    let file = LedgerFile {
        schema_version: LEDGER_SCHEMA_VERSION,
        records: std::mem::take(&mut sorted).into_values().collect(),
    };
    let serialized = serde_json::to_vec_pretty(&file)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&serialized)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
