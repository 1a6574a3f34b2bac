//! One-shot migration from the v1 on-disk layout.
//!
//! The v1 layout kept two files in the working directory: a plain-text
//! `last_frame_uploaded` watermark and a `bofc.json` queue of posts still
//! awaiting best-of evaluation. Both are folded into a single v2 ledger
//! file. The migration is all-or-nothing: any input it cannot parse aborts
//! the run instead of producing a partial ledger.

use crate::frames;
use crate::ledger::{self, FrameRecord, FrameState, LedgerError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that abort a migration run
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("No last_frame_uploaded watermark found in {0}; nothing to migrate")]
    MissingWatermark(PathBuf),

    #[error("Watermark file {path} holds '{value}', expected a frame number")]
    InvalidWatermark { path: PathBuf, value: String },

    #[error("Failed to parse {path}: {message}")]
    Bofc { path: PathBuf, message: String },

    #[error("Entry for frame {sequence} has an unparseable timestamp '{value}'")]
    InvalidTimestamp { sequence: u64, value: String },

    #[error("Duplicate frame {0} in bofc.json")]
    DuplicateEntry(u64),

    #[error("Target ledger {0} already exists; refusing to overwrite it")]
    LedgerExists(PathBuf),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Migration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bot settings the migration needs to reconstruct captions and file names
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub movie_title: String,
    pub frames_naming: String,
    pub frames_ext: String,
    pub total_frames: u64,
}

/// What a completed migration produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records still awaiting best-of evaluation
    pub posted: usize,
    /// Records already past their evaluation window in v1
    pub evaluated: usize,
}

/// v1 `bofc.json` layout
#[derive(Debug, Deserialize)]
struct BofcFile {
    list: Vec<BofcEntry>,
}

#[derive(Debug, Deserialize)]
struct BofcEntry {
    frame_number: u64,
    path: String,
    post_id: String,
    time: String,
}

/// Migrate a v1 working directory into a v2 ledger file at `ledger_path`.
///
/// Frames listed in `bofc.json` become `Posted` records so the evaluator
/// picks them up; every other frame at or below the watermark was already
/// evaluated in v1 and becomes `EvaluatedForBestOf`. Frame files referenced
/// by `bofc.json` are copied next to the ledger so later evaluation can
/// repost them even if the v1 directory goes away.
pub fn migrate_v1(
    source_dir: &Path,
    ledger_path: &Path,
    options: &MigrationOptions,
) -> Result<MigrationReport, MigrationError> {
    if ledger_path.exists() {
        return Err(MigrationError::LedgerExists(ledger_path.to_path_buf()));
    }

    let watermark = read_watermark(source_dir)?;
    let bofc = read_bofc(source_dir)?;
    // The frames directory may already be gone; the watermark is the best
    // remaining estimate of the caption total
    let total_frames = if options.total_frames > 0 {
        options.total_frames
    } else {
        watermark
    };
    info!(
        watermark,
        pending_evaluation = bofc.len(),
        "Read v1 state files"
    );

    let retention_dir = ledger_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("frames_to_check");

    let mut records: BTreeMap<u64, FrameRecord> = BTreeMap::new();

    for entry in bofc {
        let sequence = entry.frame_number;
        if records.contains_key(&sequence) {
            return Err(MigrationError::DuplicateEntry(sequence));
        }

        let posted_at = parse_post_time(&entry.time).ok_or(MigrationError::InvalidTimestamp {
            sequence,
            value: entry.time.clone(),
        })?;

        let file_path = PathBuf::from(&entry.path);
        let mut record = FrameRecord::pending(sequence, file_path.clone());
        record.state = FrameState::Posted;
        // v1 recorded a single id per post
        record.remote_post_id = Some(entry.post_id.clone());
        record.remote_photo_id = Some(entry.post_id);
        record.posted_at = Some(posted_at);
        record.caption = frames::caption(&options.movie_title, sequence, total_frames);
        record.retained_path = retain_frame(source_dir, &retention_dir, &file_path, sequence)?;

        records.insert(sequence, record);
    }

    let mut evaluated = 0;
    for sequence in 1..=watermark {
        if records.contains_key(&sequence) {
            continue;
        }
        let filename = format!(
            "{}.{}",
            options.frames_naming.replace("$N$", &sequence.to_string()),
            options.frames_ext
        );
        let mut record = FrameRecord::pending(sequence, source_dir.join("frames").join(filename));
        record.state = FrameState::EvaluatedForBestOf;
        record.caption = frames::caption(&options.movie_title, sequence, total_frames);
        records.insert(sequence, record);
        evaluated += 1;
    }

    let posted = records.len() - evaluated;
    ledger::write_ledger_file(ledger_path, records.into_values().collect())?;
    info!(
        path = %ledger_path.display(),
        posted,
        evaluated,
        "Wrote migrated ledger"
    );

    Ok(MigrationReport { posted, evaluated })
}

/// Read the v1 watermark: the highest frame number ever posted.
fn read_watermark(source_dir: &Path) -> Result<u64, MigrationError> {
    let path = source_dir.join("last_frame_uploaded");
    if !path.exists() {
        return Err(MigrationError::MissingWatermark(source_dir.to_path_buf()));
    }
    let raw = fs::read_to_string(&path)?;
    raw.trim()
        .parse()
        .map_err(|_| MigrationError::InvalidWatermark {
            path,
            value: raw.trim().to_string(),
        })
}

/// Read the v1 best-of queue, empty if the file does not exist.
fn read_bofc(source_dir: &Path) -> Result<Vec<BofcEntry>, MigrationError> {
    let path = source_dir.join("bofc.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    let file: BofcFile = serde_json::from_str(&raw).map_err(|e| MigrationError::Bofc {
        path,
        message: e.to_string(),
    })?;
    Ok(file.list)
}

/// Copy a still-to-evaluate frame next to the new ledger, if it can be found.
fn retain_frame(
    source_dir: &Path,
    retention_dir: &Path,
    file_path: &Path,
    sequence: u64,
) -> Result<Option<PathBuf>, MigrationError> {
    // v1 entries hold paths from the old machine, possibly with the other
    // platform's separators; resolve by bare file name
    let Some(filename) = file_path
        .to_str()
        .and_then(|p| p.rsplit(['/', '\\']).next())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let candidates = [
        file_path.to_path_buf(),
        source_dir.join("frames").join(&filename),
    ];
    let Some(source) = candidates.iter().find(|p| p.is_file()) else {
        warn!(
            sequence,
            path = %file_path.display(),
            "Frame file not found, evaluation will rely on the reaction count only"
        );
        return Ok(None);
    };

    fs::create_dir_all(retention_dir)?;
    let target = retention_dir.join(filename);
    fs::copy(source, &target)?;
    Ok(Some(target))
}

/// Parse a v1 timestamp: either RFC 3339 or a naive Python isoformat string.
fn parse_post_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
