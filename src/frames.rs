//! Frame source.
//!
//! Enumerates candidate frame files on disk in strict index order, given a
//! `$N$` naming pattern. Pure and stateless; every scan re-reads the
//! directory.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while enumerating frames
#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Naming pattern '{0}' does not contain the $N$ placeholder")]
    MissingPlaceholder(String),

    #[error("Failed to read frames directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One candidate frame file, identified by its naming-pattern index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFrame {
    pub index: u64,
    pub path: PathBuf,
}

/// Compiled `$N$` naming pattern for frame filenames
#[derive(Debug, Clone)]
pub struct FramePattern {
    prefix: String,
    suffix: String,
}

impl FramePattern {
    /// Build a pattern from a naming string like `frame$N$` and an extension.
    ///
    /// The `$N$` placeholder marks where the frame index is extracted from.
    pub fn new(naming: &str, ext: &str) -> Result<Self, FrameSourceError> {
        let Some(placeholder) = naming.find("$N$") else {
            return Err(FrameSourceError::MissingPlaceholder(naming.to_string()));
        };

        Ok(Self {
            prefix: naming[..placeholder].to_string(),
            suffix: format!("{}.{}", &naming[placeholder + 3..], ext),
        })
    }

    /// Extract the frame index from a filename, or `None` if it does not
    /// match the pattern.
    pub fn index_of(&self, filename: &str) -> Option<u64> {
        let rest = filename.strip_prefix(&self.prefix)?;
        let digits = rest.strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// Enumerates frame files in a directory by naming-pattern index
pub struct FrameSource {
    directory: PathBuf,
    pattern: FramePattern,
}

impl FrameSource {
    pub fn new(
        directory: impl Into<PathBuf>,
        naming: &str,
        ext: &str,
    ) -> Result<Self, FrameSourceError> {
        Ok(Self {
            directory: directory.into(),
            pattern: FramePattern::new(naming, ext)?,
        })
    }

    /// Enumerate the frames currently on disk, ascending by index.
    ///
    /// Files that do not match the naming pattern are logged and ignored.
    pub fn scan(&self) -> Result<Vec<SourceFrame>, FrameSourceError> {
        let entries = std::fs::read_dir(&self.directory).map_err(|source| {
            FrameSourceError::ReadDir {
                path: self.directory.clone(),
                source,
            }
        })?;

        let mut frames = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.pattern.index_of(filename) {
                Some(index) => frames.push(SourceFrame { index, path }),
                None => {
                    warn!(file = %path.display(), "File does not match the frame naming pattern, skipping");
                }
            }
        }

        frames.sort_by_key(|frame| frame.index);
        Ok(frames)
    }

    /// Highest frame index currently on disk, or 0 when empty
    pub fn total_frames(&self) -> Result<u64, FrameSourceError> {
        Ok(self.scan()?.last().map(|f| f.index).unwrap_or(0))
    }

    /// Path an alternate variant of `path` would have inside `alternate_dir`
    pub fn alternate_path(alternate_dir: &Path, path: &Path) -> Option<PathBuf> {
        path.file_name().map(|name| alternate_dir.join(name))
    }
}

/// Default caption for a frame post
pub fn caption(movie_title: &str, index: u64, total: u64) -> String {
    format!("{movie_title}\nFrame {index} of {total}")
}

/// Signature appended to the caption of a mirrored post
pub fn mirrored_signature(bot_name: &str) -> String {
    format!("\n\nJust a randomly mirrored image.\n-{bot_name}")
}
