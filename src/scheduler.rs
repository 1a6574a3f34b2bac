//! Posting scheduler.
//!
//! Drives the main loop: advances the ledger by exactly one frame per
//! interval tick, or stands idle when no frame is ready. At most one posting
//! operation is in flight at a time; the shutdown token is honored only at
//! the sleep point, never mid-call, so no half-committed state is left
//! behind.

use crate::config::Config;
use crate::frames::{self, FrameSource};
use crate::gateway::{GatewayError, PosterGateway};
use crate::ledger::{FrameRecord, FrameState, Ledger};
use crate::mirror;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of a single scheduler tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was posted and durably recorded
    Posted { sequence: u64 },
    /// A transient gateway failure; the record stays Pending for the next tick
    Retry { sequence: u64, reason: String },
    /// The frame failed non-retryably and was marked Failed
    FrameFailed { sequence: u64 },
    /// Nothing to do this tick (e.g. frames directory temporarily unreadable,
    /// or only Failed records left awaiting operator intervention)
    Idle,
    /// The source is exhausted and no pending or failed records remain
    Exhausted,
}

/// Posting scheduler: pulls the next unposted frame, posts it through the
/// gateway and records the outcome in the ledger.
pub struct PostingScheduler {
    gateway: Arc<dyn PosterGateway>,
    ledger: Arc<Ledger>,
    source: FrameSource,
    config: Arc<Config>,
    total_frames: u64,
    last_posted_at: Option<DateTime<Utc>>,
}

impl PostingScheduler {
    pub fn new(
        gateway: Arc<dyn PosterGateway>,
        ledger: Arc<Ledger>,
        source: FrameSource,
        config: Arc<Config>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            source,
            config,
            total_frames: 0,
            last_posted_at: None,
        }
    }

    /// Run the posting loop until the source is exhausted or shutdown is
    /// requested. `posting_done` is cancelled on natural completion so the
    /// best-of evaluator can switch to drain mode.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        posting_done: CancellationToken,
    ) -> Result<()> {
        info!(
            interval_secs = self.config.bot.upload_interval_secs,
            mirroring = self.config.mirroring.enabled,
            delete_files = self.config.bot.delete_files,
            "Starting posting loop"
        );

        loop {
            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Posting loop stopped by a permanent error");
                    return Err(e);
                }
            };

            match &outcome {
                TickOutcome::Exhausted => {
                    info!("Frame source exhausted and no pending frames remain, posting loop over");
                    break;
                }
                TickOutcome::Posted { sequence } => {
                    debug!(sequence, "Tick posted a frame");
                }
                TickOutcome::Retry { sequence, reason } => {
                    warn!(sequence, reason = %reason, "Post failed transiently, will retry next tick");
                }
                TickOutcome::FrameFailed { sequence } => {
                    warn!(sequence, "Frame failed permanently, advancing past it");
                }
                TickOutcome::Idle => {
                    debug!("Nothing to post this tick");
                }
            }

            let pause = self.pause_after(&outcome);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping posting loop");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        posting_done.cancel();
        Ok(())
    }

    /// How long to wait after a tick.
    ///
    /// Only a tick that actually posted gets the adjusted pause; every other
    /// outcome sleeps the full interval so transient failures are spaced out
    /// by the same minimum the remote API expects, never re-hit in a hot
    /// loop.
    fn pause_after(&self, outcome: &TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Posted { .. } => self.next_pause(),
            _ => self.config.upload_interval(),
        }
    }

    /// Adjusted pause for the posting cadence: aim for
    /// `posted_at + upload_interval` so the rhythm stays regular even when a
    /// post took a while, clamped to zero and never overlapping a tick.
    fn next_pause(&self) -> Duration {
        let interval = self.config.upload_interval();
        let Some(last_posted_at) = self.last_posted_at else {
            return interval;
        };

        let wanted = last_posted_at + chrono::Duration::from_std(interval).unwrap_or_default();
        let remaining = wanted.signed_duration_since(Utc::now());
        remaining.to_std().unwrap_or(Duration::ZERO).min(interval)
    }

    /// Advance the ledger by at most one frame.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if self.config.alternate.enabled {
            self.retry_outstanding_comments().await;
        }

        // After a restart the ledger may hold pending records before the
        // first discovery pass; captions still need the real total
        if self.total_frames == 0 {
            if let Ok(total) = self.source.total_frames() {
                self.total_frames = total;
            }
        }

        let record = match self.ledger.next_pending() {
            Some(record) => record,
            None => match self.discover_new_frames() {
                Ok(0) => return Ok(self.drained_outcome()),
                Ok(discovered) => {
                    info!(discovered, "Discovered new frames");
                    match self.ledger.next_pending() {
                        Some(record) => record,
                        None => return Ok(self.drained_outcome()),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Frame discovery failed, standing idle this tick");
                    return Ok(TickOutcome::Idle);
                }
            },
        };

        self.post_frame(record).await
    }

    /// Outcome when the source has nothing left to post.
    ///
    /// Failed records keep the loop alive (idling) instead of ending it:
    /// an operator can still restore the missing files or mark the records
    /// skipped, and the service must not exit underneath them.
    fn drained_outcome(&self) -> TickOutcome {
        if self.ledger.count(FrameState::Failed) > 0 {
            TickOutcome::Idle
        } else {
            TickOutcome::Exhausted
        }
    }

    /// Bring the ledger up to date with the frame source. Only indices above
    /// the highest known sequence are added, keeping posting order strict.
    fn discover_new_frames(&mut self) -> Result<usize, crate::frames::FrameSourceError> {
        let frames = self.source.scan()?;
        self.total_frames = frames
            .last()
            .map(|f| f.index)
            .unwrap_or(0)
            .max(self.total_frames);

        let watermark = self.ledger.highest_sequence();
        let mut discovered = 0;
        for frame in frames {
            if watermark.is_some_and(|w| frame.index <= w) {
                continue;
            }
            if self
                .ledger
                .upsert(FrameRecord::pending(frame.index, frame.path))
                .is_ok()
            {
                discovered += 1;
            }
        }
        Ok(discovered)
    }

    /// Post a single pending frame and record the outcome.
    async fn post_frame(&mut self, mut record: FrameRecord) -> Result<TickOutcome> {
        let sequence = record.sequence_number;

        let bytes = match fs::read(&record.file_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(sequence, path = %record.file_path.display(), error = %e, "Source file is missing, marking frame failed");
                record.state = FrameState::Failed;
                self.ledger.upsert(record)?;
                return Ok(TickOutcome::FrameFailed { sequence });
            }
        };

        let mirrored = self.draw_mirror();
        let base_caption = frames::caption(&self.config.bot.movie_title, sequence, self.total_frames);
        let (posted_bytes, posted_caption) = if mirrored {
            match mirror::mirror_image(&bytes) {
                Ok(flipped) => {
                    let caption = format!(
                        "{base_caption}{}",
                        frames::mirrored_signature(&self.config.bot.bot_name)
                    );
                    (flipped, caption)
                }
                Err(e) => {
                    warn!(sequence, error = %e, "Frame image cannot be decoded, marking frame failed");
                    record.state = FrameState::Failed;
                    self.ledger.upsert(record)?;
                    return Ok(TickOutcome::FrameFailed { sequence });
                }
            }
        } else {
            (bytes, base_caption.clone())
        };

        info!(
            sequence,
            total = self.total_frames,
            mirrored,
            "Uploading frame"
        );

        let filename = record
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{sequence}.jpg"));

        let response = match self
            .gateway
            .post_image(posted_bytes, filename, &posted_caption, None)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_retryable() => {
                return Ok(TickOutcome::Retry {
                    sequence,
                    reason: e.to_string(),
                });
            }
            Err(GatewayError::NotFound(message)) => {
                warn!(sequence, message = %message, "Posting target is gone, marking frame failed");
                record.state = FrameState::Failed;
                self.ledger.upsert(record)?;
                return Ok(TickOutcome::FrameFailed { sequence });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context("posting requires operator intervention"));
            }
        };

        // Retain a copy for best-of evaluation before the source can be
        // deleted under the evaluator's feet. If the copy fails, the source
        // file must survive as the evaluator's only remaining input.
        let mut safe_to_delete = self.config.bot.delete_files;
        if self.config.bot.delete_files && self.config.best_of.enabled {
            match self.retain_copy(&record) {
                Ok(path) => record.retained_path = Some(path),
                Err(e) => {
                    warn!(sequence, error = %e, "Failed to retain a frame copy, keeping the source file");
                    safe_to_delete = false;
                }
            }
        }

        let posted_at = Utc::now();
        record.remote_photo_id = Some(response.photo_id.clone());
        record.remote_post_id = Some(response.post_id.clone());
        record.was_mirrored = mirrored;
        record.posted_at = Some(posted_at);
        record.caption = base_caption;
        record.state = FrameState::Posted;
        // The gateway call and this write form one logical step: the write
        // must land before anything else observes the post.
        self.ledger.upsert(record.clone())?;
        self.last_posted_at = Some(posted_at);

        info!(
            sequence,
            post_id = %response.post_id,
            "Frame posted and recorded"
        );

        if self.config.alternate.enabled {
            self.attach_alternate(&mut record).await;
        }

        if safe_to_delete {
            if let Err(e) = fs::remove_file(&record.file_path) {
                warn!(sequence, error = %e, "Failed to delete posted frame file");
            }
        }

        Ok(TickOutcome::Posted { sequence })
    }

    /// Mirror draw with probability `ratio` percent
    fn draw_mirror(&self) -> bool {
        self.config.mirroring.enabled
            && rand::thread_rng().gen_range(0.0..100.0) < self.config.mirroring.ratio
    }

    fn retain_copy(&self, record: &FrameRecord) -> std::io::Result<std::path::PathBuf> {
        let dir = self.config.retention_dir();
        fs::create_dir_all(&dir)?;
        let target = dir.join(
            record
                .file_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("frame")),
        );
        fs::copy(&record.file_path, &target)?;
        Ok(target)
    }

    /// Attach the alternate-frame comment to a posted record. Failures never
    /// roll back the Posted state; the comment is retried on a later tick.
    async fn attach_alternate(&self, record: &mut FrameRecord) {
        let sequence = record.sequence_number;
        let Some(photo_id) = record.remote_photo_id.clone() else {
            return;
        };

        let Some(alternate_path) =
            FrameSource::alternate_path(&self.config.alternate.directory, &record.file_path)
        else {
            return;
        };

        let bytes = match fs::read(&alternate_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    sequence,
                    path = %alternate_path.display(),
                    error = %e,
                    "Alternate frame is missing, skipping its comment"
                );
                record.alternate_posted = true;
                if let Err(e) = self.ledger.upsert(record.clone()) {
                    warn!(sequence, error = %e, "Failed to record skipped alternate comment");
                }
                return;
            }
        };

        let filename = alternate_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{sequence}.jpg"));
        let text = &self.config.alternate.comment_text;
        let text = (!text.is_empty()).then(|| text.clone());

        match self
            .gateway
            .post_comment(&photo_id, Some((bytes, filename)), text)
            .await
        {
            Ok(comment_id) => {
                debug!(sequence, comment_id = %comment_id, "Alternate frame comment posted");
                record.alternate_posted = true;
                if let Err(e) = self.ledger.upsert(record.clone()) {
                    warn!(sequence, error = %e, "Failed to record alternate comment");
                }
            }
            Err(e) => {
                warn!(sequence, error = %e, "Alternate frame comment failed, will retry next tick");
            }
        }
    }

    /// Retry alternate comments that failed on an earlier tick.
    async fn retry_outstanding_comments(&self) {
        let outstanding: Vec<FrameRecord> = self
            .ledger
            .query(FrameState::Posted)
            .into_iter()
            .filter(|r| !r.alternate_posted)
            .collect();

        for mut record in outstanding {
            self.attach_alternate(&mut record).await;
        }
    }
}
