//! Best-of evaluator.
//!
//! Runs on its own timer, independent of the posting loop. Every pass it
//! picks up the `Posted` records whose wait period has elapsed, queries their
//! reaction counts and either reposts them into the best-of album or retires
//! them as evaluated. Each record is evaluated at most once; a restarted
//! evaluator consults the album listing before reposting so an interrupted
//! pass cannot produce duplicates.

use crate::config::Config;
use crate::gateway::{AlbumMedia, GatewayError, PosterGateway};
use crate::ledger::{FrameRecord, FrameState, Ledger};
use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Counters for one evaluation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationSummary {
    /// Records whose wait period had elapsed and that were checked
    pub checked: usize,
    /// Records reposted into the best-of album
    pub reposted: usize,
    /// Records retired below the threshold
    pub evaluated: usize,
}

/// How a qualifying record left (or stayed in) the repost path
enum RepostOutcome {
    /// Reposted into the album (or found already there) and recorded
    Reposted,
    /// Retired as evaluated without a repost (image or album gone)
    Retired,
    /// Nothing recorded; the record stays Posted for the next pass
    Deferred,
}

/// Best-of evaluator: scans the ledger and reposts the most-reacted frames.
pub struct BestOfEvaluator {
    gateway: Arc<dyn PosterGateway>,
    ledger: Arc<Ledger>,
    config: Arc<Config>,
}

impl BestOfEvaluator {
    pub fn new(gateway: Arc<dyn PosterGateway>, ledger: Arc<Ledger>, config: Arc<Config>) -> Self {
        Self {
            gateway,
            ledger,
            config,
        }
    }

    /// Run the evaluation loop. Stops on shutdown, on a permanent gateway
    /// error, or — once `posting_done` has fired — when no `Posted` records
    /// remain to drain.
    pub async fn run(
        self,
        shutdown: CancellationToken,
        posting_done: CancellationToken,
    ) -> Result<()> {
        info!(
            threshold = self.config.best_of.reactions_threshold,
            wait_hours = self.config.best_of.wait_hours,
            album_id = %self.config.best_of.album_id,
            "Starting best-of evaluation loop"
        );

        loop {
            let wait = self.effective_wait(posting_done.is_cancelled());
            match self.evaluate_due(wait).await {
                Ok(summary) if summary.checked > 0 => {
                    info!(
                        checked = summary.checked,
                        reposted = summary.reposted,
                        evaluated = summary.evaluated,
                        "Best-of pass complete"
                    );
                }
                Ok(_) => debug!("No frames due for best-of evaluation"),
                Err(e) => {
                    error!(error = %e, "Best-of loop stopped by a permanent error");
                    return Err(e);
                }
            }

            if posting_done.is_cancelled() && self.ledger.count(FrameState::Posted) == 0 {
                info!("Posting finished and no frames left to evaluate, best-of loop over");
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping best-of loop");
                    break;
                }
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }
        }

        Ok(())
    }

    /// Wait period for a pass. Once posting is over there is nothing to
    /// pace against, so the drain checks at half the configured wait.
    fn effective_wait(&self, draining: bool) -> chrono::Duration {
        let wait = self.config.wait_period();
        if draining {
            wait / 2
        } else {
            wait
        }
    }

    /// Evaluate every posted record whose wait period has elapsed.
    #[instrument(skip(self, wait))]
    pub async fn evaluate_due(&self, wait: chrono::Duration) -> Result<EvaluationSummary> {
        let now = Utc::now();
        let mut summary = EvaluationSummary::default();
        // Fetched lazily, once per pass, only when a record qualifies
        let mut album_media: Option<Vec<AlbumMedia>> = None;

        for record in self.ledger.query(FrameState::Posted) {
            if !record.wait_elapsed(wait, now) {
                continue;
            }
            summary.checked += 1;

            let sequence = record.sequence_number;
            let Some(post_id) = record.remote_post_id.clone() else {
                warn!(sequence, "Posted record has no post id, retiring it unevaluated");
                self.retire(record, None)?;
                summary.evaluated += 1;
                continue;
            };

            let count = match self.gateway.reaction_count(&post_id).await {
                Ok(count) => count,
                Err(GatewayError::NotFound(message)) => {
                    warn!(sequence, post_id = %post_id, message = %message, "Post is gone, retiring record");
                    self.retire(record, None)?;
                    summary.evaluated += 1;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!(sequence, error = %e, "Reaction query failed transiently, will retry next pass");
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context("best-of evaluation requires operator intervention"));
                }
            };

            debug!(
                sequence,
                reactions = count,
                threshold = self.config.best_of.reactions_threshold,
                "Evaluating frame reactions"
            );

            // Strictly above the threshold; equality stays evaluated-only
            if count <= self.config.best_of.reactions_threshold {
                self.retire(record, Some(count))?;
                summary.evaluated += 1;
                continue;
            }

            if album_media.is_none() {
                match self
                    .gateway
                    .list_album_media(&self.config.best_of.album_id)
                    .await
                {
                    Ok(media) => album_media = Some(media),
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Album listing failed, deferring reposts to the next pass");
                        continue;
                    }
                    Err(GatewayError::Unauthorized(message)) => {
                        return Err(anyhow::anyhow!(
                            "best-of evaluation requires operator intervention: {message}"
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Album listing failed, deferring reposts to the next pass");
                        continue;
                    }
                }
            }

            match self.repost(record, count, album_media.as_deref().unwrap_or(&[])).await? {
                RepostOutcome::Reposted => summary.reposted += 1,
                RepostOutcome::Retired => summary.evaluated += 1,
                RepostOutcome::Deferred => {}
            }
        }

        Ok(summary)
    }

    /// Repost a qualifying record into the best-of album.
    async fn repost(
        &self,
        mut record: FrameRecord,
        count: u64,
        album_media: &[AlbumMedia],
    ) -> Result<RepostOutcome> {
        let sequence = record.sequence_number;
        let post_id = record.remote_post_id.clone().unwrap_or_default();

        // Idempotent retry: a crash after the remote call but before the
        // ledger write is detected here instead of duplicated.
        let already_present = album_media
            .iter()
            .any(|media| media.caption.as_deref().is_some_and(|c| c.contains(&post_id)));
        if already_present {
            info!(sequence, post_id = %post_id, "Frame already present in the best-of album, recording repost");
            record.reaction_count = Some(count);
            record.state = FrameState::Reposted;
            self.cleanup_retained(&mut record);
            self.ledger.upsert(record)?;
            return Ok(RepostOutcome::Reposted);
        }

        let source_path = record
            .retained_path
            .clone()
            .filter(|p| p.exists())
            .unwrap_or_else(|| record.file_path.clone());

        let bytes = match fs::read(&source_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(sequence, path = %source_path.display(), error = %e, "Frame image is gone, skipping best-of repost");
                self.retire(record, Some(count))?;
                return Ok(RepostOutcome::Retired);
            }
        };

        let elapsed_hours = record
            .posted_at
            .map(|posted_at| Utc::now().signed_duration_since(posted_at).num_hours())
            .unwrap_or_default();
        let message = format!(
            "Reactions after {elapsed_hours} hours : {count}.\nOriginal post: https://facebook.com/{post_id}\n\n{caption}",
            caption = record.caption
        );

        info!(sequence, reactions = count, "Reposting frame to the best-of album");

        let filename = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{sequence}.jpg"));

        match self
            .gateway
            .post_image(
                bytes.clone(),
                filename,
                &message,
                Some(self.config.best_of.album_id.clone()),
            )
            .await
        {
            Ok(response) => {
                debug!(sequence, photo_id = %response.photo_id, "Best-of repost succeeded");
            }
            Err(e) if e.is_retryable() => {
                warn!(sequence, error = %e, "Best-of repost failed transiently, will retry next pass");
                return Ok(RepostOutcome::Deferred);
            }
            Err(GatewayError::NotFound(message)) => {
                warn!(sequence, message = %message, "Best-of album is gone, retiring record");
                self.retire(record, Some(count))?;
                return Ok(RepostOutcome::Retired);
            }
            Err(e) => {
                return Err(
                    anyhow::Error::new(e).context("best-of repost requires operator intervention")
                );
            }
        }

        if self.config.best_of.store_best_ofs {
            if let Err(e) = self.store_local_copy(&record, count, &bytes) {
                warn!(sequence, error = %e, "Failed to store a local best-of copy");
            }
        }

        record.reaction_count = Some(count);
        record.state = FrameState::Reposted;
        self.cleanup_retained(&mut record);
        self.ledger.upsert(record)?;
        Ok(RepostOutcome::Reposted)
    }

    /// Retire a record as evaluated below the threshold (or unevaluable).
    fn retire(&self, mut record: FrameRecord, count: Option<u64>) -> Result<()> {
        if let Some(count) = count {
            record.reaction_count = Some(count);
        }
        record.state = FrameState::EvaluatedForBestOf;
        self.cleanup_retained(&mut record);
        self.ledger.upsert(record)?;
        Ok(())
    }

    /// Keep a local copy of a reposted frame in the best-of album directory.
    fn store_local_copy(&self, record: &FrameRecord, count: u64, bytes: &[u8]) -> std::io::Result<()> {
        let dir = self.config.best_of_album_dir();
        fs::create_dir_all(&dir)?;
        let name = format!(
            "Frame {} post_id {} reactions {}.jpg",
            record.sequence_number,
            record.remote_post_id.as_deref().unwrap_or("unknown"),
            count
        );
        fs::write(dir.join(name), bytes)
    }

    /// Remove the retained frame copy once a record leaves `Posted`.
    fn cleanup_retained(&self, record: &mut FrameRecord) {
        if let Some(path) = record.retained_path.take() {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove retained frame copy");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AlternateConfig, BestOfConfig, BotConfig, FacebookConfig, MirroringConfig, ServiceConfig,
    };
    use crate::gateway::MockPosterGateway;
    use chrono::Duration;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        Config {
            service: ServiceConfig::default(),
            facebook: FacebookConfig {
                page_id: "page-1".to_string(),
                access_token: "token".to_string(),
                base_url: "http://localhost".to_string(),
                request_timeout_secs: 5,
            },
            bot: BotConfig {
                movie_title: "A Movie".to_string(),
                bot_name: "Bot".to_string(),
                upload_interval_secs: 5,
                delete_files: false,
                frames_directory: dir.join("frames"),
                frames_ext: "jpg".to_string(),
                frames_naming: "frame$N$".to_string(),
                working_dir: dir.to_path_buf(),
            },
            best_of: BestOfConfig {
                enabled: true,
                reactions_threshold: 40,
                wait_hours: 1,
                album_id: "album-1".to_string(),
                check_interval_secs: 60,
                store_best_ofs: true,
            },
            mirroring: MirroringConfig::default(),
            alternate: AlternateConfig::default(),
        }
    }

    fn posted_record(dir: &Path, sequence: u64, hours_ago: i64) -> FrameRecord {
        let frames_dir = dir.join("frames");
        fs::create_dir_all(&frames_dir).unwrap();
        let path = frames_dir.join(format!("frame{sequence}.jpg"));
        fs::write(&path, format!("frame-{sequence}")).unwrap();

        let mut record = FrameRecord::pending(sequence, path);
        record.state = FrameState::Posted;
        record.remote_post_id = Some(format!("post-{sequence}"));
        record.remote_photo_id = Some(format!("photo-{sequence}"));
        record.posted_at = Some(Utc::now() - Duration::hours(hours_ago));
        record.caption = format!("A Movie\nFrame {sequence} of 10");
        record
    }

    fn evaluator_with(
        dir: &TempDir,
        gateway: MockPosterGateway,
        records: Vec<FrameRecord>,
    ) -> (BestOfEvaluator, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::load(dir.path().join("ledger.json")).unwrap());
        for record in records {
            ledger.upsert(record).unwrap();
        }
        let evaluator = BestOfEvaluator::new(
            Arc::new(gateway),
            ledger.clone(),
            Arc::new(test_config(dir.path())),
        );
        (evaluator, ledger)
    }

    #[tokio::test]
    async fn test_qualifying_frame_is_reposted_once() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(50));
        gateway
            .expect_list_album_media()
            .times(1)
            .returning(|_| Ok(vec![]));
        gateway
            .expect_post_image()
            .withf(|_, _, message, album| {
                album.as_deref() == Some("album-1")
                    && message.contains("Original post: https://facebook.com/post-1")
                    && message.contains(": 50.")
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(crate::gateway::PostPhotoResponse {
                    photo_id: "bof-photo".to_string(),
                    post_id: "bof-post".to_string(),
                })
            });

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.reposted, 1);
        let record = ledger.get(1).unwrap();
        assert_eq!(record.state, FrameState::Reposted);
        assert_eq!(record.reaction_count, Some(50));

        // The local best-of copy was stored
        let album_dir = dir.path().join("best_of_album");
        assert!(album_dir
            .join("Frame 1 post_id post-1 reactions 50.jpg")
            .exists());

        // A second pass finds nothing left to check
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();
        assert_eq!(summary, EvaluationSummary::default());
    }

    #[tokio::test]
    async fn test_count_equal_to_threshold_stays_evaluated() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(40));
        gateway.expect_post_image().times(0);

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.evaluated, 1);
        let record = ledger.get(1).unwrap();
        assert_eq!(record.state, FrameState::EvaluatedForBestOf);
        assert_eq!(record.reaction_count, Some(40));
    }

    #[tokio::test]
    async fn test_wait_period_not_elapsed_leaves_record_untouched() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 0);

        let mut gateway = MockPosterGateway::new();
        gateway.expect_reaction_count().times(0);

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.checked, 0);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::Posted);
    }

    #[tokio::test]
    async fn test_restart_detects_existing_album_entry() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(99));
        gateway.expect_list_album_media().times(1).returning(|_| {
            Ok(vec![AlbumMedia {
                id: "existing".to_string(),
                caption: Some("Reactions after 2 hours : 99.\nOriginal post: https://facebook.com/post-1\n\n...".to_string()),
            }])
        });
        // No duplicate remote post
        gateway.expect_post_image().times(0);

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.reposted, 1);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::Reposted);
    }

    #[tokio::test]
    async fn test_transient_reaction_error_retries_next_pass() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Err(GatewayError::RateLimited));

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.reposted, 0);
        assert_eq!(summary.evaluated, 0);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::Posted);
    }

    #[tokio::test]
    async fn test_transient_repost_error_is_deferred_not_retired() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(50));
        gateway
            .expect_list_album_media()
            .times(1)
            .returning(|_| Ok(vec![]));
        gateway
            .expect_post_image()
            .times(1)
            .returning(|_, _, _, _| Err(GatewayError::RateLimited));

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        // Neither reposted nor retired: the pass summary must not claim it
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.reposted, 0);
        assert_eq!(summary.evaluated, 0);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::Posted);
    }

    #[tokio::test]
    async fn test_drain_mode_halves_the_wait() {
        let dir = TempDir::new().unwrap();
        let mut record = posted_record(dir.path(), 1, 0);
        record.posted_at = Some(Utc::now() - Duration::minutes(40));

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(10));

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);

        assert_eq!(evaluator.effective_wait(false), Duration::hours(1));
        assert_eq!(evaluator.effective_wait(true), Duration::minutes(30));

        // Not yet due at the full wait, but due once draining
        let summary = evaluator
            .evaluate_due(evaluator.effective_wait(false))
            .await
            .unwrap();
        assert_eq!(summary.checked, 0);

        let summary = evaluator
            .evaluate_due(evaluator.effective_wait(true))
            .await
            .unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::EvaluatedForBestOf);
    }

    #[tokio::test]
    async fn test_missing_post_retires_record() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Err(GatewayError::NotFound("gone".to_string())));

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(ledger.get(1).unwrap().state, FrameState::EvaluatedForBestOf);
    }

    #[tokio::test]
    async fn test_repost_uses_retained_copy_when_source_deleted() {
        let dir = TempDir::new().unwrap();
        let mut record = posted_record(dir.path(), 1, 2);

        // Simulate delete_files: the source is gone, the retained copy is not
        let retained_dir = dir.path().join("frames_to_check");
        fs::create_dir_all(&retained_dir).unwrap();
        let retained = retained_dir.join("frame1.jpg");
        fs::rename(&record.file_path, &retained).unwrap();
        record.retained_path = Some(retained.clone());

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(50));
        gateway
            .expect_list_album_media()
            .times(1)
            .returning(|_| Ok(vec![]));
        gateway
            .expect_post_image()
            .withf(|bytes, _, _, _| bytes.as_slice() == b"frame-1".as_slice())
            .times(1)
            .returning(|_, _, _, _| {
                Ok(crate::gateway::PostPhotoResponse {
                    photo_id: "bof-photo".to_string(),
                    post_id: "bof-post".to_string(),
                })
            });

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        let record = ledger.get(1).unwrap();
        assert_eq!(record.state, FrameState::Reposted);
        // The retained copy is cleaned up after the repost
        assert!(!retained.exists());
        assert!(record.retained_path.is_none());
    }

    #[tokio::test]
    async fn test_missing_image_everywhere_retires_record() {
        let dir = TempDir::new().unwrap();
        let record = posted_record(dir.path(), 1, 2);
        fs::remove_file(&record.file_path).unwrap();

        let mut gateway = MockPosterGateway::new();
        gateway
            .expect_reaction_count()
            .times(1)
            .returning(|_| Ok(50));
        gateway
            .expect_list_album_media()
            .times(1)
            .returning(|_| Ok(vec![]));
        gateway.expect_post_image().times(0);

        let (evaluator, ledger) = evaluator_with(&dir, gateway, vec![record]);
        let summary = evaluator.evaluate_due(Duration::hours(1)).await.unwrap();

        assert_eq!(summary.evaluated, 1);
        assert_eq!(ledger.get(1).unwrap().state, FrameState::EvaluatedForBestOf);
    }

    #[test]
    fn test_record_without_post_id_is_unreachable_via_scheduler() {
        // Guard: the scheduler always writes a post id before Posted; the
        // evaluator still handles its absence defensively at runtime.
        let record = FrameRecord::pending(1, PathBuf::from("frame1.jpg"));
        assert!(record.remote_post_id.is_none());
        assert_eq!(record.state, FrameState::Pending);
    }
}
