//! Framebot
//!
//! A movie-frame posting bot for Facebook pages. Posts one frame per
//! configured interval, in strict frame order, and keeps every outcome in a
//! durable single-file ledger so a restart resumes exactly where the previous
//! run stopped. An optional best-of evaluator revisits posted frames after a
//! wait period and reposts the most-reacted ones into a dedicated album.
//!
//! ## Features
//!
//! - **Ordered posting**: frames go out strictly by index, one per tick,
//!   with a fixed-delay cadence that absorbs slow uploads
//! - **Crash-consistent ledger**: a single JSON file, rewritten atomically,
//!   is the only state; no frame is ever posted twice or skipped
//! - **Best-of reposting**: reaction counts are polled after a configurable
//!   wait and winners are reposted into a best-of album
//! - **Random mirroring**: a configurable share of frames is posted as its
//!   horizontally mirrored variant, credited in the caption
//! - **Alternate frames**: a matching alternate image can be attached to
//!   each post as a comment
//!
//! ## Architecture
//!
//! ```text
//! frames/                    Facebook Graph API
//! ┌──────────────┐           ┌──────────────┐
//! │ frame1.jpg   │           │ page feed    │
//! │ frame2.jpg   │──────────▶│ best-of album│
//! │ ...          │           └──────────────┘
//! └──────────────┘                  ▲
//!        │                          │
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐
//! │ Frame        │           │ Poster       │
//! │ Source       │           │ Gateway      │
//! └──────────────┘           └──────────────┘
//!        │                       ▲      ▲
//!        ▼                       │      │
//! ┌──────────────┐           ┌──────────────┐
//! │ Posting      │──────────▶│ Best-of      │
//! │ Scheduler    │           │ Evaluator    │
//! └──────────────┘           └──────────────┘
//!        │                          │
//!        └──────────┬───────────────┘
//!                   ▼
//!            ┌──────────────┐
//!            │ ledger.json  │
//!            └──────────────┘
//! ```

pub mod best_of;
pub mod config;
pub mod frames;
pub mod gateway;
pub mod ledger;
pub mod migration;
pub mod mirror;
pub mod scheduler;

pub use best_of::{BestOfEvaluator, EvaluationSummary};
pub use config::Config;
pub use frames::{FramePattern, FrameSource, SourceFrame};
pub use gateway::{FacebookGateway, GatewayError, PosterGateway, PostPhotoResponse};
pub use ledger::{FrameRecord, FrameState, Ledger, LedgerError};
pub use migration::{MigrationOptions, MigrationReport};
pub use scheduler::{PostingScheduler, TickOutcome};
