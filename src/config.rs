use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the framebot service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Facebook Graph API configuration
    pub facebook: FacebookConfig,
    /// Bot posting configuration
    pub bot: BotConfig,
    /// Best-of reposting configuration
    #[serde(default)]
    pub best_of: BestOfConfig,
    /// Random mirroring configuration
    #[serde(default)]
    pub mirroring: MirroringConfig,
    /// Alternate frame comment configuration
    #[serde(default)]
    pub alternate: AlternateConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Facebook Graph API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FacebookConfig {
    /// Page id posts are published to
    pub page_id: String,
    /// Page access token
    pub access_token: String,
    /// Graph API base URL (overridable for testing)
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Core posting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Movie/video title shown in every post caption
    pub movie_title: String,
    /// Bot name, credited in mirrored posts
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Seconds between one frame post and the next
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,
    /// Delete frame files after a successful, durably recorded post
    #[serde(default)]
    pub delete_files: bool,
    /// Directory holding the frame files
    pub frames_directory: PathBuf,
    /// Frame file extension
    #[serde(default = "default_frames_ext")]
    pub frames_ext: String,
    /// Frame naming pattern; must contain the $N$ index placeholder
    #[serde(default = "default_frames_naming")]
    pub frames_naming: String,
    /// Working directory for the ledger and retained frame copies
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

/// Best-of reposting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BestOfConfig {
    /// Enable best-of evaluation and reposting
    #[serde(default)]
    pub enabled: bool,
    /// Reaction count a frame must exceed (strictly) to be reposted
    #[serde(default = "default_reactions_threshold")]
    pub reactions_threshold: u64,
    /// Hours to wait after posting before reactions are evaluated
    #[serde(default = "default_wait_hours")]
    pub wait_hours: u64,
    /// Album id best-of frames are reposted to
    #[serde(default)]
    pub album_id: String,
    /// Seconds between evaluation passes
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Also keep a local copy of every reposted frame
    #[serde(default = "default_true")]
    pub store_best_ofs: bool,
}

/// Random mirroring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MirroringConfig {
    /// Enable the mirror draw
    #[serde(default)]
    pub enabled: bool,
    /// Percentage (0-100) of frames posted as their mirrored variant
    #[serde(default = "default_mirror_ratio")]
    pub ratio: f64,
}

/// Alternate frame comment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlternateConfig {
    /// Enable alternate frame comments
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding alternate frames, named like the main frames
    #[serde(default)]
    pub directory: PathBuf,
    /// Text attached to the alternate frame comment
    #[serde(default)]
    pub comment_text: String,
}

// Default value functions
fn default_service_name() -> String {
    "framebot".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com/v16.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_bot_name() -> String {
    "Bot".to_string()
}

fn default_upload_interval_secs() -> u64 {
    150
}

fn default_frames_ext() -> String {
    "jpg".to_string()
}

fn default_frames_naming() -> String {
    "$N$".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_reactions_threshold() -> u64 {
    50
}

fn default_wait_hours() -> u64 {
    24
}

fn default_check_interval_secs() -> u64 {
    3600
}

fn default_mirror_ratio() -> f64 {
    50.0
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BestOfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reactions_threshold: default_reactions_threshold(),
            wait_hours: default_wait_hours(),
            album_id: String::new(),
            check_interval_secs: default_check_interval_secs(),
            store_best_ofs: default_true(),
        }
    }
}

impl Default for MirroringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio: default_mirror_ratio(),
        }
    }
}

impl Default for AlternateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::new(),
            comment_text: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("framebot").required(false))
            .add_source(config::File::with_name("/etc/framebot/framebot").required(false))
            // Override with environment variables
            // FRAMEBOT__FACEBOOK__ACCESS_TOKEN -> facebook.access_token
            .add_source(
                config::Environment::with_prefix("FRAMEBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.bot.frames_naming.contains("$N$") {
            anyhow::bail!(
                "frames_naming must contain the $N$ placeholder, got '{}'",
                self.bot.frames_naming
            );
        }
        if !(0.0..=100.0).contains(&self.mirroring.ratio) {
            anyhow::bail!(
                "mirroring ratio must be within 0-100, got {}",
                self.mirroring.ratio
            );
        }
        if self.best_of.enabled && self.best_of.album_id.is_empty() {
            anyhow::bail!("best_of is enabled but no album_id is configured");
        }
        if self.alternate.enabled && self.alternate.directory.as_os_str().is_empty() {
            anyhow::bail!("alternate frames are enabled but no directory is configured");
        }
        Ok(())
    }

    /// Get the posting interval as Duration
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.bot.upload_interval_secs)
    }

    /// Get the best-of wait period as a chrono Duration
    pub fn wait_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.best_of.wait_hours as i64)
    }

    /// Get the evaluation pass interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.best_of.check_interval_secs)
    }

    /// Get the per-request gateway timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.facebook.request_timeout_secs)
    }

    /// Path of the ledger file inside the working directory
    pub fn ledger_path(&self) -> PathBuf {
        self.bot.working_dir.join("ledger.json")
    }

    /// Directory for frame copies retained for best-of evaluation
    pub fn retention_dir(&self) -> PathBuf {
        self.bot.working_dir.join("frames_to_check")
    }

    /// Directory for local copies of reposted best-of frames
    pub fn best_of_album_dir(&self) -> PathBuf {
        self.bot.working_dir.join("best_of_album")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            facebook: FacebookConfig {
                page_id: "page-1".to_string(),
                access_token: "token".to_string(),
                base_url: default_graph_base_url(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            bot: BotConfig {
                movie_title: "A Movie".to_string(),
                bot_name: default_bot_name(),
                upload_interval_secs: default_upload_interval_secs(),
                delete_files: false,
                frames_directory: PathBuf::from("frames"),
                frames_ext: default_frames_ext(),
                frames_naming: default_frames_naming(),
                working_dir: default_working_dir(),
            },
            best_of: BestOfConfig::default(),
            mirroring: MirroringConfig::default(),
            alternate: AlternateConfig::default(),
        }
    }

    #[test]
    fn test_minimal_config_validates() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_naming_without_placeholder_rejected() {
        let mut config = minimal_config();
        config.bot.frames_naming = "frame".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ratio_out_of_range_rejected() {
        let mut config = minimal_config();
        config.mirroring.ratio = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_best_of_requires_album() {
        let mut config = minimal_config();
        config.best_of.enabled = true;
        assert!(config.validate().is_err());
        config.best_of.album_id = "album-1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers() {
        let config = minimal_config();
        assert_eq!(config.upload_interval(), Duration::from_secs(150));
        assert_eq!(config.wait_period(), chrono::Duration::hours(24));
        assert_eq!(config.ledger_path(), PathBuf::from("./ledger.json"));
    }
}
