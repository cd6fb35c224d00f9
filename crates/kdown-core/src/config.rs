//! Engine configuration: loaded from `~/.config/kdown/config.toml`, using a
//! load-or-initialize-default idiom (see `logging.rs` for the matching
//! state-directory convention).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Engine-wide tuning knobs (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-task parallelism when a `DownloadRequest` doesn't specify one.
    pub max_connections_per_download: usize,
    /// Maximum retry attempts after the first failed attempt.
    pub retry_count: u32,
    /// Base backoff delay in milliseconds (exponential, see `execution::retry`).
    pub retry_delay_ms: u64,
    /// Minimum interval between published progress updates.
    pub progress_update_interval_ms: u64,
    /// Minimum interval between durable segment-snapshot persists.
    pub segment_save_interval_ms: u64,
    /// I/O chunk size used by segment downloaders. Must be > 0.
    pub buffer_size: usize,
    /// Default output directory when a request doesn't specify one.
    pub default_directory: String,
    /// Global concurrency cap across all tasks.
    pub max_concurrent_downloads: usize,
    /// Per-host concurrency cap.
    pub max_connections_per_host: usize,
    /// Token-bucket burst size (initial/maximum token count), shared default for new limiters.
    pub burst_size: u64,
    /// Size of the engine-owned network dispatcher pool, when the engine creates its own.
    pub network_pool_size: usize,
    /// Size of the engine-owned I/O dispatcher pool, when the engine creates its own.
    pub io_pool_size: usize,
    /// Bounded timeout (seconds) for torrent metadata fetch (spec §5).
    pub torrent_metadata_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections_per_download: 4,
            retry_count: 3,
            retry_delay_ms: 1000,
            progress_update_interval_ms: 200,
            segment_save_interval_ms: 5000,
            buffer_size: 65536,
            default_directory: "downloads".to_string(),
            max_concurrent_downloads: 4,
            max_connections_per_host: 4,
            burst_size: 65536,
            network_pool_size: 8,
            io_pool_size: 4,
            torrent_metadata_timeout_secs: 120,
        }
    }
}

/// Raised when a loaded or constructed `EngineConfig` violates an invariant.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer_size must be > 0")]
    ZeroBufferSize,
    #[error("max_concurrent_downloads must be > 0")]
    ZeroMaxConcurrentDownloads,
    #[error("max_connections_per_host must be > 0")]
    ZeroMaxConnectionsPerHost,
}

impl EngineConfig {
    /// Validates the invariants called out in spec §6.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::ZeroMaxConcurrentDownloads);
        }
        if self.max_connections_per_host == 0 {
            return Err(ConfigError::ZeroMaxConnectionsPerHost);
        }
        Ok(())
    }
}

/// Path to the config file under the platform config directory.
pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("kdown")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Loads configuration from disk, writing a default file if none exists yet.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!(path = %path.display(), "created default engine config");
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data).context("failed to parse engine config")?;
    cfg.validate().context("invalid engine config")?;
    Ok(cfg)
}
