//! The `TorrentEngine` collaborator interface (spec §4.9, §6): the actual
//! peer-protocol implementation is consumed, not owned (spec §1 lists the
//! torrent backend as an out-of-scope collaborator named by interface).
//!
//! The donor has no torrent support at all; this trait is grounded on the
//! same collaborator shape as [`crate::http_engine::HttpEngine`] — a thin
//! async boundary the engine depends on exclusively, with a reference
//! implementation left for the host application to supply (e.g. wrapping a
//! `rqbit`-style HTTP-API torrent daemon, the way `other_examples` shows
//! `torrent-fuse` fronting `rqbit` over HTTP).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::SourceFile;

/// Metadata returned by `fetch_metadata` once a magnet link's DHT/peer
/// metadata exchange completes (spec §4.9).
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub info_hash: String,
    pub name: String,
    pub piece_length: u64,
    pub comment: Option<String>,
    pub files: Vec<SourceFile>,
    pub total_bytes: u64,
}

/// Coarse lifecycle of one active torrent transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentSessionState {
    Downloading,
    Seeding,
    Paused,
    Error,
}

/// One active torrent transfer (spec §6). The torrent source polls
/// `downloaded_bytes`/`state` to drive the engine-observable
/// `DownloadProgress`/`DownloadState`, exactly as the HTTP source's segment
/// downloaders report progress — but here the engine never touches bytes
/// directly (`Source::manages_own_file_io() == true`).
#[async_trait]
pub trait TorrentSession: Send + Sync {
    async fn downloaded_bytes(&self) -> anyhow::Result<u64>;
    async fn state(&self) -> anyhow::Result<TorrentSessionState>;
    async fn pause(&self) -> anyhow::Result<()>;
    async fn resume(&self) -> anyhow::Result<()>;
    async fn set_file_priorities(&self, selected_file_ids: &[String]) -> anyhow::Result<()>;
    /// Opaque resume blob persisted into `TorrentResumeData.resume_data`
    /// (base64-encoded by the caller, spec §3).
    async fn save_resume_data(&self) -> anyhow::Result<Vec<u8>>;
}

/// The pluggable torrent transport (spec §6, §4.9).
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    /// Resolves a magnet URI's metadata over DHT/peers, bounded by
    /// `timeout` (spec §5: "metadata fetch for torrent sources has a
    /// bounded timeout, default 120s").
    async fn fetch_metadata(&self, magnet_uri: &str, timeout: Duration) -> anyhow::Result<TorrentMetadata>;
    async fn add_torrent(
        &self,
        info_hash: &str,
        save_path: &Path,
        selected_file_ids: &[String],
        resume_data: Option<Vec<u8>>,
    ) -> anyhow::Result<Box<dyn TorrentSession>>;
    async fn remove_torrent(&self, info_hash: &str) -> anyhow::Result<()>;
    async fn set_download_rate_limit(&self, bytes_per_sec: Option<u64>) -> anyhow::Result<()>;
    async fn set_upload_rate_limit(&self, bytes_per_sec: Option<u64>) -> anyhow::Result<()>;
}
