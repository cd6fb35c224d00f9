//! The source abstraction (spec §4.4, C4/C5): every transfer protocol the
//! engine drives (HTTP, torrent, and anything added later) implements
//! [`Source`] against a single [`DownloadContext`], so `execution` and
//! `coordinator` never special-case a protocol.
//!
//! The donor has no such abstraction — `fetch_head`/`downloader` are wired
//! directly to curl HTTP throughout `scheduler::execute`. This module is
//! the generalization spec §9 calls for ("sum types over inheritance...
//! prefer pattern matching"), expressed instead as a small trait object set
//! (`Arc<dyn Source>`) since the set of sources is open — new protocols are
//! added by registering another implementation, not by extending an enum.

pub mod http;
pub mod resolver;
pub mod torrent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::{MaxConnectionsCell, MaxConnectionsWatcher, PendingResegment, TaskCancellation};
use crate::config::EngineConfig;
use crate::error::KDownError;
use crate::file_accessor::FileAccessor;
use crate::model::{DownloadProgress, DownloadRequest, ResolvedSource, Segment, SourceResumeState};
use crate::rate_limiter::DelegatingSpeedLimiter;

pub use resolver::SourceResolver;

/// Published after each throttled progress update (spec §4.4.2: "publish
/// the aggregate... at most once per `progressUpdateIntervalMs`").
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Everything one execution attempt needs to drive a source to completion
/// (spec §4.4.3: "Build `DownloadContext`"). Owned as an `Arc` because the
/// segmented-download loop (§4.4.2) spawns several concurrent subtasks that
/// each need a handle to the same mutable cells (`segments`,
/// `max_connections`, `pending_resegment`) without the execution function
/// itself staying alive as a borrow source.
pub struct DownloadContext {
    pub task_id: String,
    pub url: String,
    pub request: DownloadRequest,
    /// `None` when the source manages its own file I/O (spec §4.4,
    /// `managesOwnFileIo`), e.g. the torrent source.
    pub file_accessor: Option<Arc<dyn FileAccessor>>,
    pub segments: Arc<AsyncMutex<Vec<Segment>>>,
    pub on_progress: ProgressCallback,
    pub task_limiter: DelegatingSpeedLimiter,
    pub global_limiter: DelegatingSpeedLimiter,
    pub headers: HashMap<String, String>,
    /// A pre-resolved source, skipping the resolver (spec §4.4.3).
    pub pre_resolved: Option<ResolvedSource>,
    /// Mutable mid-flight connection-count cell (spec §4.5
    /// `setTaskConnections`, §4.4.2 watcher). `0` means "no explicit
    /// override yet; use the request/engine default".
    pub max_connections: MaxConnectionsCell,
    /// The single consumer of connection-count changes; locked for the
    /// duration of one batch's watcher subtask (spec §4.4.2).
    pub max_connections_watcher: AsyncMutex<MaxConnectionsWatcher>,
    pub pending_resegment: PendingResegment,
    pub cancellation: TaskCancellation,
    pub config: Arc<EngineConfig>,
}

impl DownloadContext {
    pub fn file_accessor(&self) -> anyhow::Result<&Arc<dyn FileAccessor>> {
        self.file_accessor
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("source requires a file accessor but none was provided"))
    }
}

/// A pluggable transfer-protocol implementation (spec §4.4). Sources never
/// touch the task store or the active-task map directly; they only read and
/// mutate the `DownloadContext` they are handed.
#[async_trait]
pub trait Source: Send + Sync {
    /// Protocol discriminator, e.g. `"http"`, `"torrent"` (spec §4.4).
    fn source_type(&self) -> &'static str;

    /// When `true`, the engine skips file-accessor creation/cleanup for
    /// this source's tasks (spec §4.4).
    fn manages_own_file_io(&self) -> bool {
        false
    }

    fn can_handle(&self, url: &str) -> bool;

    /// HEAD-equivalent probe (spec §4.4.1).
    async fn resolve(&self, url: &str, headers: &HashMap<String, String>) -> Result<ResolvedSource, KDownError>;

    /// Fresh download (spec §4.4.1 "Download").
    async fn download(&self, ctx: &Arc<DownloadContext>, resolved: &ResolvedSource) -> Result<(), KDownError>;

    /// Continue from persisted state (spec §4.4.1 "Resume").
    async fn resume(&self, ctx: &Arc<DownloadContext>, resume_state: &SourceResumeState) -> Result<(), KDownError>;

    fn build_resume_state(&self, resolved: &ResolvedSource, total_bytes: u64) -> SourceResumeState;

    /// Optional periodic snapshot (spec §4.4); `None` unless a source
    /// overrides it.
    async fn update_resume_state(&self, _ctx: &Arc<DownloadContext>) -> Option<SourceResumeState> {
        None
    }
}
