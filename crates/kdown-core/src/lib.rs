//! Core engine for a cross-platform, resumable, concurrent download manager.
//!
//! The engine drives reliable, concurrent, resumable file transfers from
//! heterogeneous sources (HTTP/HTTPS, BitTorrent, extensible to others),
//! respecting per-task and global rate limits and concurrency caps, while
//! persisting enough state to recover after process restart.
//!
//! The engine is consumed as an embedded library: the GUI/CLI presentation
//! layer, the HTTP client implementation, the file-accessor implementation,
//! the torrent backend, and the task-store persistence backend are all
//! pluggable collaborators named by interface rather than owned here.

pub mod bencode;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod file_accessor;
pub mod filename;
pub mod http_engine;
pub mod logging;
pub mod magnet;
pub mod model;
pub mod queue;
pub mod rate_limiter;
pub mod schedule;
pub mod segment_calc;
pub mod segment_downloader;
pub mod source;
pub mod task_store;
pub mod torrent_engine;

pub use error::KDownError;
pub use model::{
    DownloadPriority, DownloadProgress, DownloadRequest, DownloadState, ResolvedSource, Segment,
    SourceFile, SourceResumeState, SpeedLimit, TaskRecord, TaskState,
};
