//! Core data model (spec §3): requests, resolved sources, segments, observable
//! state, and the durable task record. Sum types are modeled as Rust enums
//! with pattern matching rather than a class hierarchy, following the
//! donor's preference (`resume_db::types::JobState`) for small tagged enums
//! over trait objects wherever the set of variants is closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KDownError;

/// Download priority (spec §3): `LOW < NORMAL < HIGH < URGENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for DownloadPriority {
    fn default() -> Self {
        DownloadPriority::Normal
    }
}

/// A target transfer rate (spec §3). `Unlimited` disables throttling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpeedLimit {
    Unlimited,
    Limited { bytes_per_second: u64 },
}

impl SpeedLimit {
    pub fn kbps(n: u64) -> Self {
        SpeedLimit::Limited {
            bytes_per_second: n * 1024,
        }
    }

    pub fn mbps(n: u64) -> Self {
        SpeedLimit::Limited {
            bytes_per_second: n * 1024 * 1024,
        }
    }

    pub fn bytes_per_second(&self) -> Option<u64> {
        match self {
            SpeedLimit::Unlimited => None,
            SpeedLimit::Limited { bytes_per_second } => Some(*bytes_per_second),
        }
    }
}

/// Where a completed download should be written (donor: `url_model` + CLI
/// `--output` handling, generalized into a first-class sum type per spec §9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Absolute file path; if set, `dir`/`name` are ignored (spec §4.4.3 step 1).
    pub absolute_path: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    pub name: Option<String>,
}

/// A scheduling directive wrapping `DownloadQueue::enqueue` (spec §9 open
/// question, resolved per `SPEC_FULL.md` A.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSchedule {
    Immediate,
    AtTime { at: DateTime<Utc> },
    AfterDelay { delay_ms: u64 },
}

impl Default for DownloadSchedule {
    fn default() -> Self {
        DownloadSchedule::Immediate
    }
}

/// An immutable request to start a download (spec §3).
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: Option<Destination>,
    /// `0` means "use the engine default" (spec §3).
    pub connections: usize,
    pub headers: HashMap<String, String>,
    pub priority: DownloadPriority,
    pub speed_limit: SpeedLimit,
    pub schedule: DownloadSchedule,
    pub selected_file_ids: Vec<String>,
    /// A pre-resolved source, skipping the resolver (spec §4.4.3).
    pub resolved_source: Option<ResolvedSource>,
}

impl DownloadRequest {
    /// Validates synchronous invariants (spec §7: "`DownloadRequest`
    /// construction validates arguments and fails with `IllegalArgument`-class
    /// errors synchronously").
    pub fn validate(&self) -> Result<(), KDownError> {
        if self.url.trim().is_empty() {
            return Err(KDownError::IllegalArgument("url must not be blank".into()));
        }
        if let SpeedLimit::Limited { bytes_per_second } = self.speed_limit {
            if bytes_per_second == 0 {
                return Err(KDownError::IllegalArgument(
                    "speed_limit bytes_per_second must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for DownloadRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            destination: None,
            connections: 0,
            headers: HashMap::new(),
            priority: DownloadPriority::Normal,
            speed_limit: SpeedLimit::Unlimited,
            schedule: DownloadSchedule::Immediate,
            selected_file_ids: Vec::new(),
            resolved_source: None,
        }
    }
}

/// One file exposed by a multi-file source (torrent, archive) (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: String,
    pub name: String,
    /// `-1` means unknown.
    pub size: i64,
    pub metadata: HashMap<String, String>,
}

/// Whether a caller may select one or several files from a multi-file source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelectionMode {
    Multiple,
    Single,
}

/// The outcome of resolving a `DownloadRequest` against a source (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub source_type: String,
    /// `-1` means unknown.
    pub total_bytes: i64,
    pub supports_resume: bool,
    pub suggested_file_name: Option<String>,
    pub max_segments: usize,
    pub metadata: HashMap<String, String>,
    pub files: Vec<SourceFile>,
    pub selection_mode: SelectionMode,
}

impl ResolvedSource {
    pub fn total_bytes_known(&self) -> Option<u64> {
        if self.total_bytes >= 0 {
            Some(self.total_bytes as u64)
        } else {
            None
        }
    }
}

/// A contiguous byte range within the target file (spec §3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    /// Inclusive start offset.
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
    pub downloaded_bytes: u64,
}

impl Segment {
    pub fn total_bytes(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn current_offset(&self) -> u64 {
        self.start + self.downloaded_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_bytes == self.total_bytes()
    }

    /// `bytes=start-end` HTTP Range header value for the remaining range.
    pub fn range_header_value(&self) -> String {
        format!("bytes={}-{}", self.current_offset(), self.end)
    }
}

/// Live progress for an active or paused task (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// `0` (or less through `i64`-derived sources) means unknown; callers
    /// should treat `total_bytes == 0` as "unknown" per the percent formula.
    pub total_bytes: u64,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.downloaded_bytes as f64 / self.total_bytes as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }
}

/// The client-observable lifecycle of one task (spec §3). A sum type, not a
/// class hierarchy: match on this rather than querying booleans.
///
/// `Failed` carries an `Arc<KDownError>` rather than `KDownError` directly so
/// that `DownloadState` stays `Clone` (required by the `tokio::sync::watch`
/// observable-state stream, spec §6) despite `KDownError` wrapping a
/// non-`Clone` `anyhow::Error` cause.
#[derive(Debug, Clone)]
pub enum DownloadState {
    Idle,
    Scheduled(DownloadSchedule),
    Queued,
    Pending,
    Downloading(DownloadProgress),
    Paused(DownloadProgress),
    Completed(PathBuf),
    Failed(Arc<KDownError>),
    Canceled,
}

impl PartialEq for DownloadState {
    /// `KDownError` wraps a non-`PartialEq` `anyhow::Error`, so `Failed` is
    /// compared by rendered message rather than structurally.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DownloadState::Idle, DownloadState::Idle) => true,
            (DownloadState::Scheduled(a), DownloadState::Scheduled(b)) => a == b,
            (DownloadState::Queued, DownloadState::Queued) => true,
            (DownloadState::Pending, DownloadState::Pending) => true,
            (DownloadState::Downloading(a), DownloadState::Downloading(b)) => a == b,
            (DownloadState::Paused(a), DownloadState::Paused(b)) => a == b,
            (DownloadState::Completed(a), DownloadState::Completed(b)) => a == b,
            (DownloadState::Failed(a), DownloadState::Failed(b)) => a.to_string() == b.to_string(),
            (DownloadState::Canceled, DownloadState::Canceled) => true,
            _ => false,
        }
    }
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed(_) | DownloadState::Failed(_) | DownloadState::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Pending | DownloadState::Downloading(_))
    }
}

/// The durable `TaskState` projection stored by the `TaskStore` (spec §3).
/// Serializes as its label per spec §9 ("Enum values serialize as their
/// label").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_restorable(&self) -> bool {
        matches!(
            self,
            TaskState::Queued | TaskState::Downloading | TaskState::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// An opaque, per-source continuation blob (spec §3, GLOSSARY). The engine
/// never parses `data`; only the owning `Source` interprets it (spec §9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResumeState {
    pub source_type: String,
    pub data: String,
}

/// The HTTP source's decoded resume payload (spec §3). Serialized into/out
/// of `SourceResumeState::data` by `source::http` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResumeData {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub total_bytes: u64,
}

/// The torrent source's decoded resume payload (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentResumeData {
    pub info_hash: String,
    pub total_bytes: u64,
    /// Base64-encoded opaque resume blob from the `TorrentEngine`.
    pub resume_data: String,
    pub selected_file_ids: Vec<String>,
    pub save_path: String,
}

/// The durable projection of a task (spec §3). Unknown fields are ignored on
/// deserialize and absent optionals default to `None`/empty — see
/// `#[serde(default)]` below — matching the donor's forward-compatible
/// persistence stance (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    pub task_id: String,
    pub request_url: String,
    pub output_path: Option<PathBuf>,
    pub state: TaskState,
    pub total_bytes: i64,
    pub downloaded_bytes: u64,
    pub accept_ranges: Option<bool>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub segments: Option<Vec<Segment>>,
    pub source_type: Option<String>,
    pub source_resume_state: Option<SourceResumeState>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            task_id: String::new(),
            request_url: String::new(),
            output_path: None,
            state: TaskState::Queued,
            total_bytes: -1,
            downloaded_bytes: 0,
            accept_ranges: None,
            etag: None,
            last_modified: None,
            segments: None,
            source_type: None,
            source_resume_state: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_spec() {
        assert!(DownloadPriority::Low < DownloadPriority::Normal);
        assert!(DownloadPriority::Normal < DownloadPriority::High);
        assert!(DownloadPriority::High < DownloadPriority::Urgent);
    }

    #[test]
    fn speed_limit_helpers() {
        assert_eq!(SpeedLimit::kbps(10).bytes_per_second(), Some(10 * 1024));
        assert_eq!(
            SpeedLimit::mbps(2).bytes_per_second(),
            Some(2 * 1024 * 1024)
        );
        assert_eq!(SpeedLimit::Unlimited.bytes_per_second(), None);
    }

    #[test]
    fn segment_invariants() {
        let s = Segment {
            index: 0,
            start: 100,
            end: 199,
            downloaded_bytes: 50,
        };
        assert_eq!(s.total_bytes(), 100);
        assert_eq!(s.current_offset(), 150);
        assert!(!s.is_complete());

        let done = Segment {
            downloaded_bytes: 100,
            ..s
        };
        assert!(done.is_complete());
    }

    #[test]
    fn progress_percent_and_completion() {
        let p = DownloadProgress {
            downloaded_bytes: 50,
            total_bytes: 200,
            bytes_per_second: 0,
        };
        assert_eq!(p.percent(), 0.25);
        assert!(!p.is_complete());

        let zero_total = DownloadProgress {
            downloaded_bytes: 0,
            total_bytes: 0,
            bytes_per_second: 0,
        };
        assert_eq!(zero_total.percent(), 0.0);

        let complete = DownloadProgress {
            downloaded_bytes: 200,
            total_bytes: 200,
            bytes_per_second: 0,
        };
        assert!(complete.is_complete());
    }

    #[test]
    fn state_terminal_and_active_predicates() {
        assert!(DownloadState::Completed(PathBuf::from("/x")).is_terminal());
        assert!(DownloadState::Canceled.is_terminal());
        assert!(!DownloadState::Queued.is_terminal());
        assert!(DownloadState::Pending.is_active());
        assert!(!DownloadState::Queued.is_active());
    }

    #[test]
    fn task_state_restorable_and_terminal() {
        assert!(TaskState::Queued.is_restorable());
        assert!(TaskState::Downloading.is_restorable());
        assert!(TaskState::Paused.is_restorable());
        assert!(!TaskState::Completed.is_restorable());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
    }

    #[test]
    fn task_record_json_roundtrip_ignores_unknown_fields() {
        let record = TaskRecord {
            task_id: "abc".into(),
            request_url: "https://example.com/f".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, "abc");

        let with_extra = r#"{"task_id":"x","request_url":"u","unknown_future_field":42}"#;
        let parsed2: TaskRecord = serde_json::from_str(with_extra).unwrap();
        assert_eq!(parsed2.task_id, "x");
        assert_eq!(parsed2.total_bytes, -1);
        assert!(parsed2.segments.is_none());
    }

    #[test]
    fn task_state_serializes_as_label() {
        let json = serde_json::to_string(&TaskState::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
    }
}
