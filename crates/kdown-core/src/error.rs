//! The engine's public error taxonomy.
//!
//! `KDownError` is the sum type surfaced through `DownloadState::Failed` and
//! `TaskRecord.error_message`. Internal plumbing is free to use
//! `anyhow::Result` (see the donor's `scheduler`/`retry` modules for the
//! precedent); every boundary that can produce a `DownloadState` maps into
//! this enum exactly once.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The engine's error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum KDownError {
    /// Transport-level failure (connection reset, DNS, timeout, short read). Retryable.
    #[error("network error{}", display_cause(.0))]
    Network(#[source] Option<anyhow::Error>),

    /// Non-2xx HTTP response. Retryable iff `code == 429 || (500..=599).contains(&code)`.
    #[error("http {code}{}", display_http_suffix(.message, .retry_after_seconds))]
    Http {
        code: u16,
        message: Option<String>,
        retry_after_seconds: Option<u64>,
        rate_limit_remaining: Option<u64>,
    },

    /// File I/O failure. Not retryable.
    #[error("disk error{}", display_cause(.0))]
    Disk(#[source] Option<anyhow::Error>),

    /// Protocol/content not handled (unknown size, unknown scheme). Not retryable.
    #[error("unsupported")]
    Unsupported,

    /// Remote content changed (ETag/Last-Modified mismatch) or persisted state corrupt. Not retryable.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// User-initiated cancellation. Not retryable.
    #[error("canceled")]
    Canceled,

    /// Source-specific failure (e.g. torrent engine). Not retryable by default.
    #[error("source error ({source_type}){}", display_cause(.cause))]
    SourceError {
        source_type: String,
        #[source]
        cause: Option<anyhow::Error>,
    },

    /// Authentication was required and failed or was never supplied.
    #[error("authentication failed ({scheme})")]
    AuthenticationFailed { scheme: String },

    /// A persisted resume state could not be reconstituted.
    #[error("corrupt resume state{}", display_msg_cause(.msg, .cause))]
    CorruptResumeState {
        msg: Option<String>,
        #[source]
        cause: Option<anyhow::Error>,
    },

    /// The local file changed underneath the engine (size mismatch on resume validation).
    #[error("file changed: {0}")]
    FileChanged(String),

    /// A request argument failed synchronous validation (`DownloadRequest` construction).
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Fallback for anything not already domain-typed.
    #[error("unknown error{}", display_cause(.0))]
    Unknown(#[source] Option<anyhow::Error>),
}

fn display_cause(cause: &Option<anyhow::Error>) -> String {
    match cause {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

fn display_msg_cause(msg: &Option<String>, cause: &Option<anyhow::Error>) -> String {
    let mut s = String::new();
    if let Some(m) = msg {
        s.push_str(": ");
        s.push_str(m);
    }
    if let Some(c) = cause {
        s.push_str(&format!(" ({c})"));
    }
    s
}

fn display_http_suffix(message: &Option<String>, retry_after: &Option<u64>) -> String {
    let mut s = String::new();
    if let Some(m) = message {
        s.push_str(&format!(" {m}"));
    }
    if let Some(r) = retry_after {
        s.push_str(&format!(" (retry after {r}s)"));
    }
    s
}

impl KDownError {
    /// Wraps a non-domain error raised while inside the coordinator's top-level
    /// spawn (spec §7 propagation policy).
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast::<KDownError>() {
            Ok(domain) => domain,
            Err(e) => KDownError::Unknown(Some(e)),
        }
    }

    /// Retryable predicate (spec §4.4.4 / §7).
    pub fn is_retryable(&self) -> bool {
        match self {
            KDownError::Network(_) => true,
            KDownError::Http { code, .. } => *code == 429 || (500..=599).contains(code),
            KDownError::Disk(_)
            | KDownError::Unsupported
            | KDownError::ValidationFailed(_)
            | KDownError::Canceled
            | KDownError::SourceError { .. }
            | KDownError::AuthenticationFailed { .. }
            | KDownError::CorruptResumeState { .. }
            | KDownError::FileChanged(_)
            | KDownError::IllegalArgument(_)
            | KDownError::Unknown(_) => false,
        }
    }

    /// `Retry-After` seconds, when present on an HTTP 429.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            KDownError::Http {
                code: 429,
                retry_after_seconds: Some(s),
                ..
            } => Some(Duration::from_secs(*s)),
            _ => None,
        }
    }

    /// `RateLimit-Remaining`, when the server reported one alongside an HTTP error.
    pub fn rate_limit_remaining(&self) -> Option<u64> {
        match self {
            KDownError::Http {
                rate_limit_remaining,
                ..
            } => *rate_limit_remaining,
            _ => None,
        }
    }

    /// A short, human-readable message suitable for `TaskRecord.error_message`.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Local classification used by the retry loop and the segment downloader to
/// decide what family an internal failure belongs to before it is turned
/// into a `KDownError`. Mirrors the donor's `retry::classify::ErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Throttled,
    Connection,
    Http5xx(u16),
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Throttled => write!(f, "throttled"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Http5xx(code) => write!(f, "http {code}"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Classifies an HTTP status code (donor: `retry::classify::classify_http_status`).
pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Other,
    }
}
