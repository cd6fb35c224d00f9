//! The HTTP source (spec §4.4.1, §4.4.2): range detection, segment
//! calculation, parallel range fetches, integrity validation on resume,
//! rate-limit adaptation, and live resegmentation.
//!
//! Grounded on the donor's `fetch_head` (HEAD probe → `HeadResult`) and
//! `scheduler::execute` (segment planning, the download-then-finalize
//! shape), generalized from synchronous curl calls to the injected
//! [`crate::http_engine::HttpEngine`] and from a fixed connection count to
//! the live-resegmentation loop spec §4.4.2 requires, which the donor has
//! no counterpart for at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::KDownError;
use crate::filename;
use crate::http_engine::{HttpEngine, HttpEngineError, ServerInfo};
use crate::model::{HttpResumeData, ResolvedSource, SelectionMode, Segment, SourceResumeState};
use crate::segment_calc::{calculate_segments, resegment, single_segment};
use crate::segment_downloader::download_segment;

use super::{DownloadContext, Source};

/// HTTP/HTTPS source (spec §4.4.1). Holds the injected `HttpEngine` and the
/// engine-wide default per-task connection count (used when `resolve`
/// computes `maxSegments` and when `download` falls back to the engine
/// default).
pub struct HttpSource {
    http: Arc<dyn HttpEngine>,
    engine_max_connections: usize,
}

impl HttpSource {
    pub fn new(http: Arc<dyn HttpEngine>, engine_max_connections: usize) -> Self {
        Self {
            http,
            engine_max_connections: engine_max_connections.max(1),
        }
    }

    fn build_metadata(info: &ServerInfo, supports_resume: bool) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(etag) = &info.etag {
            metadata.insert("etag".to_string(), etag.clone());
        }
        if let Some(lm) = &info.last_modified {
            metadata.insert("lastModified".to_string(), lm.clone());
        }
        if supports_resume {
            metadata.insert("acceptRanges".to_string(), "true".to_string());
        }
        if let Some(r) = info.rate_limit_remaining {
            metadata.insert("rateLimitRemaining".to_string(), r.to_string());
        }
        if let Some(r) = info.rate_limit_reset {
            metadata.insert("rateLimitReset".to_string(), r.to_string());
        }
        if let Some(cd) = &info.content_disposition {
            metadata.insert("contentDisposition".to_string(), cd.clone());
        }
        metadata
    }

    /// Determines the connection count to drive this attempt with (spec
    /// §4.4.1 download step 1).
    fn effective_connection_count(&self, ctx: &DownloadContext) -> usize {
        let live = ctx.max_connections.get();
        if live > 0 {
            live
        } else if ctx.request.connections > 0 {
            ctx.request.connections
        } else {
            self.engine_max_connections
        }
    }

    /// Applies the server's rate-limit headers to a candidate connection
    /// count (spec §4.4.1 download step 2). Returns the (possibly delayed,
    /// possibly capped) effective count.
    async fn apply_rate_limit_cap(&self, metadata: &HashMap<String, String>, effective: usize) -> usize {
        let Some(remaining) = metadata.get("rateLimitRemaining").and_then(|s| s.parse::<u64>().ok()) else {
            return effective;
        };
        if remaining == 0 {
            let reset = metadata
                .get("rateLimitReset")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1)
                .max(1);
            tokio::time::sleep(Duration::from_secs(reset)).await;
            return effective;
        }
        if remaining < effective as u64 {
            return (remaining.max(1)) as usize;
        }
        effective
    }

    async fn segmented_download_loop(&self, ctx: &Arc<DownloadContext>, total_bytes: u64) -> Result<(), KDownError> {
        loop {
            let all_complete = ctx.segments.lock().await.iter().all(Segment::is_complete);
            if all_complete {
                break;
            }
            let completed_naturally = self.run_batch(ctx, total_bytes).await?;
            if completed_naturally {
                break;
            }
            let n = ctx
                .pending_resegment
                .take()
                .unwrap_or_else(|| ctx.max_connections.get().max(1));
            let mut segments = ctx.segments.lock().await;
            *segments = resegment(&segments, n.max(1));
        }
        (ctx.on_progress)(crate::model::DownloadProgress {
            downloaded_bytes: total_bytes,
            total_bytes,
            bytes_per_second: 0,
        });
        Ok(())
    }

    /// Downloads every currently-incomplete segment concurrently, watching
    /// for a live connection-count change (spec §4.4.2 "Batch protocol").
    /// Returns `Ok(true)` if every segment completed naturally, `Ok(false)`
    /// if the batch was cancelled to resegment.
    async fn run_batch(&self, ctx: &Arc<DownloadContext>, total_bytes: u64) -> Result<bool, KDownError> {
        let batch_cancel = ctx.cancellation.child_token();

        let initial = ctx.segments.lock().await.clone();
        let incomplete: Vec<Segment> = initial.iter().copied().filter(|s| !s.is_complete()).collect();
        if incomplete.is_empty() {
            return Ok(true);
        }
        let conn_count = incomplete.len();

        let progress_counters: Arc<tokio::sync::Mutex<HashMap<usize, u64>>> = Arc::new(tokio::sync::Mutex::new(
            initial.iter().map(|s| (s.index, s.downloaded_bytes)).collect(),
        ));

        let mut set = tokio::task::JoinSet::new();
        for seg in incomplete {
            let http = Arc::clone(&self.http);
            let file = Arc::clone(ctx.file_accessor()?);
            let url = ctx.url.clone();
            let headers = ctx.headers.clone();
            let task_limiter = ctx.task_limiter.clone();
            let global_limiter = ctx.global_limiter.clone();
            let token = batch_cancel.clone();
            let counters = Arc::clone(&progress_counters);
            let idx = seg.index;
            set.spawn(async move {
                let mut on_progress = move |downloaded: u64| {
                    if let Ok(mut c) = counters.try_lock() {
                        c.insert(idx, downloaded);
                    }
                };
                let result = download_segment(
                    http.as_ref(),
                    file.as_ref(),
                    &url,
                    seg,
                    &headers,
                    &task_limiter,
                    &global_limiter,
                    &token,
                    &mut on_progress,
                )
                .await;
                (idx, result)
            });
        }

        let publisher = spawn_progress_publisher(ctx, Arc::clone(&progress_counters), total_bytes, batch_cancel.clone());
        let saver = spawn_segment_saver(ctx, Arc::clone(&progress_counters), batch_cancel.clone());
        let watcher = spawn_resegment_watcher(ctx, conn_count, batch_cancel.clone());

        let mut first_error: Option<KDownError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(updated))) => {
                    let mut segments = ctx.segments.lock().await;
                    if let Some(s) = segments.iter_mut().find(|s| s.index == idx) {
                        *s = updated;
                    }
                }
                Ok((_, Err(KDownError::Canceled))) => {}
                Ok((_, Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        batch_cancel.cancel();
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(KDownError::Unknown(Some(anyhow::anyhow!(join_err))));
                        batch_cancel.cancel();
                    }
                }
            }
        }

        publisher.abort();
        saver.abort();
        watcher.abort();

        if let Some(e) = first_error {
            return Err(e);
        }
        if ctx.pending_resegment.peek().is_some() {
            return Ok(false);
        }
        if ctx.cancellation.is_cancelled() {
            return Err(KDownError::Canceled);
        }
        Ok(true)
    }
}

fn spawn_progress_publisher(
    ctx: &Arc<DownloadContext>,
    counters: Arc<tokio::sync::Mutex<HashMap<usize, u64>>>,
    total_bytes: u64,
    batch_cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    let interval_ms = ctx.config.progress_update_interval_ms.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut last_bytes = 0u64;
        let mut last_instant = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = batch_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let downloaded: u64 = counters.lock().await.values().sum();
                    let now = tokio::time::Instant::now();
                    let elapsed = now.saturating_duration_since(last_instant);
                    let bps = if elapsed.as_millis() >= 500 {
                        let delta = downloaded.saturating_sub(last_bytes);
                        let bps = (delta as f64 * 1000.0 / elapsed.as_millis() as f64) as u64;
                        last_bytes = downloaded;
                        last_instant = now;
                        bps
                    } else {
                        0
                    };
                    (ctx.on_progress)(crate::model::DownloadProgress {
                        downloaded_bytes: downloaded,
                        total_bytes,
                        bytes_per_second: bps,
                    });
                }
            }
        }
    })
}

fn spawn_segment_saver(
    ctx: &Arc<DownloadContext>,
    counters: Arc<tokio::sync::Mutex<HashMap<usize, u64>>>,
    batch_cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    let interval_ms = ctx.config.segment_save_interval_ms.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = batch_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let snapshot = counters.lock().await.clone();
                    let mut segments = ctx.segments.lock().await;
                    for seg in segments.iter_mut() {
                        if let Some(&downloaded) = snapshot.get(&seg.index) {
                            seg.downloaded_bytes = downloaded;
                        }
                    }
                }
            }
        }
    })
}

fn spawn_resegment_watcher(
    ctx: &Arc<DownloadContext>,
    current: usize,
    batch_cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut watcher = ctx.max_connections_watcher.lock().await;
        tokio::select! {
            _ = batch_cancel.cancelled() => {}
            new_count = watcher.wait_for_change(current) => {
                ctx.pending_resegment.set(new_count);
                batch_cancel.cancel();
            }
        }
    })
}

fn map_http_engine_error(e: HttpEngineError) -> KDownError {
    match e {
        HttpEngineError::Network(cause) => KDownError::Network(Some(cause)),
        HttpEngineError::Http {
            code,
            message,
            retry_after_seconds,
            rate_limit_remaining,
        } => KDownError::Http {
            code,
            message,
            retry_after_seconds,
            rate_limit_remaining,
        },
    }
}

#[async_trait]
impl Source for HttpSource {
    fn source_type(&self) -> &'static str {
        "http"
    }

    fn can_handle(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn resolve(&self, url: &str, headers: &HashMap<String, String>) -> Result<ResolvedSource, KDownError> {
        let info = self.http.head(url, headers).await.map_err(map_http_engine_error)?;
        let supports_resume = info.accept_ranges && info.content_length.is_some_and(|n| n > 0);
        let suggested_file_name = filename::derive_filename(url, info.content_disposition.as_deref());
        let max_segments = if supports_resume { self.engine_max_connections } else { 1 };

        Ok(ResolvedSource {
            url: url.to_string(),
            source_type: "http".to_string(),
            total_bytes: info.content_length.map(|n| n as i64).unwrap_or(-1),
            supports_resume,
            suggested_file_name: Some(suggested_file_name),
            max_segments: max_segments.max(1),
            metadata: Self::build_metadata(&info, supports_resume),
            files: Vec::new(),
            selection_mode: SelectionMode::Single,
        })
    }

    async fn download(&self, ctx: &Arc<DownloadContext>, resolved: &ResolvedSource) -> Result<(), KDownError> {
        let total_bytes = resolved.total_bytes_known().ok_or(KDownError::Unsupported)?;

        let requested = self.effective_connection_count(ctx);
        let effective = self.apply_rate_limit_cap(&resolved.metadata, requested).await;
        ctx.max_connections.set(effective.max(1));

        let existing = ctx.segments.lock().await.clone();
        let has_progress = existing.iter().any(|s| s.downloaded_bytes > 0);
        let plan = if has_progress {
            resegment(&existing, effective.max(1))
        } else if resolved.supports_resume && effective > 1 {
            calculate_segments(total_bytes, effective.min(total_bytes.max(1) as usize).max(1))
        } else {
            single_segment(total_bytes)
        };

        if existing.is_empty() {
            if let Ok(file) = ctx.file_accessor() {
                file.preallocate(total_bytes)
                    .await
                    .map_err(|e| KDownError::Disk(Some(e)))?;
            }
        }
        *ctx.segments.lock().await = plan;

        self.segmented_download_loop(ctx, total_bytes).await
    }

    async fn resume(&self, ctx: &Arc<DownloadContext>, resume_state: &SourceResumeState) -> Result<(), KDownError> {
        let decoded: HttpResumeData = serde_json::from_str(&resume_state.data)
            .map_err(|e| KDownError::CorruptResumeState {
                msg: Some("failed to decode HTTP resume payload".to_string()),
                cause: Some(anyhow::anyhow!(e)),
            })?;

        let info = self.http.head(&ctx.url, &ctx.headers).await.map_err(map_http_engine_error)?;

        if let (Some(persisted), Some(server)) = (&decoded.etag, &info.etag) {
            if persisted != server {
                return Err(KDownError::ValidationFailed("ETag mismatch between persisted and server state".into()));
            }
        }
        if let (Some(persisted), Some(server)) = (&decoded.last_modified, &info.last_modified) {
            if persisted != server {
                return Err(KDownError::ValidationFailed(
                    "Last-Modified mismatch between persisted and server state".into(),
                ));
            }
        }

        let total_bytes = decoded.total_bytes;
        let effective = self.effective_connection_count(ctx).max(1);
        ctx.max_connections.set(effective);

        let mut segments = ctx.segments.lock().await.clone();
        let incomplete_count = segments.iter().filter(|s| !s.is_complete()).count();
        if incomplete_count != effective {
            segments = resegment(&segments, effective);
        }

        if let Ok(file) = ctx.file_accessor() {
            let file_size = file.size().await.map_err(|e| KDownError::Disk(Some(e)))?;
            let sum_downloaded: u64 = segments.iter().map(|s| s.downloaded_bytes).sum();
            if file_size < sum_downloaded || file_size < total_bytes {
                file.preallocate(total_bytes).await.map_err(|e| KDownError::Disk(Some(e)))?;
                for seg in segments.iter_mut() {
                    seg.downloaded_bytes = 0;
                }
            }
        }
        *ctx.segments.lock().await = segments;

        self.segmented_download_loop(ctx, total_bytes).await
    }

    fn build_resume_state(&self, resolved: &ResolvedSource, total_bytes: u64) -> SourceResumeState {
        let data = HttpResumeData {
            etag: resolved.metadata.get("etag").cloned(),
            last_modified: resolved.metadata.get("lastModified").cloned(),
            total_bytes,
        };
        SourceResumeState {
            source_type: "http".to_string(),
            data: serde_json::to_string(&data).unwrap_or_default(),
        }
    }
}
