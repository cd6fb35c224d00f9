//! Download execution (spec §4.4.3/§4.4.4, C6): drives one task's fresh or
//! resume attempt through a `Source` to completion, including the retry
//! policy and output-path resolution.
//!
//! The donor's closest counterpart is `scheduler::execute::run_job`, which
//! inlines HEAD, preallocate, the curl multi loop, and retry in one
//! function. This module splits the same sequence into a standalone,
//! source-agnostic driver: resolving output paths and sources is generic
//! (spec §4.4.3), while the actual transfer is delegated to whichever
//! `Source` the task resolves to (spec §4.4).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::{MaxConnectionsCell, MaxConnectionsWatcher, PendingResegment, TaskCancellation};
use crate::config::EngineConfig;
use crate::error::KDownError;
use crate::file_accessor::FileAccessorFactory;
use crate::filename::{derive_filename, unique_path_among_existing};
use crate::model::{Destination, DownloadProgress, DownloadRequest, DownloadState, ResolvedSource, Segment, TaskRecord, TaskState};
use crate::rate_limiter::DelegatingSpeedLimiter;
use crate::source::{DownloadContext, ProgressCallback, SourceResolver};
use crate::task_store::TaskStore;

/// Collaborators an execution attempt needs, owned by the coordinator and
/// handed down per attempt (spec §4.4.3).
pub struct ExecutionDeps {
    pub resolver: Arc<SourceResolver>,
    pub task_store: Arc<dyn TaskStore>,
    pub file_accessors: Arc<dyn FileAccessorFactory>,
    pub config: Arc<EngineConfig>,
}

/// Whether this attempt starts fresh or continues a persisted record (spec
/// §4.4.3 "Resume path" vs "Fresh path").
pub enum AttemptKind {
    Fresh,
    Resume(TaskRecord),
}

/// Drives one task to completion, failure, or cancellation.
///
/// On success, the `TaskRecord` is persisted as `COMPLETED` and `Ok(path)` is
/// returned. On a real failure (retries exhausted or non-retryable), the
/// record is persisted as `FAILED` and the partial file is deleted (spec
/// §4.4.3: "delete the partial file" only applies when the final state is
/// neither `Paused`/`Queued`/`Canceled` nor `Completed` — in practice,
/// `Failed`). On cancellation, neither the record nor the partial file is
/// touched here: the caller (coordinator) decides whether the task settles
/// into `Paused`, `Queued`, or `Canceled` and persists accordingly.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    task_id: &str,
    request: &DownloadRequest,
    kind: AttemptKind,
    deps: &ExecutionDeps,
    state_tx: &tokio::sync::watch::Sender<DownloadState>,
    segments: Arc<AsyncMutex<Vec<Segment>>>,
    cancellation: TaskCancellation,
    max_connections: MaxConnectionsCell,
    max_connections_watcher: MaxConnectionsWatcher,
    pending_resegment: PendingResegment,
    task_limiter: DelegatingSpeedLimiter,
    global_limiter: DelegatingSpeedLimiter,
) -> Result<PathBuf, KDownError> {
    let (source, resolved, output_path, mut resume_state, initial_segments) = match kind {
        AttemptKind::Fresh => {
            let source = match &request.resolved_source {
                Some(pre) => deps.resolver.by_type(&pre.source_type)?,
                None => deps.resolver.resolve_for_url(&request.url)?,
            };
            let resolved = match &request.resolved_source {
                Some(pre) => pre.clone(),
                None => source.resolve(&request.url, &request.headers).await?,
            };
            let output_path = resolve_output_path(
                request.destination.as_ref(),
                &deps.config,
                resolved.suggested_file_name.as_deref(),
            );
            let now = Utc::now();
            let record = TaskRecord {
                task_id: task_id.to_string(),
                request_url: request.url.clone(),
                output_path: Some(output_path.clone()),
                state: TaskState::Downloading,
                total_bytes: resolved.total_bytes,
                downloaded_bytes: 0,
                accept_ranges: Some(resolved.supports_resume),
                etag: resolved.metadata.get("etag").cloned(),
                last_modified: resolved.metadata.get("last_modified").cloned(),
                segments: None,
                source_type: Some(resolved.source_type.clone()),
                source_resume_state: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            deps.task_store.save(record).await.map_err(KDownError::from_anyhow)?;
            (source, resolved, output_path, None, Vec::new())
        }
        AttemptKind::Resume(record) => {
            let source_type = record
                .source_type
                .clone()
                .ok_or_else(|| KDownError::CorruptResumeState {
                    msg: Some("missing source_type".into()),
                    cause: None,
                })?;
            let source = deps.resolver.by_type(&source_type)?;
            let persisted_path = record
                .output_path
                .clone()
                .ok_or_else(|| KDownError::CorruptResumeState {
                    msg: Some("missing output_path".into()),
                    cause: None,
                })?;
            // `resume(handle, destination?)` may redirect the output; an
            // explicit destination overrides the persisted path outright
            // (no collision probe, since the file already exists there).
            let output_path = match &request.destination {
                Some(dest) if dest.absolute_path.is_some() => dest.absolute_path.clone().unwrap(),
                Some(dest) if dest.dir.is_some() || dest.name.is_some() => {
                    let dir = dest.dir.clone().unwrap_or_else(|| {
                        persisted_path.parent().map(|p| p.to_path_buf()).unwrap_or_default()
                    });
                    let name = dest
                        .name
                        .clone()
                        .or_else(|| persisted_path.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .unwrap_or_else(|| "download".to_string());
                    dir.join(name)
                }
                _ => persisted_path,
            };
            let resolved = ResolvedSource {
                url: request.url.clone(),
                source_type: source_type.clone(),
                total_bytes: record.total_bytes,
                supports_resume: record.accept_ranges.unwrap_or(false),
                suggested_file_name: output_path.file_name().map(|n| n.to_string_lossy().into_owned()),
                max_segments: request.connections.max(1),
                metadata: Default::default(),
                files: Vec::new(),
                selection_mode: crate::model::SelectionMode::Single,
            };
            let resume_state = record.source_resume_state.clone().ok_or_else(|| KDownError::CorruptResumeState {
                msg: Some("missing source_resume_state".into()),
                cause: None,
            })?;
            let initial_segments = record.segments.clone().unwrap_or_default();
            (source, resolved, output_path, Some(resume_state), initial_segments)
        }
    };

    if resolved.total_bytes < 0 {
        return Err(KDownError::Unsupported);
    }

    if resolved.total_bytes == 0 {
        let accessor = deps.file_accessors.create(&output_path).await.map_err(disk_err)?;
        accessor.flush().await.map_err(disk_err)?;
        accessor.close().await.map_err(disk_err)?;
        finalize_completed(deps, task_id, &output_path, 0, &*source, &resolved).await?;
        return Ok(output_path);
    }

    let file_accessor = if source.manages_own_file_io() {
        None
    } else if resume_state.is_some() {
        Some(deps.file_accessors.open_existing(&output_path).await.map_err(disk_err)?)
    } else {
        Some(deps.file_accessors.create(&output_path).await.map_err(disk_err)?)
    };

    {
        let mut guard = segments.lock().await;
        *guard = initial_segments;
    }

    let state_tx_progress = state_tx.clone();
    let on_progress: ProgressCallback = Arc::new(move |progress: DownloadProgress| {
        let _ = state_tx_progress.send(DownloadState::Downloading(progress));
    });

    let ctx = Arc::new(DownloadContext {
        task_id: task_id.to_string(),
        url: resolved.url.clone(),
        request: request.clone(),
        file_accessor,
        segments,
        on_progress,
        task_limiter,
        global_limiter,
        headers: request.headers.clone(),
        pre_resolved: Some(resolved.clone()),
        max_connections,
        max_connections_watcher: AsyncMutex::new(max_connections_watcher),
        pending_resegment,
        cancellation: cancellation.clone(),
        config: Arc::clone(&deps.config),
    });

    let saver = spawn_periodic_snapshot(
        Arc::clone(&ctx),
        Arc::clone(&source),
        Arc::clone(&deps.task_store),
        deps.config.segment_save_interval_ms,
    );

    let mut retry_count = 0u32;
    let result: Result<(), KDownError> = loop {
        let attempt = match resume_state.take() {
            Some(rs) => source.resume(&ctx, &rs).await,
            None => source.download(&ctx, &resolved).await,
        };

        match attempt {
            Ok(()) => break Ok(()),
            Err(KDownError::Canceled) => break Err(KDownError::Canceled),
            Err(e) => {
                if !e.is_retryable() || retry_count >= deps.config.retry_count {
                    break Err(e);
                }
                retry_count += 1;

                if let KDownError::Http {
                    code: 429,
                    rate_limit_remaining,
                    ..
                } = &e
                {
                    let current = ctx.max_connections.get().max(request.connections).max(1);
                    let reduced = match rate_limit_remaining {
                        Some(r) if (*r as usize) < current && *r > 0 => *r as usize,
                        _ => (current / 2).max(1),
                    };
                    ctx.max_connections.set(reduced);
                }

                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| Duration::from_millis(deps.config.retry_delay_ms * 2u64.pow(retry_count - 1)));

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation_wait(&cancellation) => break Err(KDownError::Canceled),
                }
            }
        }
    };

    saver.abort();

    match result {
        Ok(()) => {
            if let Some(accessor) = &ctx.file_accessor {
                accessor.flush().await.map_err(disk_err)?;
                accessor.close().await.map_err(disk_err)?;
            }
            finalize_completed(deps, task_id, &output_path, resolved.total_bytes.max(0) as u64, &*source, &resolved).await?;
            Ok(output_path)
        }
        Err(KDownError::Canceled) => {
            if let Some(accessor) = &ctx.file_accessor {
                let _ = accessor.flush().await;
                let _ = accessor.close().await;
            }
            Err(KDownError::Canceled)
        }
        Err(e) => {
            if let Some(accessor) = &ctx.file_accessor {
                let _ = accessor.close().await;
                let _ = accessor.delete().await;
            }
            if let Ok(Some(mut record)) = deps.task_store.load(task_id).await {
                record.state = TaskState::Failed;
                record.error_message = Some(e.user_message());
                record.updated_at = Utc::now();
                let _ = deps.task_store.save(record).await;
            }
            Err(e)
        }
    }
}

fn disk_err(e: anyhow::Error) -> KDownError {
    KDownError::Disk(Some(e))
}

async fn cancellation_wait(cancellation: &TaskCancellation) {
    // `CancellationToken` exposes an async `cancelled()` future; `TaskCancellation`
    // only exposes the sync predicate plus child tokens, so poll it directly
    // through a child token (cancelled whenever the parent is).
    cancellation.child_token().cancelled().await
}

async fn finalize_completed(
    deps: &ExecutionDeps,
    task_id: &str,
    output_path: &std::path::Path,
    total_bytes: u64,
    source: &(impl crate::source::Source + ?Sized),
    resolved: &ResolvedSource,
) -> Result<(), KDownError> {
    let resume_state = source.build_resume_state(resolved, total_bytes);
    let now = Utc::now();
    let record = if let Ok(Some(mut existing)) = deps.task_store.load(task_id).await {
        existing.state = TaskState::Completed;
        existing.output_path = Some(output_path.to_path_buf());
        existing.downloaded_bytes = total_bytes;
        existing.segments = None;
        existing.source_resume_state = Some(resume_state);
        existing.error_message = None;
        existing.updated_at = now;
        existing
    } else {
        TaskRecord {
            task_id: task_id.to_string(),
            output_path: Some(output_path.to_path_buf()),
            state: TaskState::Completed,
            total_bytes: total_bytes as i64,
            downloaded_bytes: total_bytes,
            segments: None,
            source_type: Some(resolved.source_type.clone()),
            source_resume_state: Some(resume_state),
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    };
    deps.task_store.save(record).await.map_err(KDownError::from_anyhow)
}

/// Periodically snapshots in-flight segments (and the source's own resume
/// blob, when it has one) to the task store so a crash or pause loses at
/// most `segment_save_interval_ms` of progress (spec §4.4.2's saver subtask
/// keeps this in memory only; this complements it with durable persistence,
/// and keeps `TaskRecord.source_resume_state` fresh enough that a paused
/// task can actually resume rather than only a completed one).
fn spawn_periodic_snapshot(
    ctx: Arc<DownloadContext>,
    source: Arc<dyn crate::source::Source>,
    task_store: Arc<dyn TaskStore>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(interval_ms.max(1));
        loop {
            tokio::time::sleep(interval).await;
            let snapshot = ctx.segments.lock().await.clone();
            let downloaded: u64 = snapshot.iter().map(|s| s.downloaded_bytes).sum();
            let resume_state = source.update_resume_state(&ctx).await;
            if let Ok(Some(mut record)) = task_store.load(&ctx.task_id).await {
                record.segments = Some(snapshot);
                record.downloaded_bytes = downloaded;
                if let Some(resume_state) = resume_state {
                    record.source_resume_state = Some(resume_state);
                }
                record.updated_at = Utc::now();
                let _ = task_store.save(record).await;
            }
        }
    })
}

/// Resolves the final output path (spec §4.4.3 step 4):
/// 1. `destination.absolute_path`, if set, wins outright.
/// 2. Otherwise `dir ?? config.default_directory` joined with
///    `name ?? suggested_file_name ?? "download"`.
/// 3. Local filesystem paths that already exist get a `" (n)"` suffix
///    before the extension; this does not apply to destinations that look
///    like a `scheme://` target.
pub fn resolve_output_path(destination: Option<&Destination>, config: &EngineConfig, suggested_file_name: Option<&str>) -> PathBuf {
    if let Some(dest) = destination {
        if let Some(abs) = &dest.absolute_path {
            return abs.clone();
        }
    }

    let dir = destination
        .and_then(|d| d.dir.clone())
        .unwrap_or_else(|| PathBuf::from(&config.default_directory));

    let name = destination
        .and_then(|d| d.name.clone())
        .unwrap_or_else(|| derive_filename_or_default(suggested_file_name));

    let candidate = dir.join(name);

    if candidate.to_string_lossy().contains("://") {
        candidate
    } else {
        unique_path_among_existing(&candidate)
    }
}

fn derive_filename_or_default(suggested_file_name: Option<&str>) -> String {
    match suggested_file_name {
        Some(name) => {
            let sanitized = crate::filename::sanitize_filename_for_linux(name);
            if sanitized.is_empty() {
                "download".to_string()
            } else {
                sanitized
            }
        }
        None => derive_filename("", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Destination;

    #[test]
    fn output_path_absolute_wins() {
        let config = EngineConfig::default();
        let dest = Destination {
            absolute_path: Some(PathBuf::from("/tmp/explicit.bin")),
            dir: Some(PathBuf::from("/ignored")),
            name: Some("ignored.bin".into()),
        };
        let path = resolve_output_path(Some(&dest), &config, Some("suggested.bin"));
        assert_eq!(path, PathBuf::from("/tmp/explicit.bin"));
    }

    #[test]
    fn output_path_falls_back_to_default_directory_and_suggested_name() {
        let config = EngineConfig::default();
        let path = resolve_output_path(None, &config, Some("archive.zip"));
        assert_eq!(path, PathBuf::from("downloads/archive.zip"));
    }

    #[test]
    fn output_path_dir_override_with_suggested_name() {
        let config = EngineConfig::default();
        let dest = Destination {
            absolute_path: None,
            dir: Some(PathBuf::from("/data")),
            name: None,
        };
        let path = resolve_output_path(Some(&dest), &config, Some("file.iso"));
        assert_eq!(path, PathBuf::from("/data/file.iso"));
    }

    #[test]
    fn output_path_avoids_collision_on_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dup.bin"), b"x").unwrap();
        let config = EngineConfig {
            default_directory: dir.path().to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let path = resolve_output_path(None, &config, Some("dup.bin"));
        assert_eq!(path, dir.path().join("dup (1).bin"));
    }
}
