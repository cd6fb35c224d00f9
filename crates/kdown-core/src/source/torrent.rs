//! The torrent source (spec §4.9): magnet URI and local `.torrent` file
//! resolution, delegating the actual peer-protocol work to the injected
//! [`crate::torrent_engine::TorrentEngine`] and polling its
//! [`crate::torrent_engine::TorrentSession`] for progress exactly as the HTTP
//! source polls its segment downloaders.
//!
//! Unlike the HTTP source, this source never touches file bytes itself
//! (`manages_own_file_io() == true`, spec §4.4): the engine writes directly
//! to `save_path` under the `TorrentEngine`'s control, so there is no
//! `FileAccessor`, no segment plan, and no resegmentation loop here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::Mutex as AsyncMutex;

use crate::bencode;
use crate::error::KDownError;
use crate::filename::sanitize_filename_for_linux;
use crate::model::{DownloadProgress, ResolvedSource, SelectionMode, SourceFile, SourceResumeState, TorrentResumeData};
use crate::torrent_engine::{TorrentEngine, TorrentSession, TorrentSessionState};

use super::{DownloadContext, Source};

/// Bookkeeping for one task's live torrent session, kept so
/// [`Source::update_resume_state`] can snapshot a fresh resume blob without
/// re-deriving the save path or info hash from the context.
struct ActiveTorrent {
    session: Arc<dyn TorrentSession>,
    info_hash: String,
    save_path: PathBuf,
    total_bytes: u64,
}

/// Torrent source (spec §4.9). Holds the injected `TorrentEngine` and the
/// bounded timeout applied to `fetch_metadata` for magnet links.
pub struct TorrentSource {
    engine: Arc<dyn TorrentEngine>,
    metadata_timeout: Duration,
    sessions: AsyncMutex<HashMap<String, ActiveTorrent>>,
}

impl TorrentSource {
    pub fn new(engine: Arc<dyn TorrentEngine>, metadata_timeout: Duration) -> Self {
        Self {
            engine,
            metadata_timeout,
            sessions: AsyncMutex::new(HashMap::new()),
        }
    }

    fn save_path_for(&self, ctx: &DownloadContext, suggested_name: Option<&str>) -> PathBuf {
        let base = ctx
            .request
            .destination
            .as_ref()
            .and_then(|d| d.dir.clone())
            .unwrap_or_else(|| PathBuf::from(&ctx.config.default_directory));
        let name = suggested_name.unwrap_or(&ctx.task_id);
        base.join(sanitize_filename_for_linux(name))
    }

    /// Resolves a magnet URI by starting the engine and running a bounded
    /// metadata-exchange fetch (spec §5: "metadata fetch for torrent sources
    /// has a bounded timeout, default 120s").
    async fn resolve_magnet(&self, uri: &str) -> Result<ResolvedSource, KDownError> {
        self.engine.start().await.map_err(engine_err)?;
        let metadata = self
            .engine
            .fetch_metadata(uri, self.metadata_timeout)
            .await
            .map_err(engine_err)?;

        let mut meta = HashMap::new();
        meta.insert("infoHash".to_string(), metadata.info_hash.clone());
        meta.insert("pieceLength".to_string(), metadata.piece_length.to_string());
        if let Some(comment) = &metadata.comment {
            meta.insert("comment".to_string(), comment.clone());
        }

        Ok(ResolvedSource {
            url: uri.to_string(),
            source_type: "torrent".to_string(),
            total_bytes: metadata.total_bytes as i64,
            supports_resume: true,
            suggested_file_name: Some(metadata.name),
            max_segments: metadata.files.len().max(1),
            metadata: meta,
            selection_mode: if metadata.files.len() > 1 {
                SelectionMode::Multiple
            } else {
                SelectionMode::Single
            },
            files: metadata.files,
        })
    }

    /// Resolves a local `.torrent` file by decoding its bencoded payload
    /// directly (spec §4.9: "decode bencoded `.torrent` payload"), without
    /// needing the engine at all since every field is already in the file.
    async fn resolve_torrent_file(&self, path: &str) -> Result<ResolvedSource, KDownError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| KDownError::Disk(Some(e.into())))?;
        let value = bencode::decode(&bytes).map_err(|e| KDownError::ValidationFailed(format!("invalid .torrent file: {e}")))?;
        let dict = value
            .as_dict()
            .ok_or_else(|| KDownError::ValidationFailed(".torrent file is not a bencoded dictionary".to_string()))?;
        let info = dict
            .get(b"info".as_slice())
            .ok_or_else(|| KDownError::ValidationFailed(".torrent file has no info dict".to_string()))?;
        let info_dict = info
            .as_dict()
            .ok_or_else(|| KDownError::ValidationFailed(".torrent info is not a dictionary".to_string()))?;

        let info_hash = bencode::info_hash_hex(info);
        let name = info_dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .unwrap_or("torrent")
            .to_string();
        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_int())
            .unwrap_or(0)
            .max(0) as u64;
        let comment = dict.get(b"comment".as_slice()).and_then(|v| v.as_str()).map(str::to_string);

        let (files, total_bytes) = if let Some(length) = info_dict.get(b"length".as_slice()).and_then(|v| v.as_int()) {
            let size = length.max(0) as i64;
            (
                vec![SourceFile {
                    id: "0".to_string(),
                    name: name.clone(),
                    size,
                    metadata: HashMap::new(),
                }],
                size.max(0) as u64,
            )
        } else {
            let list = info_dict
                .get(b"files".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| KDownError::ValidationFailed(".torrent info has neither length nor files".to_string()))?;
            let mut files = Vec::with_capacity(list.len());
            let mut total = 0u64;
            for (idx, entry) in list.iter().enumerate() {
                let entry_dict = entry
                    .as_dict()
                    .ok_or_else(|| KDownError::ValidationFailed("torrent file entry is not a dictionary".to_string()))?;
                let size = entry_dict.get(b"length".as_slice()).and_then(|v| v.as_int()).unwrap_or(0).max(0) as u64;
                let path_parts = entry_dict
                    .get(b"path".as_slice())
                    .and_then(|v| v.as_list())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.as_str())
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_else(|| format!("file-{idx}"));
                total += size;
                files.push(SourceFile {
                    id: idx.to_string(),
                    name: path_parts,
                    size: size as i64,
                    metadata: HashMap::new(),
                });
            }
            (files, total)
        };

        let mut meta = HashMap::new();
        meta.insert("infoHash".to_string(), info_hash);
        meta.insert("pieceLength".to_string(), piece_length.to_string());
        if let Some(comment) = comment {
            meta.insert("comment".to_string(), comment);
        }

        Ok(ResolvedSource {
            url: path.to_string(),
            source_type: "torrent".to_string(),
            total_bytes: total_bytes as i64,
            supports_resume: true,
            suggested_file_name: Some(name),
            max_segments: files.len().max(1),
            selection_mode: if files.len() > 1 { SelectionMode::Multiple } else { SelectionMode::Single },
            metadata: meta,
            files,
        })
    }

    /// Polls `session` until every selected byte is downloaded or the task is
    /// cancelled, publishing throttled progress exactly as the HTTP source's
    /// batch publisher does (spec §4.4.2).
    async fn poll_until_complete(
        &self,
        ctx: &Arc<DownloadContext>,
        session: &Arc<dyn TorrentSession>,
        total_bytes: u64,
    ) -> Result<(), KDownError> {
        let interval_ms = ctx.config.progress_update_interval_ms.max(1);
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        let cancel_token = ctx.cancellation.child_token();
        let mut last_bytes = 0u64;
        let mut last_instant = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    let _ = session.pause().await;
                    return Err(KDownError::Canceled);
                }
                _ = ticker.tick() => {
                    let state = session.state().await.map_err(engine_err)?;
                    if state == TorrentSessionState::Error {
                        return Err(KDownError::SourceError {
                            source_type: "torrent".to_string(),
                            cause: Some(anyhow::anyhow!("torrent session entered an error state")),
                        });
                    }

                    let downloaded = session.downloaded_bytes().await.map_err(engine_err)?;
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
                    (ctx.on_progress)(DownloadProgress {
                        downloaded_bytes: downloaded.min(total_bytes),
                        total_bytes,
                        bytes_per_second: bps,
                    });

                    if total_bytes > 0 && downloaded >= total_bytes {
                        (ctx.on_progress)(DownloadProgress {
                            downloaded_bytes: total_bytes,
                            total_bytes,
                            bytes_per_second: 0,
                        });
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn start_session(
        &self,
        ctx: &Arc<DownloadContext>,
        info_hash: &str,
        save_path: PathBuf,
        selected_file_ids: &[String],
        resume_data: Option<Vec<u8>>,
        total_bytes: u64,
    ) -> Result<Arc<dyn TorrentSession>, KDownError> {
        self.engine.start().await.map_err(engine_err)?;
        let session: Arc<dyn TorrentSession> = self
            .engine
            .add_torrent(info_hash, &save_path, selected_file_ids, resume_data)
            .await
            .map_err(engine_err)?
            .into();
        self.sessions.lock().await.insert(
            ctx.task_id.clone(),
            ActiveTorrent {
                session: Arc::clone(&session),
                info_hash: info_hash.to_string(),
                save_path,
                total_bytes,
            },
        );
        Ok(session)
    }
}

fn engine_err(e: anyhow::Error) -> KDownError {
    KDownError::SourceError {
        source_type: "torrent".to_string(),
        cause: Some(e),
    }
}

#[async_trait]
impl Source for TorrentSource {
    fn source_type(&self) -> &'static str {
        "torrent"
    }

    fn manages_own_file_io(&self) -> bool {
        true
    }

    fn can_handle(&self, url: &str) -> bool {
        url.starts_with("magnet:") || url.ends_with(".torrent")
    }

    async fn resolve(&self, url: &str, _headers: &HashMap<String, String>) -> Result<ResolvedSource, KDownError> {
        if url.starts_with("magnet:") {
            self.resolve_magnet(url).await
        } else {
            self.resolve_torrent_file(url).await
        }
    }

    async fn download(&self, ctx: &Arc<DownloadContext>, resolved: &ResolvedSource) -> Result<(), KDownError> {
        let total_bytes = resolved.total_bytes_known().ok_or(KDownError::Unsupported)?;
        let info_hash = resolved
            .metadata
            .get("infoHash")
            .ok_or_else(|| KDownError::ValidationFailed("resolved torrent source is missing infoHash".to_string()))?
            .clone();
        let save_path = self.save_path_for(ctx, resolved.suggested_file_name.as_deref());
        let selected = ctx.request.selected_file_ids.clone();

        let session = self
            .start_session(ctx, &info_hash, save_path, &selected, None, total_bytes)
            .await?;
        let result = self.poll_until_complete(ctx, &session, total_bytes).await;
        self.sessions.lock().await.remove(&ctx.task_id);
        result
    }

    async fn resume(&self, ctx: &Arc<DownloadContext>, resume_state: &SourceResumeState) -> Result<(), KDownError> {
        let decoded: TorrentResumeData = serde_json::from_str(&resume_state.data).map_err(|e| KDownError::CorruptResumeState {
            msg: Some("failed to decode torrent resume payload".to_string()),
            cause: Some(anyhow::anyhow!(e)),
        })?;

        let resume_bytes = if decoded.resume_data.is_empty() {
            None
        } else {
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(&decoded.resume_data)
                    .map_err(|e| KDownError::CorruptResumeState {
                        msg: Some("torrent resume_data is not valid base64".to_string()),
                        cause: Some(anyhow::anyhow!(e)),
                    })?,
            )
        };

        let save_path = PathBuf::from(&decoded.save_path);
        let session = self
            .start_session(
                ctx,
                &decoded.info_hash,
                save_path,
                &decoded.selected_file_ids,
                resume_bytes,
                decoded.total_bytes,
            )
            .await?;
        let result = self.poll_until_complete(ctx, &session, decoded.total_bytes).await;
        self.sessions.lock().await.remove(&ctx.task_id);
        result
    }

    fn build_resume_state(&self, resolved: &ResolvedSource, total_bytes: u64) -> SourceResumeState {
        let info_hash = resolved.metadata.get("infoHash").cloned().unwrap_or_default();
        let data = TorrentResumeData {
            info_hash,
            total_bytes,
            resume_data: String::new(),
            selected_file_ids: Vec::new(),
            save_path: String::new(),
        };
        SourceResumeState {
            source_type: "torrent".to_string(),
            data: serde_json::to_string(&data).unwrap_or_default(),
        }
    }

    async fn update_resume_state(&self, ctx: &Arc<DownloadContext>) -> Option<SourceResumeState> {
        let sessions = self.sessions.lock().await;
        let active = sessions.get(&ctx.task_id)?;
        let blob = active.session.save_resume_data().await.ok()?;
        let data = TorrentResumeData {
            info_hash: active.info_hash.clone(),
            total_bytes: active.total_bytes,
            resume_data: base64::engine::general_purpose::STANDARD.encode(blob),
            selected_file_ids: ctx.request.selected_file_ids.clone(),
            save_path: active.save_path.to_string_lossy().into_owned(),
        };
        Some(SourceResumeState {
            source_type: "torrent".to_string(),
            data: serde_json::to_string(&data).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{MaxConnectionsCell, PendingResegment, TaskCancellation};
    use crate::config::EngineConfig;
    use crate::model::{DownloadRequest, Segment};
    use crate::rate_limiter::{DelegatingSpeedLimiter, SpeedLimiter};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex as TMutex;

    struct FakeSession {
        total_bytes: u64,
        downloaded: AtomicU64,
        paused: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TorrentSession for FakeSession {
        async fn downloaded_bytes(&self) -> anyhow::Result<u64> {
            Ok(self.downloaded.load(Ordering::SeqCst))
        }

        async fn state(&self) -> anyhow::Result<TorrentSessionState> {
            if self.paused.load(Ordering::SeqCst) {
                Ok(TorrentSessionState::Paused)
            } else {
                Ok(TorrentSessionState::Downloading)
            }
        }

        async fn pause(&self) -> anyhow::Result<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> anyhow::Result<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn set_file_priorities(&self, _selected_file_ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn save_resume_data(&self) -> anyhow::Result<Vec<u8>> {
            Ok(format!("resume:{}", self.downloaded.load(Ordering::SeqCst)).into_bytes())
        }
    }

    /// Completes instantly: `downloaded_bytes` reports `total_bytes` from the
    /// first poll onward, like the HTTP tests' `InstantFileAccessors` analog.
    struct InstantEngine;

    #[async_trait]
    impl TorrentEngine for InstantEngine {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch_metadata(&self, magnet_uri: &str, _timeout: Duration) -> anyhow::Result<crate::torrent_engine::TorrentMetadata> {
            let link = crate::magnet::parse_magnet(magnet_uri).ok_or_else(|| anyhow::anyhow!("bad magnet"))?;
            Ok(crate::torrent_engine::TorrentMetadata {
                info_hash: link.info_hash,
                name: link.display_name.unwrap_or_else(|| "fake".to_string()),
                piece_length: 16384,
                comment: None,
                files: vec![SourceFile {
                    id: "0".to_string(),
                    name: "fake.bin".to_string(),
                    size: 10,
                    metadata: HashMap::new(),
                }],
                total_bytes: 10,
            })
        }
        async fn add_torrent(
            &self,
            _info_hash: &str,
            _save_path: &std::path::Path,
            _selected_file_ids: &[String],
            _resume_data: Option<Vec<u8>>,
        ) -> anyhow::Result<Box<dyn TorrentSession>> {
            Ok(Box::new(FakeSession {
                total_bytes: 10,
                downloaded: AtomicU64::new(10),
                paused: std::sync::atomic::AtomicBool::new(false),
            }))
        }
        async fn remove_torrent(&self, _info_hash: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_download_rate_limit(&self, _bytes_per_sec: Option<u64>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_upload_rate_limit(&self, _bytes_per_sec: Option<u64>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Never reports completion until paused, used to exercise cancellation.
    struct HangingEngine;

    #[async_trait]
    impl TorrentEngine for HangingEngine {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch_metadata(&self, _magnet_uri: &str, _timeout: Duration) -> anyhow::Result<crate::torrent_engine::TorrentMetadata> {
            unreachable!("test does not resolve via magnet")
        }
        async fn add_torrent(
            &self,
            _info_hash: &str,
            _save_path: &std::path::Path,
            _selected_file_ids: &[String],
            _resume_data: Option<Vec<u8>>,
        ) -> anyhow::Result<Box<dyn TorrentSession>> {
            Ok(Box::new(FakeSession {
                total_bytes: 10,
                downloaded: AtomicU64::new(0),
                paused: std::sync::atomic::AtomicBool::new(false),
            }))
        }
        async fn remove_torrent(&self, _info_hash: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_download_rate_limit(&self, _bytes_per_sec: Option<u64>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_upload_rate_limit(&self, _bytes_per_sec: Option<u64>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn make_ctx(url: &str) -> Arc<DownloadContext> {
        let (max_connections, watcher) = MaxConnectionsCell::new(0);
        Arc::new(DownloadContext {
            task_id: "t1".to_string(),
            url: url.to_string(),
            request: DownloadRequest {
                url: url.to_string(),
                ..Default::default()
            },
            file_accessor: None,
            segments: Arc::new(TMutex::new(Vec::<Segment>::new())),
            on_progress: Arc::new(|_| {}),
            task_limiter: DelegatingSpeedLimiter::new(SpeedLimiter::Unlimited),
            global_limiter: DelegatingSpeedLimiter::new(SpeedLimiter::Unlimited),
            headers: HashMap::new(),
            pre_resolved: None,
            max_connections,
            max_connections_watcher: TMutex::new(watcher),
            pending_resegment: PendingResegment::new(),
            cancellation: TaskCancellation::new(),
            config: Arc::new(EngineConfig::default()),
        })
    }

    #[test]
    fn can_handle_magnet_and_torrent_file() {
        let source = TorrentSource::new(Arc::new(InstantEngine), Duration::from_secs(120));
        assert!(source.can_handle("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"));
        assert!(source.can_handle("/home/user/linux.torrent"));
        assert!(!source.can_handle("https://example.com/x"));
    }

    #[tokio::test]
    async fn resolve_magnet_reports_single_file_metadata() {
        let source = TorrentSource::new(Arc::new(InstantEngine), Duration::from_secs(120));
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=fake";
        let resolved = source.resolve(uri, &HashMap::new()).await.unwrap();
        assert_eq!(resolved.source_type, "torrent");
        assert_eq!(resolved.total_bytes, 10);
        assert!(resolved.supports_resume);
        assert_eq!(resolved.selection_mode, SelectionMode::Single);
        assert_eq!(
            resolved.metadata.get("infoHash").map(String::as_str),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
    }

    #[tokio::test]
    async fn download_completes_when_session_reports_full_bytes() {
        let source = TorrentSource::new(Arc::new(InstantEngine), Duration::from_secs(120));
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=fake";
        let ctx = make_ctx(uri);
        let resolved = source.resolve(uri, &HashMap::new()).await.unwrap();
        source.download(&ctx, &resolved).await.unwrap();
        assert!(source.sessions.lock().await.is_empty(), "session bookkeeping cleared after completion");
    }

    #[tokio::test]
    async fn cancellation_pauses_session_and_returns_canceled() {
        let source = TorrentSource::new(Arc::new(HangingEngine), Duration::from_secs(120));
        let ctx = make_ctx("/tmp/fake.torrent");
        let mut meta = HashMap::new();
        meta.insert("infoHash".to_string(), "0123456789abcdef0123456789abcdef01234567".to_string());
        let resolved = ResolvedSource {
            url: ctx.url.clone(),
            source_type: "torrent".to_string(),
            total_bytes: 10,
            supports_resume: true,
            suggested_file_name: Some("fake".to_string()),
            max_segments: 1,
            metadata: meta,
            files: Vec::new(),
            selection_mode: SelectionMode::Single,
        };

        let ctx_for_cancel = Arc::clone(&ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx_for_cancel.cancellation.cancel();
        });

        let err = source.download(&ctx, &resolved).await.unwrap_err();
        assert!(matches!(err, KDownError::Canceled));
    }

    #[tokio::test]
    async fn build_resume_state_roundtrips_info_hash_and_total_bytes() {
        let source = TorrentSource::new(Arc::new(InstantEngine), Duration::from_secs(120));
        let mut meta = HashMap::new();
        meta.insert("infoHash".to_string(), "abc".to_string());
        let resolved = ResolvedSource {
            url: "magnet:?xt=urn:btih:abc".to_string(),
            source_type: "torrent".to_string(),
            total_bytes: 10,
            supports_resume: true,
            suggested_file_name: None,
            max_segments: 1,
            metadata: meta,
            files: Vec::new(),
            selection_mode: SelectionMode::Single,
        };
        let state = source.build_resume_state(&resolved, 10);
        let decoded: TorrentResumeData = serde_json::from_str(&state.data).unwrap();
        assert_eq!(decoded.info_hash, "abc");
        assert_eq!(decoded.total_bytes, 10);
    }
}
