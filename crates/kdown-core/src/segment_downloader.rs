//! Segment downloader (spec §4.3, C3): fetches one byte range, writes it to
//! the file accessor, reports progress, and applies throttling.
//!
//! Grounded on `downloader::multi::handler::SegmentHandler` (range
//! validation against the response, write-at-offset, progress counter) and
//! `downloader::segment` (short-read / partial-transfer detection),
//! generalized from curl's synchronous `Handler::write` callback to an
//! async closure driven by the injected `HttpEngine`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::KDownError;
use crate::file_accessor::FileAccessor;
use crate::http_engine::{HttpEngine, HttpEngineError};
use crate::model::Segment;
use crate::rate_limiter::DelegatingSpeedLimiter;

/// Per-chunk progress callback: receives the segment's cumulative
/// `downloaded_bytes` after each chunk is durably written (spec §4.3).
pub type ProgressFn<'a> = dyn FnMut(u64) + Send + 'a;

/// Downloads one segment to completion (spec §4.3 contract). Returns the
/// updated segment with `downloaded_bytes == total_bytes` on success.
pub async fn download_segment(
    http: &dyn HttpEngine,
    file: &dyn FileAccessor,
    url: &str,
    mut segment: Segment,
    headers: &HashMap<String, String>,
    task_limiter: &DelegatingSpeedLimiter,
    global_limiter: &DelegatingSpeedLimiter,
    cancellation: &CancellationToken,
    on_progress: &mut ProgressFn<'_>,
) -> Result<Segment, KDownError> {
    if segment.is_complete() {
        return Ok(segment);
    }

    let expected_total = segment.total_bytes();
    let range = (segment.current_offset(), segment.end);
    let start = segment.start;

    let downloaded = Arc::new(std::sync::atomic::AtomicU64::new(segment.downloaded_bytes));

    {
        // The `HttpEngine::download` contract is synchronous-closure-shaped
        // (the donor's curl `Handler::write` precedent), but writes must be
        // async (the `FileAccessor` trait is async) and throttled. Rather
        // than blocking inside the closure, chunks are handed to a channel
        // and an async task on the other end performs the rate-limited,
        // async write. The channel is unbounded: the producer side is a
        // synchronous, non-yielding callback loop (curl's write callback
        // under `block_in_place`, or a fake engine calling straight
        // through), so it shares this task with `writer_task` and cannot be
        // relied on to interleave with it — a bounded channel's `try_send`
        // would spuriously fail as "full" once the producer outruns a
        // writer that never gets polled until the producer yields.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<bytes::Bytes>();

        let writer_task = {
            let downloaded = Arc::clone(&downloaded);
            let cancellation = cancellation.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => {
                            return Err(KDownError::Canceled);
                        }
                        chunk = rx.recv() => {
                            let Some(chunk) = chunk else { return Ok(()) };
                            task_limiter.acquire(chunk.len() as u64).await;
                            global_limiter.acquire(chunk.len() as u64).await;
                            let offset = start + downloaded.load(std::sync::atomic::Ordering::SeqCst);
                            file.write_at(offset, &chunk)
                                .await
                                .map_err(|e| KDownError::Disk(Some(e)))?;
                            let new_total = downloaded.fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::SeqCst) + chunk.len() as u64;
                            on_progress(new_total);
                        }
                    }
                }
            }
        };

        let download_fut = http.download(url, Some(range), headers, &mut move |chunk| {
            tx.send(chunk)
                .map_err(|e| HttpEngineError::Network(anyhow::anyhow!("segment channel: {e}")))
        });

        let (writer_res, download_res) = tokio::join!(writer_task, download_fut);
        writer_res?;
        if let Err(e) = download_res {
            return Err(map_http_engine_error(e));
        }
    }

    let final_downloaded = downloaded.load(std::sync::atomic::Ordering::SeqCst);
    if final_downloaded < expected_total {
        return Err(KDownError::Network(Some(anyhow::anyhow!(
            "short read: expected {expected_total} bytes, got {final_downloaded}"
        ))));
    }

    segment.downloaded_bytes = final_downloaded;
    Ok(segment)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_accessor::InMemoryFileAccessor;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct EchoHttpEngine {
        body: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl HttpEngine for EchoHttpEngine {
        async fn head(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<crate::http_engine::ServerInfo, HttpEngineError> {
            unimplemented!("not exercised by this test")
        }

        async fn download(
            &self,
            _url: &str,
            range: Option<(u64, u64)>,
            _headers: &HashMap<String, String>,
            on_chunk: &mut (dyn FnMut(bytes::Bytes) -> Result<(), HttpEngineError> + Send),
        ) -> Result<(), HttpEngineError> {
            let (start, end) = range.unwrap();
            let slice = &self.body[start as usize..=end as usize];
            for chunk in slice.chunks(4) {
                on_chunk(bytes::Bytes::copy_from_slice(chunk))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn downloads_full_segment_and_reports_progress() {
        let body: Vec<u8> = (0u8..100).collect();
        let http = EchoHttpEngine { body: body.clone() };
        let file = InMemoryFileAccessor::new();
        file.preallocate(100).await.unwrap();

        let segment = Segment {
            index: 0,
            start: 10,
            end: 49,
            downloaded_bytes: 0,
        };

        let task_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let global_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let cancellation = CancellationToken::new();

        let last_progress = Arc::new(AtomicU64::new(0));
        let last_progress_clone = Arc::clone(&last_progress);
        let mut on_progress = move |n: u64| {
            last_progress_clone.store(n, Ordering::SeqCst);
        };

        let result = download_segment(
            &http,
            &file,
            "http://example/",
            segment,
            &HashMap::new(),
            &task_limiter,
            &global_limiter,
            &cancellation,
            &mut on_progress,
        )
        .await
        .unwrap();

        assert!(result.is_complete());
        assert_eq!(last_progress.load(Ordering::SeqCst), 40);
        let written = file.read_at(10, 40).await.unwrap();
        assert_eq!(written, body[10..50]);
    }

    #[tokio::test]
    async fn already_complete_segment_returns_immediately() {
        let http = EchoHttpEngine { body: vec![] };
        let file = InMemoryFileAccessor::new();
        let segment = Segment {
            index: 0,
            start: 0,
            end: 9,
            downloaded_bytes: 10,
        };
        let task_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let global_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let cancellation = CancellationToken::new();
        let mut on_progress = |_n: u64| panic!("should not be called");
        let result = download_segment(
            &http,
            &file,
            "http://example/",
            segment,
            &HashMap::new(),
            &task_limiter,
            &global_limiter,
            &cancellation,
            &mut on_progress,
        )
        .await
        .unwrap();
        assert_eq!(result, segment);
    }

    #[tokio::test]
    async fn cancellation_propagates_unchanged() {
        let http = EchoHttpEngine {
            body: vec![0u8; 100],
        };
        let file = InMemoryFileAccessor::new();
        file.preallocate(100).await.unwrap();
        let segment = Segment {
            index: 0,
            start: 0,
            end: 99,
            downloaded_bytes: 0,
        };
        let task_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let global_limiter = DelegatingSpeedLimiter::new(crate::rate_limiter::SpeedLimiter::Unlimited);
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let mut on_progress = |_n: u64| {};
        let result = download_segment(
            &http,
            &file,
            "http://example/",
            segment,
            &HashMap::new(),
            &task_limiter,
            &global_limiter,
            &cancellation,
            &mut on_progress,
        )
        .await;
        assert!(matches!(result, Err(KDownError::Canceled)));
    }
}
