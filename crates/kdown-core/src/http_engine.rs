//! The `HttpEngine` collaborator interface (spec §6): the HTTP transport
//! implementation is consumed, not owned. `source::http` depends only on
//! this trait.
//!
//! `fetch_head::probe` (a free function wrapping blocking `curl::easy::Easy`)
//! plus the segment-level transfer code under `downloader::multi` and
//! `downloader::single` are folded here into one async trait so
//! `source::http` can be written once against a collaborator instead of
//! against curl directly; a reference implementation bridging the same curl
//! calls through `spawn_blocking` is provided under the `curl-http-engine`
//! feature (spec `SPEC_FULL.md` A.6).

use std::collections::HashMap;

use async_trait::async_trait;

/// Metadata returned by a HEAD-equivalent probe (spec §6).
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
    pub rate_limit_remaining: Option<u64>,
    pub rate_limit_reset: Option<u64>,
}

/// Errors an `HttpEngine` implementation can surface (spec §6). Distinct
/// from `KDownError` — this is the collaborator boundary; `source::http`
/// maps these into `KDownError` at the edge, mirroring the split between
/// `retry::SegmentError` (transport-local) and the CLI-facing error type.
#[derive(Debug, thiserror::Error)]
pub enum HttpEngineError {
    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),

    #[error("http {code}")]
    Http {
        code: u16,
        message: Option<String>,
        retry_after_seconds: Option<u64>,
        rate_limit_remaining: Option<u64>,
    },
}

/// A chunk of response body bytes delivered by `download`.
pub type ChunkResult = Result<bytes::Bytes, HttpEngineError>;

/// The pluggable HTTP transport (spec §6). `source::http` and
/// `segment_downloader` depend on this trait exclusively; the engine never
/// constructs sockets itself.
#[async_trait]
pub trait HttpEngine: Send + Sync {
    /// Performs a HEAD-equivalent probe.
    async fn head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ServerInfo, HttpEngineError>;

    /// Streams the body (optionally ranged) to `on_chunk`, returning once the
    /// transfer completes or an error occurs. `range` is an inclusive
    /// `(start, end)` byte pair when present.
    async fn download(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        headers: &HashMap<String, String>,
        on_chunk: &mut (dyn FnMut(bytes::Bytes) -> Result<(), HttpEngineError> + Send),
    ) -> Result<(), HttpEngineError>;
}

/// Reference `curl-http-engine` implementation, directly adapted from
/// `fetch_head::probe` (`head`) and
/// `downloader::segment::download_one_segment` (`download`), generalized
/// from writing straight to a `StorageWriter` to streaming chunks through the
/// `on_chunk` callback `source::http`/`segment_downloader` expect.
///
/// `head` has no borrowed state to cross a thread boundary, so it runs on
/// `spawn_blocking` like the rest of the engine's blocking bridges. `download`
/// instead holds a borrowed, non-`'static` `on_chunk` closure, so it runs on
/// `block_in_place`, keeping curl's blocking `transfer()` on the calling
/// worker thread instead of moving it to a fresh one.
#[cfg(feature = "curl-http-engine")]
pub mod curl_engine {
    use super::*;
    use std::str;
    use std::time::Duration;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
    const LOW_SPEED_LIMIT_BYTES_PER_SEC: u32 = 1024;
    const LOW_SPEED_TIME: Duration = Duration::from_secs(60);
    const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

    /// One instance is shared across every task; curl's `Easy` handle is
    /// created fresh per call since `Easy` isn't safe to reuse across threads.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CurlHttpEngine;

    impl CurlHttpEngine {
        pub fn new() -> Self {
            Self
        }
    }

    fn append_headers(easy: &mut curl::easy::Easy, headers: &HashMap<String, String>) -> Result<(), curl::Error> {
        let mut list = curl::easy::List::new();
        for (k, v) in headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        if !headers.is_empty() {
            easy.http_headers(list)?;
        }
        Ok(())
    }

    /// Parses raw header lines into the fields `ServerInfo` cares about,
    /// including the rate-limit headers `fetch_head::probe` has no
    /// counterpart for (spec §4.4.1 download step 2).
    fn parse_headers(lines: &[String]) -> ServerInfo {
        let mut info = ServerInfo::default();
        for line in lines {
            let line = line.trim();
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                info.content_length = value.parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("accept-ranges") {
                info.accept_ranges = value.eq_ignore_ascii_case("bytes");
            } else if name.eq_ignore_ascii_case("etag") {
                info.etag = Some(value.trim_matches('"').to_string());
            } else if name.eq_ignore_ascii_case("last-modified") {
                info.last_modified = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("content-disposition") {
                info.content_disposition = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("x-ratelimit-remaining") {
                info.rate_limit_remaining = value.parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("x-ratelimit-reset") {
                info.rate_limit_reset = value.parse::<u64>().ok();
            }
        }
        info
    }

    fn network_err(e: curl::Error) -> HttpEngineError {
        HttpEngineError::Network(anyhow::Error::from(e))
    }

    fn blocking_head(url: String, headers: HashMap<String, String>) -> Result<ServerInfo, HttpEngineError> {
        let mut lines: Vec<String> = Vec::new();

        let mut easy = curl::easy::Easy::new();
        easy.url(&url).map_err(network_err)?;
        easy.nobody(true).map_err(network_err)?;
        easy.follow_location(true).map_err(network_err)?;
        easy.connect_timeout(CONNECT_TIMEOUT).map_err(network_err)?;
        easy.timeout(HEAD_TIMEOUT).map_err(network_err)?;
        append_headers(&mut easy, &headers).map_err(network_err)?;

        {
            let mut transfer = easy.transfer();
            transfer
                .header_function(|data| {
                    if let Ok(s) = str::from_utf8(data) {
                        lines.push(s.trim_end().to_string());
                    }
                    true
                })
                .map_err(network_err)?;
            transfer.perform().map_err(network_err)?;
        }

        let code = easy.response_code().map_err(network_err)? as u16;
        if !(200..300).contains(&code) {
            return Err(HttpEngineError::Http {
                code,
                message: None,
                retry_after_seconds: None,
                rate_limit_remaining: None,
            });
        }

        Ok(parse_headers(&lines))
    }

    fn blocking_download(
        url: &str,
        range: Option<(u64, u64)>,
        headers: &HashMap<String, String>,
        on_chunk: &mut (dyn FnMut(bytes::Bytes) -> Result<(), HttpEngineError> + Send),
    ) -> Result<(), HttpEngineError> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url).map_err(network_err)?;
        easy.follow_location(true).map_err(network_err)?;
        easy.connect_timeout(CONNECT_TIMEOUT).map_err(network_err)?;
        easy.low_speed_limit(LOW_SPEED_LIMIT_BYTES_PER_SEC).map_err(network_err)?;
        easy.low_speed_time(LOW_SPEED_TIME).map_err(network_err)?;
        easy.timeout(DOWNLOAD_TIMEOUT).map_err(network_err)?;
        append_headers(&mut easy, headers).map_err(network_err)?;

        if let Some((start, end)) = range {
            easy.range(&format!("{start}-{end}")).map_err(network_err)?;
        }

        let mut chunk_error: Option<HttpEngineError> = None;
        {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| match on_chunk(bytes::Bytes::copy_from_slice(data)) {
                    Ok(()) => Ok(data.len()),
                    Err(e) => {
                        chunk_error = Some(e);
                        Ok(0)
                    }
                })
                .map_err(network_err)?;
            if let Err(e) = transfer.perform() {
                if e.is_write_error() {
                    if let Some(e) = chunk_error.take() {
                        return Err(e);
                    }
                }
                return Err(network_err(e));
            }
        }
        if let Some(e) = chunk_error {
            return Err(e);
        }

        let code = easy.response_code().map_err(network_err)? as u16;
        if !(200..300).contains(&code) {
            return Err(HttpEngineError::Http {
                code,
                message: None,
                retry_after_seconds: None,
                rate_limit_remaining: None,
            });
        }
        Ok(())
    }

    #[async_trait]
    impl HttpEngine for CurlHttpEngine {
        async fn head(&self, url: &str, headers: &HashMap<String, String>) -> Result<ServerInfo, HttpEngineError> {
            let url = url.to_string();
            let headers = headers.clone();
            tokio::task::spawn_blocking(move || blocking_head(url, headers))
                .await
                .map_err(|e| HttpEngineError::Network(anyhow::anyhow!(e)))?
        }

        async fn download(
            &self,
            url: &str,
            range: Option<(u64, u64)>,
            headers: &HashMap<String, String>,
            on_chunk: &mut (dyn FnMut(bytes::Bytes) -> Result<(), HttpEngineError> + Send),
        ) -> Result<(), HttpEngineError> {
            tokio::task::block_in_place(|| blocking_download(url, range, headers, on_chunk))
        }
    }

}
