//! Source resolver (spec §4.4.3, C5): routes a URL to the `Source`
//! implementation that handles it.
//!
//! The donor's closest counterpart is `resolver::Resolver` (a trait for
//! turning a HAR entry into a direct URL), which never chooses *between*
//! transport implementations because the donor only ever speaks HTTP. This
//! module generalizes the "pick the right collaborator for this URL"
//! pattern spec §4.4 introduces across multiple sources.

use std::sync::Arc;

use crate::error::KDownError;

use super::Source;

/// Routes URLs to a registered [`Source`] (spec §4.4.3: "choose source via
/// resolver if no `resolvedSource`").
pub struct SourceResolver {
    sources: Vec<Arc<dyn Source>>,
}

impl SourceResolver {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    /// The first registered source whose `can_handle` accepts `url`.
    /// `Unsupported` if none does (spec §7: unrecognized scheme is
    /// `Unsupported`, not retryable).
    pub fn resolve_for_url(&self, url: &str) -> Result<Arc<dyn Source>, KDownError> {
        self.sources
            .iter()
            .find(|s| s.can_handle(url))
            .cloned()
            .ok_or(KDownError::Unsupported)
    }

    /// Looks a source up by its `source_type` label, used when
    /// reconstituting a resume attempt from a persisted `TaskRecord`
    /// (spec §4.4.3 "Resume path").
    pub fn by_type(&self, source_type: &str) -> Result<Arc<dyn Source>, KDownError> {
        self.sources
            .iter()
            .find(|s| s.source_type() == source_type)
            .cloned()
            .ok_or(KDownError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolvedSource, SourceResumeState};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeSource(&'static str, &'static str);

    #[async_trait]
    impl Source for FakeSource {
        fn source_type(&self) -> &'static str {
            self.0
        }
        fn can_handle(&self, url: &str) -> bool {
            url.starts_with(self.1)
        }
        async fn resolve(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<ResolvedSource, KDownError> {
            unimplemented!()
        }
        async fn download(
            &self,
            _ctx: &Arc<super::super::DownloadContext>,
            _resolved: &ResolvedSource,
        ) -> Result<(), KDownError> {
            unimplemented!()
        }
        async fn resume(
            &self,
            _ctx: &Arc<super::super::DownloadContext>,
            _resume_state: &SourceResumeState,
        ) -> Result<(), KDownError> {
            unimplemented!()
        }
        fn build_resume_state(&self, _resolved: &ResolvedSource, _total_bytes: u64) -> SourceResumeState {
            unimplemented!()
        }
    }

    #[test]
    fn routes_by_scheme_prefix() {
        let resolver = SourceResolver::new(vec![
            Arc::new(FakeSource("http", "http")),
            Arc::new(FakeSource("torrent", "magnet:")),
        ]);
        assert_eq!(
            resolver.resolve_for_url("https://example.com/x").unwrap().source_type(),
            "http"
        );
        assert_eq!(
            resolver.resolve_for_url("magnet:?xt=urn:btih:abc").unwrap().source_type(),
            "torrent"
        );
    }

    #[test]
    fn unrecognized_scheme_is_unsupported() {
        let resolver = SourceResolver::new(vec![Arc::new(FakeSource("http", "http"))]);
        assert!(matches!(
            resolver.resolve_for_url("ftp://example.com/x"),
            Err(KDownError::Unsupported)
        ));
    }

    #[test]
    fn by_type_looks_up_registered_source() {
        let resolver = SourceResolver::new(vec![Arc::new(FakeSource("http", "http"))]);
        assert!(resolver.by_type("http").is_ok());
        assert!(matches!(resolver.by_type("torrent"), Err(KDownError::Unsupported)));
    }
}
