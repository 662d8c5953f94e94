//! Static page probe: fetch once and match a pattern.

use async_trait::async_trait;
use regex::Regex;
use std::time::Instant;

use super::{Probe, ProbeError, ProbeKind, ProbeOutcome, Target, TargetMeta};
use crate::clients::HttpFetcher;

pub struct StaticContentProbe {
    http: HttpFetcher,
}

impl StaticContentProbe {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Probe for StaticContentProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::PageFetch
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let TargetMeta::StaticPage { pattern } = &target.meta else {
            let e = ProbeError::Missing(format!("no pattern configured for '{}'", target.id));
            return ProbeOutcome::failure(self.kind(), target, 0, e);
        };
        let pattern = match Regex::new(pattern) {
            Ok(pattern) => pattern,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 0, format!("invalid pattern: {}", e)),
        };

        let start = Instant::now();
        let body = match self.http.fetch_text(&target.id).await {
            Ok(body) => body,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 1, e),
        };
        if !pattern.is_match(&body) {
            let e = ProbeError::Mismatch(format!("'{}' not found in page", pattern));
            return ProbeOutcome::failure(self.kind(), target, 1, e);
        }
        ProbeOutcome::success(self.kind(), target, start.elapsed(), 1)
    }
}
