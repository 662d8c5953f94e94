//! Name resolution probe.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::{Probe, ProbeError, ProbeKind, ProbeOutcome, Target, TargetMeta};
use crate::clients::NameResolver;
use crate::keys;

/// Resolves a well-known name through the service under test. A record that
/// is not a valid identity counts as a failure.
pub struct NameResolutionProbe {
    resolvers: HashMap<String, Arc<dyn NameResolver>>,
}

impl NameResolutionProbe {
    /// `resolvers` maps each service URL to its client.
    pub fn new(resolvers: HashMap<String, Arc<dyn NameResolver>>) -> Self {
        Self { resolvers }
    }

    async fn resolve(&self, target: &Target) -> Result<String, ProbeError> {
        let TargetMeta::NameService { name, record } = &target.meta else {
            return Err(ProbeError::Missing(format!("no name configured for '{}'", target.id)));
        };
        let resolver = self
            .resolvers
            .get(&target.id)
            .ok_or_else(|| ProbeError::Missing(format!("no resolver for '{}'", target.id)))?;

        match resolver.resolve(name, record).await? {
            Some(value) if keys::is_identity(&value) => Ok(value),
            Some(value) => Err(ProbeError::Mismatch(format!(
                "'{}' resolved to '{}' which is not an identity",
                name, value
            ))),
            None => Err(ProbeError::Missing(format!("'{}' has no {} record", name, record))),
        }
    }
}

#[async_trait]
impl Probe for NameResolutionProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::NameResolve
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let start = Instant::now();
        match self.resolve(target).await {
            Ok(identity) => {
                ProbeOutcome::success(self.kind(), target, start.elapsed(), 1).with("resolvedIdentity", identity)
            }
            Err(e) => ProbeOutcome::failure(self.kind(), target, 1, e),
        }
    }
}
