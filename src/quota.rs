//! Quota enforcer (C14): per-org plan limits, documented as an
//! interface-only external collaborator. The gateway calls it at push/action
//! time but owns no implementation beyond a permissive default.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Push,
    Action,
}

#[derive(Debug, Error, Clone)]
#[error("quota exceeded for {org} ({kind:?})")]
pub struct QuotaDenied {
    pub org: String,
    pub kind: QuotaKind,
}

#[async_trait]
pub trait QuotaEnforcer: Send + Sync {
    async fn check(&self, org: &str, kind: QuotaKind) -> Result<(), QuotaDenied>;
}

/// Default enforcer: no plan data exists in this crate, so every request is
/// allowed.
pub struct NoopQuotaEnforcer;

#[async_trait]
impl QuotaEnforcer for NoopQuotaEnforcer {
    async fn check(&self, _org: &str, _kind: QuotaKind) -> Result<(), QuotaDenied> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_enforcer_always_allows() {
        let enforcer = NoopQuotaEnforcer;
        assert!(enforcer.check("org-1", QuotaKind::Push).await.is_ok());
    }
}
