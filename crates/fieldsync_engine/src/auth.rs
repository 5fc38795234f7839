//! Authorization seam for remote writes.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Establishes that the client may write to the remote store.
///
/// Session management lives outside the engine; every remote apply calls
/// [`Authorizer::ensure_authorized`] first and fails with
/// [`SyncError::Unauthorized`] if it cannot succeed.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns once the client is authorized.
    async fn ensure_authorized(&self) -> SyncResult<()>;
}

/// An authorizer with a fixed answer.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    denied: RwLock<Option<String>>,
}

impl StaticAuthorizer {
    /// Creates an authorizer that always allows writes.
    pub fn allow() -> Self {
        Self::default()
    }

    /// Creates an authorizer that refuses writes with `reason`.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            denied: RwLock::new(Some(reason.into())),
        }
    }

    /// Allows writes from now on.
    pub fn set_authorized(&self) {
        *self.denied.write() = None;
    }

    /// Refuses writes from now on.
    pub fn set_denied(&self, reason: impl Into<String>) {
        *self.denied.write() = Some(reason.into());
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn ensure_authorized(&self) -> SyncResult<()> {
        match self.denied.read().clone() {
            Some(reason) => Err(SyncError::Unauthorized(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denial_can_be_lifted() {
        let auth = StaticAuthorizer::deny("no session");
        let err = auth.ensure_authorized().await.unwrap_err();
        assert_eq!(err.to_string(), "authorization required: no session");

        auth.set_authorized();
        auth.ensure_authorized().await.unwrap();
    }
}
