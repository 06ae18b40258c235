use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::domain::{ChannelId, ChannelRef, OwnerPermissions, ResourceKind};

/// Failure talking to the chat platform.
///
/// None of these mean "the channel is gone": that is reported as `Ok(None)`
/// by `resolve`. Callers treat every variant as ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Hexagonal port for the remote channel platform.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// `Ok(None)` means the platform confirmed the channel no longer exists.
    async fn resolve(&self, id: ChannelId) -> ProviderResult<Option<ChannelRef>>;

    /// Members currently connected (voice channels).
    async fn occupant_count(&self, channel: &ChannelRef) -> ProviderResult<usize>;

    async fn create_channel(
        &self,
        kind: ResourceKind,
        name: &str,
        permissions: &OwnerPermissions,
    ) -> ProviderResult<ChannelRef>;

    async fn delete_channel(&self, channel: &ChannelRef) -> ProviderResult<()>;
}

/// ChannelProvider decorator that bounds every remote call.
///
/// A stuck platform call turns into `ProviderError::Timeout` so one owner
/// cannot stall the whole sweep.
pub struct TimeoutProvider {
    inner: Arc<dyn ChannelProvider>,
    timeout: Duration,
}

impl TimeoutProvider {
    pub fn new(inner: Arc<dyn ChannelProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = ProviderResult<T>>) -> ProviderResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl ChannelProvider for TimeoutProvider {
    async fn resolve(&self, id: ChannelId) -> ProviderResult<Option<ChannelRef>> {
        self.bounded(self.inner.resolve(id)).await
    }

    async fn occupant_count(&self, channel: &ChannelRef) -> ProviderResult<usize> {
        self.bounded(self.inner.occupant_count(channel)).await
    }

    async fn create_channel(
        &self,
        kind: ResourceKind,
        name: &str,
        permissions: &OwnerPermissions,
    ) -> ProviderResult<ChannelRef> {
        self.bounded(self.inner.create_channel(kind, name, permissions))
            .await
    }

    async fn delete_channel(&self, channel: &ChannelRef) -> ProviderResult<()> {
        self.bounded(self.inner.delete_channel(channel)).await
    }
}
