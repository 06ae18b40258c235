use std::sync::Arc;

use chrono::Duration;

use crate::{
    clock::Clock,
    config::LifetimePolicy,
    domain::{
        ChannelId, ChannelRef, OwnerId, OwnerPermissions, OwnerRecord, ResourceEntry, ResourceKind,
    },
    errors::Error,
    locks::OwnerLocks,
    provider::ChannelProvider,
    store::{self, RecordStore},
    Result,
};

/// Platform limit on channel names.
const MAX_CHANNEL_NAME_CHARS: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ChannelRef),
    /// The owner already manages a live channel of this kind.
    Conflict(ChannelRef),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    Deleted,
    AlreadyGone,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushOutcome {
    pub owner: OwnerId,
    pub kind: ResourceKind,
    pub channel_id: ChannelId,
    pub status: FlushStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub outcomes: Vec<FlushOutcome>,
    /// Owners whose record could not be read; their keys were cleared anyway.
    pub unreadable_owners: Vec<OwnerId>,
    /// Owners whose key could not be removed; they are still in the store.
    pub uncleared_owners: Vec<OwnerId>,
}

impl FlushReport {
    /// Entries processed.
    pub fn count(&self) -> usize {
        self.outcomes.len()
    }

    /// Delete calls issued (successful or not).
    pub fn attempted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.status, FlushStatus::AlreadyGone))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &FlushOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FlushStatus::Failed(_)))
    }
}

/// Single writer of owner records on the request path.
///
/// Shares `OwnerLocks` with the sweeper so both see a linearizable history per
/// owner.
pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn ChannelProvider>,
    clock: Arc<dyn Clock>,
    locks: Arc<OwnerLocks>,
    lifetimes: LifetimePolicy,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn ChannelProvider>,
        clock: Arc<dyn Clock>,
        locks: Arc<OwnerLocks>,
        lifetimes: LifetimePolicy,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            locks,
            lifetimes,
        }
    }

    pub fn lifetimes(&self) -> &LifetimePolicy {
        &self.lifetimes
    }

    /// Current record of `owner`, read under its lock.
    pub async fn record(&self, owner: OwnerId) -> Result<Option<OwnerRecord>> {
        let _guard = self.locks.lock_owner(owner).await;
        store::blocking(&self.store, move |s| s.get(owner)).await
    }

    /// Provision a channel of `kind` for `owner` unless one is still live.
    pub async fn create(
        &self,
        owner: OwnerId,
        kind: ResourceKind,
        name: &str,
        lifetime_hours: u32,
    ) -> Result<CreateOutcome> {
        self.lifetimes.check(kind, lifetime_hours)?;
        let name = validate_name(name)?;

        let _guard = self.locks.lock_owner(owner).await;
        let mut record = store::blocking(&self.store, move |s| s.get(owner))
            .await?
            .unwrap_or_default();

        if let Some(entry) = record.get(kind).copied() {
            match self.provider.resolve(entry.channel_id).await {
                Ok(Some(existing)) => {
                    tracing::info!(
                        owner = %owner,
                        kind = %kind,
                        channel = %existing.id,
                        "create rejected: owner already manages a live channel"
                    );
                    return Ok(CreateOutcome::Conflict(existing));
                }
                Ok(None) => {
                    tracing::debug!(
                        owner = %owner,
                        kind = %kind,
                        channel = %entry.channel_id,
                        "stale entry, remote channel is gone"
                    );
                }
                Err(e) => {
                    return Err(Error::ProviderUnavailable(format!(
                        "could not check existing {kind} channel {}: {e}",
                        entry.channel_id
                    )));
                }
            }
        }

        let channel = self
            .provider
            .create_channel(kind, name, &OwnerPermissions::exclusive(owner))
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("create {kind} channel: {e}")))?;

        let expires_at = self.clock.now() + Duration::hours(i64::from(lifetime_hours));
        record.set(
            kind,
            ResourceEntry {
                channel_id: channel.id,
                expires_at,
            },
        );

        let persisted = record.clone();
        if let Err(e) = store::blocking(&self.store, move |s| s.put(owner, &persisted)).await {
            tracing::error!(
                owner = %owner,
                channel = %channel.id,
                "failed to persist new channel, removing it: {e}"
            );
            if let Err(del) = self.provider.delete_channel(&channel).await {
                tracing::warn!(channel = %channel.id, "orphan channel cleanup failed: {del}");
            }
            return Err(e);
        }

        tracing::info!(
            owner = %owner,
            kind = %kind,
            channel = %channel.id,
            expires_at = %expires_at.to_rfc3339(),
            "channel created"
        );
        Ok(CreateOutcome::Created(channel))
    }

    /// Delete every tracked channel and clear the store.
    ///
    /// Unconditional: no expiry or occupancy checks. Provider failures are
    /// recorded per entry and never abort the flush; neither does a key that
    /// cannot be removed, since its channels may already be gone.
    pub async fn flush_all(&self) -> Result<FlushReport> {
        let owners = store::blocking(&self.store, |s| s.list_owners()).await?;
        let mut report = FlushReport::default();

        for owner in owners {
            let _guard = self.locks.lock_owner(owner).await;

            match store::blocking(&self.store, move |s| s.get(owner)).await {
                Ok(Some(record)) => {
                    for (kind, entry) in record.entries() {
                        let status = self.flush_entry(kind, entry.channel_id).await;
                        report.outcomes.push(FlushOutcome {
                            owner,
                            kind,
                            channel_id: entry.channel_id,
                            status,
                        });
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(owner = %owner, "flush: unreadable record, clearing key: {e}");
                    report.unreadable_owners.push(owner);
                }
            }

            if let Err(e) = store::blocking(&self.store, move |s| s.delete(owner)).await {
                tracing::error!(owner = %owner, "flush: could not clear record: {e}");
                report.uncleared_owners.push(owner);
            }
        }

        self.locks.prune().await;

        let failed = report.failed().count();
        tracing::info!(
            entries = report.count(),
            attempted = report.attempted(),
            failed,
            uncleared = report.uncleared_owners.len(),
            "flushed all channels"
        );
        Ok(report)
    }

    async fn flush_entry(&self, kind: ResourceKind, id: ChannelId) -> FlushStatus {
        let channel = match self.provider.resolve(id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => return FlushStatus::AlreadyGone,
            Err(e) => {
                // Resolution is ambiguous; the flush is unconditional, so try anyway.
                tracing::debug!(channel = %id, "flush: resolve failed ({e}), deleting blind");
                ChannelRef {
                    id,
                    name: String::new(),
                    kind,
                }
            }
        };

        match self.provider.delete_channel(&channel).await {
            Ok(()) => FlushStatus::Deleted,
            Err(e) => {
                tracing::warn!(channel = %id, kind = %kind, "flush: delete failed: {e}");
                FlushStatus::Failed(e.to_string())
            }
        }
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidName("name must not be empty".to_string()));
    }
    let len = trimmed.chars().count();
    if len > MAX_CHANNEL_NAME_CHARS {
        return Err(Error::InvalidName(format!(
            "name is {len} characters, the limit is {MAX_CHANNEL_NAME_CHARS}"
        )));
    }
    Ok(trimmed)
}
