use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform user id of a channel owner (numeric snowflake).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform channel id (numeric snowflake).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Voice,
    Text,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Voice, ResourceKind::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Voice => "voice",
            ResourceKind::Text => "text",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked remote channel and the moment it becomes eligible for reclamation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub channel_id: ChannelId,
    pub expires_at: DateTime<Utc>,
}

impl ResourceEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Everything one owner currently manages, at most one entry per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<ResourceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<ResourceEntry>,
}

impl OwnerRecord {
    pub fn get(&self, kind: ResourceKind) -> Option<&ResourceEntry> {
        match kind {
            ResourceKind::Voice => self.voice.as_ref(),
            ResourceKind::Text => self.text.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ResourceKind, entry: ResourceEntry) {
        *self.slot(kind) = Some(entry);
    }

    pub fn take(&mut self, kind: ResourceKind) -> Option<ResourceEntry> {
        self.slot(kind).take()
    }

    pub fn is_empty(&self) -> bool {
        self.voice.is_none() && self.text.is_none()
    }

    /// Populated entries, voice first.
    pub fn entries(&self) -> Vec<(ResourceKind, ResourceEntry)> {
        ResourceKind::ALL
            .iter()
            .filter_map(|k| self.get(*k).map(|e| (*k, *e)))
            .collect()
    }

    fn slot(&mut self, kind: ResourceKind) -> &mut Option<ResourceEntry> {
        match kind {
            ResourceKind::Voice => &mut self.voice,
            ResourceKind::Text => &mut self.text,
        }
    }
}

/// A resolved remote channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub name: String,
    pub kind: ResourceKind,
}

/// Permission overwrites applied to a freshly created channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerPermissions {
    pub owner: OwnerId,
    pub owner_can_manage: bool,
    pub owner_can_view: bool,
    pub hide_from_everyone: bool,
}

impl OwnerPermissions {
    /// Owner may view and manage the channel (including its permissions);
    /// the default role cannot see it.
    pub fn exclusive(owner: OwnerId) -> Self {
        Self {
            owner,
            owner_can_manage: true,
            owner_can_view: true,
            hide_from_everyone: true,
        }
    }
}
