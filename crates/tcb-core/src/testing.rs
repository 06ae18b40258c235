//! Fakes shared by the unit tests of this crate.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    domain::{ChannelId, ChannelRef, OwnerPermissions, ResourceKind},
    provider::{ChannelProvider, ProviderError, ProviderResult},
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Resolve(ChannelId),
    Occupants(ChannelId),
    Create(ResourceKind, String),
    Delete(ChannelId),
}

#[derive(Clone, Debug)]
struct FakeChannel {
    name: String,
    kind: ResourceKind,
    occupants: usize,
}

/// In-memory platform with scripted failures and a call log.
#[derive(Default)]
pub struct FakeProvider {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, FakeChannel>>,
    calls: Mutex<Vec<Call>>,
    permissions: Mutex<Vec<OwnerPermissions>>,
    ambiguous: Mutex<HashSet<ChannelId>>,
    failing_deletes: Mutex<HashSet<ChannelId>>,
    failing_creates: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    /// Pretend a channel already exists on the platform.
    pub fn insert(&self, id: ChannelId, kind: ResourceKind, name: &str) {
        self.channels.lock().unwrap().insert(
            id,
            FakeChannel {
                name: name.to_string(),
                kind,
                occupants: 0,
            },
        );
    }

    pub fn set_occupants(&self, id: ChannelId, n: usize) {
        if let Some(ch) = self.channels.lock().unwrap().get_mut(&id) {
            ch.occupants = n;
        }
    }

    /// Channel deleted behind the bot's back.
    pub fn vanish(&self, id: ChannelId) {
        self.channels.lock().unwrap().remove(&id);
    }

    pub fn exists(&self, id: ChannelId) -> bool {
        self.channels.lock().unwrap().contains_key(&id)
    }

    pub fn make_ambiguous(&self, id: ChannelId) {
        self.ambiguous.lock().unwrap().insert(id);
    }

    pub fn fail_deletes_of(&self, id: ChannelId) {
        self.failing_deletes.lock().unwrap().insert(id);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.failing_creates.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<ChannelId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create(..)))
            .count()
    }

    pub fn last_permissions(&self) -> Option<OwnerPermissions> {
        self.permissions.lock().unwrap().last().copied()
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_ambiguous(&self, id: ChannelId) -> ProviderResult<()> {
        if self.ambiguous.lock().unwrap().contains(&id) {
            return Err(ProviderError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelProvider for FakeProvider {
    async fn resolve(&self, id: ChannelId) -> ProviderResult<Option<ChannelRef>> {
        self.log(Call::Resolve(id));
        self.check_ambiguous(id)?;
        Ok(self
            .channels
            .lock()
            .unwrap()
            .get(&id)
            .map(|ch| ChannelRef {
                id,
                name: ch.name.clone(),
                kind: ch.kind,
            }))
    }

    async fn occupant_count(&self, channel: &ChannelRef) -> ProviderResult<usize> {
        self.log(Call::Occupants(channel.id));
        self.check_ambiguous(channel.id)?;
        self.channels
            .lock()
            .unwrap()
            .get(&channel.id)
            .map(|ch| ch.occupants)
            .ok_or_else(|| ProviderError::Unavailable("unknown channel".to_string()))
    }

    async fn create_channel(
        &self,
        kind: ResourceKind,
        name: &str,
        permissions: &OwnerPermissions,
    ) -> ProviderResult<ChannelRef> {
        self.log(Call::Create(kind, name.to_string()));
        if self.failing_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("scripted create failure".to_string()));
        }
        self.permissions.lock().unwrap().push(*permissions);
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(id, kind, name);
        Ok(ChannelRef {
            id,
            name: name.to_string(),
            kind,
        })
    }

    async fn delete_channel(&self, channel: &ChannelRef) -> ProviderResult<()> {
        self.log(Call::Delete(channel.id));
        if self.failing_deletes.lock().unwrap().contains(&channel.id) {
            return Err(ProviderError::Rejected {
                status: 403,
                message: "Missing Permissions".to_string(),
            });
        }
        self.channels.lock().unwrap().remove(&channel.id);
        Ok(())
    }
}
