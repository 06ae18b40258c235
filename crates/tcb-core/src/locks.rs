use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::OwnerId;

/// Per-owner serialization for record mutations.
///
/// The lifecycle manager and the sweeper both take the owner's lock before a
/// read-modify-write of that owner's record, so a concurrent create and a
/// concurrent expiry on the same owner cannot lose each other's update.
#[derive(Default)]
pub struct OwnerLocks {
    inner: Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_owner(&self, owner: OwnerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(owner)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop lock slots nobody is holding or waiting on.
    pub async fn prune(&self) {
        let mut map = self.inner.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    async fn slots(&self) -> usize {
        self.inner.lock().await.len()
    }
}
