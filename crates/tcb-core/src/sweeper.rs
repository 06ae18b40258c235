//! Expiry sweeper: periodically reclaims channels whose lifetime has passed.
//!
//! - voice channels are deleted only once nobody is connected
//! - text channels are deleted purely by time
//! - channels already gone on the platform are dropped without a delete call
//! - any ambiguous provider answer leaves the entry for the next tick
//!
//! At most one sweeper may run against a given store.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::Config,
    domain::{OwnerId, ResourceEntry, ResourceKind},
    errors::Error,
    locks::OwnerLocks,
    provider::ChannelProvider,
    store::{self, RecordStore},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Consecutive ticks with an unreadable store before the loop gives up.
    pub store_failure_limit: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            store_failure_limit: 3,
        }
    }
}

impl From<&Config> for SweeperConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            interval: cfg.sweep_interval,
            store_failure_limit: cfg.store_failure_limit,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweeperState {
    Idle,
    Scanning,
    Stopped,
}

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub owners_scanned: usize,
    pub deleted: usize,
    /// Entries whose channel had already disappeared.
    pub dropped_missing: usize,
    /// Text entries dropped although the delete call failed.
    pub delete_failures: usize,
    pub still_occupied: usize,
    /// Expired entries left alone because the provider gave no clear answer.
    pub deferred: usize,
    pub owners_pruned: usize,
    pub failed_owners: Vec<OwnerId>,
    /// Shutdown was requested before every owner was visited.
    pub interrupted: bool,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        self.deleted == 0
            && self.dropped_missing == 0
            && self.delete_failures == 0
            && self.still_occupied == 0
            && self.deferred == 0
            && self.failed_owners.is_empty()
    }
}

enum Disposition {
    Keep,
    Drop,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    inner: Arc<SweeperInner>,
}

struct SweeperInner {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn ChannelProvider>,
    clock: Arc<dyn Clock>,
    locks: Arc<OwnerLocks>,
    cfg: SweeperConfig,
    phase: watch::Sender<SweeperState>,
    run: tokio::sync::Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    handle: Option<JoinHandle<Result<()>>>,
    cancel: Option<CancellationToken>,
}

impl ExpirySweeper {
    /// Build a sweeper. Nothing runs until `start()`.
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn ChannelProvider>,
        clock: Arc<dyn Clock>,
        locks: Arc<OwnerLocks>,
        cfg: SweeperConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SweeperState::Stopped);
        Self {
            inner: Arc::new(SweeperInner {
                store,
                provider,
                clock,
                locks,
                cfg,
                phase,
                run: tokio::sync::Mutex::new(RunState::default()),
            }),
        }
    }

    pub fn state(&self) -> SweeperState {
        *self.inner.phase.borrow()
    }

    /// Spawn the background loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut run = self.inner.run.lock().await;
        if run.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        self.inner.phase.send_replace(SweeperState::Idle);

        let sweeper = self.clone();
        let token = cancel.clone();
        run.handle = Some(tokio::spawn(async move { sweeper.run_loop(token).await }));
        run.cancel = Some(cancel);

        tracing::info!(
            interval_secs = self.inner.cfg.interval.as_secs(),
            "expiry sweeper started"
        );
        true
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// The loop finishes the owner it is working on, then exits without
    /// sleeping again. Returns the loop's terminal result: an error here means
    /// it had already died on persistent store failure.
    pub async fn stop(&self) -> Result<()> {
        let (handle, cancel) = {
            let mut run = self.inner.run.lock().await;
            (run.handle.take(), run.cancel.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let Some(handle) = handle else {
            return Ok(());
        };

        let res = match handle.await {
            Ok(res) => res,
            Err(e) => Err(Error::Task(format!("sweeper task: {e}"))),
        };
        self.inner.phase.send_replace(SweeperState::Stopped);
        tracing::info!("expiry sweeper stopped");
        res
    }

    /// Resolves once the loop is no longer running (stopped or died).
    pub async fn stopped(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|s| *s == SweeperState::Stopped).await;
    }

    /// Run a single pass right now, independent of the background loop.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep(&CancellationToken::new()).await
    }

    async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        let cfg = self.inner.cfg;
        let mut store_failures = 0u32;

        loop {
            self.inner.phase.send_replace(SweeperState::Scanning);
            let res = self.sweep(&cancel).await;
            self.inner.phase.send_replace(SweeperState::Idle);

            match res {
                Ok(report) => {
                    store_failures = 0;
                    log_report(&report);
                }
                Err(e) if e.is_store_failure() => {
                    store_failures += 1;
                    tracing::error!(
                        attempt = store_failures,
                        limit = cfg.store_failure_limit,
                        "sweep could not read the record store: {e}"
                    );
                    if store_failures >= cfg.store_failure_limit {
                        self.inner.phase.send_replace(SweeperState::Stopped);
                        return Err(e);
                    }
                }
                Err(e) => tracing::warn!("sweep failed: {e}"),
            }

            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = sleep(cfg.interval) => {}
            }
        }

        self.inner.phase.send_replace(SweeperState::Stopped);
        Ok(())
    }

    async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let now = self.inner.clock.now();
        let owners = store::blocking(&self.inner.store, |s| s.list_owners()).await?;
        let mut report = SweepReport::default();

        for owner in owners {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            report.owners_scanned += 1;
            if let Err(e) = self.sweep_owner(owner, now, &mut report).await {
                tracing::warn!(owner = %owner, "sweep skipped owner: {e}");
                report.failed_owners.push(owner);
            }
        }

        self.inner.locks.prune().await;
        Ok(report)
    }

    async fn sweep_owner(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let _guard = self.inner.locks.lock_owner(owner).await;
        let Some(mut record) = store::blocking(&self.inner.store, move |s| s.get(owner)).await? else {
            return Ok(());
        };

        let mut changed = false;
        for (kind, entry) in record.entries() {
            if !entry.is_expired(now) {
                continue;
            }
            let disposition = match kind {
                ResourceKind::Voice => self.reclaim_voice(owner, entry, report).await,
                ResourceKind::Text => self.reclaim_text(owner, entry, report).await,
            };
            if let Disposition::Drop = disposition {
                record.take(kind);
                changed = true;
            }
        }

        if record.is_empty() {
            store::blocking(&self.inner.store, move |s| s.delete(owner)).await?;
            report.owners_pruned += 1;
        } else if changed {
            store::blocking(&self.inner.store, move |s| s.put(owner, &record)).await?;
        }
        Ok(())
    }

    async fn reclaim_voice(
        &self,
        owner: OwnerId,
        entry: ResourceEntry,
        report: &mut SweepReport,
    ) -> Disposition {
        let provider = &self.inner.provider;
        let id = entry.channel_id;

        let channel = match provider.resolve(id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                tracing::info!(owner = %owner, channel = %id, "expired voice channel already gone");
                report.dropped_missing += 1;
                return Disposition::Drop;
            }
            Err(e) => {
                tracing::warn!(owner = %owner, channel = %id, "voice resolve failed, retrying next tick: {e}");
                report.deferred += 1;
                return Disposition::Keep;
            }
        };

        match provider.occupant_count(&channel).await {
            Ok(0) => {}
            Ok(n) => {
                tracing::debug!(owner = %owner, channel = %id, occupants = n, "expired voice channel still in use");
                report.still_occupied += 1;
                return Disposition::Keep;
            }
            Err(e) => {
                tracing::warn!(owner = %owner, channel = %id, "occupancy check failed, retrying next tick: {e}");
                report.deferred += 1;
                return Disposition::Keep;
            }
        }

        match provider.delete_channel(&channel).await {
            Ok(()) => {
                tracing::info!(owner = %owner, channel = %id, name = %channel.name, "deleted expired voice channel");
                report.deleted += 1;
                Disposition::Drop
            }
            Err(e) => {
                tracing::warn!(owner = %owner, channel = %id, "voice delete failed, retrying next tick: {e}");
                report.deferred += 1;
                Disposition::Keep
            }
        }
    }

    async fn reclaim_text(
        &self,
        owner: OwnerId,
        entry: ResourceEntry,
        report: &mut SweepReport,
    ) -> Disposition {
        let provider = &self.inner.provider;
        let id = entry.channel_id;

        let channel = match provider.resolve(id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                tracing::info!(owner = %owner, channel = %id, "expired text channel already gone");
                report.dropped_missing += 1;
                return Disposition::Drop;
            }
            Err(e) => {
                tracing::warn!(owner = %owner, channel = %id, "text resolve failed, retrying next tick: {e}");
                report.deferred += 1;
                return Disposition::Keep;
            }
        };

        match provider.delete_channel(&channel).await {
            Ok(()) => {
                tracing::info!(owner = %owner, channel = %id, name = %channel.name, "deleted expired text channel");
                report.deleted += 1;
            }
            Err(e) => {
                tracing::warn!(owner = %owner, channel = %id, "text delete failed, dropping entry anyway: {e}");
                report.delete_failures += 1;
            }
        }
        Disposition::Drop
    }
}

fn log_report(report: &SweepReport) {
    if report.is_quiet() {
        tracing::debug!(owners = report.owners_scanned, "sweep finished, nothing to reclaim");
        return;
    }
    tracing::info!(
        owners = report.owners_scanned,
        deleted = report.deleted,
        dropped_missing = report.dropped_missing,
        delete_failures = report.delete_failures,
        still_occupied = report.still_occupied,
        deferred = report.deferred,
        pruned = report.owners_pruned,
        failed_owners = report.failed_owners.len(),
        interrupted = report.interrupted,
        "sweep finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::LifetimePolicy,
        domain::{ChannelId, ChannelRef, OwnerPermissions, OwnerRecord},
        lifecycle::{CreateOutcome, LifecycleManager},
        provider::ProviderResult,
        store::MemoryStore,
        testing::{t0, Call, FakeProvider},
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Harness {
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        clock: Arc<ManualClock>,
        manager: LifecycleManager,
        sweeper: ExpirySweeper,
    }

    fn harness_with(cfg: SweeperConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let locks = Arc::new(OwnerLocks::new());
        let manager = LifecycleManager::new(
            store.clone(),
            provider.clone(),
            clock.clone(),
            locks.clone(),
            LifetimePolicy::default(),
        );
        let sweeper = ExpirySweeper::new(
            store.clone(),
            provider.clone(),
            clock.clone(),
            locks,
            cfg,
        );
        Harness {
            store,
            provider,
            clock,
            manager,
            sweeper,
        }
    }

    fn harness() -> Harness {
        harness_with(SweeperConfig::default())
    }

    async fn create(h: &Harness, owner: u64, kind: ResourceKind, name: &str, hours: u32) -> ChannelId {
        match h
            .manager
            .create(OwnerId(owner), kind, name, hours)
            .await
            .unwrap()
        {
            CreateOutcome::Created(ch) => ch.id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_expired_voice_is_deleted_once_and_owner_pruned() {
        let h = harness();
        let id = create(&h, 1, ResourceKind::Voice, "general", 1).await;

        h.clock.advance(ChronoDuration::minutes(61));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.owners_pruned, 1);
        assert_eq!(h.provider.deletes(), vec![id]);
        assert!(h.store.get(OwnerId(1)).unwrap().is_none());

        // Idempotent: nothing left to look at.
        let again = h.sweeper.sweep_once().await.unwrap();
        assert_eq!(again, SweepReport::default());
        assert_eq!(h.provider.deletes(), vec![id]);
    }

    #[tokio::test]
    async fn occupied_voice_is_kept_until_empty() {
        let h = harness();
        let id = create(&h, 1, ResourceKind::Voice, "party", 1).await;
        let before = h.store.get(OwnerId(1)).unwrap().unwrap();
        h.provider.set_occupants(id, 2);

        h.clock.advance(ChronoDuration::hours(2));
        for _ in 0..3 {
            let report = h.sweeper.sweep_once().await.unwrap();
            assert_eq!(report.still_occupied, 1);
            assert_eq!(report.deleted, 0);
        }
        assert!(h.provider.deletes().is_empty());
        // No renewal.
        assert_eq!(h.store.get(OwnerId(1)).unwrap().unwrap(), before);

        h.provider.set_occupants(id, 0);
        let report = h.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(h.provider.deletes(), vec![id]);
        assert!(h.store.list_owners().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_text_is_deleted_regardless_of_occupancy() {
        let h = harness();
        let id = create(&h, 3, ResourceKind::Text, "chat", 1).await;
        h.provider.set_occupants(id, 10);

        h.clock.advance(ChronoDuration::hours(1) + ChronoDuration::seconds(1));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(h.provider.deletes(), vec![id]);
        assert!(!h.provider.calls().contains(&Call::Occupants(id)));
        assert!(h.store.get(OwnerId(3)).unwrap().is_none());
    }

    #[tokio::test]
    async fn unexpired_text_is_untouched() {
        let h = harness();
        let hours = h.manager.lifetimes().default_hours;
        create(&h, 4, ResourceKind::Text, "temp", hours).await;
        let before = h.store.get(OwnerId(4)).unwrap().unwrap();
        let calls_before = h.provider.calls().len();

        h.clock.advance(ChronoDuration::hours(2));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.owners_scanned, 1);
        assert!(report.is_quiet());
        assert_eq!(h.provider.calls().len(), calls_before);
        assert_eq!(h.store.get(OwnerId(4)).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn vanished_channels_are_dropped_without_delete() {
        let h = harness();
        let v = create(&h, 1, ResourceKind::Voice, "v", 1).await;
        let t = create(&h, 1, ResourceKind::Text, "t", 1).await;
        h.provider.vanish(v);
        h.provider.vanish(t);

        h.clock.advance(ChronoDuration::hours(3));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.dropped_missing, 2);
        assert!(h.provider.deletes().is_empty());
        assert!(h.store.list_owners().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_answers_never_delete() {
        let h = harness();
        let v = create(&h, 1, ResourceKind::Voice, "v", 1).await;
        let t = create(&h, 2, ResourceKind::Text, "t", 1).await;
        h.provider.make_ambiguous(v);
        h.provider.make_ambiguous(t);

        h.clock.advance(ChronoDuration::hours(3));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deferred, 2);
        assert!(h.provider.deletes().is_empty());
        assert!(h.store.get(OwnerId(1)).unwrap().unwrap().voice.is_some());
        assert!(h.store.get(OwnerId(2)).unwrap().unwrap().text.is_some());
    }

    #[tokio::test]
    async fn failed_voice_delete_is_retried_but_failed_text_delete_is_dropped() {
        let h = harness();
        let v = create(&h, 1, ResourceKind::Voice, "v", 1).await;
        let t = create(&h, 1, ResourceKind::Text, "t", 1).await;
        h.provider.fail_deletes_of(v);
        h.provider.fail_deletes_of(t);

        h.clock.advance(ChronoDuration::hours(2));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.delete_failures, 1);
        let rec = h.store.get(OwnerId(1)).unwrap().unwrap();
        assert_eq!(rec.voice.unwrap().channel_id, v);
        assert!(rec.text.is_none());
    }

    #[tokio::test]
    async fn partial_expiry_persists_remaining_entry() {
        let h = harness();
        create(&h, 9, ResourceKind::Text, "short", 1).await;
        let v = create(&h, 9, ResourceKind::Voice, "long", 10).await;

        h.clock.advance(ChronoDuration::hours(2));
        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.owners_pruned, 0);
        let rec = h.store.get(OwnerId(9)).unwrap().unwrap();
        assert!(rec.text.is_none());
        assert_eq!(rec.voice.unwrap().channel_id, v);
    }

    /// MemoryStore whose reads fail for one owner.
    struct PoisonedOwner {
        inner: MemoryStore,
        bad: OwnerId,
    }

    impl RecordStore for PoisonedOwner {
        fn get(&self, owner: OwnerId) -> Result<Option<OwnerRecord>> {
            if owner == self.bad {
                return Err(Error::StoreCorruption {
                    owner,
                    reason: "garbage".to_string(),
                });
            }
            self.inner.get(owner)
        }
        fn put(&self, owner: OwnerId, record: &OwnerRecord) -> Result<()> {
            self.inner.put(owner, record)
        }
        fn delete(&self, owner: OwnerId) -> Result<()> {
            self.inner.delete(owner)
        }
        fn list_owners(&self) -> Result<Vec<OwnerId>> {
            self.inner.list_owners()
        }
    }

    #[tokio::test]
    async fn one_bad_owner_does_not_stop_the_sweep() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(PoisonedOwner {
            inner: MemoryStore::new(),
            bad: OwnerId(2),
        });
        for (owner, channel) in [(1u64, 11u64), (2, 22), (3, 33)] {
            provider.insert(ChannelId(channel), ResourceKind::Text, "t");
            let mut rec = OwnerRecord::default();
            rec.set(
                ResourceKind::Text,
                ResourceEntry {
                    channel_id: ChannelId(channel),
                    expires_at: t0(),
                },
            );
            store.inner.put(OwnerId(owner), &rec).unwrap();
        }

        let sweeper = ExpirySweeper::new(
            store.clone(),
            provider.clone(),
            Arc::new(ManualClock::new(t0() + ChronoDuration::minutes(1))),
            Arc::new(OwnerLocks::new()),
            SweeperConfig::default(),
        );
        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.owners_scanned, 3);
        assert_eq!(report.failed_owners, vec![OwnerId(2)]);
        assert_eq!(report.deleted, 2);
        assert_eq!(store.inner.list_owners().unwrap(), vec![OwnerId(2)]);
        assert!(provider.exists(ChannelId(22)));
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_between_owners() {
        let h = harness();
        create(&h, 1, ResourceKind::Text, "a", 1).await;
        create(&h, 2, ResourceKind::Text, "b", 1).await;
        h.clock.advance(ChronoDuration::hours(2));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.sweeper.sweep(&cancel).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.owners_scanned, 0);
        assert_eq!(h.store.list_owners().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_reclaims_on_later_tick_and_stops_cleanly() {
        let h = harness_with(SweeperConfig {
            interval: Duration::from_secs(30 * 60),
            store_failure_limit: 3,
        });
        let id = create(&h, 1, ResourceKind::Text, "temp", 1).await;

        assert_eq!(h.sweeper.state(), SweeperState::Stopped);
        assert!(h.sweeper.start().await);
        assert!(!h.sweeper.start().await);

        // First tick runs immediately; nothing is expired yet.
        sleep(Duration::from_secs(1)).await;
        assert!(h.provider.deletes().is_empty());
        assert_eq!(h.sweeper.state(), SweeperState::Idle);

        h.clock.advance(ChronoDuration::hours(2));
        sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(h.provider.deletes(), vec![id]);
        assert!(h.store.list_owners().unwrap().is_empty());

        h.sweeper.stop().await.unwrap();
        assert_eq!(h.sweeper.state(), SweeperState::Stopped);
        h.sweeper.stopped().await;

        // Stopping twice is harmless.
        h.sweeper.stop().await.unwrap();
    }

    struct BrokenStore {
        lists: AtomicUsize,
    }

    impl RecordStore for BrokenStore {
        fn get(&self, _owner: OwnerId) -> Result<Option<OwnerRecord>> {
            Ok(None)
        }
        fn put(&self, _owner: OwnerId, _record: &OwnerRecord) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _owner: OwnerId) -> Result<()> {
            Ok(())
        }
        fn list_owners(&self) -> Result<Vec<OwnerId>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Err(Error::StoreUnavailable("disk I/O error".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_store_failure_ends_the_loop() {
        let store = Arc::new(BrokenStore {
            lists: AtomicUsize::new(0),
        });
        let sweeper = ExpirySweeper::new(
            store.clone(),
            Arc::new(FakeProvider::new()),
            Arc::new(ManualClock::new(t0())),
            Arc::new(OwnerLocks::new()),
            SweeperConfig {
                interval: Duration::from_secs(60),
                store_failure_limit: 3,
            },
        );

        assert!(sweeper.start().await);
        sweeper.stopped().await;

        let err = sweeper.stop().await.unwrap_err();
        assert!(err.is_store_failure());
        assert_eq!(store.lists.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn create_racing_a_sweep_keeps_both_changes() {
        for _ in 0..50 {
            let h = Arc::new(harness());
            let text = create(&h, 1, ResourceKind::Text, "old", 1).await;
            h.clock.advance(ChronoDuration::hours(2));

            let creating = {
                let h = h.clone();
                tokio::spawn(async move {
                    h.manager
                        .create(OwnerId(1), ResourceKind::Voice, "new", 3)
                        .await
                })
            };
            let sweeping = {
                let h = h.clone();
                tokio::spawn(async move { h.sweeper.sweep_once().await })
            };

            let voice = match creating.await.unwrap().unwrap() {
                CreateOutcome::Created(ch) => ch,
                other => panic!("expected Created, got {other:?}"),
            };
            let report = sweeping.await.unwrap().unwrap();

            assert_eq!(report.deleted, 1);
            assert_eq!(h.provider.deletes(), vec![text]);
            let rec = h.store.get(OwnerId(1)).unwrap().unwrap();
            assert_eq!(rec.voice.unwrap().channel_id, voice.id);
            assert!(rec.text.is_none());
        }
    }

    /// Holds `resolve` of one channel until released.
    struct GatedProvider {
        inner: Arc<FakeProvider>,
        gate: ChannelId,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl ChannelProvider for GatedProvider {
        async fn resolve(&self, id: ChannelId) -> ProviderResult<Option<ChannelRef>> {
            if id == self.gate {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.resolve(id).await
        }

        async fn occupant_count(&self, channel: &ChannelRef) -> ProviderResult<usize> {
            self.inner.occupant_count(channel).await
        }

        async fn create_channel(
            &self,
            kind: ResourceKind,
            name: &str,
            permissions: &OwnerPermissions,
        ) -> ProviderResult<ChannelRef> {
            self.inner.create_channel(kind, name, permissions).await
        }

        async fn delete_channel(&self, channel: &ChannelRef) -> ProviderResult<()> {
            self.inner.delete_channel(channel).await
        }
    }

    #[tokio::test]
    async fn stop_mid_sweep_finishes_current_owner_and_exits() {
        let fake = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        for (owner, channel) in [(1u64, 11u64), (2, 22), (3, 33)] {
            fake.insert(ChannelId(channel), ResourceKind::Text, "t");
            let mut rec = OwnerRecord::default();
            rec.set(
                ResourceKind::Text,
                ResourceEntry {
                    channel_id: ChannelId(channel),
                    expires_at: t0(),
                },
            );
            store.put(OwnerId(owner), &rec).unwrap();
        }
        let provider = Arc::new(GatedProvider {
            inner: fake.clone(),
            gate: ChannelId(11),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let sweeper = ExpirySweeper::new(
            store.clone(),
            provider.clone(),
            Arc::new(ManualClock::new(t0() + ChronoDuration::minutes(1))),
            Arc::new(OwnerLocks::new()),
            SweeperConfig {
                interval: Duration::from_secs(60 * 60),
                store_failure_limit: 3,
            },
        );

        assert!(sweeper.start().await);
        provider.entered.notified().await;
        assert_eq!(sweeper.state(), SweeperState::Scanning);

        // stop() cancels first; the gated owner is released afterwards.
        let release = async {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            provider.release.notify_one();
        };
        let (stopped, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(sweeper.stop(), release)
        })
        .await
        .expect("stop waited for another tick");
        stopped.unwrap();

        assert_eq!(sweeper.state(), SweeperState::Stopped);
        assert_eq!(fake.deletes(), vec![ChannelId(11)]);
        assert_eq!(store.list_owners().unwrap(), vec![OwnerId(2), OwnerId(3)]);
        assert!(fake.exists(ChannelId(22)));
        assert!(fake.exists(ChannelId(33)));
    }
}
