use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use super::diff::{self, DataInconsistency, MergeChoice, ProfileMap};
use super::{SyncError, SyncOutcome, SyncResult, SyncState, SyncStrategy};
use crate::config::SyncConfig;
use crate::storage::{ConnectionProfile, ProfileRepository};

/// One planned change; a merged conflict writes to both sides.
#[derive(Debug)]
struct PlannedItem {
    id: String,
    to_local: Option<ConnectionProfile>,
    to_remote: Option<ConnectionProfile>,
}

/// Publishes `Error` if a run is dropped before it finished.
struct RunGuard<'a> {
    engine: &'a ProfileSyncEngine,
    strategy: Option<SyncStrategy>,
    synced: usize,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Sync cancelled after {} profile(s)", self.synced);
            self.engine.finish(SyncResult {
                success: false,
                synced_count: self.synced,
                error: Some(SyncError::Cancelled.to_string()),
                strategy: self.strategy,
                finished_at: SystemTime::now(),
            });
        }
    }
}

/// Reconciles a local and a remote [`ProfileRepository`].
///
/// Runs are exclusive; a second `sync` while one is in flight fails with
/// [`SyncError::AlreadySyncing`]. Writes are applied one profile at a time and
/// never rolled back, so a failed or cancelled run keeps what it already
/// wrote.
pub struct ProfileSyncEngine {
    local: Arc<dyn ProfileRepository>,
    remote: Arc<dyn ProfileRepository>,
    fetch_timeout: Duration,
    default_strategy: SyncStrategy,
    run: tokio::sync::Mutex<()>,
    /// Set while in `Conflict`; `resolve` is only valid then.
    pending: Mutex<Option<DataInconsistency>>,
    last_sync: Mutex<Option<SystemTime>>,
    state_tx: watch::Sender<Arc<SyncState>>,
    transitions_tx: broadcast::Sender<Arc<SyncState>>,
}

impl ProfileSyncEngine {
    pub fn new(
        local: Arc<dyn ProfileRepository>,
        remote: Arc<dyn ProfileRepository>,
        config: &SyncConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(Arc::new(SyncState::Idle));
        let (transitions_tx, _) = broadcast::channel(64);
        Self {
            local,
            remote,
            fetch_timeout: config.fetch_timeout,
            default_strategy: config.auto_strategy,
            run: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            last_sync: Mutex::new(None),
            state_tx,
            transitions_tx,
        }
    }

    pub fn state(&self) -> Arc<SyncState> {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SyncState>> {
        self.state_tx.subscribe()
    }

    /// Every transition, in order, progress updates included.
    pub fn transitions(&self) -> broadcast::Receiver<Arc<SyncState>> {
        self.transitions_tx.subscribe()
    }

    /// When the last run completed, successfully or not. Display only.
    pub fn last_sync_time(&self) -> Option<SystemTime> {
        *self.last_sync.lock()
    }

    /// Compare both collections. Returns the pending conflict if they differ.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let _run = self.run.try_lock().map_err(|_| SyncError::AlreadySyncing)?;
        self.sync_locked().await
    }

    /// Apply `strategy` to the pending conflict. `overrides` pick the winner
    /// of individual conflicts under [`SyncStrategy::Merge`].
    pub async fn resolve(
        &self,
        strategy: SyncStrategy,
        overrides: &HashMap<String, MergeChoice>,
    ) -> Result<SyncResult, SyncError> {
        let _run = self.run.try_lock().map_err(|_| SyncError::AlreadySyncing)?;
        if self.pending.lock().is_none() {
            return Err(SyncError::NoPendingConflict);
        }
        self.resolve_locked(strategy, overrides).await
    }

    /// Sync and, on conflict, resolve right away with `strategy` (or the
    /// configured default).
    pub async fn full_sync(&self, strategy: Option<SyncStrategy>) -> Result<SyncResult, SyncError> {
        let _run = self.run.try_lock().map_err(|_| SyncError::AlreadySyncing)?;
        match self.sync_locked().await? {
            SyncOutcome::Completed(result) => Ok(result),
            SyncOutcome::Conflict(_) => {
                let strategy = strategy.unwrap_or(self.default_strategy);
                info!("Resolving automatically with {}", strategy);
                self.resolve_locked(strategy, &HashMap::new()).await
            }
        }
    }

    /// Back to `Idle` from any finished state.
    pub fn reset(&self) {
        if !self.state().is_syncing() {
            self.pending.lock().take();
            self.publish(SyncState::Idle);
        }
    }

    fn publish(&self, state: SyncState) {
        debug!("Sync state -> {:?}", state);
        let state = Arc::new(state);
        self.state_tx.send_replace(state.clone());
        let _ = self.transitions_tx.send(state);
    }

    fn finish(&self, result: SyncResult) {
        *self.last_sync.lock() = Some(result.finished_at);
        if result.success {
            self.publish(SyncState::Success { result });
        } else {
            self.publish(SyncState::Error { result });
        }
    }

    /// A fresh run passes through `Idle`; resolving a conflict goes
    /// straight to `Syncing`.
    fn begin(&self, fresh: bool) {
        self.pending.lock().take();
        if fresh && !matches!(*self.state(), SyncState::Idle) {
            self.publish(SyncState::Idle);
        }
        self.publish(SyncState::Syncing { progress: 0.0 });
    }

    fn fail(&self, strategy: Option<SyncStrategy>, synced: usize, e: &SyncError) -> SyncResult {
        error!("Sync failed: {}", e);
        let result = SyncResult {
            success: false,
            synced_count: synced,
            error: Some(e.to_string()),
            strategy,
            finished_at: SystemTime::now(),
        };
        self.finish(result.clone());
        result
    }

    async fn fetch(&self) -> Result<(ProfileMap, ProfileMap), SyncError> {
        let local = timeout(self.fetch_timeout, self.local.list())
            .await
            .map_err(|_| SyncError::Timeout("local"))?
            .map_err(SyncError::Store)?;
        let remote = timeout(self.fetch_timeout, self.remote.list())
            .await
            .map_err(|_| SyncError::Timeout("remote"))?
            .map_err(SyncError::Remote)?;
        Ok((diff::index(local), diff::index(remote)))
    }

    async fn sync_locked(&self) -> Result<SyncOutcome, SyncError> {
        self.begin(true);
        let mut guard = RunGuard {
            engine: self,
            strategy: None,
            synced: 0,
            armed: true,
        };

        let (local, remote) = match self.fetch().await {
            Ok(both) => both,
            Err(e) => {
                guard.armed = false;
                self.fail(None, 0, &e);
                return Err(e);
            }
        };
        guard.armed = false;

        let inconsistency = diff::diff(&local, &remote);
        if inconsistency.is_empty() {
            info!("Profiles are in sync ({} local)", local.len());
            let result = SyncResult {
                success: true,
                synced_count: 0,
                error: None,
                strategy: None,
                finished_at: SystemTime::now(),
            };
            self.finish(result.clone());
            return Ok(SyncOutcome::Completed(result));
        }

        info!(
            "Profiles differ: {} local only, {} remote only, {} conflicting",
            inconsistency.local_only.len(),
            inconsistency.server_only.len(),
            inconsistency.conflicts.len()
        );
        *self.pending.lock() = Some(inconsistency.clone());
        self.publish(SyncState::Conflict {
            inconsistency: inconsistency.clone(),
        });
        Ok(SyncOutcome::Conflict(inconsistency))
    }

    /// Collections are fetched again so the plan reflects the current data,
    /// not the snapshot the conflict was reported from.
    async fn resolve_locked(
        &self,
        strategy: SyncStrategy,
        overrides: &HashMap<String, MergeChoice>,
    ) -> Result<SyncResult, SyncError> {
        self.begin(false);
        let mut guard = RunGuard {
            engine: self,
            strategy: Some(strategy),
            synced: 0,
            armed: true,
        };

        let (local, remote) = match self.fetch().await {
            Ok(both) => both,
            Err(e) => {
                guard.armed = false;
                self.fail(Some(strategy), 0, &e);
                return Err(e);
            }
        };
        let inconsistency = diff::diff(&local, &remote);
        let plan = plan(strategy, &inconsistency, &local, &remote, overrides);
        let total = plan.len();
        info!("Applying {} with {} write(s)", strategy, total);

        for (done, item) in plan.into_iter().enumerate() {
            if let Err(e) = self.apply(&item).await {
                guard.armed = false;
                warn!("Stopped at profile '{}'", item.id);
                return Ok(self.fail(Some(strategy), guard.synced, &e));
            }
            guard.synced += 1;
            self.publish(SyncState::Syncing {
                progress: (done + 1) as f32 / total as f32,
            });
        }

        guard.armed = false;
        let result = SyncResult {
            success: true,
            synced_count: guard.synced,
            error: None,
            strategy: Some(strategy),
            finished_at: SystemTime::now(),
        };
        info!("Sync finished: {} profile(s) written", result.synced_count);
        self.finish(result.clone());
        Ok(result)
    }

    async fn apply(&self, item: &PlannedItem) -> Result<(), SyncError> {
        if let Some(p) = &item.to_remote {
            debug!("Uploading profile '{}'", p.id);
            self.remote.upsert(p).await.map_err(SyncError::Remote)?;
        }
        if let Some(p) = &item.to_local {
            debug!("Downloading profile '{}'", p.id);
            self.local.upsert(p).await.map_err(SyncError::Store)?;
        }
        Ok(())
    }
}

fn plan(
    strategy: SyncStrategy,
    inconsistency: &DataInconsistency,
    local: &ProfileMap,
    remote: &ProfileMap,
    overrides: &HashMap<String, MergeChoice>,
) -> Vec<PlannedItem> {
    let upload = |id: &String| {
        local.get(id).map(|p| PlannedItem {
            id: id.clone(),
            to_local: None,
            to_remote: Some(p.clone()),
        })
    };
    let download = |id: &String| {
        remote.get(id).map(|p| PlannedItem {
            id: id.clone(),
            to_local: Some(p.clone()),
            to_remote: None,
        })
    };

    match strategy {
        SyncStrategy::UploadLocal => inconsistency
            .local_only
            .iter()
            .chain(&inconsistency.conflicts)
            .filter_map(upload)
            .collect(),
        SyncStrategy::DownloadRemote => inconsistency
            .server_only
            .iter()
            .chain(&inconsistency.conflicts)
            .filter_map(download)
            .collect(),
        SyncStrategy::Merge => {
            let mut items: Vec<PlannedItem> = inconsistency
                .local_only
                .iter()
                .filter_map(upload)
                .chain(inconsistency.server_only.iter().filter_map(download))
                .collect();
            for id in &inconsistency.conflicts {
                let (Some(mine), Some(theirs)) = (local.get(id), remote.get(id)) else {
                    continue;
                };
                let choice = overrides.get(id).copied();
                let merged = diff::merge(mine, theirs, choice);
                let loser = match diff::winner(mine, theirs, choice) {
                    MergeChoice::KeepLocal => "remote",
                    MergeChoice::KeepRemote => "local",
                };
                debug!("Merged '{}', {} copy lost where fields differ", id, loser);
                items.push(PlannedItem {
                    id: id.clone(),
                    to_local: (merged != *mine).then(|| merged.clone()),
                    to_remote: (merged != *theirs).then_some(merged),
                });
            }
            items
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AuthMethod, MemoryProfileStore};

    fn profile(id: &str, host: &str) -> ConnectionProfile {
        let mut p = ConnectionProfile::new(
            id,
            host,
            22,
            "dev",
            AuthMethod::Password {
                password: "pw".into(),
            },
        );
        p.id = id.to_string();
        p
    }

    fn engine(local: &MemoryProfileStore, remote: &MemoryProfileStore) -> ProfileSyncEngine {
        ProfileSyncEngine::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            &SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn identical_collections_succeed_without_writes() {
        let local = MemoryProfileStore::with_profiles([profile("A", "a")]);
        let remote = MemoryProfileStore::with_profiles(local.snapshot());
        let engine = engine(&local, &remote);

        match engine.sync().await.unwrap() {
            SyncOutcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(result.synced_count, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(*engine.state(), SyncState::Success { .. }));
        assert!(engine.last_sync_time().is_some());
    }

    #[tokio::test]
    async fn resolve_needs_a_pending_conflict() {
        let engine = engine(&MemoryProfileStore::new(), &MemoryProfileStore::new());
        assert!(matches!(
            engine.resolve(SyncStrategy::Merge, &HashMap::new()).await,
            Err(SyncError::NoPendingConflict)
        ));
    }

    #[tokio::test]
    async fn download_remote_overwrites_local_and_keeps_local_only() {
        let local = MemoryProfileStore::with_profiles([profile("A", "a"), profile("B", "b-local")]);
        let remote = MemoryProfileStore::with_profiles([profile("B", "b-remote"), profile("C", "c")]);
        let engine = engine(&local, &remote);

        assert!(matches!(engine.sync().await.unwrap(), SyncOutcome::Conflict(_)));
        let result = engine
            .resolve(SyncStrategy::DownloadRemote, &HashMap::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.synced_count, 2);

        let hosts: Vec<_> = local.snapshot().into_iter().map(|p| p.host).collect();
        assert_eq!(hosts, vec!["a", "b-remote", "c"]);
        assert_eq!(remote.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn merge_leaves_both_sides_equal() {
        let local = MemoryProfileStore::with_profiles([profile("A", "a"), profile("B", "b-local")]);
        let remote = MemoryProfileStore::with_profiles([profile("B", "b-remote"), profile("C", "c")]);
        let engine = engine(&local, &remote);

        let overrides = HashMap::from([("B".to_string(), MergeChoice::KeepRemote)]);
        engine.sync().await.unwrap();
        let result = engine.resolve(SyncStrategy::Merge, &overrides).await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_count, 3);
        assert_eq!(local.snapshot(), remote.snapshot());
        assert_eq!(local.snapshot()[1].host, "b-remote");

        // nothing left to do
        assert!(matches!(
            engine.sync().await.unwrap(),
            SyncOutcome::Completed(SyncResult { synced_count: 0, .. })
        ));
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<SyncState>>) -> Vec<Arc<SyncState>> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        seen
    }

    #[tokio::test]
    async fn resolve_goes_from_conflict_straight_to_syncing() {
        let local = MemoryProfileStore::with_profiles([profile("A", "a")]);
        let remote = MemoryProfileStore::new();
        let engine = engine(&local, &remote);

        engine.sync().await.unwrap();
        let mut transitions = engine.transitions();
        engine.resolve(SyncStrategy::UploadLocal, &HashMap::new()).await.unwrap();

        let seen = drain(&mut transitions);
        assert!(matches!(*seen[0], SyncState::Syncing { progress } if progress == 0.0));
        assert!(matches!(**seen.last().unwrap(), SyncState::Success { .. }));
        assert!(!seen.iter().any(|s| matches!(**s, SyncState::Idle)));

        // a new run starts over from idle
        engine.sync().await.unwrap();
        let seen = drain(&mut transitions);
        assert!(matches!(*seen[0], SyncState::Idle));
        assert!(matches!(*seen[1], SyncState::Syncing { .. }));
    }

    #[tokio::test]
    async fn full_sync_applies_the_default_strategy() {
        let local = MemoryProfileStore::with_profiles([profile("A", "a")]);
        let remote = MemoryProfileStore::with_profiles([profile("C", "c")]);
        let engine = engine(&local, &remote);

        let result = engine.full_sync(None).await.unwrap();
        assert_eq!(result.strategy, Some(SyncStrategy::Merge));
        assert_eq!(local.snapshot().len(), 2);
        assert_eq!(remote.snapshot().len(), 2);
    }
}
