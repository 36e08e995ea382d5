use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use remoterm_core::config::SyncConfig;
use remoterm_core::storage::{
    ConnectionProfile, FileProfileStore, MemoryProfileStore, ProfileRepository, StoreError,
};
use remoterm_core::sync::{SyncError, SyncOutcome, SyncState, SyncStrategy};
use remoterm_core::ProfileSyncEngine;
use tokio::time::{sleep, Duration};

mod common;
use common::{init_logs, profile};

fn with_id(id: &str, host: &str) -> ConnectionProfile {
    let mut p = profile(id);
    p.id = id.to_string();
    p.host = host.to_string();
    p
}

fn ids(profiles: &[ConnectionProfile]) -> Vec<&str> {
    profiles.iter().map(|p| p.id.as_str()).collect()
}

#[tokio::test]
async fn conflict_is_classified_and_upload_keeps_remote_only_profiles() -> Result<()> {
    init_logs();
    let dir = tempfile::tempdir()?;
    let local = FileProfileStore::with_dir(dir.path())?;
    local.upsert(&with_id("A", "a.example.org")).await?;
    local.upsert(&with_id("B", "b-local.example.org")).await?;
    let remote = MemoryProfileStore::with_profiles([
        with_id("B", "b-remote.example.org"),
        with_id("C", "c.example.org"),
    ]);
    let engine = ProfileSyncEngine::new(
        Arc::new(local.clone()),
        Arc::new(remote.clone()),
        &SyncConfig::default(),
    );

    let inconsistency = match engine.sync().await? {
        SyncOutcome::Conflict(inconsistency) => inconsistency,
        other => panic!("expected a conflict, got {other:?}"),
    };
    assert_eq!(inconsistency.local_only, BTreeSet::from(["A".to_string()]));
    assert_eq!(inconsistency.server_only, BTreeSet::from(["C".to_string()]));
    assert_eq!(inconsistency.conflicts, BTreeSet::from(["B".to_string()]));
    assert!(matches!(*engine.state(), SyncState::Conflict { .. }));

    let result = engine
        .resolve(SyncStrategy::UploadLocal, &HashMap::new())
        .await?;
    assert!(result.success);
    assert_eq!(result.synced_count, 2);
    assert_eq!(result.strategy, Some(SyncStrategy::UploadLocal));
    assert!(engine.last_sync_time().is_some());

    let remote_now = remote.snapshot();
    assert_eq!(ids(&remote_now), vec!["A", "B", "C"], "C must survive an upload");
    assert_eq!(remote_now[1].host, "b-local.example.org");
    assert_eq!(ids(&local.list().await?), vec!["A", "B"], "upload never downloads");
    Ok(())
}

#[tokio::test]
async fn resolving_twice_needs_a_new_conflict() -> Result<()> {
    init_logs();
    let local = MemoryProfileStore::with_profiles([with_id("A", "a")]);
    let remote = MemoryProfileStore::new();
    let engine =
        ProfileSyncEngine::new(Arc::new(local), Arc::new(remote), &SyncConfig::default());

    engine.sync().await?;
    engine.resolve(SyncStrategy::Merge, &HashMap::new()).await?;
    assert!(matches!(
        engine.resolve(SyncStrategy::Merge, &HashMap::new()).await,
        Err(SyncError::NoPendingConflict)
    ));
    Ok(())
}

/// Remote whose calls take a while, or fail.
#[derive(Clone, Default)]
struct SlowRemote {
    inner: MemoryProfileStore,
    list_delay: Duration,
    list_broken: bool,
    write_delay: Duration,
    broken_id: Option<&'static str>,
}

#[async_trait]
impl ProfileRepository for SlowRemote {
    async fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        sleep(self.list_delay).await;
        if self.list_broken {
            return Err(StoreError::Remote("502 Bad Gateway".into()));
        }
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> Result<Option<ConnectionProfile>, StoreError> {
        self.inner.get(id).await
    }

    async fn upsert(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        sleep(self.write_delay).await;
        if self.broken_id == Some(profile.id.as_str()) {
            return Err(StoreError::Remote("503 Service Unavailable".into()));
        }
        self.inner.upsert(profile).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn failed_write_keeps_what_was_already_synced() -> Result<()> {
    init_logs();
    let local =
        MemoryProfileStore::with_profiles([with_id("A", "a"), with_id("B", "b"), with_id("C", "c")]);
    let remote = SlowRemote {
        broken_id: Some("B"),
        ..SlowRemote::default()
    };
    let engine = ProfileSyncEngine::new(
        Arc::new(local),
        Arc::new(remote.clone()),
        &SyncConfig::default(),
    );

    let result = engine.full_sync(Some(SyncStrategy::UploadLocal)).await?;
    assert!(!result.success);
    assert_eq!(result.synced_count, 1);
    assert!(result.error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(ids(&remote.inner.snapshot()), vec!["A"], "no rollback");
    assert!(matches!(*engine.state(), SyncState::Error { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_sync_reports_an_error_and_keeps_partial_writes() -> Result<()> {
    init_logs();
    let local =
        MemoryProfileStore::with_profiles([with_id("A", "a"), with_id("B", "b"), with_id("C", "c")]);
    let remote = SlowRemote {
        write_delay: Duration::from_secs(1),
        ..SlowRemote::default()
    };
    let engine = Arc::new(ProfileSyncEngine::new(
        Arc::new(local),
        Arc::new(remote.clone()),
        &SyncConfig::default(),
    ));

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.full_sync(Some(SyncStrategy::UploadLocal)).await })
    };
    sleep(Duration::from_millis(1500)).await;
    assert!(matches!(engine.sync().await, Err(SyncError::AlreadySyncing)));
    match &*engine.state() {
        SyncState::Syncing { progress } => assert!((*progress - 1.0 / 3.0).abs() < 1e-6),
        other => panic!("expected progress, got {other:?}"),
    }

    run.abort();
    assert!(run.await.is_err(), "task was cancelled");

    match &*engine.state() {
        SyncState::Error { result } => {
            assert_eq!(result.synced_count, 1);
            assert_eq!(result.error.as_deref(), Some("sync was cancelled"));
        }
        other => panic!("expected an error state, got {other:?}"),
    }
    assert_eq!(ids(&remote.inner.snapshot()), vec!["A"]);
    Ok(())
}

#[tokio::test]
async fn unreachable_remote_fails_the_run_without_writes() -> Result<()> {
    init_logs();
    let local = MemoryProfileStore::with_profiles([with_id("A", "a")]);
    let remote = SlowRemote {
        list_broken: true,
        ..SlowRemote::default()
    };
    let engine = ProfileSyncEngine::new(
        Arc::new(local),
        Arc::new(remote.clone()),
        &SyncConfig::default(),
    );

    assert!(matches!(engine.sync().await, Err(SyncError::Remote(_))));
    match &*engine.state() {
        SyncState::Error { result } => {
            assert!(!result.success);
            assert_eq!(result.synced_count, 0);
            assert!(result.error.as_deref().unwrap_or_default().contains("502"));
        }
        other => panic!("expected an error state, got {other:?}"),
    }
    assert!(engine.last_sync_time().is_some());
    assert!(remote.inner.snapshot().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_remote_listing_times_out() -> Result<()> {
    init_logs();
    let local = MemoryProfileStore::with_profiles([with_id("A", "a")]);
    let remote = SlowRemote {
        list_delay: Duration::from_secs(60),
        ..SlowRemote::default()
    };
    let config = SyncConfig {
        fetch_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    };
    let engine = ProfileSyncEngine::new(Arc::new(local), Arc::new(remote), &config);

    let err = engine
        .full_sync(Some(SyncStrategy::UploadLocal))
        .await
        .expect_err("listing must time out");
    assert!(matches!(err, SyncError::Timeout("remote")));
    match &*engine.state() {
        SyncState::Error { result } => {
            assert!(!result.success);
            assert_eq!(result.synced_count, 0);
        }
        other => panic!("expected an error state, got {other:?}"),
    }
    assert!(engine.last_sync_time().is_some());
    Ok(())
}
