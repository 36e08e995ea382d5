//! Reconciling the local profile store with the remote profile API.

pub mod diff;
pub mod engine;
pub mod remote;

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

pub use diff::{DataInconsistency, MergeChoice};
pub use engine::ProfileSyncEngine;
pub use remote::HttpProfileApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Local wins; remote-only profiles are left alone.
    UploadLocal,
    /// Remote wins; local-only profiles are left alone.
    DownloadRemote,
    /// Both sides end up with the union.
    Merge,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStrategy::UploadLocal => "upload-local",
            SyncStrategy::DownloadRemote => "download-remote",
            SyncStrategy::Merge => "merge",
        })
    }
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "upload-local" | "upload" => Ok(SyncStrategy::UploadLocal),
            "download-remote" | "download" => Ok(SyncStrategy::DownloadRemote),
            "merge" => Ok(SyncStrategy::Merge),
            other => Err(format!("unknown sync strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    /// Profiles fully written before the run finished or failed.
    pub synced_count: usize,
    pub error: Option<String>,
    /// `None` when nothing had to be resolved.
    pub strategy: Option<SyncStrategy>,
    pub finished_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Syncing {
        /// 0.0..=1.0 over the writes of the current run.
        progress: f32,
    },
    Success {
        result: SyncResult,
    },
    Error {
        result: SyncResult,
    },
    /// Waiting for [`ProfileSyncEngine::resolve`].
    Conflict {
        inconsistency: DataInconsistency,
    },
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::Syncing { .. })
    }
}

/// What a sync attempt ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncResult),
    Conflict(DataInconsistency),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadySyncing,
    #[error("there is no conflict to resolve")]
    NoPendingConflict,
    #[error("local profile store: {0}")]
    Store(#[source] StoreError),
    #[error("remote profile API: {0}")]
    Remote(#[source] StoreError),
    #[error("timed out fetching {0} profiles")]
    Timeout(&'static str),
    #[error("sync was cancelled")]
    Cancelled,
}
