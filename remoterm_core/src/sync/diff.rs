//! Classifying two profile collections and merging divergent profiles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::ConnectionProfile;

/// Ids that differ between the local and the remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataInconsistency {
    pub local_only: BTreeSet<String>,
    pub server_only: BTreeSet<String>,
    /// Present on both sides with different content.
    pub conflicts: BTreeSet<String>,
}

impl DataInconsistency {
    pub fn is_empty(&self) -> bool {
        self.local_only.is_empty() && self.server_only.is_empty() && self.conflicts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.local_only.len() + self.server_only.len() + self.conflicts.len()
    }
}

pub type ProfileMap = BTreeMap<String, ConnectionProfile>;

pub fn index(profiles: Vec<ConnectionProfile>) -> ProfileMap {
    profiles.into_iter().map(|p| (p.id.clone(), p)).collect()
}

/// Content is compared by fingerprint, so bookkeeping fields such as
/// `updated_at` alone never make two copies diverge.
pub fn diff(local: &ProfileMap, remote: &ProfileMap) -> DataInconsistency {
    let mut out = DataInconsistency::default();
    for (id, mine) in local {
        match remote.get(id) {
            None => {
                out.local_only.insert(id.clone());
            }
            Some(theirs) if mine.fingerprint() != theirs.fingerprint() => {
                out.conflicts.insert(id.clone());
            }
            Some(_) => {}
        }
    }
    out.server_only = remote
        .keys()
        .filter(|id| !local.contains_key(*id))
        .cloned()
        .collect();
    out
}

/// Which copy wins a conflict under the merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeChoice {
    KeepLocal,
    KeepRemote,
}

/// `choice` if given, else the more recently updated copy (local on ties).
pub fn winner(
    local: &ConnectionProfile,
    remote: &ConnectionProfile,
    choice: Option<MergeChoice>,
) -> MergeChoice {
    choice.unwrap_or(if remote.updated_at > local.updated_at {
        MergeChoice::KeepRemote
    } else {
        MergeChoice::KeepLocal
    })
}

/// Merge two copies of the same profile.
///
/// The [`winner`]'s fields are kept except that tags are united and an empty
/// description is filled from the other copy, so neither side's additions
/// are lost.
pub fn merge(
    local: &ConnectionProfile,
    remote: &ConnectionProfile,
    choice: Option<MergeChoice>,
) -> ConnectionProfile {
    let (winner, loser) = match winner(local, remote, choice) {
        MergeChoice::KeepLocal => (local, remote),
        MergeChoice::KeepRemote => (remote, local),
    };

    let mut merged = winner.clone();
    let tags: BTreeSet<&String> = winner.tags.iter().chain(loser.tags.iter()).collect();
    merged.tags = tags.into_iter().cloned().collect();
    if merged.description.is_empty() {
        merged.description = loser.description.clone();
    }
    merged.created_at = winner.created_at.min(loser.created_at);
    merged.updated_at = winner.updated_at.max(loser.updated_at);
    merged.last_connected_at = winner.last_connected_at.max(loser.last_connected_at);
    merged
}
