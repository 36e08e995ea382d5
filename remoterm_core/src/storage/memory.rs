use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::profile::ConnectionProfile;
use super::{ProfileRepository, StoreError};

/// Process-local profile collection. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    profiles: Arc<Mutex<BTreeMap<String, ConnectionProfile>>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = ConnectionProfile>) -> Self {
        let store = Self::new();
        {
            let mut map = store.profiles.lock();
            for p in profiles {
                map.insert(p.id.clone(), p);
            }
        }
        store
    }

    /// Snapshot of the collection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionProfile> {
        self.profiles.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ProfileRepository for MemoryProfileStore {
    async fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        Ok(self.snapshot())
    }

    async fn get(&self, id: &str) -> Result<Option<ConnectionProfile>, StoreError> {
        Ok(self.profiles.lock().get(id).cloned())
    }

    async fn upsert(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        self.profiles
            .lock()
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.profiles.lock().remove(id).is_some())
    }
}
