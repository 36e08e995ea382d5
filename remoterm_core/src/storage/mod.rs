//! Profile model and the stores that hold profiles.
//!
//! Both the local file store and the remote profile API implement
//! [`ProfileRepository`], so the sync engine can treat them alike.

pub mod memory;
pub mod profile;
pub mod store;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryProfileStore;
pub use profile::{AuthMethod, ConnectionProfile, ProfileStatus};
pub use store::FileProfileStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid profile id '{0}'")]
    InvalidId(String),
    #[error("corrupt profile record: {0}")]
    Corrupt(String),
    #[error("remote profile API error: {0}")]
    Remote(String),
}

/// CRUD access to a collection of profiles keyed by id.
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    /// The full current collection.
    async fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<ConnectionProfile>, StoreError>;
    /// Create or overwrite by id.
    async fn upsert(&self, profile: &ConnectionProfile) -> Result<(), StoreError>;
    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}
