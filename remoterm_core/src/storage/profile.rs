use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::connections::errors::{ConnectionError, ConnectionErrorKind};
use crate::utils::time::now_millis;

/// How the backend should authenticate against the target host.
///
/// The enum is `#[serde(tag = "kind")]` so JSON looks like:
/// `{ "kind":"password", "password":"hunter2" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    PrivateKey {
        key_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    #[default]
    Active,
    Testing,
    Failed,
    Disabled,
}

/// A saved connection target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    #[serde(default)]
    pub status: ProfileStatus,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<u64>,
}

/// Fields that identify what a profile *is*; timestamps and runtime status
/// are left out so clock skew never makes two equal profiles look different.
#[derive(Serialize)]
struct FingerprintView<'a> {
    name: &'a str,
    description: &'a str,
    tags: Vec<&'a str>,
    host: &'a str,
    port: u16,
    username: &'a str,
    auth: &'a AuthMethod,
}

impl ConnectionProfile {
    /// New profile with a random id and fresh timestamps.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            host: host.into(),
            port,
            username: username.into(),
            auth,
            status: ProfileStatus::Active,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }

    /// Hex SHA-256 over the content fields.
    pub fn fingerprint(&self) -> String {
        let mut tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        tags.sort_unstable();
        tags.dedup();
        let view = FingerprintView {
            name: &self.name,
            description: &self.description,
            tags,
            host: &self.host,
            port: self.port,
            username: &self.username,
            auth: &self.auth,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Checks performed before any network I/O. Failures are never retryable.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::configuration(format!(
                "profile '{}' has no host",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(ConnectionError::configuration(format!(
                "profile '{}' has port 0",
                self.name
            )));
        }
        if self.username.trim().is_empty() {
            return Err(ConnectionError::new(
                ConnectionErrorKind::MissingCredentials,
                format!("profile '{}' has no username", self.name),
            ));
        }
        match &self.auth {
            AuthMethod::Password { password } if password.is_empty() => {
                Err(ConnectionError::new(
                    ConnectionErrorKind::MissingCredentials,
                    format!("profile '{}' has an empty password", self.name),
                ))
            }
            AuthMethod::PrivateKey { key_path, .. } if key_path.trim().is_empty() => {
                Err(ConnectionError::new(
                    ConnectionErrorKind::InvalidKey,
                    format!("profile '{}' has no private key path", self.name),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    pub fn mark_connected(&mut self) {
        self.last_connected_at = Some(now_millis());
    }
}
