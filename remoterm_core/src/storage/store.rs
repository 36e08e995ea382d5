use std::{fs, io, path::PathBuf};

use async_trait::async_trait;
use directories::ProjectDirs;
use log::{debug, warn};
use serde_json::Error as SerdeError;

use super::profile::ConnectionProfile;
use super::{ProfileRepository, StoreError};

/// Local profile store: one `<id>.json` file per profile.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    dir: PathBuf,
}

impl FileProfileStore {
    /// `~/.config/remoterm/profiles` on Linux, `%APPDATA%\remoterm\profiles` on Windows, etc.
    pub fn new() -> io::Result<Self> {
        let proj = ProjectDirs::from("", "", "remoterm")
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Unable to locate config dir"))?;
        Self::with_dir(proj.config_dir().join("profiles"))
    }

    /// Store rooted at an explicit directory (created if missing).
    pub fn with_dir(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        // ids become file names; keep them from escaping the directory
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Returns every stored profile (skips malformed files with a warning).
    pub fn list_sync(&self) -> io::Result<Vec<ConnectionProfile>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::File::open(&path)
                .and_then(|f| serde_json::from_reader(io::BufReader::new(f)).map_err(SerdeError::into))
            {
                Ok(profile) => out.push(profile),
                Err(e) => warn!("Could not read profile {:?}: {e}", path),
            }
        }
        out.sort_by(|a: &ConnectionProfile, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Create or overwrite a profile.
    pub fn save_sync(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        let path = self.file_for(&profile.id)?;
        // write-then-rename so a crash never leaves half a profile behind
        let tmp = path.with_extension("json.tmp");
        let file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(file, profile).map_err(io::Error::from)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved profile '{}' to {:?}", profile.id, path);
        Ok(())
    }

    /// Delete a profile (`Ok(true)` if removed, `Ok(false)` if it didn't exist).
    pub fn delete_sync(&self, id: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.file_for(id)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProfileRepository for FileProfileStore {
    async fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        Ok(self.list_sync()?)
    }

    async fn get(&self, id: &str) -> Result<Option<ConnectionProfile>, StoreError> {
        let path = self.file_for(id)?;
        match fs::File::open(&path) {
            Ok(f) => serde_json::from_reader(io::BufReader::new(f))
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{path:?}: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        self.save_sync(profile)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_sync(id)
    }
}
