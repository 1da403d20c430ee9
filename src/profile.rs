//! Cache of exploit parameters that worked before, keyed by the identity of
//! the device and of the firmware involved.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("malformed profile file: {0}")]
    Json(#[from] serde_json::Error),
}

/// The allocation configuration one attempt runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExploitParameters {
    pub gap_fill_size: u32,
    pub header_allocation_size: u32,
    pub allocate_async_buffers_first: bool,
    pub assume_second_header_falls_in_gap: bool,
    /// Only searched in experimental mode.
    #[serde(default)]
    pub allocate_backup_buffers_first: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub device_model: String,
    pub platform_id: String,
    pub current_firmware: String,
    pub target_firmware: String,
}

impl ProfileKey {
    pub fn new(
        device_model: impl Into<String>,
        platform_id: impl Into<String>,
        current_firmware: impl Into<String>,
        target_firmware: impl Into<String>,
    ) -> Self {
        ProfileKey {
            device_model: device_model.into(),
            platform_id: platform_id.into(),
            current_firmware: current_firmware.into(),
            target_firmware: target_firmware.into(),
        }
    }

    fn fields(&self) -> [&str; 4] {
        [
            &self.device_model,
            &self.platform_id,
            &self.current_firmware,
            &self.target_firmware,
        ]
    }
}

pub trait ProfileStore {
    fn get(&self, key: &ProfileKey) -> Result<Option<ExploitParameters>, ProfileError>;
    fn set(&mut self, key: &ProfileKey, parameters: ExploitParameters) -> Result<(), ProfileError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
    profiles: HashMap<ProfileKey, ExploitParameters>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, key: &ProfileKey) -> Result<Option<ExploitParameters>, ProfileError> {
        Ok(self.profiles.get(key).copied())
    }

    fn set(&mut self, key: &ProfileKey, parameters: ExploitParameters) -> Result<(), ProfileError> {
        self.profiles.insert(key.clone(), parameters);
        Ok(())
    }
}

/// One record of the profile file.
#[derive(Serialize, Deserialize)]
struct Entry {
    #[serde(flatten)]
    key: ProfileKey,
    parameters: ExploitParameters,
}

/// Profiles kept in a JSON file, rewritten on every change.
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    cache: MemoryProfileStore,
}

impl JsonProfileStore {
    /// Loads `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref().to_owned();
        let mut cache = MemoryProfileStore::new();
        match fs::read(&path) {
            Ok(raw) => {
                let entries: Vec<Entry> = serde_json::from_slice(&raw)?;
                for entry in entries {
                    cache.profiles.insert(entry.key, entry.parameters);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tracing::debug!("loaded {} profiles from {:?}", cache.len(), path);
        Ok(JsonProfileStore { path, cache })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), ProfileError> {
        let mut entries: Vec<Entry> = self
            .cache
            .profiles
            .iter()
            .map(|(key, parameters)| Entry {
                key: key.clone(),
                parameters: *parameters,
            })
            .collect();
        entries.sort_by(|a, b| a.key.fields().cmp(&b.key.fields()));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(&entries)?)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn get(&self, key: &ProfileKey) -> Result<Option<ExploitParameters>, ProfileError> {
        self.cache.get(key)
    }

    fn set(&mut self, key: &ProfileKey, parameters: ExploitParameters) -> Result<(), ProfileError> {
        self.cache.set(key, parameters)?;
        self.save()
    }
}
