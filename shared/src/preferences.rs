use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::get_current_time_ms;
use crate::imaging::write_atomic;

pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes, max {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("serialization error for {key}: {message}")]
    Serialization { key: String, message: String },

    #[error("preferences file is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported preferences schema version {0}")]
    UnsupportedVersion(u32),

    #[error("preferences io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyNamespace {
    Profile,
    Settings,
}

impl KeyNamespace {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefKey {
    namespace: KeyNamespace,
    key: String,
}

impl PrefKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, PreferenceError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn profile(key: impl Into<String>) -> Result<Self, PreferenceError> {
        Self::new(KeyNamespace::Profile, key)
    }

    pub fn settings(key: impl Into<String>) -> Result<Self, PreferenceError> {
        Self::new(KeyNamespace::Settings, key)
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), PreferenceError> {
        let invalid = |key: String, reason: &str| PreferenceError::InvalidKey {
            key,
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid(key.to_string(), "key cannot be empty"));
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(PreferenceError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") {
            return Err(invalid(key.to_string(), "key cannot contain path traversal sequences"));
        }

        if key.chars().any(char::is_control) {
            return Err(invalid(key.escape_debug().to_string(), "key contains control characters"));
        }

        Ok(())
    }
}

impl std::fmt::Display for PrefKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace.prefix(), self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredValue {
    value: serde_json::Value,
    version: u64,
    updated_at_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PreferencesFile {
    schema_version: u32,
    entries: BTreeMap<String, StoredValue>,
}

/// Small JSON file of user preferences and the saved profile.
///
/// Every mutation rewrites the whole file (tmp + rename).
#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    entries: BTreeMap<String, StoredValue>,
}

impl PreferenceStore {
    /// Opens the store at `path`. A missing file yields an empty store.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PreferenceError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            debug!("no preferences file, starting empty");
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
            });
        }

        let size = std::fs::metadata(&path)?.len();
        if size > MAX_FILE_SIZE {
            return Err(PreferenceError::Corrupt(format!(
                "file is {size} bytes, max {MAX_FILE_SIZE}"
            )));
        }

        let raw = std::fs::read(&path)?;
        let file: PreferencesFile =
            serde_json::from_slice(&raw).map_err(|e| PreferenceError::Corrupt(e.to_string()))?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(PreferenceError::UnsupportedVersion(file.schema_version));
        }

        debug!(entries = file.entries.len(), "preferences loaded");
        Ok(Self {
            path,
            entries: file.entries,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &PrefKey) -> Result<Option<T>, PreferenceError> {
        let raw_key = key.raw();
        self.entries
            .get(&raw_key)
            .map(|stored| {
                serde_json::from_value(stored.value.clone()).map_err(|e| PreferenceError::Serialization {
                    key: raw_key.clone(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Stores `value` and persists. Returns the entry's new version.
    pub fn set<T: Serialize>(&mut self, key: &PrefKey, value: &T) -> Result<u64, PreferenceError> {
        let raw_key = key.raw();
        let value = serde_json::to_value(value).map_err(|e| PreferenceError::Serialization {
            key: raw_key.clone(),
            message: e.to_string(),
        })?;
        let size = value.to_string().len();
        if size > MAX_VALUE_SIZE {
            return Err(PreferenceError::ValueTooLarge {
                size,
                max: MAX_VALUE_SIZE,
            });
        }

        let version = self.entries.get(&raw_key).map_or(1, |old| old.version + 1);
        let previous = self.entries.insert(
            raw_key.clone(),
            StoredValue {
                value,
                version,
                updated_at_ms: get_current_time_ms(),
            },
        );

        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.entries.insert(raw_key, old),
                None => self.entries.remove(&raw_key),
            };
            return Err(e);
        }
        Ok(version)
    }

    /// Removes `key` and persists. Returns false if it was not present.
    pub fn remove(&mut self, key: &PrefKey) -> Result<bool, PreferenceError> {
        let raw_key = key.raw();
        let Some(old) = self.entries.remove(&raw_key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist() {
            self.entries.insert(raw_key, old);
            return Err(e);
        }
        Ok(true)
    }

    #[must_use]
    pub fn contains(&self, key: &PrefKey) -> bool {
        self.entries.contains_key(&key.raw())
    }

    /// Keys in a namespace, without the prefix, sorted.
    #[must_use]
    pub fn keys(&self, namespace: KeyNamespace) -> Vec<String> {
        let prefix = format!("{}:", namespace.prefix());
        self.entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(ToString::to_string))
            .collect()
    }

    #[must_use]
    pub fn version(&self, key: &PrefKey) -> Option<u64> {
        self.entries.get(&key.raw()).map(|stored| stored.version)
    }

    #[must_use]
    pub fn updated_at_ms(&self, key: &PrefKey) -> Option<u64> {
        self.entries.get(&key.raw()).map(|stored| stored.updated_at_ms)
    }

    fn persist(&self) -> Result<(), PreferenceError> {
        let file = PreferencesFile {
            schema_version: SCHEMA_VERSION,
            entries: self.entries.clone(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|e| PreferenceError::Serialization {
            key: "*".into(),
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        write_atomic(&self.path, &data)?;
        Ok(())
    }
}
