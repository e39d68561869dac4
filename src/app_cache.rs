//! On-disk cache of app metadata shared between invocations.
//!
//! The whole file is one JSON object keyed by `org##space##app`. Entries
//! older than the max age or written by another tool version are ignored and
//! overwritten on the next refresh. Concurrent writers are not coordinated;
//! the last one wins.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OperatorError;
use crate::expiring_cache::CacheKey;
use crate::platform::AppMetadata;
use crate::settings::cache_max_age;

pub const FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(flatten)]
    pub metadata: AppMetadata,
}

impl PersistedEntry {
    pub fn is_usable(&self, now: DateTime<Utc>, max_age: TimeDelta, version: &str) -> bool {
        self.version == version && now - self.timestamp <= max_age
    }
}

#[derive(Clone, Debug)]
pub struct PersistedAppCache {
    path: PathBuf,
    max_age: TimeDelta,
    version: String,
}

impl PersistedAppCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_policy(path, cache_max_age(), FORMAT_VERSION)
    }

    pub fn with_policy(path: impl Into<PathBuf>, max_age: TimeDelta, version: &str) -> Self {
        Self {
            path: path.into(),
            max_age,
            version: version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(org_guid: &str, space_guid: &str, app_name: &str) -> Result<CacheKey, OperatorError> {
        CacheKey::compound([org_guid, space_guid, app_name])
    }

    /// The stored metadata for `key`, if present, fresh and written by this
    /// version.
    pub fn load(&self, key: &CacheKey, now: DateTime<Utc>) -> anyhow::Result<Option<AppMetadata>> {
        let entries = self.read_entries()?;
        let Some(raw) = entries.get(key.as_str()) else {
            return Ok(None);
        };
        let entry: PersistedEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(key = %key, %err, "ignoring unreadable cache entry");
                return Ok(None);
            }
        };
        if !entry.is_usable(now, self.max_age, &self.version) {
            tracing::debug!(
                key = %key,
                written = %entry.timestamp,
                version = %entry.version,
                "ignoring stale cache entry"
            );
            return Ok(None);
        }
        Ok(Some(entry.metadata))
    }

    /// Insert or overwrite the entry for `key`, rewriting the whole file.
    pub fn store(
        &self,
        key: &CacheKey,
        metadata: &AppMetadata,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut entries = self.read_entries()?;
        let entry = PersistedEntry {
            timestamp: now,
            version: self.version.clone(),
            metadata: metadata.clone(),
        };
        entries.insert(key.as_str().to_string(), serde_json::to_value(entry)?);
        self.write_entries(&entries)
    }

    /// Remove the cache file. Returns whether there was one.
    pub fn clear(&self) -> anyhow::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }

    fn read_entries(&self) -> anyhow::Result<BTreeMap<String, Value>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %err,
                    "app cache file is corrupt; starting from an empty cache"
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_entries(&self, entries: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
