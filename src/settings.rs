use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::TimeDelta;
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::roles::Role;

pub const CONFIG_DIR_ENV: &str = "TENANT_OP_CONFIG_DIR";
pub const CACHE_FILE_ENV: &str = "TENANT_OP_CACHE_FILE";
pub const SUFFIXES_ENV: &str = "TENANT_OP_APP_SUFFIXES";
pub const POLL_INTERVAL_ENV: &str = "TENANT_OP_POLL_INTERVAL_SECS";
pub const CONCURRENCY_ENV: &str = "TENANT_OP_CONCURRENCY";
pub const CF_HOME_ENV: &str = "CF_HOME";

const SETTINGS_FILE: &str = "settings.json";
const CACHE_FILE: &str = "app-cache.json";

pub const DEFAULT_APP_SUFFIXES: &[&str] = &["-blue", "-green", "-{uuid}"];
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_CONCURRENCY: usize = 5;

pub fn cache_max_age() -> TimeDelta {
    TimeDelta::hours(12)
}

pub fn token_safety_gap() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// Snapshot of the process environment, passed explicitly to whatever needs
/// it. Empty values count as unset.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn app_suffixes(&self) -> Vec<String> {
        match self.get(SUFFIXES_ENV) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|suffix| !suffix.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_APP_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn poll_interval_secs(&self) -> anyhow::Result<u64> {
        self.parse_or(POLL_INTERVAL_ENV, DEFAULT_POLL_INTERVAL_SECS)
    }

    pub fn concurrency(&self) -> anyhow::Result<usize> {
        self.parse_or(CONCURRENCY_ENV, DEFAULT_CONCURRENCY)
    }

    fn parse_or<T>(&self, name: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(name) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid value {raw:?} for {name}")),
            None => Ok(default),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct OperatorSettings {
    #[serde(default)]
    pub target: Option<PlatformTarget>,
    #[serde(default)]
    pub apps: BTreeMap<Role, String>,
}

/// Where the deployed applications live.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlatformTarget {
    pub api_url: String,
    pub org_guid: String,
    pub space_guid: String,
    #[serde(default)]
    pub org_name: Option<String>,
    #[serde(default)]
    pub space_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl OperatorSettings {
    pub fn app_name(&self, role: Role) -> Option<&str> {
        self.apps
            .get(&role)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }
}

pub fn load_settings(path: &Path) -> anyhow::Result<OperatorSettings> {
    if !path.exists() {
        return Ok(OperatorSettings::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let settings: OperatorSettings = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &OperatorSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn settings_path(env: &Environment) -> anyhow::Result<PathBuf> {
    if let Some(value) = env.get(CONFIG_DIR_ENV) {
        return Ok(Path::new(value).join(SETTINGS_FILE));
    }
    Ok(project_dirs()?.config_dir().join(SETTINGS_FILE))
}

pub fn cache_file_path(env: &Environment) -> anyhow::Result<PathBuf> {
    if let Some(value) = env.get(CACHE_FILE_ENV) {
        return Ok(PathBuf::from(value));
    }
    Ok(project_dirs()?.cache_dir().join(CACHE_FILE))
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("", "tenant-operator", "operator")
        .ok_or_else(|| anyhow::anyhow!("unable to determine config directory"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CfCliConfig {
    #[serde(default)]
    target: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    organization_fields: CfCliEntity,
    #[serde(default)]
    space_fields: CfCliEntity,
}

#[derive(Debug, Default, Deserialize)]
struct CfCliEntity {
    #[serde(default, rename = "GUID")]
    guid: String,
    #[serde(default, rename = "Name")]
    name: String,
}

pub fn cf_cli_config_path(env: &Environment) -> Option<PathBuf> {
    let home = match env.get(CF_HOME_ENV) {
        Some(home) => PathBuf::from(home),
        None => directories_next::BaseDirs::new()?.home_dir().to_path_buf(),
    };
    Some(home.join(".cf").join("config.json"))
}

/// Read the platform target the platform CLI is logged into, if any.
pub fn load_cf_cli_target(path: &Path) -> anyhow::Result<Option<PlatformTarget>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: CfCliConfig = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if config.target.is_empty()
        || config.organization_fields.guid.is_empty()
        || config.space_fields.guid.is_empty()
    {
        return Ok(None);
    }
    let access_token = config
        .access_token
        .trim()
        .strip_prefix("bearer ")
        .unwrap_or(config.access_token.trim())
        .to_string();
    Ok(Some(PlatformTarget {
        api_url: config.target,
        org_guid: config.organization_fields.guid,
        space_guid: config.space_fields.guid,
        org_name: Some(config.organization_fields.name).filter(|name| !name.is_empty()),
        space_name: Some(config.space_fields.name).filter(|name| !name.is_empty()),
        access_token: Some(access_token).filter(|token| !token.is_empty()),
    }))
}
