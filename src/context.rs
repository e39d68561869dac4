//! Per-invocation context: role resolution, app metadata and tokens.
//!
//! A [`Context`] is built once per command. It lists the deployed apps of the
//! target space at most once, fetches the metadata of every app at most once
//! (backed by the on-disk [`PersistedAppCache`]) and hands out cached access
//! tokens per client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use chrono::{TimeDelta, Utc};
use serde_json::Value;

use crate::app_cache::PersistedAppCache;
use crate::error::OperatorError;
use crate::expiring_cache::{CacheKey, ExpiringCache};
use crate::memo::{MemoCache, OnceFlight};
use crate::platform::{AppMetadata, AppRecord, CfPlatform, ClientCredentials, Platform, TokenOptions};
use crate::roles::{Role, RoleBinding, SuffixPolicy};
use crate::settings::{
    self, Environment, OperatorSettings, PlatformTarget, token_safety_gap,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct ContextOptions {
    /// Read-only commands may also resolve the `-live` variant of an app.
    pub read_only: bool,
}

pub struct Context {
    env: Environment,
    settings: OperatorSettings,
    settings_path: PathBuf,
    target: PlatformTarget,
    platform: Arc<dyn Platform>,
    app_cache: PersistedAppCache,
    suffixes: SuffixPolicy,
    deployed: OnceFlight<Arc<Vec<AppRecord>>>,
    metadata: MemoCache<AppMetadata>,
    tokens: ExpiringCache<String>,
}

impl Context {
    /// Build a context from the process configuration, talking to the
    /// platform the settings (or the platform CLI login) point at.
    pub fn load(env: Environment, options: ContextOptions) -> anyhow::Result<Self> {
        let settings_path = settings::settings_path(&env)?;
        let settings = settings::load_settings(&settings_path)?;
        let target = match settings.target.clone() {
            Some(target) => target,
            None => settings::cf_cli_config_path(&env)
                .map(|path| settings::load_cf_cli_target(&path))
                .transpose()?
                .flatten()
                .ok_or_else(|| OperatorError::MissingConfig {
                    what: "platform target".to_string(),
                    env_var: settings::CF_HOME_ENV.to_string(),
                    settings: settings_path.display().to_string(),
                })?,
        };
        let app_cache = PersistedAppCache::new(settings::cache_file_path(&env)?);
        Ok(Self::new(
            env,
            settings,
            settings_path,
            target,
            Arc::new(CfPlatform::default()),
            app_cache,
            options,
        ))
    }

    pub fn new(
        env: Environment,
        settings: OperatorSettings,
        settings_path: PathBuf,
        target: PlatformTarget,
        platform: Arc<dyn Platform>,
        app_cache: PersistedAppCache,
        options: ContextOptions,
    ) -> Self {
        let suffixes = SuffixPolicy {
            alternates: env.app_suffixes(),
            read_only: options.read_only,
        };
        Self {
            env,
            settings,
            settings_path,
            target,
            platform,
            app_cache,
            suffixes,
            deployed: OnceFlight::new(),
            metadata: MemoCache::new(),
            tokens: ExpiringCache::new(token_safety_gap()),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn target(&self) -> &PlatformTarget {
        &self.target
    }

    pub fn settings_path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Configured base app name for `role`: environment first, then settings.
    pub fn app_name(&self, role: Role) -> Result<String, OperatorError> {
        let env_var = role.env_var();
        let configured = self.settings.app_name(role);
        match (self.env.get(env_var), configured) {
            (Some(overridden), Some(configured)) => {
                if overridden != configured {
                    tracing::info!(
                        role = %role,
                        env_var,
                        configured,
                        overridden,
                        "environment overrides configured app name"
                    );
                }
                Ok(overridden.to_string())
            }
            (Some(overridden), None) => Ok(overridden.to_string()),
            (None, Some(configured)) => Ok(configured.to_string()),
            (None, None) => Err(OperatorError::MissingConfig {
                what: role.to_string(),
                env_var: env_var.to_string(),
                settings: self.settings_path.display().to_string(),
            }),
        }
    }

    pub fn binding(&self, role: Role) -> anyhow::Result<RoleBinding> {
        let app_name = self.app_name(role)?;
        RoleBinding::new(role, &app_name, &self.suffixes)
            .with_context(|| format!("invalid app name pattern for {role}"))
    }

    /// Deployed apps of the target space, listed once per context.
    pub async fn deployed_apps(&self) -> anyhow::Result<Arc<Vec<AppRecord>>> {
        let platform = Arc::clone(&self.platform);
        let target = self.target.clone();
        self.deployed
            .get_or_compute(move || async move {
                let apps = platform
                    .list_apps(&target)
                    .await
                    .with_context(|| format!("failed to list apps of space {}", target.space_guid))?;
                Ok::<_, anyhow::Error>(Arc::new(apps))
            })
            .await
            .map_err(anyhow::Error::new)
    }

    pub async fn resolve_app(&self, role: Role) -> anyhow::Result<AppRecord> {
        let binding = self.binding(role)?;
        let apps = self.deployed_apps().await?;
        let app = binding.select(apps.as_slice(), |app| app.name.as_str())?;
        tracing::debug!(role = %role, app = %app.name, "resolved role");
        Ok(app.clone())
    }

    /// Metadata of `app`, from memory, then disk, then the platform.
    pub async fn app_metadata(&self, app: &AppRecord) -> anyhow::Result<AppMetadata> {
        let key = CacheKey::single(app.name.as_str())?;
        let persisted_key =
            PersistedAppCache::key(&self.target.org_guid, &self.target.space_guid, &app.name)?;
        let platform = Arc::clone(&self.platform);
        let target = self.target.clone();
        let app_cache = self.app_cache.clone();
        let app = app.clone();
        self.metadata
            .get_or_compute(key, move || async move {
                match app_cache.load(&persisted_key, Utc::now()) {
                    Ok(Some(metadata)) => {
                        tracing::debug!(app = %app.name, "app metadata served from disk");
                        return Ok(metadata);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(app = %app.name, "failed to read persisted app metadata: {err:#}");
                    }
                }
                let metadata = platform.fetch_metadata(&target, &app).await?;
                if let Err(err) = app_cache.store(&persisted_key, &metadata, Utc::now()) {
                    tracing::warn!(app = %app.name, "failed to persist app metadata: {err:#}");
                }
                Ok::<_, anyhow::Error>(metadata)
            })
            .await
            .map_err(anyhow::Error::new)
    }

    pub async fn role_metadata(&self, role: Role) -> anyhow::Result<AppMetadata> {
        let app = self.resolve_app(role).await?;
        self.app_metadata(&app)
            .await
            .with_context(|| format!("failed to load metadata of the {role} ({})", app.name))
    }

    /// Credentials of the service bound to the app serving `role`.
    pub async fn role_service(&self, role: Role) -> anyhow::Result<Value> {
        let metadata = self.role_metadata(role).await?;
        let label = role.spec().service_label;
        metadata
            .service_credentials(label)
            .cloned()
            .ok_or_else(|| anyhow!("app {} has no bound {label} service", metadata.app.name))
    }

    pub async fn role_credentials(&self, role: Role) -> anyhow::Result<ClientCredentials> {
        let service = self.role_service(role).await?;
        ClientCredentials::from_service(&service)
            .with_context(|| format!("invalid credentials bound to the {role}"))
    }

    /// Access token for `credentials`, issued at most once per client until
    /// it comes within the safety gap of its expiry.
    pub async fn cached_token(
        &self,
        credentials: &ClientCredentials,
        options: &TokenOptions,
    ) -> anyhow::Result<String> {
        let key = match &options.subdomain {
            Some(subdomain) => CacheKey::compound([credentials.client_id.as_str(), subdomain])?,
            None => CacheKey::single(credentials.client_id.as_str())?,
        };
        let platform = Arc::clone(&self.platform);
        let credentials = credentials.clone();
        let options = options.clone();
        self.tokens
            .get_or_compute(key, move || async move {
                let issued = platform
                    .issue_token(&credentials, &options)
                    .await
                    .with_context(|| format!("failed to issue token for {}", credentials.client_id))?;
                let expires_at = TimeDelta::try_seconds(issued.expires_in)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        anyhow!(
                            "invalid expires_in {} for {}",
                            issued.expires_in,
                            credentials.client_id
                        )
                    })?;
                tracing::debug!(client = %credentials.client_id, %expires_at, "issued access token");
                Ok::<_, anyhow::Error>((issued.access_token, Some(expires_at)))
            })
            .await
            .map_err(anyhow::Error::new)
    }

    pub async fn role_token(&self, role: Role) -> anyhow::Result<String> {
        let credentials = self.role_credentials(role).await?;
        self.cached_token(&credentials, &TokenOptions::default())
            .await
    }

    /// Base URL of the app serving `role`.
    pub async fn role_url(&self, role: Role) -> anyhow::Result<String> {
        let metadata = self.role_metadata(role).await?;
        metadata
            .url()
            .ok_or_else(|| anyhow!("app {} has no route", metadata.app.name))
    }

    /// Forget persisted and in-memory metadata.
    pub fn clear_persisted_cache(&self) -> anyhow::Result<bool> {
        self.metadata.clear();
        self.app_cache.clear()
    }
}
