use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tempfile::TempDir;
use tenant_operator::app_cache::{FORMAT_VERSION, PersistedAppCache};
use tenant_operator::context::{Context, ContextOptions};
use tenant_operator::error::OperatorError;
use tenant_operator::platform::{
    AppMetadata, AppRecord, ClientCredentials, IssuedToken, Platform, TokenOptions,
};
use tenant_operator::roles::Role;
use tenant_operator::settings::{Environment, OperatorSettings, PlatformTarget};
use tokio::time::sleep;

const UUID_APP: &str = "tenant-registry-3f2504e0-4f89-11d3-9a0c-0305e82c3301";

#[derive(Default)]
struct FakePlatform {
    apps: Vec<&'static str>,
    token_lifetime_secs: i64,
    list_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    token_calls: AtomicUsize,
}

impl FakePlatform {
    fn with_apps(apps: Vec<&'static str>) -> Self {
        Self {
            apps,
            token_lifetime_secs: 3600,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn list_apps(&self, _target: &PlatformTarget) -> anyhow::Result<Vec<AppRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(10)).await;
        Ok(self
            .apps
            .iter()
            .map(|name| AppRecord {
                guid: format!("{name}-guid"),
                name: name.to_string(),
                state: "STARTED".to_string(),
            })
            .collect())
    }

    async fn fetch_metadata(
        &self,
        _target: &PlatformTarget,
        app: &AppRecord,
    ) -> anyhow::Result<AppMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(10)).await;
        Ok(AppMetadata {
            app: app.clone(),
            env: json!({
                "system_env_json": {"VCAP_SERVICES": {
                    "xsuaa": [{"credentials": {
                        "clientid": format!("sb-{}", app.name),
                        "clientsecret": "secret",
                        "url": "https://provider.authentication.example.com"
                    }}],
                    "saas-registry": [{"credentials": {
                        "clientid": "sb-registry",
                        "clientsecret": "secret",
                        "url": "https://provider.authentication.example.com",
                        "saas_registry_url": "https://registry.example.com"
                    }}]
                }}
            }),
            process: None,
            route: Some(format!("{}.cfapps.example.com", app.name)),
        })
    }

    async fn issue_token(
        &self,
        credentials: &ClientCredentials,
        _options: &TokenOptions,
    ) -> anyhow::Result<IssuedToken> {
        let call = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep(Duration::from_millis(10)).await;
        Ok(IssuedToken {
            access_token: format!("{}-token-{call}", credentials.client_id),
            expires_in: self.token_lifetime_secs,
        })
    }
}

fn target() -> PlatformTarget {
    PlatformTarget {
        api_url: "https://api.cf.example.com".to_string(),
        org_guid: "org-1".to_string(),
        space_guid: "space-1".to_string(),
        org_name: None,
        space_name: None,
        access_token: Some("cf-token".to_string()),
    }
}

fn settings() -> OperatorSettings {
    let mut settings = OperatorSettings::default();
    settings.target = Some(target());
    settings.apps.insert(Role::Registry, "tenant-registry".to_string());
    settings.apps.insert(Role::Runtime, "mtx".to_string());
    settings
}

fn context(
    dir: &TempDir,
    env: Environment,
    platform: Arc<FakePlatform>,
    read_only: bool,
) -> Context {
    Context::new(
        env,
        settings(),
        dir.path().join("settings.json"),
        target(),
        platform,
        PersistedAppCache::new(dir.path().join("app-cache.json")),
        ContextOptions { read_only },
    )
}

fn write_cache_entry(path: &Path, app: &str, timestamp: chrono::DateTime<Utc>, version: &str) {
    let entry = json!({
        "timestamp": timestamp,
        "version": version,
        "app": {"guid": format!("{app}-guid"), "name": app, "state": "STARTED"},
        "env": {},
        "process": null,
        "route": "cached.cfapps.example.com"
    });
    let mut file = serde_json::Map::new();
    file.insert(format!("org-1##space-1##{app}"), entry);
    std::fs::write(path, serde_json::to_string(&file).unwrap()).unwrap();
}

#[tokio::test(start_paused = true)]
async fn literal_variant_beats_uuid_template() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec![
        UUID_APP,
        "tenant-registry-blue",
        "unrelated",
    ]));
    let context = context(&dir, Environment::default(), platform, false);
    let app = context.resolve_app(Role::Registry).await.unwrap();
    assert_eq!(app.name, "tenant-registry-blue");
}

#[tokio::test(start_paused = true)]
async fn uuid_template_matches_when_no_literal_variant_exists() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["other", UUID_APP]));
    let context = context(&dir, Environment::default(), platform, false);
    let app = context.resolve_app(Role::Registry).await.unwrap();
    assert_eq!(app.name, UUID_APP);
}

#[tokio::test(start_paused = true)]
async fn live_variant_is_only_tried_by_read_only_commands() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx-live"]));

    let writer = context(&dir, Environment::default(), Arc::clone(&platform), false);
    let err = writer.resolve_app(Role::Runtime).await.unwrap_err();
    match err.downcast_ref::<OperatorError>() {
        Some(OperatorError::Resolution { role, attempted, .. }) => {
            assert_eq!(*role, Role::Runtime);
            assert_eq!(attempted, &["mtx", "mtx-blue", "mtx-green", "mtx-{uuid}"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let reader = context(&dir, Environment::default(), platform, true);
    assert_eq!(reader.resolve_app(Role::Runtime).await.unwrap().name, "mtx-live");
}

#[tokio::test(start_paused = true)]
async fn environment_override_wins_over_settings() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["tenant-registry", "registry-v2"]));
    let env = Environment::from_pairs([("TENANT_OP_REGISTRY_APP", "registry-v2")]);
    let context = context(&dir, env, platform, false);
    assert_eq!(context.app_name(Role::Registry).unwrap(), "registry-v2");
    assert_eq!(
        context.resolve_app(Role::Registry).await.unwrap().name,
        "registry-v2"
    );
}

#[tokio::test]
async fn unconfigured_role_names_its_sources() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(Vec::new()));
    let context = context(&dir, Environment::default(), platform, false);
    let err = context.app_name(Role::BindingManager).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("TENANT_OP_BINDING_APP"));
    assert!(message.contains("settings.json"));
}

#[tokio::test(start_paused = true)]
async fn app_listing_and_metadata_are_fetched_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["tenant-registry", "mtx"]));
    let context = Arc::new(context(&dir, Environment::default(), Arc::clone(&platform), false));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let context = Arc::clone(&context);
        handles.push(tokio::spawn(async move {
            context.role_metadata(Role::Registry).await
        }));
    }
    for handle in handles {
        let metadata = handle.await.unwrap().unwrap();
        assert_eq!(metadata.app.name, "tenant-registry");
    }
    context.role_metadata(Role::Runtime).await.unwrap();

    assert_eq!(platform.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("app-cache.json").exists());
}

#[tokio::test(start_paused = true)]
async fn persisted_metadata_is_reused_by_the_next_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));

    let first = context(&dir, Environment::default(), Arc::clone(&platform), false);
    first.role_metadata(Role::Runtime).await.unwrap();
    let second = context(&dir, Environment::default(), Arc::clone(&platform), false);
    let metadata = second.role_metadata(Role::Runtime).await.unwrap();

    assert_eq!(metadata.route.as_deref(), Some("mtx.cfapps.example.com"));
    assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_persisted_entry_skips_the_fetch() {
    let dir = tempfile::tempdir().unwrap();
    write_cache_entry(
        &dir.path().join("app-cache.json"),
        "mtx",
        Utc::now() - TimeDelta::hours(1),
        FORMAT_VERSION,
    );
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);
    let metadata = context.role_metadata(Role::Runtime).await.unwrap();
    assert_eq!(metadata.route.as_deref(), Some("cached.cfapps.example.com"));
    assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_or_foreign_entries_trigger_exactly_one_fetch() {
    for (age, version) in [(TimeDelta::hours(13), FORMAT_VERSION), (TimeDelta::minutes(1), "0.0.0-old")] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-cache.json");
        write_cache_entry(&path, "mtx", Utc::now() - age, version);
        let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));
        let context = context(&dir, Environment::default(), Arc::clone(&platform), false);

        let metadata = context.role_metadata(Role::Runtime).await.unwrap();
        context.role_metadata(Role::Runtime).await.unwrap();
        assert_eq!(metadata.route.as_deref(), Some("mtx.cfapps.example.com"));
        assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 1);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["org-1##space-1##mtx"]["version"], FORMAT_VERSION);
    }
}

#[tokio::test(start_paused = true)]
async fn tokens_are_issued_once_per_client() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["tenant-registry", "mtx"]));
    let context = Arc::new(context(&dir, Environment::default(), Arc::clone(&platform), false));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let context = Arc::clone(&context);
        handles.push(tokio::spawn(async move { context.role_token(Role::Runtime).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "sb-mtx-token-1");
    }
    let registry = context.role_token(Role::Registry).await.unwrap();
    assert_eq!(registry, "sb-registry-token-2");
    assert_eq!(platform.token_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn tokens_inside_the_safety_gap_are_reissued() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform {
        apps: vec!["mtx"],
        token_lifetime_secs: 120,
        ..FakePlatform::default()
    });
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);
    let credentials = context.role_credentials(Role::Runtime).await.unwrap();

    let first = context
        .cached_token(&credentials, &TokenOptions::default())
        .await
        .unwrap();
    let second = context
        .cached_token(&credentials, &TokenOptions::default())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(platform.token_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn subscriber_tokens_are_cached_separately() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);
    let credentials = context.role_credentials(Role::Runtime).await.unwrap();

    let provider = context
        .cached_token(&credentials, &TokenOptions::default())
        .await
        .unwrap();
    let subscriber = TokenOptions {
        subdomain: Some("tenant-a".to_string()),
    };
    let tenant = context.cached_token(&credentials, &subscriber).await.unwrap();
    let again = context.cached_token(&credentials, &subscriber).await.unwrap();
    assert_ne!(provider, tenant);
    assert_eq!(tenant, again);
    assert_eq!(platform.token_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_cache_forces_a_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);
    context.role_metadata(Role::Runtime).await.unwrap();
    assert!(context.clear_persisted_cache().unwrap());
    context.role_metadata(Role::Runtime).await.unwrap();
    assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn unreadable_cache_file_falls_through_to_the_platform() {
    let dir = tempfile::tempdir().unwrap();
    let blocked = dir.path().join("app-cache.json");
    std::fs::create_dir(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"").unwrap();
    let platform = Arc::new(FakePlatform::with_apps(vec!["mtx"]));
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);

    let metadata = context.role_metadata(Role::Runtime).await.unwrap();
    assert_eq!(metadata.route.as_deref(), Some("mtx.cfapps.example.com"));
    assert_eq!(platform.metadata_calls.load(Ordering::SeqCst), 1);
    assert!(blocked.is_dir());
}

#[tokio::test(start_paused = true)]
async fn out_of_range_token_lifetime_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(FakePlatform {
        apps: vec!["mtx"],
        token_lifetime_secs: i64::MAX,
        ..FakePlatform::default()
    });
    let context = context(&dir, Environment::default(), Arc::clone(&platform), false);

    let err = context.role_token(Role::Runtime).await.unwrap_err();
    assert!(format!("{err:#}").contains("invalid expires_in"));
    assert!(context.role_token(Role::Runtime).await.is_err());
    assert_eq!(platform.token_calls.load(Ordering::SeqCst), 2);
}
