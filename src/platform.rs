//! The cloud platform the tenant applications are deployed on.

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{HttpClient, HttpRequest};
use crate::settings::PlatformTarget;

const APPS_PAGE_SIZE: usize = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A deployed application as listed by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub instances: u32,
    #[serde(default)]
    pub memory_in_mb: Option<u64>,
}

/// Everything known about one deployed app: its record, environment with
/// bound services, first process and first route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub app: AppRecord,
    pub env: Value,
    #[serde(default)]
    pub process: Option<ProcessInfo>,
    #[serde(default)]
    pub route: Option<String>,
}

impl AppMetadata {
    /// Credentials of the first bound service instance with `label`.
    pub fn service_credentials(&self, label: &str) -> Option<&Value> {
        self.env
            .get("system_env_json")
            .and_then(|system| system.get("VCAP_SERVICES"))
            .and_then(|services| services.get(label))
            .and_then(Value::as_array)
            .and_then(|instances| instances.first())
            .and_then(|instance| instance.get("credentials"))
    }

    pub fn url(&self) -> Option<String> {
        let route = self.route.as_deref()?;
        if route.starts_with("http://") || route.starts_with("https://") {
            return Some(route.trim_end_matches('/').to_string());
        }
        Some(format!("https://{}", route.trim_end_matches('/')))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Base URL of the authorization server.
    pub url: String,
}

impl ClientCredentials {
    pub fn from_service(credentials: &Value) -> anyhow::Result<Self> {
        let field = |name: &str| {
            credentials
                .get(name)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("service credentials are missing {name:?}"))
        };
        Ok(Self {
            client_id: field("clientid")?,
            client_secret: field("clientsecret")?,
            url: field("url")?,
        })
    }

    /// Token endpoint, optionally switched to the identity zone of a
    /// subscriber `subdomain`.
    pub fn token_url(&self, options: &TokenOptions) -> String {
        let base = self.url.trim_end_matches('/');
        let base = match &options.subdomain {
            Some(subdomain) => replace_subdomain(base, subdomain),
            None => base.to_string(),
        };
        format!("{base}/oauth/token")
    }
}

fn replace_subdomain(url: &str, subdomain: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('.') {
        Some((_, domain)) => format!("{scheme}://{subdomain}.{domain}"),
        None => url.to_string(),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenOptions {
    pub subdomain: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn list_apps(&self, target: &PlatformTarget) -> anyhow::Result<Vec<AppRecord>>;

    async fn fetch_metadata(
        &self,
        target: &PlatformTarget,
        app: &AppRecord,
    ) -> anyhow::Result<AppMetadata>;

    async fn issue_token(
        &self,
        credentials: &ClientCredentials,
        options: &TokenOptions,
    ) -> anyhow::Result<IssuedToken>;
}

/// Cloud Foundry v3 API client.
pub struct CfPlatform {
    client: HttpClient,
}

impl Default for CfPlatform {
    fn default() -> Self {
        Self::new(HttpClient::new(REQUEST_TIMEOUT))
    }
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default)]
    pagination: Pagination,
    resources: Vec<T>,
}

#[derive(Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Deserialize)]
struct Link {
    href: String,
}

#[derive(Deserialize)]
struct RouteResource {
    url: String,
}

impl CfPlatform {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn access_token(target: &PlatformTarget) -> anyhow::Result<&str> {
        target
            .access_token
            .as_deref()
            .ok_or_else(|| anyhow!("no platform access token for {}; log in with the cf CLI", target.api_url))
    }

    fn api(target: &PlatformTarget, path: &str) -> String {
        format!("{}{path}", target.api_url.trim_end_matches('/'))
    }

    async fn first_resource<T>(&self, url: &str, token: &str) -> anyhow::Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let page: Page<T> = self.client.get_json(url, token).await?;
        Ok(page.resources.into_iter().next())
    }
}

#[async_trait]
impl Platform for CfPlatform {
    async fn list_apps(&self, target: &PlatformTarget) -> anyhow::Result<Vec<AppRecord>> {
        let token = Self::access_token(target)?;
        let mut next = Some(Self::api(
            target,
            &format!(
                "/v3/apps?space_guids={}&per_page={APPS_PAGE_SIZE}",
                target.space_guid
            ),
        ));
        let mut apps = Vec::new();
        while let Some(url) = next.take() {
            let page: Page<AppRecord> = self.client.get_json(&url, token).await?;
            apps.extend(page.resources);
            next = page.pagination.next.map(|link| link.href);
        }
        tracing::debug!(space = %target.space_guid, count = apps.len(), "listed deployed apps");
        Ok(apps)
    }

    async fn fetch_metadata(
        &self,
        target: &PlatformTarget,
        app: &AppRecord,
    ) -> anyhow::Result<AppMetadata> {
        let token = Self::access_token(target)?;
        let env_url = Self::api(target, &format!("/v3/apps/{}/env", app.guid));
        let process_url = Self::api(target, &format!("/v3/apps/{}/processes", app.guid));
        let route_url = Self::api(target, &format!("/v3/apps/{}/routes", app.guid));
        let (env, process, route) = tokio::try_join!(
            self.client.get_json::<Value>(&env_url, token),
            self.first_resource::<ProcessInfo>(&process_url, token),
            self.first_resource::<RouteResource>(&route_url, token),
        )
        .with_context(|| format!("failed to fetch metadata of app {}", app.name))?;
        Ok(AppMetadata {
            app: app.clone(),
            env,
            process,
            route: route.map(|route| route.url),
        })
    }

    async fn issue_token(
        &self,
        credentials: &ClientCredentials,
        options: &TokenOptions,
    ) -> anyhow::Result<IssuedToken> {
        let request = HttpRequest::post(credentials.token_url(options))
            .basic_auth(&credentials.client_id, &credentials.client_secret)
            .header("Accept", "application/json")
            .form([
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
            ]);
        let response = self.client.send_ok(request).await?;
        response
            .json()
            .with_context(|| format!("invalid token response for client {}", credentials.client_id))
    }
}
