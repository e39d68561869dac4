//! Dependency updates of tenant subscriptions on the tenant registry.
//!
//! Each tenant gets its own remote job; the job state is the only detail.

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::Context;
use crate::http::{HttpClient, HttpRequest};
use crate::jobs::{
    ItemDetail, ItemResult, JobBackend, JobHandle, JobStatus, RemoteState, Submission,
};
use crate::roles::Role;

pub struct DependencyUpdate {
    context: Arc<Context>,
    client: HttpClient,
    registry_url: String,
}

impl DependencyUpdate {
    pub async fn connect(context: Arc<Context>, client: HttpClient) -> anyhow::Result<Self> {
        let service = context.role_service(Role::Registry).await?;
        let registry_url = service
            .get("saas_registry_url")
            .and_then(Value::as_str)
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow!("tenant registry credentials carry no saas_registry_url"))?;
        Ok(Self {
            context,
            client,
            registry_url,
        })
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.context.role_token(Role::Registry).await
    }

    pub async fn submit(&self, tenant: &str) -> anyhow::Result<Submission> {
        let token = self.token().await?;
        let url = subscription_url(&self.registry_url, tenant);
        let response = self
            .client
            .send_ok(HttpRequest::patch(url).bearer(&token))
            .await
            .with_context(|| format!("failed to update dependencies of tenant {tenant}"))?;
        let location = response
            .location
            .ok_or_else(|| anyhow!("dependency update of tenant {tenant} returned no job location"))?;
        Ok(Submission::Pending(job_handle(&self.registry_url, tenant, &location)))
    }
}

pub fn subscription_url(registry_url: &str, tenant: &str) -> String {
    format!(
        "{registry_url}/saas-manager/v1/application/tenants/{}/subscriptions?updateApplicationDependencies=true",
        urlencoding::encode(tenant)
    )
}

/// Job handle from the `Location` of an accepted update, e.g.
/// `/api/v2.0/jobs/<id>`.
pub fn job_handle(registry_url: &str, tenant: &str, location: &str) -> JobHandle {
    let id = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
        .to_string();
    let poll_url = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{registry_url}{location}")
    };
    JobHandle::new(id, tenant, poll_url)
}

#[derive(Deserialize)]
struct RegistryJob {
    state: String,
    #[serde(default)]
    error: Value,
}

/// The registry reports `error` either as a plain string or as an object.
fn error_message(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        Value::Object(fields) => fields
            .get("message")
            .or_else(|| fields.get("description"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(error.to_string())),
        other => Some(other.to_string()),
    }
}

pub fn parse_status(job: &JobHandle, body: &Value) -> anyhow::Result<JobStatus> {
    let remote = RegistryJob::deserialize(body).context("registry job carries no state")?;
    let error = error_message(&remote.error);
    let state = match remote.state.as_str() {
        "STARTED" | "IN_PROGRESS" | "PENDING" => RemoteState::Running,
        "SUCCEEDED" => RemoteState::Succeeded,
        _ => RemoteState::Failed,
    };
    let detail = match state {
        RemoteState::Running => ItemDetail::None,
        RemoteState::Succeeded => ItemDetail::Inline(vec![ItemResult::succeeded(job.label.as_str())]),
        RemoteState::Failed => ItemDetail::Inline(vec![ItemResult::failed(
            job.label.as_str(),
            error.clone(),
        )]),
    };
    Ok(JobStatus {
        state,
        raw_state: remote.state,
        message: error,
        detail,
    })
}

#[async_trait]
impl JobBackend for DependencyUpdate {
    fn name(&self) -> &str {
        "dependency update"
    }

    async fn poll(&self, job: &JobHandle) -> anyhow::Result<JobStatus> {
        let token = self.token().await?;
        let body: Value = self.client.get_json(&job.poll_url, &token).await?;
        parse_status(job, &body)
    }

    async fn item_status(
        &self,
        job: &JobHandle,
        _item: &str,
        _task: &str,
    ) -> anyhow::Result<ItemResult> {
        Err(anyhow!("registry job {} has no per-item status", job.id))
    }
}
