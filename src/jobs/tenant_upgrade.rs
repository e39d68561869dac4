//! Tenant database upgrades on the multitenancy runtime.
//!
//! Two API generations exist. The legacy one reports per-tenant results in
//! the finished job payload; the current one hands out one task per tenant
//! whose result needs its own status call. Which one a runtime speaks is
//! probed once when connecting.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::Context;
use crate::http::{HttpClient, HttpRequest};
use crate::jobs::{
    ItemDetail, ItemResult, JobBackend, JobHandle, JobStatus, RemoteState, Submission,
};
use crate::roles::Role;

const PROBE_PATH: &str = "/-/cds/saas-provisioning/tenant";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeApi {
    Legacy,
    Current,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantSelection {
    All,
    Only(Vec<String>),
}

impl TenantSelection {
    fn label(&self) -> String {
        match self {
            TenantSelection::All => "all tenants".to_string(),
            TenantSelection::Only(tenants) => tenants.join(","),
        }
    }
}

pub struct TenantUpgrade {
    context: Arc<Context>,
    client: HttpClient,
    base_url: String,
    api: RuntimeApi,
}

impl TenantUpgrade {
    pub async fn connect(context: Arc<Context>, client: HttpClient) -> anyhow::Result<Self> {
        let base_url = context.role_url(Role::Runtime).await?;
        let token = context.role_token(Role::Runtime).await?;
        let api = probe(&client, &base_url, &token).await?;
        tracing::info!(url = %base_url, ?api, "connected to multitenancy runtime");
        Ok(Self {
            context,
            client,
            base_url,
            api,
        })
    }

    pub fn api(&self) -> RuntimeApi {
        self.api
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.context.role_token(Role::Runtime).await
    }

    pub async fn submit(&self, selection: &TenantSelection) -> anyhow::Result<Submission> {
        let token = self.token().await?;
        let label = selection.label();
        let handle = match self.api {
            RuntimeApi::Legacy => {
                let tenants = match selection {
                    TenantSelection::All => vec!["all".to_string()],
                    TenantSelection::Only(tenants) => tenants.clone(),
                };
                let request = HttpRequest::post(format!("{}/mtx/v1/model/asyncUpgrade", self.base_url))
                    .bearer(&token)
                    .json(json!({ "tenants": tenants, "autoUndeploy": false }));
                let body: Value = self.client.send_ok(request).await?.json()?;
                parse_legacy_submission(&self.base_url, &label, &body)?
            }
            RuntimeApi::Current => {
                let tenants = match selection {
                    TenantSelection::All => vec!["*".to_string()],
                    TenantSelection::Only(tenants) => tenants.clone(),
                };
                let request = HttpRequest::post(format!(
                    "{}/-/cds/saas-provisioning/upgrade",
                    self.base_url
                ))
                .bearer(&token)
                .header("Prefer", "respond-async")
                .json(json!({ "tenants": tenants }));
                let body: Value = self.client.send_ok(request).await?.json()?;
                parse_current_submission(&self.base_url, &label, &body)?
            }
        };
        Ok(Submission::Pending(handle))
    }
}

/// Which API generation the runtime at `base_url` speaks.
pub async fn probe(client: &HttpClient, base_url: &str, token: &str) -> anyhow::Result<RuntimeApi> {
    let response = client
        .send(HttpRequest::get(format!("{base_url}{PROBE_PATH}")).bearer(token))
        .await?;
    if response.status == 404 {
        return Ok(RuntimeApi::Legacy);
    }
    response.error_for_status()?;
    Ok(RuntimeApi::Current)
}

#[derive(Deserialize)]
struct LegacySubmission {
    #[serde(rename = "jobID")]
    job_id: String,
}

pub fn parse_legacy_submission(base_url: &str, label: &str, body: &Value) -> anyhow::Result<JobHandle> {
    let submission = LegacySubmission::deserialize(body)
        .context("upgrade response carries no job id")?;
    let poll_url = format!("{base_url}/mtx/v1/jobs/{}", submission.job_id);
    Ok(JobHandle::new(submission.job_id, label, poll_url))
}

#[derive(Deserialize)]
struct CurrentSubmission {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    tenants: BTreeMap<String, CurrentTask>,
}

#[derive(Deserialize)]
struct CurrentTask {
    #[serde(rename = "ID")]
    id: String,
}

pub fn parse_current_submission(base_url: &str, label: &str, body: &Value) -> anyhow::Result<JobHandle> {
    let submission = CurrentSubmission::deserialize(body)
        .context("upgrade response carries no job id")?;
    let poll_url = format!("{base_url}/-/cds/jobs/pollJob(ID='{}')", submission.id);
    let mut handle = JobHandle::new(submission.id, label, poll_url);
    handle.tasks = submission
        .tenants
        .into_iter()
        .map(|(tenant, task)| (tenant, task.id))
        .collect();
    Ok(handle)
}

fn job_state(raw: &str) -> RemoteState {
    match raw.to_ascii_uppercase().as_str() {
        "QUEUED" | "RUNNING" => RemoteState::Running,
        "FINISHED" | "SUCCESS" => RemoteState::Succeeded,
        _ => RemoteState::Failed,
    }
}

fn error_message(body: &Value) -> Option<String> {
    match body.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn status_of(body: &Value) -> anyhow::Result<&str> {
    body.get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("job status response carries no status"))
}

/// Legacy job payload: `status` plus `result.tenants.<id>.{status,message}`.
pub fn parse_legacy_status(body: &Value) -> anyhow::Result<JobStatus> {
    let raw_state = status_of(body)?;
    let state = job_state(raw_state);
    let detail = if state.is_terminal() {
        let items = body
            .pointer("/result/tenants")
            .and_then(Value::as_object)
            .map(|tenants| {
                tenants
                    .iter()
                    .map(|(tenant, result)| {
                        let status = result.get("status").and_then(Value::as_str).unwrap_or("");
                        let message = result
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        if job_state(status) == RemoteState::Succeeded {
                            ItemResult::succeeded(tenant.as_str())
                        } else {
                            ItemResult::failed(tenant.as_str(), message)
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        ItemDetail::Inline(items)
    } else {
        ItemDetail::None
    };
    Ok(JobStatus {
        state,
        raw_state: raw_state.to_string(),
        message: error_message(body),
        detail,
    })
}

/// Current job payload: job-level `status` only; items come from the tasks
/// recorded at submission.
pub fn parse_current_status(body: &Value, job: &JobHandle) -> anyhow::Result<JobStatus> {
    let raw_state = status_of(body)?;
    let state = job_state(raw_state);
    let detail = if state.is_terminal() && !job.tasks.is_empty() {
        ItemDetail::Deferred(job.tasks.clone())
    } else {
        ItemDetail::None
    };
    Ok(JobStatus {
        state,
        raw_state: raw_state.to_string(),
        message: error_message(body),
        detail,
    })
}

pub fn parse_task_status(tenant: &str, body: &Value) -> anyhow::Result<ItemResult> {
    let raw_state = status_of(body)?;
    Ok(match job_state(raw_state) {
        RemoteState::Succeeded => ItemResult::succeeded(tenant),
        RemoteState::Running => ItemResult::failed(tenant, Some(format!("task still {raw_state}"))),
        RemoteState::Failed => ItemResult::failed(tenant, error_message(body)),
    })
}

#[async_trait]
impl JobBackend for TenantUpgrade {
    fn name(&self) -> &str {
        "tenant upgrade"
    }

    async fn poll(&self, job: &JobHandle) -> anyhow::Result<JobStatus> {
        let token = self.token().await?;
        let body: Value = self.client.get_json(&job.poll_url, &token).await?;
        match self.api {
            RuntimeApi::Legacy => parse_legacy_status(&body),
            RuntimeApi::Current => parse_current_status(&body, job),
        }
    }

    async fn item_status(
        &self,
        _job: &JobHandle,
        item: &str,
        task: &str,
    ) -> anyhow::Result<ItemResult> {
        let token = self.token().await?;
        let url = format!("{}/-/cds/jobs/pollTask(ID='{task}')", self.base_url);
        let body: Value = self
            .client
            .get_json(&url, &token)
            .await
            .with_context(|| format!("failed to fetch upgrade task of tenant {item}"))?;
        parse_task_status(item, &body)
    }
}
