//! Recreating database bindings through the service manager.
//!
//! A binding is requested asynchronously; the service manager either accepts
//! it (`202` with an operation to poll) or creates it on the spot (`201`).

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::Context;
use crate::http::{HttpClient, HttpRequest};
use crate::jobs::{
    ItemDetail, ItemResult, JobBackend, JobHandle, JobOutcome, JobReport, JobStatus, RemoteState,
    Submission,
};
use crate::roles::Role;

pub struct BindingRepair {
    context: Arc<Context>,
    client: HttpClient,
    sm_url: String,
}

impl BindingRepair {
    pub async fn connect(context: Arc<Context>, client: HttpClient) -> anyhow::Result<Self> {
        let service = context.role_service(Role::BindingManager).await?;
        let sm_url = service
            .get("sm_url")
            .and_then(Value::as_str)
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow!("service manager credentials carry no sm_url"))?;
        Ok(Self {
            context,
            client,
            sm_url,
        })
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.context.role_token(Role::BindingManager).await
    }

    /// Service instances that currently have no binding.
    pub async fn unbound_instances(&self) -> anyhow::Result<Vec<String>> {
        let token = self.token().await?;
        let instances_url = format!("{}/v1/service_instances", self.sm_url);
        let bindings_url = format!("{}/v1/service_bindings", self.sm_url);
        let (instances, bindings) = tokio::try_join!(
            self.client.get_json::<Value>(&instances_url, &token),
            self.client.get_json::<Value>(&bindings_url, &token),
        )?;
        Ok(unbound_instances(&instances, &bindings))
    }

    pub async fn submit(&self, instance_id: &str) -> anyhow::Result<Submission> {
        let token = self.token().await?;
        let name = binding_name(instance_id, Utc::now().timestamp());
        let request = HttpRequest::post(format!("{}/v1/service_bindings?async=true", self.sm_url))
            .bearer(&token)
            .json(json!({ "name": name, "service_instance_id": instance_id }));
        let response = self
            .client
            .send_ok(request)
            .await
            .with_context(|| format!("failed to request a binding for instance {instance_id}"))?;
        if response.status == 201 {
            return Ok(Submission::Completed(JobReport {
                job: instance_id.to_string(),
                job_id: None,
                state: "created".to_string(),
                outcome: JobOutcome::Succeeded,
                message: None,
                items: vec![ItemResult::succeeded(instance_id)],
            }));
        }
        let location = response
            .location
            .ok_or_else(|| anyhow!("binding request for {instance_id} returned no operation location"))?;
        Ok(Submission::Pending(operation_handle(
            &self.sm_url,
            instance_id,
            &location,
        )))
    }
}

fn binding_name(instance_id: &str, timestamp: i64) -> String {
    let short: String = instance_id.chars().take(8).collect();
    format!("repair-{short}-{timestamp}")
}

fn ids(list: &Value, field: &str) -> Vec<String> {
    list.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Ids of instances in `instances` not referenced by any binding, in listing
/// order.
pub fn unbound_instances(instances: &Value, bindings: &Value) -> Vec<String> {
    let bound: BTreeSet<String> = ids(bindings, "service_instance_id").into_iter().collect();
    ids(instances, "id")
        .into_iter()
        .filter(|id| !bound.contains(id))
        .collect()
}

/// Operation handle from `/v1/service_bindings/<id>/operations/<op>`.
pub fn operation_handle(sm_url: &str, instance_id: &str, location: &str) -> JobHandle {
    let id = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
        .to_string();
    JobHandle::new(id, instance_id, format!("{sm_url}{location}"))
}

#[derive(Deserialize)]
struct Operation {
    state: String,
    #[serde(default)]
    description: Option<String>,
}

pub fn parse_operation(job: &JobHandle, body: &Value) -> anyhow::Result<JobStatus> {
    let operation = Operation::deserialize(body).context("binding operation carries no state")?;
    let state = match operation.state.as_str() {
        "in progress" | "pending" => RemoteState::Running,
        "succeeded" => RemoteState::Succeeded,
        _ => RemoteState::Failed,
    };
    let detail = match state {
        RemoteState::Running => ItemDetail::None,
        RemoteState::Succeeded => ItemDetail::Inline(vec![ItemResult::succeeded(job.label.as_str())]),
        RemoteState::Failed => ItemDetail::Inline(vec![ItemResult::failed(
            job.label.as_str(),
            operation.description.clone(),
        )]),
    };
    Ok(JobStatus {
        state,
        raw_state: operation.state,
        message: operation.description,
        detail,
    })
}

#[async_trait]
impl JobBackend for BindingRepair {
    fn name(&self) -> &str {
        "binding repair"
    }

    async fn poll(&self, job: &JobHandle) -> anyhow::Result<JobStatus> {
        let token = self.token().await?;
        let body: Value = self.client.get_json(&job.poll_url, &token).await?;
        parse_operation(job, &body)
    }

    async fn item_status(
        &self,
        job: &JobHandle,
        _item: &str,
        _task: &str,
    ) -> anyhow::Result<ItemResult> {
        Err(anyhow!("binding operation {} has no per-item status", job.id))
    }
}
