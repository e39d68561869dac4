//! Tracking long-running remote operations to completion.
//!
//! A backend submits a change and gets a [`Submission`]: either a job handle
//! to poll or, for synchronous endpoints, an already finished report.
//! [`JobPoller`] sleeps a fixed interval between polls until the job leaves
//! the running state, then collects per-item results (inline or with one
//! status call per item through a [`FunnelQueue`]) and classifies the
//! outcome.

pub mod binding_repair;
pub mod registry;
pub mod report;
pub mod tenant_upgrade;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;

use crate::funnel::FunnelQueue;

pub use report::BatchReport;

/// Job-level state as reported by the remote system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteState {
    Running,
    Succeeded,
    Failed,
}

impl RemoteState {
    pub fn is_terminal(self) -> bool {
        self != RemoteState::Running
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    /// What the job is about, e.g. a tenant id.
    pub label: String,
    pub poll_url: String,
    /// Item id to remote task id, for backends that report per-item results
    /// through separate status calls.
    pub tasks: BTreeMap<String, String>,
}

impl JobHandle {
    pub fn new(id: impl Into<String>, label: impl Into<String>, poll_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            poll_url: poll_url.into(),
            tasks: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub item: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemResult {
    pub fn succeeded(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: ItemStatus::Succeeded,
            message: None,
        }
    }

    pub fn failed(item: impl Into<String>, message: Option<String>) -> Self {
        Self {
            item: item.into(),
            status: ItemStatus::Failed,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Succeeded
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemDetail {
    None,
    Inline(Vec<ItemResult>),
    /// Item id to remote task id; each needs one status call.
    Deferred(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub state: RemoteState,
    /// The state string as the remote system spelled it.
    pub raw_state: String,
    pub message: Option<String>,
    pub detail: ItemDetail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOutcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl JobOutcome {
    /// Only a job whose own state and every item succeeded counts as
    /// succeeded. A job with at least one successful item is partially failed.
    pub fn classify(state: RemoteState, items: &[ItemResult]) -> Self {
        let failed = items.iter().filter(|item| !item.is_success()).count();
        if state == RemoteState::Succeeded && failed == 0 {
            return JobOutcome::Succeeded;
        }
        if !items.is_empty() && failed < items.len() {
            return JobOutcome::PartiallyFailed;
        }
        JobOutcome::Failed
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::PartiallyFailed => "partially failed",
            JobOutcome::Failed => "failed",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub state: String,
    pub outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub items: Vec<ItemResult>,
}

impl JobReport {
    /// Report for a job that could not be submitted or tracked to the end.
    pub fn errored(job: impl Into<String>, job_id: Option<String>, err: &anyhow::Error) -> Self {
        Self {
            job: job.into(),
            job_id,
            state: "error".to_string(),
            outcome: JobOutcome::Failed,
            message: Some(format!("{err:#}")),
            items: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }
}

pub enum Submission {
    Pending(JobHandle),
    /// The remote system finished the work within the submitting request.
    Completed(JobReport),
}

impl Submission {
    pub fn label(&self) -> &str {
        match self {
            Submission::Pending(job) => &job.label,
            Submission::Completed(report) => &report.job,
        }
    }

    fn job_id(&self) -> Option<String> {
        match self {
            Submission::Pending(job) => Some(job.id.clone()),
            Submission::Completed(report) => report.job_id.clone(),
        }
    }
}

/// Where a tracked job currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollPhase {
    Submitted,
    Polling { polls: u32 },
    Terminal(JobOutcome),
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollPhase::Submitted => f.write_str("submitted"),
            PollPhase::Polling { polls } => write!(f, "polling (#{polls})"),
            PollPhase::Terminal(outcome) => write!(f, "{outcome}"),
        }
    }
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn poll(&self, job: &JobHandle) -> anyhow::Result<JobStatus>;

    /// Result of one item of a finished job, for backends reporting
    /// [`ItemDetail::Deferred`].
    async fn item_status(&self, job: &JobHandle, item: &str, task: &str)
    -> anyhow::Result<ItemResult>;
}

#[derive(Clone, Debug)]
pub struct JobPoller {
    interval: Duration,
    concurrency: usize,
}

impl JobPoller {
    /// `concurrency` bounds both the jobs awaited together and the item
    /// status calls of one job.
    pub fn new(interval: Duration, concurrency: usize) -> Self {
        Self {
            interval,
            concurrency: concurrency.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `submission` until it is terminal. A failed poll request ends the
    /// wait with that error; it is not retried.
    pub async fn wait(
        &self,
        backend: Arc<dyn JobBackend>,
        submission: Submission,
    ) -> anyhow::Result<JobReport> {
        let job = match submission {
            Submission::Completed(report) => {
                tracing::info!(
                    backend = backend.name(),
                    job = %report.job,
                    outcome = %report.outcome,
                    "job completed synchronously"
                );
                return Ok(report);
            }
            Submission::Pending(job) => job,
        };

        let mut phase = PollPhase::Submitted;
        tracing::info!(backend = backend.name(), job = %job.label, id = %job.id, %phase, "job submitted");
        let status = loop {
            tokio::time::sleep(self.interval).await;
            let polls = match phase {
                PollPhase::Polling { polls } => polls + 1,
                _ => 1,
            };
            phase = PollPhase::Polling { polls };
            let status = backend
                .poll(&job)
                .await
                .with_context(|| format!("failed to poll {} job {}", backend.name(), job.id))?;
            tracing::info!(
                backend = backend.name(),
                job = %job.label,
                state = %status.raw_state,
                %phase,
                "polled job"
            );
            if status.state.is_terminal() {
                break status;
            }
        };

        let items = match status.detail {
            ItemDetail::None => Vec::new(),
            ItemDetail::Inline(items) => items,
            ItemDetail::Deferred(tasks) => self.item_results(&backend, &job, tasks).await?,
        };
        let outcome = JobOutcome::classify(status.state, &items);
        tracing::info!(
            backend = backend.name(),
            job = %job.label,
            phase = %PollPhase::Terminal(outcome),
            "job finished"
        );
        Ok(JobReport {
            job: job.label,
            job_id: Some(job.id),
            state: status.raw_state,
            outcome,
            message: status.message,
            items,
        })
    }

    async fn item_results(
        &self,
        backend: &Arc<dyn JobBackend>,
        job: &JobHandle,
        tasks: BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<ItemResult>> {
        let queue = FunnelQueue::new(self.concurrency);
        for (item, task) in tasks {
            let backend = Arc::clone(backend);
            let job = job.clone();
            queue.enqueue(1, async move { backend.item_status(&job, &item, &task).await });
        }
        queue.dequeue_all().await
    }

    /// Submit one job per item, at most `concurrency` requests at a time. A
    /// failed submission becomes a failed report so the jobs already accepted
    /// are still tracked.
    pub async fn submit_all<I, F, Fut>(&self, items: I, submit: F) -> anyhow::Result<Vec<Submission>>
    where
        I: IntoIterator<Item = String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Submission>> + Send + 'static,
    {
        let queue = FunnelQueue::new(self.concurrency);
        for item in items {
            let request = submit(item.clone());
            queue.enqueue(1, async move {
                let submission = match request.await {
                    Ok(submission) => submission,
                    Err(err) => {
                        tracing::warn!(job = %item, "submission failed: {err:#}");
                        Submission::Completed(JobReport::errored(item, None, &err))
                    }
                };
                Ok::<_, anyhow::Error>(submission)
            });
        }
        queue.dequeue_all().await
    }

    /// Wait for every submission. All jobs reach a terminal state before
    /// this returns; a job whose wait failed is reported as failed with the
    /// error as its message.
    pub async fn wait_all(
        &self,
        backend: Arc<dyn JobBackend>,
        submissions: Vec<Submission>,
    ) -> anyhow::Result<BatchReport> {
        let queue = FunnelQueue::new(self.concurrency);
        for submission in submissions {
            let poller = self.clone();
            let backend = Arc::clone(&backend);
            let label = submission.label().to_string();
            let job_id = submission.job_id();
            queue.enqueue(1, async move {
                let report = match poller.wait(backend, submission).await {
                    Ok(report) => report,
                    Err(err) => {
                        tracing::warn!(job = %label, "stopped tracking job: {err:#}");
                        JobReport::errored(label, job_id, &err)
                    }
                };
                Ok::<_, anyhow::Error>(report)
            });
        }
        let reports = queue.dequeue_all().await?;
        Ok(BatchReport::new(reports))
    }
}
