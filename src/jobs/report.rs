use std::fmt::Write as _;

use serde::Serialize;

use crate::error::OperatorError;
use crate::jobs::{ItemStatus, JobReport};

/// Terminal reports of a batch of jobs awaited together.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn new(jobs: Vec<JobReport>) -> Self {
        Self { jobs }
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|job| !job.is_success()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Raise the aggregate failure once every job has been reported.
    pub fn ensure_success(&self) -> Result<(), OperatorError> {
        match self.failed_count() {
            0 => Ok(()),
            failed => Err(OperatorError::JobsFailed {
                failed,
                total: self.jobs.len(),
            }),
        }
    }

    /// Plain-text table with one row per item, or per job when a job has no
    /// item detail.
    pub fn render_table(&self) -> String {
        let mut rows = vec![[
            "JOB".to_string(),
            "ITEM".to_string(),
            "STATUS".to_string(),
            "MESSAGE".to_string(),
        ]];
        for job in &self.jobs {
            if job.items.is_empty() {
                rows.push([
                    job.job.clone(),
                    "-".to_string(),
                    job.outcome.to_string(),
                    job.message.clone().unwrap_or_default(),
                ]);
                continue;
            }
            for item in &job.items {
                let status = match item.status {
                    ItemStatus::Succeeded => "succeeded",
                    ItemStatus::Failed => "failed",
                };
                rows.push([
                    job.job.clone(),
                    item.item.clone(),
                    status.to_string(),
                    item.message.clone().unwrap_or_default(),
                ]);
            }
        }

        let mut widths = [0usize; 4];
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        let mut out = String::new();
        for row in &rows {
            let mut line = String::new();
            for (index, cell) in row.iter().enumerate() {
                if index + 1 == row.len() {
                    line.push_str(cell);
                } else {
                    let _ = write!(line, "{cell:<width$}  ", width = widths[index]);
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        let _ = write!(
            out,
            "{} of {} jobs succeeded",
            self.jobs.len() - self.failed_count(),
            self.jobs.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ItemResult, JobOutcome};

    fn report(job: &str, outcome: JobOutcome, items: Vec<ItemResult>) -> JobReport {
        JobReport {
            job: job.to_string(),
            job_id: None,
            state: "FINISHED".to_string(),
            outcome,
            message: None,
            items,
        }
    }

    #[test]
    fn table_lists_every_item_before_the_summary() {
        let batch = BatchReport::new(vec![
            report(
                "upgrade",
                JobOutcome::PartiallyFailed,
                vec![
                    ItemResult::succeeded("tenant-a"),
                    ItemResult::failed("tenant-b", Some("deploy failed".to_string())),
                ],
            ),
            report("dependencies", JobOutcome::Succeeded, Vec::new()),
        ]);
        let table = batch.render_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "JOB           ITEM      STATUS     MESSAGE");
        assert_eq!(lines[1], "upgrade       tenant-a  succeeded");
        assert_eq!(lines[2], "upgrade       tenant-b  failed     deploy failed");
        assert_eq!(lines[3], "dependencies  -         succeeded");
        assert_eq!(lines[4], "1 of 2 jobs succeeded");
    }

    #[test]
    fn aggregate_failure_counts_unsuccessful_jobs() {
        let batch = BatchReport::new(vec![
            report("a", JobOutcome::Succeeded, Vec::new()),
            report("b", JobOutcome::Failed, Vec::new()),
            report("c", JobOutcome::PartiallyFailed, Vec::new()),
        ]);
        let err = batch.ensure_success().unwrap_err();
        assert_eq!(err.to_string(), "2 of 3 jobs did not succeed");
        assert!(BatchReport::default().ensure_success().is_ok());
    }
}
