use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::service::ClientToken;

/// Job execution status as reported by the Jobs service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExecutionState {
    Queued,
    InProgress,
    Failed,
    Succeeded,
    Canceled,
    TimedOut,
    Rejected,
    Removed,
}

/// Pending job summaries keyed by state (`IN_PROGRESS`, `QUEUED`).
pub type JobsByState = BTreeMap<JobExecutionState, Vec<JobExecutionSummary>>;

/// A full job execution, returned by a describe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub job_id: String,
    #[serde(default)]
    pub thing_name: String,
    #[serde(default)]
    pub job_document: serde_json::Value,
    pub status: JobExecutionState,
    #[serde(default)]
    pub status_details: BTreeMap<String, String>,
    #[serde(default)]
    pub queued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub last_updated_at: i64,
    #[serde(default)]
    pub version_number: u64,
    #[serde(default)]
    pub execution_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionSummary {
    pub job_id: String,
    #[serde(default)]
    pub queued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub last_updated_at: i64,
    #[serde(default)]
    pub version_number: u64,
    #[serde(default)]
    pub execution_number: u64,
}

/// Body published to `jobs/get` and `jobs/{id}/get`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeJobRequest {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_job_document: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<u64>,
    pub client_token: String,
}

/// Body published to `jobs/{id}/update`.
///
/// Field order is the wire order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub status: JobExecutionState,
    pub expected_version: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub status_details: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_in_minutes: Option<u32>,
    pub client_token: String,
}

/// `jobs/get/accepted`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobsResponse {
    #[serde(default)]
    pub in_progress_jobs: Vec<JobExecutionSummary>,
    #[serde(default)]
    pub queued_jobs: Vec<JobExecutionSummary>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub client_token: Option<String>,
}

impl PendingJobsResponse {
    pub fn into_map(self) -> JobsByState {
        let mut jobs = JobsByState::new();
        jobs.insert(JobExecutionState::InProgress, self.in_progress_jobs);
        jobs.insert(JobExecutionState::Queued, self.queued_jobs);
        jobs
    }
}

/// `jobs/{id}/get/accepted`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeJobResponse {
    pub execution: JobExecution,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub client_token: Option<String>,
}

/// `jobs/{id}/update/accepted`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobResponse {
    #[serde(default)]
    pub execution_state: Option<serde_json::Value>,
    #[serde(default)]
    pub job_document: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub client_token: Option<String>,
}

/// `jobs/notify`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotification {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub jobs: JobsByState,
}

impl ClientToken for PendingJobsResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

impl ClientToken for DescribeJobResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

impl ClientToken for UpdateJobResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}
