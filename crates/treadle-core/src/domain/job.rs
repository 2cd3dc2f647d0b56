//! Job records.

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::keys::JobKey;

/// Free-form job data carried by jobs and triggers.
pub type JobData = serde_json::Map<String, serde_json::Value>;

/// What the host hands to the store when it registers a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    /// Tag resolved through the job type registry.
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// A durable job survives the removal of its last trigger.
    #[serde(default)]
    pub durable: bool,
    /// Re-run the job when the node executing it crashes.
    #[serde(default)]
    pub requests_recovery: bool,
    #[serde(default)]
    pub job_data: JobData,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            durable: false,
            requests_recovery: false,
            job_data: JobData::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.job_data.insert(key.into(), value.into());
        self
    }
}

/// A stored job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    #[serde(flatten)]
    pub detail: JobDetail,
}

impl JobRecord {
    pub fn new(job_id: JobId, detail: JobDetail) -> Self {
        Self { job_id, detail }
    }

    pub fn key(&self) -> &JobKey {
        &self.detail.key
    }
}

/// `base` overlaid with `overlay`; entries of `overlay` win.
pub fn merge_job_data(base: &JobData, overlay: &JobData) -> JobData {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
