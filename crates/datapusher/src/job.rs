//! Job input, validated metadata and job results

use crate::error::{JobError, JobErrorPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

/// The only job type this worker executes
pub const PUSH_TO_DATASTORE: &str = "push_to_datastore";

/// Job as handed over by the queue layer
///
/// `metadata` stays loosely typed until [`Job::validate`] turns it into a
/// [`JobMetadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub job_id: Uuid,
    #[serde(default, alias = "apikey")]
    pub api_key: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Job {
    /// Build a push job from already-known values
    pub fn push(api_key: impl Into<String>, ckan_url: &str, resource_id: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("ckan_url".to_string(), Value::String(ckan_url.to_string()));
        metadata.insert("resource_id".to_string(), Value::String(resource_id.to_string()));

        Self {
            job_id: Uuid::new_v4(),
            api_key: api_key.into(),
            job_type: PUSH_TO_DATASTORE.to_string(),
            metadata,
        }
    }

    pub fn with_ignore_hash(mut self, ignore_hash: bool) -> Self {
        self.metadata
            .insert("ignore_hash".to_string(), Value::Bool(ignore_hash));
        self
    }

    /// Check the job before any external call is made
    pub fn validate(&self) -> Result<JobMetadata, JobError> {
        if self.job_type != PUSH_TO_DATASTORE {
            return Err(JobError::invalid_job(format!(
                "Unsupported job type '{}', expected '{}'",
                self.job_type, PUSH_TO_DATASTORE
            )));
        }

        if self.api_key.trim().is_empty() {
            return Err(JobError::invalid_job("No API key provided"));
        }

        let ckan_url = match self.metadata.get("ckan_url") {
            Some(Value::String(raw)) => parse_ckan_url(raw)?,
            Some(_) => return Err(JobError::invalid_job("ckan_url must be a string")),
            None => return Err(JobError::invalid_job("Missing ckan_url in job metadata")),
        };

        let resource_id = match self.metadata.get("resource_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => {
                return Err(JobError::invalid_job("resource_id must be a non-empty string"))
            },
            None => return Err(JobError::invalid_job("Missing resource_id in job metadata")),
        };

        let ignore_hash = match self.metadata.get("ignore_hash") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return Err(JobError::invalid_job("ignore_hash must be a boolean")),
        };

        Ok(JobMetadata {
            ckan_url,
            resource_id,
            ignore_hash,
        })
    }
}

fn parse_ckan_url(raw: &str) -> Result<Url, JobError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| JobError::invalid_job(format!("Invalid ckan_url '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(JobError::invalid_job(format!(
            "ckan_url must be http or https, got '{}'",
            url.scheme()
        )));
    }

    // Url::join drops the last path segment unless the base ends in '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// Validated job metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    /// CKAN site root, always ending in '/'
    pub ckan_url: Url,
    pub resource_id: String,
    /// Push even when the file hash matches the stored resource hash
    pub ignore_hash: bool,
}

/// Pipeline stage a job is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Received,
    Fetching,
    Transforming,
    Loading,
    UpdatingMetadata,
    Done,
}

impl JobStage {
    pub fn as_str(&self) -> &str {
        match self {
            JobStage::Received => "received",
            JobStage::Fetching => "fetching",
            JobStage::Transforming => "transforming",
            JobStage::Loading => "loading",
            JobStage::UpdatingMetadata => "updating_metadata",
            JobStage::Done => "done",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Complete,
    Error,
}

/// Statistics collected while a job runs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobStats {
    pub bytes_downloaded: u64,
    /// Non-blank data rows read from the source
    pub rows_read: u64,
    pub records_loaded: u64,
    /// Rows skipped, padded or truncated
    pub rows_malformed: u64,
    pub rows_padded: u64,
    pub rows_truncated: u64,
    pub rows_skipped: u64,
    pub chunks_sent: u64,
    /// Chunk sends repeated after a transport failure
    pub retries: u32,
    /// An existing datastore table was dropped before loading
    pub table_replaced: bool,
    pub columns: usize,
    /// The source hash matched the resource, so nothing was pushed
    pub hash_unchanged: bool,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark stats as completed
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }

    pub fn records_per_second(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.records_loaded as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Outcome reported back to the queue layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub resource_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorPayload>,
    /// Stage that was running when the job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<JobStage>,
    /// Every chunk was accepted by the datastore
    pub datastore_loaded: bool,
    pub stats: JobStats,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Complete
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_from(value: Value) -> Job {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_accepts_queue_payload() {
        let job = job_from(json!({
            "apikey": "my-key",
            "job_type": "push_to_datastore",
            "metadata": {
                "ckan_url": "http://www.ckan.org/",
                "resource_id": "foo-bar-42"
            }
        }));

        let metadata = job.validate().unwrap();
        assert_eq!(job.api_key, "my-key");
        assert_eq!(metadata.ckan_url.as_str(), "http://www.ckan.org/");
        assert_eq!(metadata.resource_id, "foo-bar-42");
        assert!(!metadata.ignore_hash);
    }

    #[test]
    fn test_validate_appends_trailing_slash() {
        let job = Job::push("key", "https://data.example.org/ckan", "abc");
        let metadata = job.validate().unwrap();
        assert_eq!(metadata.ckan_url.as_str(), "https://data.example.org/ckan/");
    }

    #[test]
    fn test_validate_rejects_wrong_job_type() {
        let mut job = Job::push("key", "http://ckan.local/", "abc");
        job.job_type = "echo".to_string();
        let err = job.validate().unwrap_err();
        assert_eq!(err.error_type(), "Invalid Job Error");
    }

    #[test]
    fn test_validate_rejects_missing_resource_id() {
        let job = job_from(json!({
            "api_key": "key",
            "job_type": "push_to_datastore",
            "metadata": { "ckan_url": "http://ckan.local/" }
        }));
        let err = job.validate().unwrap_err();
        assert!(err.to_string().contains("resource_id"));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let job = Job::push("key", "ftp://ckan.local/", "abc");
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_validate_reads_ignore_hash() {
        let job = Job::push("key", "http://ckan.local/", "abc").with_ignore_hash(true);
        assert!(job.validate().unwrap().ignore_hash);
    }

    #[test]
    fn test_stats_complete_sets_duration() {
        let mut stats = JobStats::new();
        std::thread::sleep(std::time::Duration::from_millis(20));
        stats.complete();
        assert!(stats.completed_at.is_some());
        assert!(stats.duration_secs > 0.0);
    }

    #[test]
    fn test_records_per_second() {
        let mut stats = JobStats {
            records_loaded: 500,
            ..Default::default()
        };
        assert_eq!(stats.records_per_second(), 0.0);

        stats.duration_secs = 2.0;
        assert_eq!(stats.records_per_second(), 250.0);
    }
}
