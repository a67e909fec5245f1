//! Job error taxonomy
//!
//! Every pipeline stage converts its local failure into a [`JobError`] at the
//! stage boundary. The `__type` strings are what CKAN and the job status
//! endpoint show to users, so they are part of the external contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for job operations
pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Job input failed validation; nothing external was touched
    #[error("{0}")]
    InvalidJob(String),

    /// The CKAN API rejected the API key
    #[error("{0}")]
    Authorization(String),

    /// `resource_show` failed for a reason other than authorization
    #[error("{0}")]
    Resource(String),

    #[error("{0}")]
    Download(String),

    /// The file bytes are not a table we can read
    #[error("{0}")]
    UnsupportedFormat(String),

    /// The table was readable but too many rows were malformed
    #[error("{0}")]
    DataFormat(String),

    /// The datastore rejected a chunk, or stayed unreachable after retries
    #[error("{message}")]
    Datastore {
        message: String,
        api_type: Option<String>,
    },

    /// Data is loaded but `resource_update` failed afterwards
    #[error("{0}")]
    MetadataUpdate(String),

    #[error("{0}")]
    Timeout(String),
}

impl JobError {
    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn unsupported_format(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn data_format(msg: impl Into<String>) -> Self {
        Self::DataFormat(msg.into())
    }

    pub fn datastore(msg: impl Into<String>, api_type: Option<String>) -> Self {
        Self::Datastore {
            message: msg.into(),
            api_type,
        }
    }

    /// The `__type` tag reported in job results
    pub fn error_type(&self) -> &'static str {
        match self {
            JobError::InvalidJob(_) => "Invalid Job Error",
            JobError::Authorization(_) => "Authorization Error",
            JobError::Resource(_) => "Resource Error",
            JobError::Download(_) => "Download Error",
            JobError::UnsupportedFormat(_) => "Unsupported Format Error",
            JobError::DataFormat(_) => "Data Format Error",
            JobError::Datastore { .. } => "Datastore Error",
            JobError::MetadataUpdate(_) => "Metadata Update Error",
            JobError::Timeout(_) => "Timeout Error",
        }
    }

    pub fn to_payload(&self) -> JobErrorPayload {
        let api_type = match self {
            JobError::Datastore { api_type, .. } => api_type.clone(),
            _ => None,
        };

        JobErrorPayload {
            message: self.to_string(),
            error_type: self.error_type().to_string(),
            api_type,
        }
    }
}

/// Serialized error object in a job result: `{message, __type}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorPayload {
    pub message: String,
    #[serde(rename = "__type")]
    pub error_type: String,
    /// Error type reported by the datastore API itself, when there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uses_dunder_type() {
        let payload = JobError::Authorization("Access denied".to_string()).to_payload();
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["message"], "Access denied");
        assert_eq!(json["__type"], "Authorization Error");
        assert!(json.get("api_type").is_none());
    }

    #[test]
    fn test_datastore_payload_keeps_api_type() {
        let err = JobError::datastore("bad field", Some("Validation Error".to_string()));
        let payload = err.to_payload();

        assert_eq!(payload.error_type, "Datastore Error");
        assert_eq!(payload.api_type.as_deref(), Some("Validation Error"));
        assert_eq!(payload.message, "bad field");
    }
}
