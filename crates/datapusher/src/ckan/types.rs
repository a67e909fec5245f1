//! CKAN action API request and response types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transform::Record;

/// Standard action response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ActionResponse<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<ApiError>,
}

/// Error object of a failed action
///
/// CKAN sends `__type`; some proxies and older versions send `type`. Any
/// other keys (validation details per field, for instance) are kept so they
/// can be shown when there is no `message`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct ApiError {
    pub message: Option<String>,
    pub error_type: Option<String>,
    pub details: Map<String, Value>,
}

impl From<Map<String, Value>> for ApiError {
    fn from(mut map: Map<String, Value>) -> Self {
        let message = map.remove("message").map(value_to_text);
        let error_type = map
            .remove("__type")
            .or_else(|| map.remove("type"))
            .map(value_to_text);

        Self {
            message,
            error_type,
            details: map,
        }
    }
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl ApiError {
    /// Human-readable message, falling back to the remaining error fields
    pub fn message(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ if !self.details.is_empty() => Value::Object(self.details.clone()).to_string(),
            _ => self
                .error_type
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
        }
    }

    pub fn is_authorization(&self) -> bool {
        self.error_type.as_deref() == Some("Authorization Error")
    }

    pub fn is_not_found(&self) -> bool {
        self.error_type.as_deref() == Some("Not Found Error")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(kind) => write!(f, "{}: {}", kind, self.message()),
            None => f.write_str(&self.message()),
        }
    }
}

/// CKAN resource as returned by `resource_show`
///
/// `resource_update` replaces the whole resource, so every field we do not
/// model is kept in `extra` and sent back untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Resource {
    /// Uploaded files live behind CKAN auth and need the API key to download
    pub fn is_upload(&self) -> bool {
        self.url_type.as_deref() == Some("upload")
    }

    /// Stored content hash, ignoring the empty string CKAN uses for "none"
    pub fn stored_hash(&self) -> Option<&str> {
        self.hash.as_deref().filter(|h| !h.is_empty())
    }

    pub fn mark_datastore_active(&mut self, hash: &str) {
        self.hash = Some(hash.to_string());
        self.extra
            .insert("datastore_active".to_string(), Value::Bool(true));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceShowRequest<'a> {
    pub id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatastoreDeleteRequest<'a> {
    pub resource_id: &'a str,
    pub force: bool,
}

/// Column definition sent with `datastore_create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreField {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatastoreCreateRequest<'a> {
    pub resource_id: &'a str,
    pub force: bool,
    pub fields: &'a [DatastoreField],
    pub records: &'a [Record],
}
