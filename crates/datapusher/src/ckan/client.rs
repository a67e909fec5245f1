//! HTTP client for the CKAN action API
//!
//! Every action is a JSON `POST` to `{ckan_url}/api/3/action/{name}` with the
//! API key in the `Authorization` header. Failures are split into transport
//! failures (retryable) and API-reported failures (never retried).

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::types::{
    ActionResponse, ApiError, DatastoreCreateRequest, DatastoreDeleteRequest, Resource,
    ResourceShowRequest,
};

/// Failure of a single action call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CkanError {
    /// No usable action envelope came back: network error, timeout, a non-2xx
    /// without an action body, or an unparseable body
    #[error("{action} request failed: {message}")]
    Transport { action: String, message: String },

    /// The API answered with `success: false`
    #[error("{action} rejected (HTTP {status}): {error}")]
    Api {
        action: String,
        status: u16,
        error: ApiError,
    },

    #[error("Invalid CKAN client configuration: {0}")]
    Config(String),
}

impl CkanError {
    fn transport(action: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            action: action.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, CkanError::Transport { .. })
    }

    /// Rejected credentials: HTTP 401/403 or an `Authorization Error` payload
    pub fn is_authorization(&self) -> bool {
        match self {
            CkanError::Api { status, error, .. } => {
                *status == 401 || *status == 403 || error.is_authorization()
            },
            _ => false,
        }
    }

    /// Message meant for the job result: the API's own message when there is one
    pub fn user_message(&self) -> String {
        match self {
            CkanError::Api { error, .. } => error.message(),
            other => other.to_string(),
        }
    }
}

/// CKAN action API client, scoped to one site and one API key
pub struct CkanClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl CkanClient {
    /// `base_url` must end in '/' (see `JobMetadata::ckan_url`)
    pub fn new(
        base_url: Url,
        api_key: impl Into<String>,
        timeout: Duration,
        ssl_verify: bool,
    ) -> Result<Self, CkanError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!ssl_verify)
            .user_agent(concat!("datapusher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CkanError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn action_url(&self, action: &str) -> Result<Url, CkanError> {
        self.base_url
            .join(&format!("api/3/action/{}", action))
            .map_err(|e| CkanError::Config(format!("Cannot build URL for {}: {}", action, e)))
    }

    /// Post one action and unwrap its envelope
    async fn post_action<B, T>(&self, action: &str, body: &B) -> Result<Option<T>, CkanError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.action_url(action)?;
        debug!(action, url = %url, "Calling CKAN action");

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CkanError::transport(action, e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CkanError::transport(action, e.to_string()))?;

        match serde_json::from_slice::<ActionResponse<T>>(&bytes) {
            Ok(envelope) if envelope.success && status.is_success() => Ok(envelope.result),
            Ok(envelope) if !envelope.success => Err(CkanError::Api {
                action: action.to_string(),
                status: status.as_u16(),
                error: envelope.error.unwrap_or_default(),
            }),
            Ok(_) => Err(CkanError::transport(
                action,
                format!("HTTP {} with a successful action body", status),
            )),
            Err(e) if status.is_success() => Err(CkanError::transport(
                action,
                format!("malformed response body: {}", e),
            )),
            // Credentials were refused even if a proxy ate the action body
            Err(_) if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                Err(CkanError::Api {
                    action: action.to_string(),
                    status: status.as_u16(),
                    error: ApiError {
                        message: Some(format!("HTTP {}", status)),
                        ..Default::default()
                    },
                })
            },
            Err(_) => Err(CkanError::transport(action, format!("HTTP {}", status))),
        }
    }

    pub async fn resource_show(&self, resource_id: &str) -> Result<Resource, CkanError> {
        let action = "resource_show";
        let resource: Option<Resource> = self
            .post_action(action, &ResourceShowRequest { id: resource_id })
            .await?;

        resource.ok_or_else(|| CkanError::transport(action, "response has no result"))
    }

    /// Write the full resource back
    pub async fn resource_update(&self, resource: &Resource) -> Result<(), CkanError> {
        let _: Option<Value> = self.post_action("resource_update", resource).await?;
        Ok(())
    }

    /// Drop the datastore table of a resource
    ///
    /// Returns `false` when there was no table to drop, which is not an error.
    pub async fn datastore_delete(&self, resource_id: &str) -> Result<bool, CkanError> {
        let request = DatastoreDeleteRequest {
            resource_id,
            force: true,
        };

        match self.post_action::<_, Value>("datastore_delete", &request).await {
            Ok(_) => Ok(true),
            Err(CkanError::Api { status, error, .. }) if status == 404 || error.is_not_found() => {
                debug!(resource_id, "No datastore table to delete");
                Ok(false)
            },
            Err(e) => {
                warn!(resource_id, error = %e, "datastore_delete failed");
                Err(e)
            },
        }
    }

    /// Create the table (first call) or append one chunk of records
    pub async fn datastore_create(
        &self,
        request: &DatastoreCreateRequest<'_>,
    ) -> Result<(), CkanError> {
        let _: Option<Value> = self.post_action("datastore_create", request).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn client(base: &str) -> CkanClient {
        CkanClient::new(Url::parse(base).unwrap(), "key", Duration::from_secs(5), true).unwrap()
    }

    #[test]
    fn test_action_url_keeps_site_path() {
        let client = client("https://data.example.org/catalog/");
        assert_eq!(
            client.action_url("resource_show").unwrap().as_str(),
            "https://data.example.org/catalog/api/3/action/resource_show"
        );
    }

    #[test]
    fn test_authorization_classification() {
        let forbidden = CkanError::Api {
            action: "datastore_create".to_string(),
            status: 403,
            error: ApiError::default(),
        };
        let typed = CkanError::Api {
            action: "datastore_create".to_string(),
            status: 200,
            error: ApiError {
                error_type: Some("Authorization Error".to_string()),
                ..Default::default()
            },
        };
        let transport = CkanError::transport("datastore_create", "HTTP 502");

        assert!(forbidden.is_authorization());
        assert!(typed.is_authorization());
        assert!(!transport.is_authorization());
        assert!(transport.is_transport());
    }
}
