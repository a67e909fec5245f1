//! Datastore loader
//!
//! Replaces a resource's datastore table: one `datastore_delete`, then
//! `datastore_create` calls of bounded chunks pulled from a record iterator.
//! Chunks that fail in transport are retried with exponential backoff. Chunks
//! the API rejects stop the load at once.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ckan::types::DatastoreCreateRequest;
use crate::ckan::{CkanClient, CkanError, DatastoreField};
use crate::config::LoaderConfig;
use crate::error::{JobError, Result};
use crate::sniff::TableSchema;
use crate::transform::Record;

/// Progress of a load, kept up to date as chunks are accepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub chunks_sent: u64,
    pub records_loaded: u64,
    /// A previous table existed and was dropped
    pub table_replaced: bool,
    /// Transport retries across all chunks
    pub retries: u32,
}

pub struct DatastoreLoader<'a> {
    client: &'a CkanClient,
    config: &'a LoaderConfig,
}

impl<'a> DatastoreLoader<'a> {
    pub fn new(client: &'a CkanClient, config: &'a LoaderConfig) -> Self {
        Self { client, config }
    }

    /// Drop any existing table; a missing table is fine
    pub async fn delete_existing(&self, resource_id: &str) -> Result<bool> {
        let deleted = self
            .client
            .datastore_delete(resource_id)
            .await
            .map_err(datastore_failure)?;

        if deleted {
            info!(resource_id, "Deleted existing datastore table");
        }
        Ok(deleted)
    }

    /// Delete the current table, then push every record in chunks
    ///
    /// `stats` counts accepted chunks as they go, so after a failure it still
    /// shows what reached the datastore.
    pub async fn load<I>(
        &self,
        resource_id: &str,
        schema: &TableSchema,
        records: &mut I,
        stats: &mut LoadStats,
    ) -> Result<()>
    where
        I: Iterator<Item = Record> + Send,
    {
        let fields = schema.datastore_fields();
        stats.table_replaced = self.delete_existing(resource_id).await?;

        let mut carry: Option<(Record, usize)> = None;
        loop {
            let chunk = next_chunk(records, &mut carry, self.config);
            // The first call creates the table, so it goes out even when empty
            if chunk.is_empty() && stats.chunks_sent > 0 {
                break;
            }

            self.send_chunk(resource_id, &fields, &chunk, stats.chunks_sent + 1, &mut stats.retries)
                .await?;
            stats.chunks_sent += 1;
            stats.records_loaded += chunk.len() as u64;

            debug!(
                resource_id,
                chunk = stats.chunks_sent,
                records = chunk.len(),
                total = stats.records_loaded,
                "Chunk accepted"
            );
        }

        info!(
            resource_id,
            chunks = stats.chunks_sent,
            records = stats.records_loaded,
            retries = stats.retries,
            "Datastore load complete"
        );
        Ok(())
    }

    /// Send one chunk, retrying transport failures and adding them to `retries`
    async fn send_chunk(
        &self,
        resource_id: &str,
        fields: &[DatastoreField],
        records: &[Record],
        chunk: u64,
        retries: &mut u32,
    ) -> Result<()> {
        let request = DatastoreCreateRequest {
            resource_id,
            force: true,
            fields,
            records,
        };

        let mut attempt = 0u32;
        loop {
            match self.client.datastore_create(&request).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() && attempt < self.config.max_retries => {
                    attempt += 1;
                    *retries += 1;
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        resource_id,
                        chunk,
                        attempt,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Chunk transport failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                },
                Err(e) => {
                    warn!(resource_id, chunk, attempts = attempt + 1, error = %e, "Chunk failed");
                    return Err(datastore_failure(e));
                },
            }
        }
    }
}

/// Pull the next chunk, bounded by record count and serialized size
///
/// A record that would push the chunk over the byte cap is carried into the
/// next chunk. A record larger than the cap on its own still goes alone.
fn next_chunk<I>(records: &mut I, carry: &mut Option<(Record, usize)>, config: &LoaderConfig) -> Vec<Record>
where
    I: Iterator<Item = Record>,
{
    let mut chunk = Vec::new();
    let mut bytes = 0usize;

    if let Some((record, size)) = carry.take() {
        chunk.push(record);
        bytes = size;
    }

    while chunk.len() < config.chunk_size {
        let Some(record) = records.next() else {
            break;
        };

        let size = serde_json::to_vec(&record).map(|v| v.len()).unwrap_or(0);
        if !chunk.is_empty() && bytes + size > config.chunk_max_bytes {
            *carry = Some((record, size));
            break;
        }

        bytes += size;
        chunk.push(record);
    }

    chunk
}

/// Map a CKAN failure during delete or create to the job error taxonomy
pub fn datastore_failure(err: CkanError) -> JobError {
    if err.is_authorization() {
        return JobError::Authorization(err.user_message());
    }

    match err {
        CkanError::Api { error, .. } => JobError::datastore(error.message(), error.error_type.clone()),
        other => JobError::datastore(other.to_string(), None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ckan::ApiError;
    use serde_json::{json, Value};

    fn record(i: i64) -> Record {
        let Value::Object(map) = json!({"n": i}) else {
            unreachable!()
        };
        map
    }

    fn chunks(count: i64, config: &LoaderConfig) -> Vec<usize> {
        let mut records = (0..count).map(record);
        let mut carry = None;
        let mut sizes = Vec::new();
        loop {
            let chunk = next_chunk(&mut records, &mut carry, config);
            if chunk.is_empty() {
                break;
            }
            sizes.push(chunk.len());
        }
        sizes
    }

    #[test]
    fn test_chunks_by_record_count() {
        let config = LoaderConfig {
            chunk_size: 2,
            ..Default::default()
        };
        assert_eq!(chunks(5, &config), vec![2, 2, 1]);
        assert_eq!(chunks(4, &config), vec![2, 2]);
        assert!(chunks(0, &config).is_empty());
    }

    #[test]
    fn test_chunks_by_byte_cap() {
        // {"n":1} serializes to 7 bytes
        let config = LoaderConfig {
            chunk_size: 100,
            chunk_max_bytes: 15,
            ..Default::default()
        };
        assert_eq!(chunks(5, &config), vec![2, 2, 1]);
    }

    #[test]
    fn test_oversized_record_goes_alone() {
        let config = LoaderConfig {
            chunk_size: 100,
            chunk_max_bytes: 1,
            ..Default::default()
        };
        assert_eq!(chunks(3, &config), vec![1, 1, 1]);
    }

    #[test]
    fn test_datastore_failure_classification() {
        let rejected = CkanError::Api {
            action: "datastore_create".to_string(),
            status: 409,
            error: ApiError {
                message: Some("bad field".to_string()),
                error_type: Some("Validation Error".to_string()),
                ..Default::default()
            },
        };
        match datastore_failure(rejected) {
            JobError::Datastore { message, api_type } => {
                assert_eq!(message, "bad field");
                assert_eq!(api_type.as_deref(), Some("Validation Error"));
            },
            other => panic!("unexpected {:?}", other),
        }

        let denied = CkanError::Api {
            action: "datastore_create".to_string(),
            status: 403,
            error: ApiError {
                message: Some("Access denied".to_string()),
                ..Default::default()
            },
        };
        assert_eq!(
            datastore_failure(denied),
            JobError::Authorization("Access denied".to_string())
        );

        let transport = CkanError::Transport {
            action: "datastore_create".to_string(),
            message: "HTTP 502".to_string(),
        };
        assert_eq!(datastore_failure(transport).error_type(), "Datastore Error");
    }
}
