//! Push-to-datastore job orchestration
//!
//! Runs one job through `received → fetching → transforming → loading →
//! updating_metadata → done`. The first failing stage ends the job, and the
//! result records which stage that was.

use tracing::{error, info, instrument, warn, Span};

use crate::ckan::{CkanClient, CkanError};
use crate::config::{PusherConfig, SniffConfig};
use crate::error::{JobError, Result};
use crate::fetch::{Fetcher, SourceFile};
use crate::job::{Job, JobResult, JobStage, JobStats, JobStatus};
use crate::loader::{DatastoreLoader, LoadStats};
use crate::sniff::{sniff, TableLayout};
use crate::transform::RecordStream;

/// Run a push job to completion
///
/// Never fails: every outcome, including invalid input, is reported in the
/// returned [`JobResult`].
#[instrument(skip_all, fields(job_id = %job.job_id, resource_id = tracing::field::Empty))]
pub async fn push_to_datastore(job: &Job, config: &PusherConfig) -> JobResult {
    let mut run = JobRun::new(job, config);

    let outcome = match config.job_timeout() {
        Some(limit) => match tokio::time::timeout(limit, run.execute()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::Timeout(format!(
                "Job did not finish within {} seconds",
                limit.as_secs()
            ))),
        },
        None => run.execute().await,
    };

    run.finish(outcome)
}

/// State of one job while it runs
struct JobRun<'a> {
    job: &'a Job,
    config: &'a PusherConfig,
    stage: JobStage,
    stats: JobStats,
    resource_id: Option<String>,
    datastore_loaded: bool,
}

impl<'a> JobRun<'a> {
    fn new(job: &'a Job, config: &'a PusherConfig) -> Self {
        Self {
            job,
            config,
            stage: JobStage::Received,
            stats: JobStats::new(),
            resource_id: None,
            datastore_loaded: false,
        }
    }

    fn enter(&mut self, stage: JobStage) {
        info!(stage = %stage, "Entering stage");
        self.stage = stage;
    }

    async fn execute(&mut self) -> Result<()> {
        let (job, config) = (self.job, self.config);
        let metadata = job.validate()?;
        Span::current().record("resource_id", metadata.resource_id.as_str());
        self.resource_id = Some(metadata.resource_id.clone());

        let client = CkanClient::new(
            metadata.ckan_url.clone(),
            job.api_key.clone(),
            config.api_timeout(),
            config.ssl_verify,
        )
        .map_err(|e| JobError::invalid_job(e.to_string()))?;

        // Fetching
        self.enter(JobStage::Fetching);
        let mut resource = client
            .resource_show(&metadata.resource_id)
            .await
            .map_err(|e| resource_failure(&metadata.resource_id, e))?;
        if resource.id.is_empty() {
            resource.id = metadata.resource_id.clone();
        }
        if resource.url.trim().is_empty() {
            return Err(JobError::download(format!(
                "Resource {} has no URL to fetch",
                metadata.resource_id
            )));
        }

        let fetcher = Fetcher::new(&config.fetch, config.ssl_verify)?;
        let api_key = resource.is_upload().then_some(job.api_key.as_str());
        let source = fetcher.fetch(resource.url.trim(), api_key).await?;
        self.stats.bytes_downloaded = source.size;

        if !metadata.ignore_hash
            && resource
                .stored_hash()
                .is_some_and(|stored| stored.eq_ignore_ascii_case(&source.hash))
        {
            info!(hash = %source.hash, "File hash unchanged, skipping push");
            self.stats.hash_unchanged = true;
            self.enter(JobStage::Done);
            return Ok(());
        }

        // Transforming
        self.enter(JobStage::Transforming);
        let hash = source.hash.clone();
        let (layout, mut records) =
            open_table(source, resource.format.clone(), config.sniff.clone()).await?;
        self.stats.columns = layout.schema.len();

        // Loading
        self.enter(JobStage::Loading);
        let loader = DatastoreLoader::new(&client, &config.loader);
        let mut load = LoadStats::default();
        let loaded = loader
            .load(&metadata.resource_id, &layout.schema, &mut records, &mut load)
            .await;

        let transform = records.stats();
        self.stats.rows_read = transform.rows_read;
        self.stats.rows_padded = transform.rows_padded;
        self.stats.rows_truncated = transform.rows_truncated;
        self.stats.rows_skipped = transform.rows_skipped;
        self.stats.rows_malformed = transform.malformed();
        self.stats.chunks_sent = load.chunks_sent;
        self.stats.records_loaded = load.records_loaded;
        self.stats.retries = load.retries;
        self.stats.table_replaced = load.table_replaced;

        loaded?;
        records.finish()?;
        self.datastore_loaded = true;

        // Updating metadata
        self.enter(JobStage::UpdatingMetadata);
        resource.mark_datastore_active(&hash);
        client.resource_update(&resource).await.map_err(|e| {
            JobError::MetadataUpdate(format!(
                "Data was loaded into the datastore, but updating the resource failed: {}",
                e.user_message()
            ))
        })?;

        self.enter(JobStage::Done);
        Ok(())
    }

    fn finish(mut self, outcome: Result<()>) -> JobResult {
        self.stats.complete();

        let (status, error, failed_stage) = match outcome {
            Ok(()) => {
                info!(
                    records = self.stats.records_loaded,
                    chunks = self.stats.chunks_sent,
                    retries = self.stats.retries,
                    records_per_second = self.stats.records_per_second(),
                    hash_unchanged = self.stats.hash_unchanged,
                    duration_secs = self.stats.duration_secs,
                    "Job complete"
                );
                (JobStatus::Complete, None, None)
            },
            Err(e) => {
                if self.datastore_loaded {
                    warn!(stage = %self.stage, error_type = e.error_type(), error = %e, "Job failed after load");
                } else {
                    error!(stage = %self.stage, error_type = e.error_type(), error = %e, "Job failed");
                }
                (JobStatus::Error, Some(e.to_payload()), Some(self.stage))
            },
        };

        JobResult {
            job_id: self.job.job_id,
            resource_id: self.resource_id,
            status,
            error,
            failed_stage,
            datastore_loaded: self.datastore_loaded,
            stats: self.stats,
        }
    }
}

/// Sniff the stored file and open its record stream off the async runtime
///
/// Both read from disk, and spreadsheets are decoded whole on open.
async fn open_table(
    source: SourceFile,
    format_hint: Option<String>,
    config: SniffConfig,
) -> Result<(TableLayout, RecordStream)> {
    tokio::task::spawn_blocking(move || -> Result<(TableLayout, RecordStream)> {
        let layout = sniff(&source, format_hint.as_deref(), &config)?;
        let records = RecordStream::open(&source, &layout, &config)?;
        Ok((layout, records))
    })
    .await
    .map_err(|e| {
        JobError::unsupported_format(format!("Reading the stored file stopped unexpectedly: {}", e))
    })?
}

fn resource_failure(resource_id: &str, err: CkanError) -> JobError {
    if err.is_authorization() {
        JobError::Authorization(err.user_message())
    } else {
        JobError::Resource(format!(
            "Could not retrieve resource {}: {}",
            resource_id,
            err.user_message()
        ))
    }
}
