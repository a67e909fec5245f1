//! Datapusher
//!
//! Worker that pushes tabular resource files from a CKAN site into its
//! datastore. One job covers one resource:
//!
//! - **Fetch**: download the resource file with size, time and redirect limits
//! - **Sniff**: detect delimiter or spreadsheet, header and column types
//! - **Transform**: stream rows as typed records, repairing or skipping bad rows
//! - **Load**: replace the datastore table in bounded chunks
//! - **Update**: mark the resource `datastore_active` and store the file hash
//!
//! # Example
//!
//! ```no_run
//! use datapusher::{push_to_datastore, Job, PusherConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PusherConfig::from_env()?;
//!     let job = Job::push("my-api-key", "https://demo.ckan.org/", "a1b2c3");
//!
//!     let result = push_to_datastore(&job, &config).await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod ckan;
pub mod config;
pub mod error;
pub mod fetch;
pub mod job;
pub mod loader;
pub mod orchestrator;
pub mod rows;
pub mod sniff;
pub mod transform;

pub use config::PusherConfig;
pub use error::{JobError, JobErrorPayload};
pub use job::{Job, JobMetadata, JobResult, JobStage, JobStats, JobStatus};
pub use orchestrator::push_to_datastore;
