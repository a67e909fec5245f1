//! Datapusher - push CKAN resources into the datastore

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use datapusher::{push_to_datastore, Job, PusherConfig};
use datapusher_common::logging::{init_logging, LogConfig, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "datapusher")]
#[command(author, version, about = "Push CKAN resources into the datastore")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run a job given as JSON
    Run {
        /// Job file, or '-' for stdin
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Push a single resource
    Push {
        /// CKAN site root, e.g. https://demo.ckan.org/
        #[arg(long)]
        ckan_url: String,

        #[arg(long)]
        resource_id: String,

        #[arg(long, env = "DATAPUSHER_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Push even if the file hash has not changed
        #[arg(long)]
        ignore_hash: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("datapusher")
        .build()
        .with_env()?;

    let _guard = init_logging(&log_config)?;

    let config = PusherConfig::from_env().context("Failed to load datapusher configuration")?;

    let job = match cli.command {
        Command::Run { job } => read_job(&job)?,
        Command::Push {
            ckan_url,
            resource_id,
            api_key,
            ignore_hash,
        } => Job::push(api_key, &ckan_url, &resource_id).with_ignore_hash(ignore_hash),
    };

    info!(job_id = %job.job_id, "Starting job");
    let result = push_to_datastore(&job, &config).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_job(path: &Path) -> Result<Job> {
    let raw = if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read job from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?
    };

    serde_json::from_str(&raw).context("Job is not valid JSON")
}
