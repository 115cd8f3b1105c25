//! avalanche: archive DynamoDB tables to object storage and restore them back.
//!
//! `export` scans a table in parallel segments and streams it into one JSON
//! archive object; `import` downloads an archive and batch-writes its
//! records back into a table.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use avalanche::config::{AttributeType, ExportConfig, ImportConfig, ScanFilter};
use avalanche::error::{TransferError, TransferStorageSnafu};
use avalanche::export::Exporter;
use avalanche::import::Importer;
use avalanche::signal;
use avalanche::storage::StorageProvider;
use avalanche::table::DynamoTable;

/// DynamoDB table archive and restore tool.
#[derive(Parser, Debug)]
#[command(name = "avalanche")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive a table into an object in the destination bucket.
    Export(ExportArgs),
    /// Restore an archived object into a table.
    Import(ImportArgs),
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    /// AWS region of the table and bucket.
    #[arg(long)]
    region: String,

    /// Table to archive.
    #[arg(long)]
    table: String,

    /// Secondary index to scan instead of the base table.
    #[arg(long)]
    index: Option<String>,

    /// Number of parallel scan segments.
    #[arg(long, default_value_t = 1)]
    partitions: usize,

    /// Page size limit per scan request.
    #[arg(long)]
    page_limit: Option<u32>,

    /// Attribute name for a server-side scan filter.
    #[arg(long)]
    filter_attribute: Option<String>,

    /// Type of the filter comparison value.
    #[arg(long, value_enum)]
    filter_type: Option<AttributeType>,

    /// Filter comparison operator, e.g. `=` or `>`.
    #[arg(long)]
    filter_operator: Option<String>,

    /// Filter comparison value.
    #[arg(long)]
    filter_value: Option<String>,

    /// Destination bucket.
    #[arg(long)]
    bucket: String,

    /// Key prefix for the archived object.
    #[arg(long)]
    prefix: Option<String>,

    /// Multipart chunk size in MB.
    #[arg(long, default_value_t = 32)]
    chunk_size: usize,

    /// Maximum concurrent part uploads.
    #[arg(long, default_value_t = 10)]
    upload_concurrency: usize,
}

#[derive(clap::Args, Debug)]
struct ImportArgs {
    /// AWS region of the table and bucket.
    #[arg(long)]
    region: String,

    /// Destination table.
    #[arg(long)]
    table: String,

    /// Number of parallel batch-write workers.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Source bucket.
    #[arg(long)]
    bucket: String,

    /// Key of the archived object.
    #[arg(long)]
    key: String,

    /// Maximum retries for unprocessed items per batch.
    #[arg(long, default_value_t = 10)]
    max_retries: usize,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), TransferError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("avalanche starting");
    let shutdown = signal::shutdown_token();

    match args.command {
        Command::Export(export) => run_export(export, shutdown).await,
        Command::Import(import) => run_import(import, shutdown).await,
    }
}

async fn run_export(args: ExportArgs, shutdown: CancellationToken) -> Result<(), TransferError> {
    let config = ExportConfig {
        table: args.table,
        index: args.index,
        partitions: args.partitions,
        page_limit: args.page_limit,
        filter: ScanFilter::from_parts(
            args.filter_attribute,
            args.filter_type,
            args.filter_operator,
            args.filter_value,
        ),
        bucket: args.bucket,
        prefix: args.prefix,
        chunk_size_mb: args.chunk_size,
        upload_concurrency: args.upload_concurrency,
    };

    let table = Arc::new(DynamoTable::new(dynamo_client(&args.region).await));
    let storage = bucket_storage(&config.bucket, &args.region).await?;

    Exporter::new(table, storage, config, shutdown)?.run().await?;
    Ok(())
}

async fn run_import(args: ImportArgs, shutdown: CancellationToken) -> Result<(), TransferError> {
    let config = ImportConfig {
        table: args.table,
        workers: args.workers,
        bucket: args.bucket,
        key: args.key,
        max_retries: args.max_retries,
    };

    let table = Arc::new(DynamoTable::new(dynamo_client(&args.region).await));
    let storage = bucket_storage(&config.bucket, &args.region).await?;

    Importer::new(table, storage, config, shutdown)?.run().await?;
    Ok(())
}

/// Build a DynamoDB client for the given region.
///
/// Credentials come from the default provider chain; the client is passed
/// down explicitly rather than held in ambient state.
async fn dynamo_client(region: &str) -> aws_sdk_dynamodb::Client {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    aws_sdk_dynamodb::Client::new(&config)
}

/// Build the blob-store provider for the bucket.
async fn bucket_storage(
    bucket: &str,
    region: &str,
) -> Result<avalanche::StorageProviderRef, TransferError> {
    let options = HashMap::from([("region".to_string(), region.to_string())]);
    let storage = StorageProvider::for_url_with_options(&format!("s3://{bucket}"), options)
        .await
        .context(TransferStorageSnafu)?;
    Ok(Arc::new(storage))
}
