//! Error types for avalanche using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

/// Boxed error type used where several concrete source types can occur.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ============ Storage Errors ============

/// Errors that can occur during blob storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// The archive upload was abandoned before completion.
    #[snafu(display("Upload aborted before completion"))]
    UploadAborted,
}

// ============ Table Errors ============

/// Errors that can occur against the backing table store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TableError {
    /// A paginated scan request failed mid-segment.
    #[snafu(display("Scan request failed for segment {segment}"))]
    ScanPage { segment: usize, source: BoxError },

    /// A bulk-write request itself failed (distinct from unprocessed items).
    #[snafu(display("Batch write request failed"))]
    BatchWrite { source: BoxError },

    /// A write request could not be constructed from an item.
    #[snafu(display("Malformed write request"))]
    WriteRequestBuild {
        source: aws_sdk_dynamodb::error::BuildError,
    },

    /// Unprocessed items never converged within the retry budget.
    #[snafu(display(
        "Batch not fully processed after {attempts} retries ({pending} items pending)"
    ))]
    RetriesExhausted { attempts: usize, pending: usize },
}

// ============ Codec Errors ============

/// Errors that can occur while converting between native items and records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// A native item could not be encoded into a portable record.
    #[snafu(display("Failed to encode item"))]
    EncodeItem { source: serde_dynamo::Error },

    /// A portable record could not be decoded back into a native item.
    #[snafu(display("Failed to decode record"))]
    DecodeRecord { source: serde_dynamo::Error },

    /// A page of records could not be serialized to JSON.
    #[snafu(display("Failed to serialize page"))]
    PageSerialize { source: serde_json::Error },

    /// The archived JSON stream is corrupt.
    #[snafu(display("Failed to read record stream"))]
    RecordStream { source: serde_json::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Table name is empty.
    #[snafu(display("Table name cannot be empty"))]
    EmptyTable,

    /// Bucket name is empty.
    #[snafu(display("Bucket name cannot be empty"))]
    EmptyBucket,

    /// Restore source key is empty.
    #[snafu(display("Source key cannot be empty"))]
    EmptySourceKey,
}

// ============ Transfer Error (top-level) ============

/// Top-level errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    /// Table store error.
    #[snafu(display("Table store error"))]
    Table { source: TableError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    TransferStorage { source: StorageError },

    /// Codec error.
    #[snafu(display("Codec error"))]
    Codec { source: CodecError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },
}
