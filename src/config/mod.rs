//! Configuration for export and import runs.
//!
//! Configuration is assembled from command-line arguments; clients (the
//! table store, the blob store) are constructed by the caller and passed
//! down explicitly rather than read from ambient state.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::warn;

use crate::error::{ConfigError, EmptyBucketSnafu, EmptySourceKeySnafu, EmptyTableSnafu};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Configuration for archiving a table to a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Table to scan.
    pub table: String,

    /// Secondary index to scan instead of the base table.
    #[serde(default)]
    pub index: Option<String>,

    /// Number of parallel scan segments (clamped to at least 1).
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Page size limit per scan request.
    #[serde(default)]
    pub page_limit: Option<u32>,

    /// Optional server-side filter applied during the scan.
    #[serde(default)]
    pub filter: Option<ScanFilter>,

    /// Destination bucket.
    pub bucket: String,

    /// Key prefix for the archived object.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Multipart chunk size in MB (default: 32).
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: usize,

    /// Maximum concurrent part uploads (default: 10).
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            index: None,
            partitions: default_partitions(),
            page_limit: None,
            filter: None,
            bucket: String::new(),
            prefix: None,
            chunk_size_mb: default_chunk_size_mb(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl ExportConfig {
    /// Validate required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.table.is_empty(), EmptyTableSnafu);
        ensure!(!self.bucket.is_empty(), EmptyBucketSnafu);
        Ok(())
    }
}

/// Configuration for restoring an archived object into a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Destination table.
    pub table: String,

    /// Number of parallel batch-write workers (clamped to at least 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Source bucket.
    pub bucket: String,

    /// Key of the archived object.
    pub key: String,

    /// Maximum retries for unprocessed items per batch (default: 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            workers: default_workers(),
            bucket: String::new(),
            key: String::new(),
            max_retries: default_max_retries(),
        }
    }
}

impl ImportConfig {
    /// Validate required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.table.is_empty(), EmptyTableSnafu);
        ensure!(!self.bucket.is_empty(), EmptyBucketSnafu);
        ensure!(!self.key.is_empty(), EmptySourceKeySnafu);
        Ok(())
    }
}

fn default_partitions() -> usize {
    1
}

fn default_chunk_size_mb() -> usize {
    32
}

fn default_upload_concurrency() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

fn default_max_retries() -> usize {
    10
}

/// Type tag for a filter comparison value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
}

/// A single comparison applied server-side during a scan.
///
/// A filter is only ever fully populated. A partially specified clause is
/// treated as "no filter" rather than producing a malformed scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Attribute to compare.
    pub attribute: String,
    /// Type of the comparison value.
    pub attribute_type: AttributeType,
    /// Comparison operator, e.g. `=`, `<>`, `>`.
    pub operator: String,
    /// Value to compare against.
    pub value: String,
}

impl ScanFilter {
    /// Build a filter from individually optional parts.
    ///
    /// Returns `Some` only when all four parts are present; a partial
    /// specification disables filtering and logs a warning.
    pub fn from_parts(
        attribute: Option<String>,
        attribute_type: Option<AttributeType>,
        operator: Option<String>,
        value: Option<String>,
    ) -> Option<Self> {
        match (attribute, attribute_type, operator, value) {
            (Some(attribute), Some(attribute_type), Some(operator), Some(value)) => Some(Self {
                attribute,
                attribute_type,
                operator,
                value,
            }),
            (None, None, None, None) => None,
            _ => {
                warn!(
                    "Ignoring partially specified scan filter: \
                     attribute, type, operator and value must all be provided"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_config_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.partitions, 1);
        assert_eq!(config.chunk_size_mb, 32);
        assert_eq!(config.upload_concurrency, 10);
    }

    #[test]
    fn test_export_config_requires_table_and_bucket() {
        let config = ExportConfig::default();
        assert!(config.validate().is_err());

        let config = ExportConfig {
            table: "orders".into(),
            bucket: "backups".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_import_config_requires_key() {
        let config = ImportConfig {
            table: "orders".into(),
            bucket: "backups".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ImportConfig {
            key: "2024-01-01/orders.json".into(),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_requires_all_parts() {
        // Only 3 of 4 parts: must disable filtering, not fail.
        let filter = ScanFilter::from_parts(
            Some("status".into()),
            Some(AttributeType::String),
            Some("=".into()),
            None,
        );
        assert!(filter.is_none());

        let filter = ScanFilter::from_parts(None, None, None, None);
        assert!(filter.is_none());

        let filter = ScanFilter::from_parts(
            Some("status".into()),
            Some(AttributeType::String),
            Some("=".into()),
            Some("shipped".into()),
        );
        assert_eq!(
            filter,
            Some(ScanFilter {
                attribute: "status".into(),
                attribute_type: AttributeType::String,
                operator: "=".into(),
                value: "shipped".into(),
            })
        );
    }
}
