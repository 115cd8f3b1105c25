//! avalanche: archive DynamoDB tables to object storage and restore them back.
//!
//! Export runs a parallel segmented scan and streams encoded record pages
//! into a single archived object; import downloads the archive and writes
//! the records back through a pool of batch writers that retry partially
//! rejected batches with exponential backoff. Delivery is at-least-once on
//! top of idempotent upserts.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use avalanche::{config::ExportConfig, export::Exporter, table::DynamoTable};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), avalanche::error::TransferError> {
//!     let config = ExportConfig {
//!         table: "orders".into(),
//!         bucket: "backups".into(),
//!         partitions: 4,
//!         ..Default::default()
//!     };
//!     let exporter = Exporter::new(table, storage, config, shutdown)?;
//!     let stats = exporter.run().await?;
//!     println!("archived {} records", stats.records);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod table;

// Re-export main types
pub use export::{Exporter, ExportStats};
pub use import::{Importer, ImportStats};
pub use storage::{StorageProvider, StorageProviderRef};
pub use table::{DynamoTable, TableStore};
