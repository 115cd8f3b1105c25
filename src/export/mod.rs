//! Export pipeline: parallel segmented scan streamed into one object.
//!
//! Segment scanners run concurrently, each encoding its pages and pushing
//! them through a bounded hand-off channel to a single uploader task that
//! owns the multipart upload. The archive never needs to fit in memory:
//! backpressure from the uploader paces the scanners.

mod bridge;

use std::sync::Arc;

use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{ExportConfig, MB};
use crate::emit;
use crate::error::{CodecSnafu, TableSnafu, TaskJoinSnafu, TransferError};
use crate::metrics::events::{PageScanned, RecordsExported, RecordsSkipped};
use crate::storage::{StorageProviderRef, backup_key};
use crate::table::{SegmentDescriptor, SegmentScanner, TableStore, plan_segments};

use bridge::Uploader;

/// Statistics about an export run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportStats {
    pub segments: usize,
    pub pages: usize,
    pub records: usize,
    pub records_skipped: usize,
    pub bytes_uploaded: u64,
}

/// Per-segment scan statistics.
#[derive(Debug, Default, Clone, Copy)]
struct SegmentStats {
    pages: usize,
    records: usize,
    records_skipped: usize,
}

/// Archives one table into one object.
pub struct Exporter<T> {
    table: Arc<T>,
    storage: StorageProviderRef,
    config: ExportConfig,
    shutdown: CancellationToken,
}

impl<T: TableStore> Exporter<T> {
    /// Create an exporter from validated configuration.
    pub fn new(
        table: Arc<T>,
        storage: StorageProviderRef,
        config: ExportConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, TransferError> {
        config.validate().context(crate::error::ConfigSnafu)?;
        Ok(Self {
            table,
            storage,
            config,
            shutdown,
        })
    }

    /// Run the export to completion.
    ///
    /// The destination object is completed only if every segment scanner
    /// finishes successfully; any failure aborts the upload so a truncated
    /// archive is never mistaken for a complete one.
    pub async fn run(&self) -> Result<ExportStats, TransferError> {
        let key = backup_key(self.config.prefix.as_deref(), &self.config.table);
        let segments = plan_segments(&self.config);
        info!(
            "Archiving table {} to {} across {} segment(s)",
            self.config.table,
            key,
            segments.len()
        );

        // Capacity 1: scanners block while the uploader drains the previous
        // page, keeping at most one serialized page queued.
        let (page_tx, page_rx) = mpsc::channel(1);

        let uploader = Uploader::spawn(
            self.storage.clone(),
            key.clone(),
            page_rx,
            self.config.chunk_size_mb * MB,
            self.config.upload_concurrency,
            self.shutdown.clone(),
        );

        let tasks: Vec<JoinHandle<Result<SegmentStats, TransferError>>> = segments
            .into_iter()
            .map(|descriptor| {
                tokio::spawn(scan_segment(
                    self.table.clone(),
                    descriptor,
                    page_tx.clone(),
                    self.shutdown.clone(),
                ))
            })
            .collect();

        // The exporter keeps its own sender until the join barrier has
        // resolved: a failing scanner must never be the last sender
        // standing, or the bridge could see a clean end-of-stream for a
        // truncated archive before cancellation reaches it.
        let mut stats = ExportStats {
            segments: tasks.len(),
            ..Default::default()
        };
        let mut first_error = None;

        for task in tasks {
            let result = task.await.context(TaskJoinSnafu).and_then(|result| result);
            match result {
                Ok(segment) => {
                    stats.pages += segment.pages;
                    stats.records += segment.records;
                    stats.records_skipped += segment.records_skipped;
                }
                Err(error) => {
                    if first_error.is_none() {
                        // First failure wins; cancel so siblings and the
                        // uploader unwind at their next blocking point.
                        self.shutdown.cancel();
                        first_error = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            drop(page_tx);
            uploader.abort().await;
            return Err(error);
        }

        drop(page_tx);
        let upload = uploader.finish().await?;
        stats.bytes_uploaded = upload.bytes_uploaded;

        info!(
            "Backup completed: {} records in {} pages across {} segment(s), {} bytes",
            stats.records, stats.pages, stats.segments, stats.bytes_uploaded
        );
        if stats.records_skipped > 0 {
            warn!(
                "{} record(s) could not be encoded and were skipped",
                stats.records_skipped
            );
        }
        Ok(stats)
    }
}

/// Drive one segment: fetch pages, encode records, hand pages to the bridge.
///
/// Stops early when the bridge hangs up or cancellation is observed; an
/// in-flight page fetch completes, but no further page is requested.
async fn scan_segment<T: TableStore>(
    table: Arc<T>,
    descriptor: SegmentDescriptor,
    pages: mpsc::Sender<bytes::Bytes>,
    shutdown: CancellationToken,
) -> Result<SegmentStats, TransferError> {
    let segment = descriptor.segment;
    debug!(
        "[scan] Starting segment {}/{}",
        segment, descriptor.total_segments
    );

    let mut scanner = SegmentScanner::new(table, descriptor);
    let mut stats = SegmentStats::default();

    while !shutdown.is_cancelled() {
        let Some(page) = scanner.next_page().await.context(TableSnafu)? else {
            break;
        };
        stats.pages += 1;

        let mut records = Vec::with_capacity(page.items.len());
        for item in page.items {
            match codec::encode_item(item) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!("[scan] Skipping item in segment {segment} that failed to encode: {error}");
                    emit!(RecordsSkipped { count: 1 });
                    stats.records_skipped += 1;
                }
            }
        }

        if records.is_empty() {
            continue;
        }

        let bytes = codec::serialize_page(&records).context(CodecSnafu)?;
        stats.records += records.len();
        emit!(PageScanned);
        emit!(RecordsExported {
            count: records.len() as u64
        });

        if pages.send(bytes).await.is_err() {
            // Uploader hung up; stop requesting further pages.
            debug!("[scan] Bridge closed, stopping segment {segment}");
            break;
        }
    }

    debug!(
        "[scan] Finished segment {segment} ({} pages, {} records)",
        stats.pages, stats.records
    );
    Ok(stats)
}
