//! Import pipeline: archived object decoded and written back in batches.
//!
//! The archive is streamed to a scratch file, decoded on the blocking
//! thread pool into a bounded record channel, chunked into write batches
//! of at most 25 upserts, and drained by a pool of writer workers. Records
//! reach the destination at least once; the upsert semantics of the table
//! store make replays harmless.

mod dispatch;
mod writer;

pub use dispatch::BatchDispatcher;
pub use writer::{BatchWriter, INITIAL_BACKOFF};

use std::io::Seek;
use std::sync::Arc;

use object_store::path::Path;
use snafu::prelude::*;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Item, Record};
use crate::config::ImportConfig;
use crate::error::{
    CodecSnafu, IoSnafu, RecordStreamSnafu, TableSnafu, TaskJoinSnafu, TransferError,
    TransferStorageSnafu,
};
use crate::storage::StorageProviderRef;
use crate::table::{MAX_BATCH_SIZE, TableStore};

/// Statistics about an import run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportStats {
    pub bytes_downloaded: u64,
    pub records_decoded: usize,
    pub records_skipped: usize,
    pub batches: usize,
    pub records_imported: usize,
}

/// Per-worker write statistics.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerStats {
    batches: usize,
    records: usize,
}

/// Restores one archived object into one table.
pub struct Importer<T> {
    table: Arc<T>,
    storage: StorageProviderRef,
    config: ImportConfig,
    shutdown: CancellationToken,
}

impl<T: TableStore> Importer<T> {
    /// Create an importer from validated configuration.
    pub fn new(
        table: Arc<T>,
        storage: StorageProviderRef,
        config: ImportConfig,
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

    /// Run the import to completion.
    ///
    /// The first fatal error from any worker wins and cancels the run;
    /// siblings unwind at their next blocking point instead of leaking.
    pub async fn run(&self) -> Result<ImportStats, TransferError> {
        let mut stats = ImportStats::default();
        let (bytes_downloaded, scratch) = self.download().await?;
        stats.bytes_downloaded = bytes_downloaded;
        let scratch = scratch.into_std().await;

        // Records flow scratch file -> decode feeder -> dispatcher -> batch
        // queue -> workers. Every hop is bounded, so a slow destination
        // pushes back all the way to the decoder.
        let (record_tx, record_rx) = mpsc::channel::<Record>(MAX_BATCH_SIZE * 4);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Item>>(self.config.workers.max(1));

        let feeder = self.spawn_feeder(scratch, record_tx);
        let dispatcher = tokio::spawn(BatchDispatcher::new(record_rx, batch_tx).run());
        let workers = self.spawn_workers(batch_rx);

        let mut first_error = None;
        for task in workers {
            match task.await.context(TaskJoinSnafu).and_then(|result| result) {
                Ok(worker) => {
                    stats.batches += worker.batches;
                    stats.records_imported += worker.records;
                }
                Err(error) => {
                    if first_error.is_none() {
                        // First failure wins; cancel so siblings, the
                        // dispatcher and the feeder unwind.
                        self.shutdown.cancel();
                        first_error = Some(error);
                    }
                }
            }
        }

        let dispatch = dispatcher.await.context(TaskJoinSnafu)?;
        stats.records_skipped = dispatch.records_skipped;

        match feeder.await.context(TaskJoinSnafu).and_then(|result| result) {
            Ok(decoded) => stats.records_decoded = decoded,
            Err(error) => {
                // A corrupt archive is fatal even though the workers wrote
                // everything decoded before the corruption.
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        info!(
            "Restore completed: {} records in {} batches to table {}",
            stats.records_imported, stats.batches, self.config.table
        );
        if stats.records_skipped > 0 {
            warn!(
                "{} record(s) could not be decoded and were skipped",
                stats.records_skipped
            );
        }
        Ok(stats)
    }

    /// Stream the archive into an anonymous scratch file, which disappears
    /// when the handle is dropped.
    async fn download(&self) -> Result<(u64, tokio::fs::File), TransferError> {
        info!(
            "Downloading archive {} from {}",
            self.config.key, self.config.bucket
        );
        let file = tempfile::tempfile()
            .context(IoSnafu)
            .context(TransferStorageSnafu)?;
        let mut file = tokio::fs::File::from_std(file);

        let bytes = self
            .storage
            .download_to(&Path::from(self.config.key.as_str()), &mut file)
            .await
            .context(TransferStorageSnafu)?;
        debug!("Downloaded {bytes} bytes");

        Ok((bytes, file))
    }

    /// Spawn the blocking decode feeder.
    ///
    /// The archive is a sequence of JSON arrays, one per scanned page; the
    /// stream deserializer tolerates any whitespace between them. The
    /// feeder stops as soon as the downstream queue closes or shutdown is
    /// requested rather than blocking on a channel no one drains.
    fn spawn_feeder(
        &self,
        mut scratch: std::fs::File,
        records: mpsc::Sender<Record>,
    ) -> JoinHandle<Result<usize, TransferError>> {
        let shutdown = self.shutdown.clone();
        tokio::task::spawn_blocking(move || {
            scratch
                .rewind()
                .context(IoSnafu)
                .context(TransferStorageSnafu)?;

            let reader = std::io::BufReader::new(scratch);
            let pages = serde_json::Deserializer::from_reader(reader).into_iter::<Vec<Record>>();
            let mut records_decoded = 0;

            for page in pages {
                let page = page.context(RecordStreamSnafu).context(CodecSnafu)?;
                for record in page {
                    if shutdown.is_cancelled() {
                        debug!("[decode] Shutdown requested, stopping feeder");
                        return Ok(records_decoded);
                    }
                    if records.blocking_send(record).is_err() {
                        debug!("[decode] Record queue closed, stopping feeder");
                        return Ok(records_decoded);
                    }
                    records_decoded += 1;
                }
            }
            Ok(records_decoded)
        })
    }

    /// Spawn the writer workers sharing one batch queue.
    fn spawn_workers(
        &self,
        batches: mpsc::Receiver<Vec<Item>>,
    ) -> Vec<JoinHandle<Result<WorkerStats, TransferError>>> {
        let worker_count = self.config.workers.max(1);
        info!("Starting {} write worker(s)", worker_count);

        let batches = Arc::new(Mutex::new(batches));
        (0..worker_count)
            .map(|worker| {
                let writer = BatchWriter::new(
                    self.table.clone(),
                    self.config.table.clone(),
                    self.config.max_retries,
                    self.shutdown.clone(),
                );
                tokio::spawn(write_batches(
                    worker,
                    writer,
                    batches.clone(),
                    self.shutdown.clone(),
                ))
            })
            .collect()
    }
}

/// One worker: pull batches off the shared queue until it closes or the
/// run is cancelled. An in-flight batch finishes its current request; no
/// new batch is started after cancellation is observed.
async fn write_batches<T: TableStore>(
    worker: usize,
    writer: BatchWriter<T>,
    batches: Arc<Mutex<mpsc::Receiver<Vec<Item>>>>,
    shutdown: CancellationToken,
) -> Result<WorkerStats, TransferError> {
    debug!("[write] Worker {worker} started");
    let mut stats = WorkerStats::default();

    loop {
        let batch = {
            let mut queue = batches.lock().await;
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                batch = queue.recv() => batch,
            }
        };
        let Some(batch) = batch else {
            break;
        };

        stats.batches += 1;
        stats.records += writer.write(batch).await.context(TableSnafu)?;
    }

    debug!(
        "[write] Worker {worker} finished ({} batches, {} records)",
        stats.batches, stats.records
    );
    Ok(stats)
}
