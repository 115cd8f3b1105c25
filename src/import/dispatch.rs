//! Chunking of the decoded record stream into bounded write batches.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{self, Item, Record};
use crate::emit;
use crate::metrics::events::RecordsSkipped;
use crate::table::MAX_BATCH_SIZE;

/// What the dispatcher got through before its input or output closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub records_dispatched: usize,
    pub records_skipped: usize,
}

/// Accumulates records into batches of at most `MAX_BATCH_SIZE` upserts.
///
/// Full batches are emitted immediately; the final partial batch is flushed
/// exactly once when the record stream ends. An empty batch is never
/// emitted. Memory stays bounded at one batch under construction plus the
/// downstream queue depth.
pub struct BatchDispatcher {
    records: mpsc::Receiver<Record>,
    batches: mpsc::Sender<Vec<Item>>,
}

impl BatchDispatcher {
    /// Connect the decoded record channel to the batch queue.
    pub fn new(records: mpsc::Receiver<Record>, batches: mpsc::Sender<Vec<Item>>) -> Self {
        Self { records, batches }
    }

    /// Run until the record stream is exhausted or the workers hang up.
    ///
    /// Closes the batch queue on return so the workers drain and finish.
    pub async fn run(mut self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut chunk: Vec<Item> = Vec::with_capacity(MAX_BATCH_SIZE);

        while let Some(record) = self.records.recv().await {
            // A record that cannot be marshalled back into a native item is
            // dropped, not fatal to the batch around it.
            let item = match codec::decode_record(record) {
                Ok(item) => item,
                Err(error) => {
                    warn!("Skipping record that failed to decode: {error}");
                    emit!(RecordsSkipped { count: 1 });
                    stats.records_skipped += 1;
                    continue;
                }
            };

            chunk.push(item);
            if chunk.len() == MAX_BATCH_SIZE {
                stats.records_dispatched += chunk.len();
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(MAX_BATCH_SIZE));
                if self.batches.send(full).await.is_err() {
                    debug!("[dispatch] Batch queue closed, stopping");
                    return stats;
                }
            }
        }

        if !chunk.is_empty() {
            stats.records_dispatched += chunk.len();
            let _ = self.batches.send(chunk).await;
        }
        stats
    }
}
