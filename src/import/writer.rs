//! Batch writes with retry on partial rejection.
//!
//! The table store may accept part of a bulk write and reject the rest
//! under throttling. The rejected subset is itself a valid batch, so it is
//! resubmitted as-is after a backoff that doubles per attempt. A hard
//! request failure is a different animal and propagates immediately.

use std::sync::Arc;
use std::time::Duration;

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::codec::Item;
use crate::emit;
use crate::error::{RetriesExhaustedSnafu, TableError};
use crate::metrics::events::{BatchesWritten, RecordsImported, UnprocessedItems};
use crate::table::TableStore;

/// Wait before the first resubmission of unprocessed items; doubles on
/// each successive retry of the same batch.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Submits write batches, resubmitting whatever the store rejects.
pub struct BatchWriter<T: ?Sized> {
    table: Arc<T>,
    table_name: String,
    max_retries: usize,
    shutdown: CancellationToken,
}

impl<T: TableStore + ?Sized> BatchWriter<T> {
    /// Create a writer for one destination table.
    pub fn new(
        table: Arc<T>,
        table_name: String,
        max_retries: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            table_name,
            max_retries,
            shutdown,
        }
    }

    /// Write one batch to the destination, returning how many of its items
    /// were accepted.
    ///
    /// Unprocessed items are resubmitted with exponential backoff until the
    /// batch converges or the retry budget is spent. The backoff sleep
    /// races shutdown so a persistently throttled batch cannot stall the
    /// run; an abandoned batch returns short with a warning rather than an
    /// error, since cancellation already carries the run's outcome.
    pub async fn write(&self, batch: Vec<Item>) -> Result<usize, TableError> {
        let total = batch.len();
        let mut pending = batch;
        let mut delay = INITIAL_BACKOFF;
        let mut attempts = 0;

        loop {
            let unprocessed = self.table.batch_put(&self.table_name, pending).await?;

            if unprocessed.is_empty() {
                emit!(BatchesWritten { count: 1 });
                emit!(RecordsImported {
                    count: total as u64
                });
                return Ok(total);
            }

            emit!(UnprocessedItems {
                count: unprocessed.len() as u64
            });
            ensure!(
                attempts < self.max_retries,
                RetriesExhaustedSnafu {
                    attempts,
                    pending: unprocessed.len(),
                }
            );
            attempts += 1;
            warn!(
                "{} unprocessed item(s), retrying after {:?} (attempt {}/{})",
                unprocessed.len(),
                delay,
                attempts,
                self.max_retries
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    warn!(
                        "Shutdown requested, abandoning batch with {} pending item(s)",
                        unprocessed.len()
                    );
                    let written = total - unprocessed.len();
                    emit!(RecordsImported {
                        count: written as u64
                    });
                    return Ok(written);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay *= 2;
            pending = unprocessed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ScanPage, SegmentDescriptor};
    use async_trait::async_trait;
    use aws_sdk_dynamodb::types::AttributeValue;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn item(id: usize) -> Item {
        HashMap::from([("id".to_string(), AttributeValue::N(id.to_string()))])
    }

    /// Rejects the tail of each submission until `throttle_calls` runs out,
    /// recording every submission and its arrival time.
    struct ThrottlingTable {
        throttle_calls: usize,
        submissions: Mutex<Vec<(Instant, Vec<Item>)>>,
    }

    impl ThrottlingTable {
        fn new(throttle_calls: usize) -> Self {
            Self {
                throttle_calls,
                submissions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TableStore for ThrottlingTable {
        async fn scan_page(
            &self,
            _segment: &SegmentDescriptor,
            _start_key: Option<Item>,
        ) -> Result<ScanPage, TableError> {
            unimplemented!("write-only mock")
        }

        async fn batch_put(
            &self,
            _table: &str,
            mut items: Vec<Item>,
        ) -> Result<Vec<Item>, TableError> {
            let mut submissions = self.submissions.lock().unwrap();
            let call = submissions.len();
            submissions.push((Instant::now(), items.clone()));

            if call < self.throttle_calls && items.len() > 1 {
                // Accept the first half, reject the rest.
                let rejected = items.split_off(items.len() / 2);
                return Ok(rejected);
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exactly_the_rejected_subset_with_doubling_delay() {
        let table = Arc::new(ThrottlingTable::new(2));
        let writer = BatchWriter::new(
            table.clone(),
            "orders".into(),
            10,
            CancellationToken::new(),
        );

        let batch: Vec<Item> = (0..8).map(item).collect();
        let written = writer.write(batch.clone()).await.unwrap();
        assert_eq!(written, 8);

        let submissions = table.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 3);

        // Each resubmission carries exactly the previously rejected tail.
        assert_eq!(submissions[1].1, batch[4..].to_vec());
        assert_eq!(submissions[2].1, batch[6..].to_vec());

        // Backoff starts at 250ms and doubles.
        let first_gap = submissions[1].0 - submissions[0].0;
        let second_gap = submissions[2].0 - submissions[1].0;
        assert!(first_gap >= Duration::from_millis(250));
        assert!(second_gap >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_a_distinct_error() {
        // Throttle forever; two retries allowed.
        let table = Arc::new(ThrottlingTable::new(usize::MAX));
        let writer = BatchWriter::new(
            table.clone(),
            "orders".into(),
            2,
            CancellationToken::new(),
        );

        let error = writer
            .write((0..8).map(item).collect())
            .await
            .unwrap_err();
        match error {
            TableError::RetriesExhausted { attempts, pending } => {
                assert_eq!(attempts, 2);
                assert!(pending > 0);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(table.submissions.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let table = Arc::new(ThrottlingTable::new(usize::MAX));
        let shutdown = CancellationToken::new();
        let writer = BatchWriter::new(table.clone(), "orders".into(), 10, shutdown.clone());

        shutdown.cancel();
        let written = writer.write((0..8).map(item).collect()).await.unwrap();

        // The first request completes, the rejected tail is abandoned.
        assert_eq!(written, 4);
        assert_eq!(table.submissions.lock().unwrap().len(), 1);
    }

    struct FailingTable;

    #[async_trait]
    impl TableStore for FailingTable {
        async fn scan_page(
            &self,
            _segment: &SegmentDescriptor,
            _start_key: Option<Item>,
        ) -> Result<ScanPage, TableError> {
            unimplemented!("write-only mock")
        }

        async fn batch_put(&self, _table: &str, _items: Vec<Item>) -> Result<Vec<Item>, TableError> {
            Err(TableError::BatchWrite {
                source: "service unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_hard_request_error_is_not_retried() {
        let writer = BatchWriter::new(
            Arc::new(FailingTable),
            "orders".into(),
            10,
            CancellationToken::new(),
        );
        let error = writer.write(vec![item(1)]).await.unwrap_err();
        assert!(matches!(error, TableError::BatchWrite { .. }));
    }
}
