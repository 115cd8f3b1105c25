//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in one of the
//! pipelines. Events implement the `InternalEvent` trait which emits the
//! corresponding counter metric.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a scan page has been encoded and handed to the bridge.
pub struct PageScanned;

impl InternalEvent for PageScanned {
    fn emit(self) {
        counter!("avalanche_pages_scanned_total").increment(1);
    }
}

/// Event emitted when records are exported.
pub struct RecordsExported {
    pub count: u64,
}

impl InternalEvent for RecordsExported {
    fn emit(self) {
        trace!(count = self.count, "Records exported");
        counter!("avalanche_records_exported_total").increment(self.count);
    }
}

/// Event emitted when bytes are shipped to the archive object.
pub struct BytesUploaded {
    pub bytes: u64,
}

impl InternalEvent for BytesUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes uploaded");
        counter!("avalanche_bytes_uploaded_total").increment(self.bytes);
    }
}

/// Event emitted when records are written to the destination table.
pub struct RecordsImported {
    pub count: u64,
}

impl InternalEvent for RecordsImported {
    fn emit(self) {
        trace!(count = self.count, "Records imported");
        counter!("avalanche_records_imported_total").increment(self.count);
    }
}

/// Event emitted when a write batch has been fully processed.
pub struct BatchesWritten {
    pub count: u64,
}

impl InternalEvent for BatchesWritten {
    fn emit(self) {
        counter!("avalanche_batches_written_total").increment(self.count);
    }
}

/// Event emitted when a bulk write reports unprocessed items.
pub struct UnprocessedItems {
    pub count: u64,
}

impl InternalEvent for UnprocessedItems {
    fn emit(self) {
        trace!(count = self.count, "Unprocessed items");
        counter!("avalanche_unprocessed_items_total").increment(self.count);
    }
}

/// Event emitted when a record is dropped instead of transferred.
pub struct RecordsSkipped {
    pub count: u64,
}

impl InternalEvent for RecordsSkipped {
    fn emit(self) {
        trace!(count = self.count, "Records skipped");
        counter!("avalanche_records_skipped_total").increment(self.count);
    }
}
