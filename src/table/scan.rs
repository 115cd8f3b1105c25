//! Segmented parallel scan planning and execution.
//!
//! A full-table scan is divided into disjoint segments that are scanned
//! independently and in parallel. Page order is preserved within a segment;
//! there is no ordering guarantee across segments.

use std::sync::Arc;

use crate::codec::Item;
use crate::config::{ExportConfig, ScanFilter};
use crate::error::TableError;

use super::{ScanPage, TableStore};

/// Immutable description of one slice of a parallel scan.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// Table to scan.
    pub table: String,
    /// Secondary index to scan instead of the base table.
    pub index: Option<String>,
    /// Index of this segment, in `[0, total_segments)`.
    pub segment: usize,
    /// Total number of segments in the plan.
    pub total_segments: usize,
    /// Page size limit per scan request.
    pub page_limit: Option<u32>,
    /// Optional server-side filter.
    pub filter: Option<ScanFilter>,
}

/// Divide a full-table scan into independent segments.
///
/// Produces exactly `partitions` descriptors (clamped to at least 1) with
/// indices `0..partitions`, all sharing the same table, index, filter and
/// page limit.
pub fn plan_segments(config: &ExportConfig) -> Vec<SegmentDescriptor> {
    let total_segments = config.partitions.max(1);
    (0..total_segments)
        .map(|segment| SegmentDescriptor {
            table: config.table.clone(),
            index: config.index.clone(),
            segment,
            total_segments,
            page_limit: config.page_limit,
            filter: config.filter.clone(),
        })
        .collect()
}

/// Drives one segment of a paginated scan to exhaustion.
///
/// The caller pulls pages until `next_page` returns `None`; stopping early
/// is simply a matter of not asking for the next page. Transport errors
/// abort the segment and propagate — retrying a scan is the caller's
/// concern, since a dropped page means missing records, not corruption.
pub struct SegmentScanner<T: ?Sized> {
    table: Arc<T>,
    descriptor: SegmentDescriptor,
    start_key: Option<Item>,
    exhausted: bool,
}

impl<T: TableStore + ?Sized> SegmentScanner<T> {
    /// Create a scanner for one segment.
    pub fn new(table: Arc<T>, descriptor: SegmentDescriptor) -> Self {
        Self {
            table,
            descriptor,
            start_key: None,
            exhausted: false,
        }
    }

    /// Fetch the next page, or `None` once the store has reported the last
    /// page of this segment.
    pub async fn next_page(&mut self) -> Result<Option<ScanPage>, TableError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .table
            .scan_page(&self.descriptor, self.start_key.take())
            .await?;

        self.exhausted = page.is_last();
        self.start_key = page.last_evaluated_key.clone();
        Ok(Some(page))
    }

    /// The descriptor this scanner was built from.
    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aws_sdk_dynamodb::types::AttributeValue;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(partitions: usize) -> ExportConfig {
        ExportConfig {
            table: "orders".into(),
            bucket: "backups".into(),
            partitions,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_clamps_to_one_segment() {
        let plan = plan_segments(&config(0));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].segment, 0);
        assert_eq!(plan[0].total_segments, 1);
    }

    #[test]
    fn test_plan_produces_disjoint_indices() {
        let plan = plan_segments(&config(8));
        assert_eq!(plan.len(), 8);
        for (index, descriptor) in plan.iter().enumerate() {
            assert_eq!(descriptor.segment, index);
            assert_eq!(descriptor.total_segments, 8);
            assert_eq!(descriptor.table, "orders");
        }
    }

    /// Serves `pages` one at a time, chaining continuation keys.
    struct PagedTable {
        pages: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for PagedTable {
        async fn scan_page(
            &self,
            _segment: &SegmentDescriptor,
            start_key: Option<Item>,
        ) -> Result<ScanPage, TableError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page = start_key
                .and_then(|key| key.get("page").cloned())
                .and_then(|value| value.as_n().ok().cloned())
                .map_or(0, |n| n.parse::<usize>().unwrap());

            let last_evaluated_key = (page + 1 < self.pages).then(|| {
                HashMap::from([(
                    "page".to_string(),
                    AttributeValue::N((page + 1).to_string()),
                )])
            });

            Ok(ScanPage {
                items: vec![HashMap::from([(
                    "id".to_string(),
                    AttributeValue::S(format!("item-{page}")),
                )])],
                last_evaluated_key,
            })
        }

        async fn batch_put(
            &self,
            _table: &str,
            _items: Vec<Item>,
        ) -> Result<Vec<Item>, TableError> {
            unimplemented!("scan-only mock")
        }
    }

    #[tokio::test]
    async fn test_scanner_follows_continuation_keys_to_exhaustion() {
        let table = Arc::new(PagedTable {
            pages: 3,
            calls: AtomicUsize::new(0),
        });
        let descriptor = plan_segments(&config(1)).remove(0);
        let mut scanner = SegmentScanner::new(table.clone(), descriptor);

        let mut pages = 0;
        while let Some(page) = scanner.next_page().await.unwrap() {
            assert_eq!(page.items.len(), 1);
            pages += 1;
        }

        assert_eq!(pages, 3);
        assert_eq!(table.calls.load(Ordering::SeqCst), 3);

        // Exhausted scanners stay exhausted without issuing more requests.
        assert!(scanner.next_page().await.unwrap().is_none());
        assert_eq!(table.calls.load(Ordering::SeqCst), 3);
    }
}
