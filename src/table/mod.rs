//! Table-store access.
//!
//! `TableStore` is the seam between the pipelines and the backing table
//! service; `DynamoTable` is the production implementation. Tests provide
//! in-memory implementations of the same trait.

pub mod scan;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use snafu::prelude::*;

use crate::codec::Item;
use crate::config::{AttributeType, ScanFilter};
use crate::error::{BatchWriteSnafu, BoxError, ScanPageSnafu, TableError, WriteRequestBuildSnafu};

pub use scan::{SegmentDescriptor, SegmentScanner, plan_segments};

/// Maximum operations per bulk-write request imposed by the table store.
pub const MAX_BATCH_SIZE: usize = 25;

/// One page of scan results for a single segment.
#[derive(Debug, Default, Clone)]
pub struct ScanPage {
    /// Native items in this page.
    pub items: Vec<Item>,
    /// Continuation key, absent on the final page of the segment.
    pub last_evaluated_key: Option<Item>,
}

impl ScanPage {
    /// Whether the store reported this as the final page of the segment.
    pub fn is_last(&self) -> bool {
        self.last_evaluated_key.is_none()
    }
}

/// Interface to the backing table service.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// Fetch one page of a segmented scan, resuming from `start_key`.
    async fn scan_page(
        &self,
        segment: &SegmentDescriptor,
        start_key: Option<Item>,
    ) -> Result<ScanPage, TableError>;

    /// Submit one batch of upserts. Returns the subset the store rejected
    /// (e.g. due to throttling), which the caller is expected to resubmit.
    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, TableError>;
}

/// DynamoDB-backed table store.
#[derive(Debug, Clone)]
pub struct DynamoTable {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoTable {
    /// Wrap an explicitly constructed client.
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }
}

fn filter_value(filter: &ScanFilter) -> AttributeValue {
    match filter.attribute_type {
        AttributeType::String => AttributeValue::S(filter.value.clone()),
        AttributeType::Number => AttributeValue::N(filter.value.clone()),
    }
}

#[async_trait]
impl TableStore for DynamoTable {
    async fn scan_page(
        &self,
        segment: &SegmentDescriptor,
        start_key: Option<Item>,
    ) -> Result<ScanPage, TableError> {
        let mut request = self
            .client
            .scan()
            .table_name(&segment.table)
            .segment(segment.segment as i32)
            .total_segments(segment.total_segments as i32)
            .set_exclusive_start_key(start_key);

        if let Some(index) = &segment.index {
            request = request.index_name(index);
        }
        if let Some(limit) = segment.page_limit {
            request = request.limit(limit as i32);
        }
        if let Some(filter) = &segment.filter {
            request = request
                .filter_expression(format!("#name {} :val", filter.operator))
                .expression_attribute_names("#name", &filter.attribute)
                .expression_attribute_values(":val", filter_value(filter));
        }

        let output = request
            .send()
            .await
            .map_err(|e| Box::new(e) as BoxError)
            .context(ScanPageSnafu {
                segment: segment.segment,
            })?;

        Ok(ScanPage {
            items: output.items.unwrap_or_default(),
            last_evaluated_key: output.last_evaluated_key,
        })
    }

    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, TableError> {
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            let put = PutRequest::builder()
                .set_item(Some(item))
                .build()
                .context(WriteRequestBuildSnafu)?;
            requests.push(WriteRequest::builder().set_put_request(Some(put)).build());
        }

        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| Box::new(e) as BoxError)
            .context(BatchWriteSnafu)?;

        let unprocessed = output
            .unprocessed_items
            .and_then(|mut tables| tables.remove(table))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|request| request.put_request.map(|put| put.item))
            .collect();

        Ok(unprocessed)
    }
}
