//! Single-writer bridge between the segment scanners and the archive.
//!
//! Scanners hand serialized pages through a bounded channel to one task
//! that owns the multipart upload exclusively; the underlying sink is not
//! assumed thread-safe, so all writes funnel through here.

use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TaskJoinSnafu, TransferError, TransferStorageSnafu, UploadAbortedSnafu};
use crate::storage::{StorageProviderRef, StreamUpload};

/// Result of a completed archive upload.
pub(super) struct UploadStats {
    pub bytes_uploaded: u64,
}

/// Handle to the background uploader task.
pub(super) struct Uploader {
    handle: JoinHandle<Result<UploadStats, TransferError>>,
}

impl Uploader {
    /// Spawn the uploader task.
    pub fn spawn(
        storage: StorageProviderRef,
        key: String,
        pages: mpsc::Receiver<Bytes>,
        part_size: usize,
        max_concurrent_parts: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(Self::run(
            storage,
            key,
            pages,
            part_size,
            max_concurrent_parts,
            shutdown,
        ));
        Self { handle }
    }

    /// Wait for the uploader to drain its channel and complete the upload.
    ///
    /// The archive only becomes visible if this returns `Ok`; a failure
    /// while completing the upload is propagated, never masked by the
    /// scanners' earlier success.
    pub async fn finish(self) -> Result<UploadStats, TransferError> {
        self.handle.await.context(TaskJoinSnafu)?
    }

    /// Wait for the uploader to unwind after a failed run. The task aborts
    /// the underlying upload itself once it observes cancellation.
    pub async fn abort(self) {
        match self.handle.await {
            Ok(_) => {}
            Err(error) => warn!("[upload] Uploader task did not unwind cleanly: {error}"),
        }
    }

    async fn run(
        storage: StorageProviderRef,
        key: String,
        mut pages: mpsc::Receiver<Bytes>,
        part_size: usize,
        max_concurrent_parts: usize,
        shutdown: CancellationToken,
    ) -> Result<UploadStats, TransferError> {
        let path = Path::from(key.as_str());
        // Started lazily on the first page: a multipart upload cannot be
        // completed with zero parts, so an export that scanned nothing
        // falls back to a plain empty object instead.
        let mut upload: Option<StreamUpload> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("[upload] Shutdown requested, abandoning archive {key}");
                    if let Some(sink) = upload.take() {
                        sink.abort().await;
                    }
                    return UploadAbortedSnafu.fail().context(TransferStorageSnafu);
                }

                page = pages.recv() => {
                    let Some(page) = page else {
                        break;
                    };
                    let sink = match upload.as_mut() {
                        Some(sink) => sink,
                        None => upload.insert(
                            storage
                                .start_upload(&path, part_size, max_concurrent_parts)
                                .await
                                .context(TransferStorageSnafu)?,
                        ),
                    };
                    if let Err(error) = sink.write(&page).await {
                        if let Some(sink) = upload.take() {
                            sink.abort().await;
                        }
                        return Err(error).context(TransferStorageSnafu);
                    }
                }
            }
        }

        // The channel can close in the same instant a scanner fails; never
        // complete an archive once cancellation has been requested.
        if shutdown.is_cancelled() {
            if let Some(sink) = upload.take() {
                sink.abort().await;
            }
            return UploadAbortedSnafu.fail().context(TransferStorageSnafu);
        }

        match upload {
            Some(sink) => {
                let bytes_uploaded = sink.finish().await.context(TransferStorageSnafu)?;
                debug!("[upload] Archive {key} completed ({bytes_uploaded} bytes)");
                Ok(UploadStats { bytes_uploaded })
            }
            None => {
                storage
                    .put_empty(&path)
                    .await
                    .context(TransferStorageSnafu)?;
                debug!("[upload] Archive {key} completed (empty)");
                Ok(UploadStats { bytes_uploaded: 0 })
            }
        }
    }
}
