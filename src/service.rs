//! Request-facing pipeline operations: synchronous conversion, job dispatch,
//! completion polling, retrieval and cleanup.
//!
//! Nothing here caches storage state; every call re-reads the filesystem.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::converter::{refresh_font_cache, ConversionInvoker, ConversionOptions};
use crate::error::ServiceError;
use crate::job::ConversionJob;
use crate::queue::JobQueue;
use crate::storage::{SafeName, SharedStorage, StorageError, StoredFile, SPREADSHEET_EXTENSIONS};

const FONT_CACHE_TIMEOUT: Duration = Duration::from_secs(30);

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobAccepted {
    pub status: &'static str,
    pub job_id: String,
    /// Stored input name.
    pub file: String,
    /// Name to poll for with the status endpoint.
    pub filename: String,
}

#[derive(Debug)]
pub struct ConvertedPdf {
    pub filename: SafeName,
    pub data: Bytes,
}

/// Result of a completion poll. `NotReady` is the normal state of a job
/// that has not finished.
#[derive(Debug)]
pub enum Poll {
    Ready {
        name: SafeName,
        file: tokio::fs::File,
        len: u64,
    },
    NotReady,
}

#[derive(Clone)]
pub struct PdfService {
    storage: SharedStorage,
    invoker: ConversionInvoker,
    queue: Arc<dyn JobQueue>,
    retain_scratch: bool,
    font_cache_program: Option<String>,
}

impl PdfService {
    pub fn new(storage: SharedStorage, invoker: ConversionInvoker, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            storage,
            invoker,
            queue,
            retain_scratch: false,
            font_cache_program: None,
        }
    }

    /// Keep the private scratch directory of synchronous conversions.
    pub fn with_retain_scratch(mut self, retain: bool) -> Self {
        self.retain_scratch = retain;
        self
    }

    /// Program run after a font install to rebuild the font cache.
    pub fn with_font_cache_program(mut self, program: impl Into<String>) -> Self {
        self.font_cache_program = Some(program.into());
        self
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    fn validate_spreadsheet(upload: &Upload) -> Result<SafeName, ServiceError> {
        let name = SafeName::parse(&upload.filename)?;
        if !name.has_extension(SPREADSHEET_EXTENSIONS) {
            return Err(ServiceError::InputInvalid(format!(
                "unsupported file type '{name}', expected one of: {}",
                SPREADSHEET_EXTENSIONS.join(", ")
            )));
        }
        if upload.data.is_empty() {
            return Err(ServiceError::InputInvalid(format!("uploaded file '{name}' is empty")));
        }
        Ok(name)
    }

    /// Converts an upload and returns the PDF bytes.
    ///
    /// Input and output live in a private scratch directory under a unique
    /// name, so concurrent requests with the same filename never collide and
    /// nothing becomes visible to other requests.
    pub async fn convert_upload(
        &self,
        upload: Upload,
        options: &ConversionOptions,
    ) -> Result<ConvertedPdf, ServiceError> {
        let name = Self::validate_spreadsheet(&upload)?;
        let target = name.pdf_target();

        let scratch = self.storage.scratch_area()?;
        let input = scratch.path().join(name.as_str());
        let output = scratch.path().join(target.as_str());

        tokio::fs::write(&input, &upload.data)
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to stage upload: {e}")))?;
        debug!(input = %input.display(), "Staged upload for synchronous conversion");

        self.invoker.invoke(&input, &output, options).await?;

        let data = tokio::fs::read(&output)
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to read converted PDF: {e}")))?;

        if self.retain_scratch {
            let kept = scratch.into_path();
            info!(dir = %kept.display(), "Retaining synchronous conversion files");
        }

        Ok(ConvertedPdf {
            filename: target,
            data: Bytes::from(data),
        })
    }

    /// Converts a file already in shared storage to its derived target, in
    /// shared storage. The original is removed only once the output exists.
    pub async fn convert_existing(
        &self,
        filename: &str,
        options: &ConversionOptions,
        delete_original: bool,
    ) -> Result<SafeName, ServiceError> {
        let source = SafeName::parse(filename)?;
        if !self.storage.exists(&source).await? {
            return Err(ServiceError::NotFound(format!("file not found: {source}")));
        }
        let target = source.pdf_target();

        self.invoker
            .invoke(
                &self.storage.path_of(&source),
                &self.storage.path_of(&target),
                options,
            )
            .await?;
        info!(source = %source, target = %target, "Converted file in shared storage");

        if delete_original {
            self.storage.delete(&source).await?;
        }
        Ok(target)
    }

    /// Stores an upload and publishes a job for it.
    ///
    /// The name must be free: an existing input (a job still pending) or an
    /// existing output (a finished PDF nobody has collected) both answer
    /// `Conflict`. The caller frees the name by fetching the PDF with delete
    /// or through [`PdfService::delete`]. If the publish fails the stored
    /// input is removed and the failure is returned.
    pub async fn enqueue(
        &self,
        upload: Upload,
        options: ConversionOptions,
        delete_original: bool,
    ) -> Result<JobAccepted, ServiceError> {
        let name = Self::validate_spreadsheet(&upload)?;
        let target = name.pdf_target();

        match self.storage.store_new(&name, upload.data).await {
            Ok(_) => {}
            Err(StorageError::AlreadyExists(_)) => {
                return Err(ServiceError::Conflict(format!(
                    "a job for '{name}' is already pending"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        // The input is claimed first, so a job finishing concurrently cannot
        // slip its output in between the two checks.
        if self.storage.exists(&target).await? {
            self.storage.delete(&name).await?;
            return Err(ServiceError::Conflict(format!(
                "'{target}' has not been collected yet"
            )));
        }

        let job = ConversionJob::new(&name, options, delete_original);
        if let Err(e) = self.queue.publish(&job).await {
            warn!(error = %e, file = %name, "Publish failed, removing stored input");
            if let Err(cleanup) = self.storage.delete(&name).await {
                warn!(error = %cleanup, file = %name, "Failed to remove input after publish failure");
            }
            return Err(ServiceError::QueuePublish(e));
        }

        Ok(JobAccepted {
            status: "queued",
            job_id: job.job_id,
            file: name.to_string(),
            filename: target.to_string(),
        })
    }

    /// Checks for `filename` at its exact path.
    pub async fn poll(&self, filename: &str) -> Result<Poll, ServiceError> {
        let name = SafeName::parse(filename)?;
        Ok(match self.storage.open_file(&name).await? {
            Some((file, len)) => Poll::Ready { name, file, len },
            None => Poll::NotReady,
        })
    }

    /// Opens any stored file for download.
    pub async fn open(&self, filename: &str) -> Result<(SafeName, tokio::fs::File, u64), ServiceError> {
        let name = SafeName::parse(filename)?;
        match self.storage.open_file(&name).await? {
            Some((file, len)) => Ok((name, file, len)),
            None => Err(ServiceError::NotFound(format!("file not found: {name}"))),
        }
    }

    /// Streams `file`. With `delete_after`, the file is removed once the last
    /// chunk has been read; a read error or an early drop of the stream
    /// leaves it in place.
    pub fn stream(
        &self,
        name: SafeName,
        file: tokio::fs::File,
        delete_after: bool,
    ) -> BoxStream<'static, io::Result<Bytes>> {
        let cleanup = delete_after.then(|| (self.storage.clone(), name));
        stream::unfold(Some((ReaderStream::new(file), cleanup)), |state| async move {
            let Some((mut reader, cleanup)) = state else {
                return None;
            };
            match reader.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some((reader, cleanup)))),
                Some(Err(e)) => {
                    warn!(error = %e, "Read failed while serving file, keeping it");
                    Some((Err(e), None))
                }
                None => {
                    if let Some((storage, name)) = cleanup {
                        match storage.delete(&name).await {
                            Ok(_) => info!(file = %name, "Deleted file after serving"),
                            Err(e) => warn!(error = %e, file = %name, "Failed to delete served file"),
                        }
                    }
                    None
                }
            }
        })
        .boxed()
    }

    /// Removes `filename`. Absent files are not an error.
    pub async fn delete(&self, filename: &str) -> Result<bool, ServiceError> {
        let name = SafeName::parse(filename)?;
        Ok(self.storage.delete(&name).await?)
    }

    /// Installs a font file and refreshes the font cache (best effort).
    pub async fn install_font(&self, upload: Upload) -> Result<SafeName, ServiceError> {
        let name = SafeName::parse(&upload.filename)?;
        if upload.data.is_empty() {
            return Err(ServiceError::InputInvalid(format!("font file '{name}' is empty")));
        }
        self.storage.install_font(&name, upload.data).await?;

        if let Some(program) = &self.font_cache_program {
            if let Err(e) = refresh_font_cache(program, self.storage.fonts_dir(), FONT_CACHE_TIMEOUT).await {
                warn!(error = %e, "Font cache refresh failed; font installed anyway");
            }
        }
        Ok(name)
    }

    pub async fn list_files(&self) -> Result<Vec<StoredFile>, ServiceError> {
        Ok(self.storage.list(None).await?)
    }

    pub async fn list_pdfs(&self) -> Result<Vec<StoredFile>, ServiceError> {
        Ok(self.storage.list(Some("pdf")).await?)
    }

    pub async fn list_fonts(&self) -> Result<Vec<StoredFile>, ServiceError> {
        Ok(self.storage.list_fonts().await?)
    }

    /// Pending queue depth, `None` when the queue cannot be reached.
    pub async fn queue_length(&self) -> Option<usize> {
        match self.queue.pending().await {
            Ok(len) => Some(len),
            Err(e) => {
                warn!(error = %e, "Failed to fetch queue stats");
                None
            }
        }
    }
}
