//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pdf_printer::converter::{ConversionEngine, ConversionError, ConversionInvoker, ConversionOptions};
use pdf_printer::queue::MemoryJobQueue;
use pdf_printer::service::PdfService;
use pdf_printer::storage::SharedStorage;
use pdf_printer::worker::Worker;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// Inputs starting with this marker make [`FakeEngine`] fail.
pub const CORRUPT: &[u8] = b"CORRUPT";

/// Stand-in for the real renderer: the "PDF" is a header followed by the
/// input bytes. Writes in chunks with `chunk_delay` between them, so a slow
/// engine leaves a partially written file behind for a while.
#[derive(Default)]
pub struct FakeEngine {
    pub chunk_delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn rendered(input: &[u8]) -> Vec<u8> {
    let mut pdf = b"%PDF-1.4\n".to_vec();
    pdf.extend_from_slice(input);
    pdf
}

#[async_trait]
impl ConversionEngine for FakeEngine {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        _options: &ConversionOptions,
    ) -> Result<(), ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data = tokio::fs::read(input).await?;
        if data.starts_with(CORRUPT) {
            return Err(ConversionError::EngineFailure("source file is corrupt".into()));
        }

        let pdf = rendered(&data);
        let mut file = tokio::fs::File::create(output).await?;
        for chunk in pdf.chunks(8) {
            file.write_all(chunk).await?;
            file.flush().await?;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        Ok(())
    }
}

pub struct Pipeline {
    pub dir: TempDir,
    pub storage: SharedStorage,
    pub queue: Arc<MemoryJobQueue>,
    pub engine: Arc<FakeEngine>,
    pub service: PdfService,
    pub worker: Worker,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_engine(FakeEngine::new())
    }

    pub fn with_engine(engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = SharedStorage::open(dir.path().join("shared"), dir.path().join("fonts")).unwrap();
        let engine = Arc::new(engine);
        let invoker = ConversionInvoker::new(engine.clone(), storage.clone(), Duration::from_secs(10));
        let queue = Arc::new(MemoryJobQueue::new());
        let service = PdfService::new(storage.clone(), invoker.clone(), queue.clone());
        let worker = Worker::new(invoker, storage.clone())
            .with_max_attempts(3)
            .with_receive_wait(Duration::from_millis(100));
        Self {
            dir,
            storage,
            queue,
            engine,
            service,
            worker,
        }
    }
}
