/// End-to-end tests of the asynchronous pipeline: dispatcher, in-memory
/// queue, worker and status polling against a fake engine.
///
/// ```bash
/// cargo test --test pipeline_test
/// ```
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{rendered, FakeEngine, Pipeline, CORRUPT};
use futures::StreamExt;
use pdf_printer::converter::ConversionOptions;
use pdf_printer::job::JobOutcome;
use pdf_printer::queue::JobQueue;
use pdf_printer::service::{Poll, Upload};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_millis(200);

fn upload(name: &str, data: &[u8]) -> Upload {
    Upload {
        filename: name.to_string(),
        data: Bytes::copy_from_slice(data),
    }
}

#[tokio::test]
async fn test_report_is_queued_converted_and_fetched() {
    let p = Pipeline::new();

    let accepted = p
        .service
        .enqueue(upload("report.xlsx", b"PK sheet"), ConversionOptions::none(), false)
        .await
        .unwrap();
    assert_eq!(accepted.filename, "report.pdf");

    // Not ready is a normal answer, not an error.
    assert!(matches!(p.service.poll("report.pdf").await.unwrap(), Poll::NotReady));

    let outcome = p.worker.run_once(p.queue.as_ref(), WAIT).await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed));
    assert_eq!(p.queue.in_flight().await, 0);

    let Poll::Ready { name, file, len } = p.service.poll("report.pdf").await.unwrap() else {
        panic!("expected report.pdf to be ready");
    };
    assert!(len > 0);

    let body: Vec<u8> = p
        .service
        .stream(name, file, true)
        .map(|chunk| chunk.unwrap())
        .collect::<Vec<_>>()
        .await
        .concat();
    assert_eq!(body, rendered(b"PK sheet"));

    // Served with delete: gone afterwards, and polling reports not ready again.
    assert!(matches!(p.service.poll("report.pdf").await.unwrap(), Poll::NotReady));
}

#[tokio::test]
async fn test_corrupt_input_is_retried_then_discarded() {
    let p = Pipeline::new();
    let mut data = CORRUPT.to_vec();
    data.extend_from_slice(b" garbage");

    p.service
        .enqueue(upload("report.xlsx", &data), ConversionOptions::none(), false)
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some(outcome) = p.worker.run_once(p.queue.as_ref(), WAIT).await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(
        outcomes,
        vec![JobOutcome::Requeued, JobOutcome::Requeued, JobOutcome::Discarded]
    );
    assert_eq!(p.engine.calls(), 3);
    assert_eq!(p.queue.pending().await.unwrap(), 0);
    assert_eq!(p.queue.in_flight().await, 0);
    assert!(matches!(p.service.poll("report.pdf").await.unwrap(), Poll::NotReady));
    assert!(!p.storage.root().join("report.xlsx").exists());
}

#[tokio::test]
async fn test_poller_never_sees_a_partial_pdf() {
    let p = Pipeline::with_engine(FakeEngine::slow(Duration::from_millis(5)));
    let input = vec![b'x'; 400];
    let expected = rendered(&input);

    p.service
        .enqueue(upload("big.xlsx", &input), ConversionOptions::none(), false)
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let poller = {
        let service = p.service.clone();
        let done = done.clone();
        let expected = expected.clone();
        tokio::spawn(async move {
            let mut observed_ready = 0;
            loop {
                let finished = done.load(Ordering::SeqCst);
                if let Poll::Ready { name, file, len } = service.poll("big.pdf").await.unwrap() {
                    assert_eq!(len as usize, expected.len());
                    let body: Vec<u8> = service
                        .stream(name, file, false)
                        .map(|chunk| chunk.unwrap())
                        .collect::<Vec<_>>()
                        .await
                        .concat();
                    assert_eq!(body, expected);
                    observed_ready += 1;
                }
                if finished {
                    return observed_ready;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let outcome = p.worker.run_once(p.queue.as_ref(), WAIT).await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Completed));
    done.store(true, Ordering::SeqCst);

    assert!(poller.await.unwrap() >= 1);
}

#[tokio::test]
async fn test_unsafe_names_never_reach_storage_or_queue() {
    let p = Pipeline::new();

    for name in ["../evil.xlsx", "/etc/passwd.xlsx", "..", "a/b.xlsx", ".hidden.xlsx", ""] {
        let err = p
            .service
            .enqueue(upload(name, b"PK"), ConversionOptions::none(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input_invalid", "name {name:?}");
    }

    assert_eq!(p.queue.pending().await.unwrap(), 0);
    assert!(p.service.list_files().await.unwrap().is_empty());
    assert!(!p.dir.path().join("evil.xlsx").exists());
}

#[tokio::test]
async fn test_pool_converts_each_job_exactly_once() {
    let p = Pipeline::new();
    let names = ["a.xlsx", "b.xlsx", "c.ods", "d.xls", "e.xlsx", "f.xlsx"];
    for name in names {
        p.service
            .enqueue(upload(name, name.as_bytes()), ConversionOptions::none(), true)
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let handles = p.worker.spawn_pool(
        (0..3).map(|_| p.queue.clone() as Arc<dyn JobQueue>).collect(),
        shutdown.clone(),
    );

    for _ in 0..250 {
        if p.service.list_pdfs().await.unwrap().len() == names.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    let mut files: Vec<String> = p
        .service
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    files.sort();
    assert_eq!(files, vec!["a.pdf", "b.pdf", "c.pdf", "d.pdf", "e.pdf", "f.pdf"]);
    assert_eq!(p.engine.calls(), names.len());
    assert_eq!(p.queue.in_flight().await, 0);
}
