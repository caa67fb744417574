//! End-to-end scenarios for the ingestion pipeline and worker pool.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;

use ivingest::blob::BlobStore;
use ivingest::bus::EventBus;
use ivingest::config::{Config, OcrConfig, StageTimeouts, WorkerConfig};
use ivingest::error::ParseError;
use ivingest::events::EventType;
use ivingest::extract::FieldExtractor;
use ivingest::model::{FileKind, Job, JobState, Tier};
use ivingest::parser::{ParseOptions, Parser, ParserOutput, ParserRegistry};
use ivingest::pipeline::Pipeline;
use ivingest::queue::WorkerPool;
use ivingest::service::IngestService;
use ivingest::store::{Database, JobStore, NewJob, RecordRepo};

fn service_config(dir: &TempDir, workers: usize) -> Config {
    common::init_tracing();
    Config {
        blob_directory: dir.path().join("blobs").display().to_string(),
        worker: WorkerConfig {
            worker_count: workers,
            idle_backoff_cap_ms: 100,
            ..WorkerConfig::default()
        },
        ocr: OcrConfig {
            enabled: false,
            ..OcrConfig::default()
        },
        ..Config::default()
    }
}

async fn wait_for_state(jobs: &JobStore, id: &str, state: JobState, timeout: Duration) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = jobs.get(id).unwrap() {
            if job.state == state {
                return job;
            }
        }
        assert!(
            Instant::now() < deadline,
            "job {} did not reach {:?} in {:?}",
            id,
            state,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// S1: a PDF report flows through all four stages into a canonical record.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pdf_happy_path() {
    let dir = TempDir::new().unwrap();
    let service = IngestService::start_in_memory(service_config(&dir, 2)).unwrap();

    let pdf = common::minimal_pdf(
        "Address: 123 Main St, Anytown, CA 90210\n\
         Inspector: Jane Smith, License NY789012\n\
         critical electrical hazard at main panel",
    );
    let job = service
        .submit_upload("user-1", Tier::Pro, "tenant-a", &pdf, "pdf", 0)
        .unwrap();

    let done = wait_for_state(service.jobs(), &job.id, JobState::Completed, Duration::from_secs(10))
        .await;
    assert_eq!(done.progress, 100);

    let summary = done.result.expect("completed job carries a summary");
    assert_eq!(summary.findings_count, 1);
    assert_eq!(summary.critical_findings, 1);

    let inspection = service
        .inspection_for_job(&job.id)
        .unwrap()
        .expect("record persisted");
    let property = &inspection.record.property;
    assert_eq!(property.address_line1.as_deref(), Some("123 Main St"));
    assert_eq!(property.city.as_deref(), Some("Anytown"));
    assert_eq!(property.state.as_deref(), Some("CA"));
    assert_eq!(property.zip.as_deref(), Some("90210"));

    let finding = &inspection.record.findings[0];
    assert_eq!(finding.category.as_str(), "electrical");
    assert_eq!(finding.severity.as_str(), "critical");

    // The stored blob is returned byte-for-byte once completed.
    let (bytes, mime) = service.download_blob(&job.id).unwrap();
    assert_eq!(bytes, pdf);
    assert_eq!(mime, "application/pdf");

    service.shutdown().await.unwrap();
}

struct Harness {
    pool: WorkerPool,
    jobs: Arc<JobStore>,
    blobs: BlobStore,
    bus: EventBus,
    records: Arc<RecordRepo>,
    _dir: TempDir,
}

fn harness_with_parser(parser: Box<dyn Parser>, workers: usize) -> Harness {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let jobs = Arc::new(JobStore::new(Arc::clone(&db), Duration::from_secs(300)));
    let records = Arc::new(RecordRepo::new(Arc::clone(&db)));
    let blobs = BlobStore::new(dir.path());

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(ParserRegistry::with_parsers(vec![parser], 50)),
        Arc::new(FieldExtractor::new()),
        Arc::new(BlobStore::new(dir.path())),
        Arc::clone(&records),
        StageTimeouts::default(),
    ));

    let bus = EventBus::new(256);
    let config = WorkerConfig {
        worker_count: workers,
        idle_backoff_cap_ms: 100,
        ..WorkerConfig::default()
    };
    let pool = WorkerPool::start(&config, Arc::clone(&jobs), pipeline, bus.clone());

    Harness {
        pool,
        jobs,
        blobs,
        bus,
        records,
        _dir: dir,
    }
}

fn submit_pdf(harness: &Harness, max_attempts: u32) -> Job {
    let blob = harness.blobs.store(b"%PDF-1.4 injected").unwrap();
    harness
        .jobs
        .submit(
            NewJob {
                tenant: "t".to_string(),
                blob,
                kind: FileKind::Pdf,
                priority: 0,
                max_attempts,
            },
            Utc::now(),
        )
        .unwrap()
}

fn drain_events(
    events: &mut tokio::sync::broadcast::Receiver<ivingest::Event>,
) -> Vec<EventType> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    seen
}

/// S2: one transient parser error, then success on the second attempt.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failure_then_success() {
    let parser = Arc::new(SequencedParser::failing_first(1));
    let harness = harness_with_parser(Box::new(SharedParser(Arc::clone(&parser))), 1);
    let mut events = harness.bus.subscribe();

    let job = submit_pdf(&harness, 3);
    let done = wait_for_state(&harness.jobs, &job.id, JobState::Completed, Duration::from_secs(15))
        .await;

    assert_eq!(done.attempts, 2);

    let seen = drain_events(&mut events);
    let started = seen
        .iter()
        .filter(|t| **t == EventType::ProcessingStarted)
        .count();
    assert_eq!(started, 1, "processing.started fires only on first activation");
    assert!(
        !seen.contains(&EventType::ProcessingFailed),
        "no terminal failure event for a retried job"
    );
    assert!(seen.contains(&EventType::ProcessingCompleted));

    harness.pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

/// S3: transient errors on every attempt exhaust max_attempts into `dead`,
/// with the back-off table spacing the attempts.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhaustion_routes_to_dead() {
    let parser = Arc::new(SequencedParser::failing_first(u32::MAX));
    let harness = harness_with_parser(Box::new(SharedParser(Arc::clone(&parser))), 1);
    let mut events = harness.bus.subscribe();

    let job = submit_pdf(&harness, 3);
    let dead = wait_for_state(&harness.jobs, &job.id, JobState::Dead, Duration::from_secs(30))
        .await;

    assert_eq!(dead.attempts, 3);
    assert!(dead.attempts <= dead.max_attempts);

    let calls = parser.call_times();
    assert_eq!(calls.len(), 3);
    let gap1 = calls[1] - calls[0];
    let gap2 = calls[2] - calls[1];
    assert!(gap1 >= Duration::from_secs(1), "gap1={:?}", gap1);
    assert!(gap2 >= Duration::from_secs(5), "gap2={:?}", gap2);

    let seen = drain_events(&mut events);
    let failed = seen
        .iter()
        .filter(|t| **t == EventType::ProcessingFailed)
        .count();
    assert_eq!(failed, 1, "processing.failed fires exactly once");
    assert!(!seen.contains(&EventType::ProcessingCompleted));

    // Nothing was persisted for a dead job.
    assert!(harness.records.get_by_job(&job.id).unwrap().is_none());

    harness.pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

/// S6: cancelling a job mid-parse fails it cooperatively with code CANCELLED
/// and persists nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_active_job() {
    let parser = Arc::new(SequencedParser::slow(Duration::from_secs(2)));
    let harness = harness_with_parser(Box::new(SharedParser(Arc::clone(&parser))), 1);

    let job = submit_pdf(&harness, 3);
    wait_for_state(&harness.jobs, &job.id, JobState::Active, Duration::from_secs(10)).await;

    // Owner cancels while the parse stage is running.
    let outcome = harness.jobs.cancel(&job.id, Utc::now()).unwrap();
    assert_eq!(outcome, ivingest::store::CancelOutcome::SignalWorker);
    assert!(harness.pool.cancel_job(&job.id));

    let failed = wait_for_state(&harness.jobs, &job.id, JobState::Failed, Duration::from_secs(15))
        .await;
    assert_eq!(failed.error.as_ref().unwrap().code, "CANCELLED");
    assert!(harness.records.get_by_job(&job.id).unwrap().is_none());

    harness.pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

/// Cancellation of a queued job never invokes a parser.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_queued_job_skips_parsing() {
    let parser = Arc::new(SequencedParser::failing_first(0));
    // No workers are polling this store.
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let jobs = JobStore::new(Arc::clone(&db), Duration::from_secs(300));
    let blobs = BlobStore::new(dir.path());

    let blob = blobs.store(b"%PDF-1.4 queued").unwrap();
    let job = jobs
        .submit(
            NewJob {
                tenant: "t".to_string(),
                blob,
                kind: FileKind::Pdf,
                priority: 0,
                max_attempts: 3,
            },
            Utc::now(),
        )
        .unwrap();

    let outcome = jobs.cancel(&job.id, Utc::now()).unwrap();
    assert_eq!(outcome, ivingest::store::CancelOutcome::Cancelled);

    let cancelled = jobs.get(&job.id).unwrap().unwrap();
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.error.as_ref().unwrap().code, "CANCELLED");
    assert!(parser.call_times().is_empty(), "no parser ran");
}

/// A parser whose behavior is scripted per call: fail the first N calls,
/// optionally sleep to simulate long parses.
struct SequencedParser {
    fail_first: u32,
    delay: Duration,
    calls: Mutex<Vec<Instant>>,
}

impl SequencedParser {
    fn failing_first(fail_first: u32) -> Self {
        Self {
            fail_first,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            fail_first: 0,
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

impl Parser for SequencedParser {
    fn parse(
        &self,
        _blob: &[u8],
        _kind: FileKind,
        _options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len() as u32
        };
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if call_index <= self.fail_first {
            Err(ParseError::Ocr("injected transient failure".to_string()))
        } else {
            Ok(ParserOutput::with_text(
                "moderate leak near the water heater".to_string(),
                0.9,
            ))
        }
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Pdf
    }
}

/// Adapter so a test can keep a handle to the parser the registry owns.
struct SharedParser(Arc<SequencedParser>);

impl Parser for SharedParser {
    fn parse(
        &self,
        blob: &[u8],
        kind: FileKind,
        options: &ParseOptions,
    ) -> Result<ParserOutput, ParseError> {
        self.0.parse(blob, kind, options)
    }

    fn supports(&self, kind: FileKind) -> bool {
        self.0.supports(kind)
    }
}
