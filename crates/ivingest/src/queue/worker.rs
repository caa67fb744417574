//! Worker tasks that drive jobs through the pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::events::{Event, EventType};
use crate::model::{Job, JobError, JobState};
use crate::pipeline::{Pipeline, PipelineError, PipelineOutcome, ProgressReporter, Stage};
use crate::queue::backoff::idle_backoff;
use crate::store::{FailOutcome, JobStore};

/// Live view of one worker, for the admin queue view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    pub current_job: Option<String>,
    pub processed_jobs: u64,
    pub failed_jobs: u64,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerStatus {
    fn new(id: String) -> Self {
        Self {
            id,
            current_job: None,
            processed_jobs: 0,
            failed_jobs: 0,
            last_heartbeat: Utc::now(),
        }
    }
}

/// Pool of N worker tasks polling the job store.
///
/// Shutdown is a drain: workers finish their current job and stop picking up
/// new ones. Cancelling an individual job is cooperative through its token.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    job_cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
    statuses: Arc<Mutex<Vec<WorkerStatus>>>,
}

impl WorkerPool {
    pub fn start(
        config: &WorkerConfig,
        store: Arc<JobStore>,
        pipeline: Arc<Pipeline>,
        bus: EventBus,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let job_cancels: Arc<Mutex<HashMap<String, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let statuses = Arc::new(Mutex::new(
            (0..config.worker_count)
                .map(|i| WorkerStatus::new(format!("worker-{}", i)))
                .collect::<Vec<_>>(),
        ));

        let mut handles = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let ctx = WorkerContext {
                index,
                worker_id: format!("worker-{}", index),
                store: Arc::clone(&store),
                pipeline: Arc::clone(&pipeline),
                bus: bus.clone(),
                shutdown: shutdown.clone(),
                job_cancels: Arc::clone(&job_cancels),
                statuses: Arc::clone(&statuses),
                idle_cap: Duration::from_millis(config.idle_backoff_cap_ms),
                progress_interval: Duration::from_millis(config.progress_interval_ms),
            };
            handles.push(tokio::spawn(ctx.run()));
        }

        info!("started {} workers", config.worker_count);

        Self {
            shutdown,
            handles,
            job_cancels,
            statuses,
        }
    }

    /// Signals the worker holding `job_id` to abandon it at the next
    /// cancellation checkpoint. Returns false when no worker holds the job.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let cancels = match self.job_cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cancels.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        match self.statuses.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Drains the pool: no new jobs are picked up, current jobs run to their
    /// end, then worker tasks exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), WorkerError> {
        info!("draining worker pool");
        self.shutdown.cancel();

        let join_all = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    error!("worker task panicked: {}", e);
                }
            }
        };

        tokio::time::timeout(timeout, join_all)
            .await
            .map_err(|_| WorkerError::ShutdownTimeout {
                seconds: timeout.as_secs(),
            })?;

        info!("all workers stopped");
        Ok(())
    }
}

struct WorkerContext {
    index: usize,
    worker_id: String,
    store: Arc<JobStore>,
    pipeline: Arc<Pipeline>,
    bus: EventBus,
    shutdown: CancellationToken,
    job_cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
    statuses: Arc<Mutex<Vec<WorkerStatus>>>,
    idle_cap: Duration,
    progress_interval: Duration,
}

impl WorkerContext {
    async fn run(self) {
        debug!("{} started", self.worker_id);
        let mut consecutive_idle = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();

            // Reclaim lapsed leases before polling; jobs that died doing so
            // still get their terminal event.
            match self.store.reap_expired(now) {
                Ok(reaped) => {
                    for id in &reaped.requeued {
                        warn!("lease expired for job {}, requeued", id);
                    }
                    for job in reaped.dead {
                        self.publish_failed(&job);
                    }
                }
                Err(e) => warn!("lease reaping failed: {}", e),
            }

            match self.store.acquire(&self.worker_id, now) {
                Ok(Some(job)) => {
                    consecutive_idle = 0;
                    self.process(job).await;
                }
                Ok(None) => {
                    consecutive_idle += 1;
                    let sleep = idle_backoff(consecutive_idle, self.idle_cap);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("{} failed to acquire: {}", self.worker_id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        debug!("{} stopped", self.worker_id);
    }

    async fn process(&self, job: Job) {
        debug!("{} processing job {}", self.worker_id, job.id);
        self.set_current_job(Some(job.id.clone()));

        // The job token is independent of pool shutdown: draining finishes
        // the job, only an owner cancel aborts it.
        let cancel = CancellationToken::new();
        {
            let mut cancels = match self.job_cancels.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cancels.insert(job.id.clone(), cancel.clone());
        }

        if job.attempts == 1 {
            self.bus.publish(Event::new(
                EventType::ProcessingStarted,
                serde_json::json!({
                    "jobId": job.id,
                    "tenant": job.tenant,
                    "kind": job.kind.as_str(),
                }),
            ));
        }

        let progress = WorkerProgress {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            job_id: job.id.clone(),
            interval: self.progress_interval,
            last_emit: Mutex::new(None),
        };

        let result = self.pipeline.run(&job, &cancel, &progress).await;
        let now = Utc::now();

        match result {
            Ok(outcome) => self.finish_success(&job, outcome, now),
            Err(e) => self.finish_failure(&job, e, now),
        }

        {
            let mut cancels = match self.job_cancels.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cancels.remove(&job.id);
        }
        self.set_current_job(None);
    }

    fn finish_success(&self, job: &Job, outcome: PipelineOutcome, now: DateTime<Utc>) {
        match self.store.complete(&job.id, &outcome.summary, now) {
            Ok(completed) => {
                info!(
                    "job {} completed: {} findings",
                    job.id, outcome.summary.findings_count
                );
                self.bump_stats(false);

                self.bus.publish(Event::new(
                    EventType::ProcessingCompleted,
                    serde_json::json!({
                        "jobId": completed.id,
                        "tenant": completed.tenant,
                        "inspectionId": outcome.inspection_id,
                        "summary": outcome.summary,
                    }),
                ));
                self.bus.publish(Event::new(
                    EventType::InspectionCreated,
                    serde_json::json!({
                        "inspectionId": outcome.inspection_id,
                        "jobId": completed.id,
                        "findingsCount": outcome.summary.findings_count,
                    }),
                ));
                for finding in &outcome.record.findings {
                    self.bus.publish(Event::new(
                        EventType::FindingAdded,
                        serde_json::json!({
                            "inspectionId": outcome.inspection_id,
                            "findingId": finding.id,
                            "category": finding.category.as_str(),
                            "severity": finding.severity.as_str(),
                        }),
                    ));
                }
            }
            Err(e) => error!("job {} finished but completion failed: {}", job.id, e),
        }
    }

    fn finish_failure(&self, job: &Job, error: PipelineError, now: DateTime<Utc>) {
        let job_error = JobError::new(error.code(), error.to_string());
        let retryable = error.is_retryable();

        match self.store.fail(&job.id, &job_error, retryable, now) {
            Ok(FailOutcome::Requeued { next_attempt_at }) => {
                warn!(
                    "job {} attempt {} failed ({}), retry at {}",
                    job.id, job.attempts, job_error.code, next_attempt_at
                );
                self.bump_stats(true);
            }
            Ok(FailOutcome::Dead) | Ok(FailOutcome::Failed) => {
                error!(
                    "job {} terminally failed ({}): {}",
                    job.id, job_error.code, job_error.message
                );
                self.bump_stats(true);
                if let Ok(Some(final_job)) = self.store.get(&job.id) {
                    self.publish_failed(&final_job);
                }
            }
            Err(e) => error!("job {} failure could not be recorded: {}", job.id, e),
        }
    }

    fn publish_failed(&self, job: &Job) {
        let (code, message) = job
            .error
            .as_ref()
            .map(|e| (e.code.clone(), e.message.clone()))
            .unwrap_or_else(|| {
                (
                    crate::error::code::PROCESSING_FAILED.to_string(),
                    String::new(),
                )
            });

        self.bus.publish(Event::new(
            EventType::ProcessingFailed,
            serde_json::json!({
                "jobId": job.id,
                "tenant": job.tenant,
                "code": code,
                "message": message,
                "state": job.state.as_str(),
                "attempts": job.attempts,
                "final": matches!(job.state, JobState::Failed | JobState::Dead),
            }),
        ));
    }

    fn set_current_job(&self, job_id: Option<String>) {
        let mut statuses = match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(status) = statuses.get_mut(self.index) {
            status.current_job = job_id;
            status.last_heartbeat = Utc::now();
        }
    }

    fn bump_stats(&self, failed: bool) {
        let mut statuses = match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(status) = statuses.get_mut(self.index) {
            if failed {
                status.failed_jobs += 1;
            } else {
                status.processed_jobs += 1;
            }
            status.last_heartbeat = Utc::now();
        }
    }
}

/// Forwards stage completions to the store heartbeat and the bus, throttling
/// processing.progress events to one per interval per job.
struct WorkerProgress {
    store: Arc<JobStore>,
    bus: EventBus,
    job_id: String,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter for WorkerProgress {
    fn report(&self, stage: Stage, message: &str) {
        let now = Utc::now();
        match self.store.heartbeat(&self.job_id, stage.percent(), stage.as_str(), now) {
            Ok(true) => {}
            Ok(false) => {
                debug!("heartbeat for job {} was stale", self.job_id);
                return;
            }
            Err(e) => {
                warn!("heartbeat for job {} failed: {}", self.job_id, e);
                return;
            }
        }

        let mut last = match self.last_emit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = last.map_or(true, |t| t.elapsed() >= self.interval);
        if due {
            *last = Some(Instant::now());
            self.bus.publish(Event::new(
                EventType::ProcessingProgress,
                serde_json::json!({
                    "jobId": self.job_id,
                    "progress": stage.percent(),
                    "currentStep": stage.as_str(),
                    "message": message,
                }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::config::{OcrConfig, StageTimeouts};
    use crate::extract::FieldExtractor;
    use crate::parser::ParserRegistry;
    use crate::store::{Database, NewJob, RecordRepo};
    use crate::model::FileKind;
    use tempfile::TempDir;

    fn harness(worker_count: usize) -> (WorkerPool, Arc<JobStore>, BlobStore, EventBus, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(JobStore::new(Arc::clone(&db), Duration::from_secs(300)));
        let blobs = BlobStore::new(dir.path());

        let ocr = OcrConfig {
            enabled: false,
            ..OcrConfig::default()
        };
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ParserRegistry::new(&ocr)),
            Arc::new(FieldExtractor::new()),
            Arc::new(BlobStore::new(dir.path())),
            Arc::new(RecordRepo::new(db)),
            StageTimeouts::default(),
        ));

        let bus = EventBus::new(64);
        let config = WorkerConfig {
            worker_count,
            idle_backoff_cap_ms: 100,
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::start(&config, Arc::clone(&store), pipeline, bus.clone());

        (pool, store, blobs, bus, dir)
    }

    async fn wait_for_state(store: &JobStore, id: &str, state: JobState) -> Job {
        for _ in 0..200 {
            if let Some(job) = store.get(id).unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} never reached {:?}", id, state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_processes_csv_job() {
        let (pool, store, blobs, bus, _dir) = harness(2);
        let mut events = bus.subscribe();

        let blob = blobs
            .store(b"finding,note\nminor cosmetic scuff near the door,paint\n")
            .unwrap();
        let job = store
            .submit(
                NewJob {
                    tenant: "t".to_string(),
                    blob,
                    kind: FileKind::Csv,
                    priority: 0,
                    max_attempts: 3,
                },
                Utc::now(),
            )
            .unwrap();

        let done = wait_for_state(&store, &job.id, JobState::Completed).await;
        assert_eq!(done.progress, 100);
        assert_eq!(done.attempts, 1);
        assert!(done.result.is_some());

        // Events: started first, completed eventually.
        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event.event_type {
                EventType::ProcessingStarted => saw_started = true,
                EventType::ProcessingCompleted => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_kind_mismatch_job_fails_permanently() {
        let (pool, store, blobs, _bus, _dir) = harness(1);

        let blob = blobs.store(b"PK\x03\x04zipzip").unwrap();
        let job = store
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

        let failed = wait_for_state(&store, &job.id, JobState::Failed).await;
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.as_ref().unwrap().code, "KIND_MISMATCH");

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_with_idle_workers() {
        let (pool, _store, _blobs, _bus, _dir) = harness(4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_job_without_holder_is_false() {
        let (pool, _store, _blobs, _bus, _dir) = harness(1);
        assert!(!pool.cancel_job("nobody-has-this"));
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_statuses_reflect_work() {
        let (pool, store, blobs, _bus, _dir) = harness(1);

        let blob = blobs.store(b"a,b\n1,2\n").unwrap();
        let job = store
            .submit(
                NewJob {
                    tenant: "t".to_string(),
                    blob,
                    kind: FileKind::Csv,
                    priority: 0,
                    max_attempts: 3,
                },
                Utc::now(),
            )
            .unwrap();
        wait_for_state(&store, &job.id, JobState::Completed).await;

        let statuses = pool.worker_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].processed_jobs, 1);
        assert!(statuses[0].current_job.is_none());

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
