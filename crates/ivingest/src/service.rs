//! Process-wide wiring: explicit construction, narrow operations for the
//! HTTP surface, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::info;

use crate::blob::BlobStore;
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::{IngestError, ParseError, Result};
use crate::events::EventType;
use crate::extract::FieldExtractor;
use crate::model::{FileKind, Job, JobState, Tier};
use crate::parser::ParserRegistry;
use crate::pipeline::Pipeline;
use crate::queue::{WorkerPool, WorkerStatus};
use crate::ratelimit::{Bucket, RateLimitDecision, RateLimitError, RateLimiter};
use crate::store::{
    CancelOutcome, Database, JobStore, NewJob, NewSubscription, RecordRepo, StoreError,
    StoredInspection, Subscription, SubscriptionRepo,
};
use crate::store::job_repo::QueueCounts;
use crate::webhook::{DeliveryOutcome, WebhookDispatcher};

/// How a cancellation request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The job was still queued and is now failed with code `CANCELLED`.
    Cancelled,
    /// The job is active; its worker has been signalled and will abandon it
    /// at the next checkpoint.
    Signalled,
}

/// The ingestion core as one embeddable unit.
///
/// All singletons (store, limiter, bus, dispatcher, pool) are constructed
/// here and passed to the components that need them; there are no ambient
/// globals.
pub struct IngestService {
    config: Config,
    blobs: Arc<BlobStore>,
    jobs: Arc<JobStore>,
    records: Arc<RecordRepo>,
    subs: Arc<SubscriptionRepo>,
    bus: EventBus,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<WebhookDispatcher>,
    pool: Option<WorkerPool>,
}

impl IngestService {
    /// Builds and starts everything against the configured database file.
    pub fn start(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database_path)?);
        Self::start_with_database(config, db)
    }

    /// Builds and starts against an in-memory database; used by tests.
    pub fn start_in_memory(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open_in_memory()?);
        Self::start_with_database(config, db)
    }

    fn start_with_database(config: Config, db: Arc<Database>) -> Result<Self> {
        let blobs = Arc::new(BlobStore::new(&config.blob_directory));
        let jobs = Arc::new(JobStore::new(
            Arc::clone(&db),
            Duration::from_secs(config.worker.visibility_timeout_secs),
        ));
        let records = Arc::new(RecordRepo::new(Arc::clone(&db)));
        let subs = Arc::new(SubscriptionRepo::new(Arc::clone(&db)));
        let bus = EventBus::new(config.bus.capacity);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ParserRegistry::new(&config.ocr)),
            Arc::new(FieldExtractor::new()),
            Arc::clone(&blobs),
            Arc::clone(&records),
            config.stages.clone(),
        ));

        let pool = WorkerPool::start(
            &config.worker,
            Arc::clone(&jobs),
            pipeline,
            bus.clone(),
        );

        let dispatcher =
            WebhookDispatcher::start(config.webhook.clone(), Arc::clone(&subs), &bus)?;

        info!(
            "ingestion core started: {} workers, dispatcher concurrency {}",
            config.worker.worker_count, config.webhook.concurrency
        );

        Ok(Self {
            config,
            blobs,
            jobs,
            records,
            subs,
            bus,
            limiter,
            dispatcher,
            pool: Some(pool),
        })
    }

    /// Admits an upload: rate limit, kind validation, blob persist, job row.
    ///
    /// The returned job is always in `queued`.
    pub fn submit_upload(
        &self,
        identity: &str,
        tier: Tier,
        tenant: &str,
        bytes: &[u8],
        declared_kind: &str,
        priority: i32,
    ) -> Result<Job> {
        let now = Utc::now();

        let decision = self.limiter.check(identity, Bucket::Files, tier, now);
        if !decision.allowed {
            return Err(RateLimitError::Denied(decision).into());
        }

        let kind = FileKind::parse(declared_kind).ok_or_else(|| {
            IngestError::Parse(ParseError::Unsupported(declared_kind.to_string()))
        })?;

        let blob = self.blobs.store(bytes)?;
        let job = self.jobs.submit(
            NewJob {
                tenant: tenant.to_string(),
                blob,
                kind,
                priority,
                max_attempts: self.config.worker.max_attempts,
            },
            now,
        )?;

        info!("job {} submitted ({} bytes, kind {})", job.id, bytes.len(), kind);
        Ok(job)
    }

    /// Consults the limiter for a non-upload bucket; the HTTP surface turns
    /// the decision into headers and, on denial, a 429.
    pub fn check_rate(&self, identity: &str, bucket: Bucket, tier: Tier) -> RateLimitDecision {
        self.limiter.check(identity, bucket, tier, Utc::now())
    }

    /// Job state, progress, timings, result summary and error, by id.
    pub fn job_status(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id)?)
    }

    /// The canonical record persisted for a completed job.
    pub fn inspection_for_job(&self, job_id: &str) -> Result<Option<StoredInspection>> {
        Ok(self.records.get_by_job(job_id)?)
    }

    /// The originally stored bytes plus their MIME type, available once the
    /// job completed.
    pub fn download_blob(&self, job_id: &str) -> Result<(Vec<u8>, String)> {
        let job = self
            .jobs
            .get(job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
            .map_err(IngestError::Store)?;

        if job.state != JobState::Completed {
            return Err(IngestError::Store(StoreError::InvalidTransition {
                id: job.id,
                from: job.state.as_str().to_string(),
                event: "download".to_string(),
            }));
        }

        let bytes = self.blobs.read(&job.blob)?;
        Ok((bytes, crate::sniff::mime_type(job.kind)))
    }

    /// Cancels a job. Queued jobs fail immediately; active jobs are
    /// signalled and fail cooperatively.
    pub fn cancel_job(&self, id: &str) -> Result<CancelResult> {
        match self.jobs.cancel(id, Utc::now())? {
            CancelOutcome::Cancelled => {
                if let Ok(Some(job)) = self.jobs.get(id) {
                    self.bus.publish(crate::events::Event::new(
                        EventType::ProcessingFailed,
                        serde_json::json!({
                            "jobId": job.id,
                            "tenant": job.tenant,
                            "code": crate::error::code::CANCELLED,
                            "message": "cancelled by owner",
                            "state": job.state.as_str(),
                            "final": true,
                        }),
                    ));
                }
                Ok(CancelResult::Cancelled)
            }
            CancelOutcome::SignalWorker => {
                if let Some(pool) = &self.pool {
                    pool.cancel_job(id);
                }
                Ok(CancelResult::Signalled)
            }
        }
    }

    /// Registers a webhook endpoint. The secret in the returned subscription
    /// is shown exactly once.
    pub fn create_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        Ok(self.subs.create(new, Utc::now())?)
    }

    pub fn list_subscriptions(&self, tenant: &str) -> Result<Vec<Subscription>> {
        Ok(self.subs.list(tenant)?)
    }

    /// Soft delete.
    pub fn delete_subscription(&self, id: &str) -> Result<()> {
        Ok(self.subs.deactivate(id)?)
    }

    /// Fires a single `test` event at one subscription.
    pub async fn test_subscription(&self, id: &str) -> Result<DeliveryOutcome> {
        Ok(self.dispatcher.test_subscription(id).await?)
    }

    /// Queue depth by state plus per-worker activity.
    pub fn queue_status(&self) -> Result<(QueueCounts, Vec<WorkerStatus>)> {
        let counts = self.jobs.counts()?;
        let workers = self
            .pool
            .as_ref()
            .map(|p| p.worker_statuses())
            .unwrap_or_default();
        Ok((counts, workers))
    }

    /// Bus access for in-process observers (progress streams).
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// Drains workers, flushes the dispatcher, and stops.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down ingestion core");
        if let Some(pool) = self.pool.take() {
            pool.shutdown(Duration::from_secs(30)).await?;
        }
        self.dispatcher.shutdown(Duration::from_secs(10)).await;
        info!("ingestion core stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OcrConfig, WorkerConfig};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            blob_directory: dir.path().join("blobs").display().to_string(),
            worker: WorkerConfig {
                worker_count: 1,
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_returns_queued_job() {
        let dir = TempDir::new().unwrap();
        let service = IngestService::start_in_memory(test_config(&dir)).unwrap();

        let job = service
            .submit_upload("user-1", Tier::Pro, "tenant-a", b"a,b\n1,2\n", "csv", 0)
            .unwrap();
        assert_eq!(job.state, JobState::Queued);

        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsupported_kind_rejected_before_any_parse() {
        let dir = TempDir::new().unwrap();
        let service = IngestService::start_in_memory(test_config(&dir)).unwrap();

        let err = service
            .submit_upload("user-1", Tier::Pro, "tenant-a", b"bytes", "exe", 0)
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_KIND");

        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_rate_limit_enforced() {
        let dir = TempDir::new().unwrap();
        let service = IngestService::start_in_memory(test_config(&dir)).unwrap();

        for i in 0..10 {
            let payload = format!("a,b\n{},x\n", i);
            service
                .submit_upload("user-free", Tier::Free, "t", payload.as_bytes(), "csv", 0)
                .unwrap();
        }
        let err = service
            .submit_upload("user-free", Tier::Free, "t", b"a,b\n", "csv", 0)
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");

        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_requires_completion() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        // No workers: the job stays queued.
        config.worker.worker_count = 1;
        let service = IngestService::start_in_memory(config).unwrap();

        let job = service
            .submit_upload("u", Tier::Pro, "t", b"PK\x03\x04stub", "docx", -100)
            .unwrap();

        // Grab the status before any worker can have finished it; a download
        // against a non-completed job must fail.
        if service.job_status(&job.id).unwrap().unwrap().state != JobState::Completed {
            assert!(service.download_blob(&job.id).is_err());
        }

        service.shutdown().await.unwrap();
    }
}
