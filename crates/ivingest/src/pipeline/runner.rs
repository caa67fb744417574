use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info_span;

use crate::blob::BlobStore;
use crate::config::StageTimeouts;
use crate::extract::FieldExtractor;
use crate::model::{InspectionRecord, Job, ResultSummary};
use crate::parser::ParserRegistry;
use crate::pipeline::{PipelineError, Stage};
use crate::sniff;
use crate::store::RecordRepo;

/// Progress sink for stage completions. The worker forwards reports to the
/// job store heartbeat and the event bus.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, stage: Stage, message: &str);
}

/// Reporter that drops everything; used by tests and the subscription-test
/// path.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _stage: Stage, _message: &str) {}
}

/// Everything the persist stage produced for a completed job.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub inspection_id: String,
    pub record: InspectionRecord,
    pub summary: ResultSummary,
}

/// Runs the four extraction stages for one job.
///
/// Cancellation is checked between stages; parse and field-extract run on the
/// blocking pool under their stage timeouts. Work lost to a cancelled stage
/// is never partially persisted: only the persist stage writes, and it writes
/// transactionally.
pub struct Pipeline {
    registry: Arc<ParserRegistry>,
    extractor: Arc<FieldExtractor>,
    blobs: Arc<BlobStore>,
    records: Arc<RecordRepo>,
    timeouts: StageTimeouts,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ParserRegistry>,
        extractor: Arc<FieldExtractor>,
        blobs: Arc<BlobStore>,
        records: Arc<RecordRepo>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            registry,
            extractor,
            blobs,
            records,
            timeouts,
        }
    }

    pub async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome, PipelineError> {
        let _pipeline_span = info_span!("pipeline",
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
        )
        .entered();

        // Stage 1: identify.
        checkpoint(cancel)?;
        let bytes = {
            let _step = info_span!("identify").entered();
            let bytes = self.blobs.read(&job.blob)?;
            if !sniff::matches_declared(job.kind, &bytes) {
                return Err(PipelineError::KindMismatch {
                    declared: job.kind,
                    found: format!("{:?}", sniff::sniff(&bytes)),
                });
            }
            bytes
        };
        progress.report(Stage::Identify, "Content identified");

        // Stage 2: parse.
        checkpoint(cancel)?;
        let output = {
            let registry = Arc::clone(&self.registry);
            let kind = job.kind;
            self.run_blocking(Stage::Parse, self.timeouts.parse_secs, move || {
                registry.parse(&bytes, kind)
            })
            .await??
        };
        progress.report(Stage::Parse, "Document parsed");

        // Stage 3: field-extract. No writes happen until stage 4 commits.
        checkpoint(cancel)?;
        let record = {
            let extractor = Arc::clone(&self.extractor);
            self.run_blocking(Stage::FieldExtract, self.timeouts.extract_secs, move || {
                extractor.extract(&output)
            })
            .await?
        };
        progress.report(Stage::FieldExtract, "Fields extracted");

        // Stage 4: persist.
        checkpoint(cancel)?;
        let (inspection_id, record) = {
            let records = Arc::clone(&self.records);
            let job_id = job.id.clone();
            let tenant = job.tenant.clone();
            self.run_blocking(Stage::Persist, self.timeouts.persist_secs, move || {
                let id = records.insert(&job_id, &tenant, &record, Utc::now())?;
                Ok::<_, PipelineError>((id, record))
            })
            .await??
        };
        progress.report(Stage::Persist, "Record persisted");

        let summary = record.summary();
        Ok(PipelineOutcome {
            inspection_id,
            record,
            summary,
        })
    }

    async fn run_blocking<T, F>(
        &self,
        stage: Stage,
        timeout_secs: u64,
        f: F,
    ) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let _step = info_span!("stage", stage = stage.as_str()).entered();
        let handle = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(Duration::from_secs(timeout_secs), handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_err)) => Err(PipelineError::Internal(format!(
                "{} stage task failed: {}",
                stage, join_err
            ))),
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                seconds: timeout_secs,
            }),
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}
