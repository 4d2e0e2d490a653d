//! Stage pipeline runner.
//!
//! Advances one scan through the state machine while holding its lease.
//! Resumable by construction: the runner switches on the persisted status,
//! so a crashed worker's scan continues from its last durable stage once
//! the lease expires and the queue redelivers.

use crate::db::queue::{JobQueue, Lane, QueueJob};
use crate::db::scans::{ScanPatch, ScanStore, StoreError};
use anyhow::{Context, Result};
use cardmint_catalog::{CatalogHandle, ReferenceStore};
use cardmint_inference::{ImagePayload, ImagePipeline, InferenceResult};
use cardmint_protocol::config::ConfigHandle;
use cardmint_protocol::error::{ErrorCode, StageError};
use cardmint_protocol::fields::ResolverDecision;
use cardmint_protocol::ids::{JobId, ProcessorId};
use cardmint_protocol::metrics::{Metrics, METRICS};
use cardmint_protocol::status::JobStatus;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Extraction entry point the runner drives. Implemented by the inference
/// orchestrator; stubbed in tests. The returned future must be Send so
/// jobs can run on spawned tasks.
pub trait InferenceBackend: Send + Sync + 'static {
    fn extract(
        &self,
        image: &ImagePayload,
    ) -> impl std::future::Future<Output = Result<InferenceResult, StageError>> + Send;
}

impl<P, F> InferenceBackend for cardmint_inference::Orchestrator<P, F>
where
    P: cardmint_inference::Extractor + 'static,
    F: cardmint_inference::Extractor + 'static,
{
    async fn extract(&self, image: &ImagePayload) -> Result<InferenceResult, StageError> {
        cardmint_inference::Orchestrator::extract(self, image).await
    }
}

/// Payload of a capture-lane job, as enqueued by the watcher sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturePayload {
    pub path: String,
    pub filename: String,
    pub arrived_at_ms: i64,
    pub sequence: Option<u32>,
    pub fingerprint: Option<String>,
}

/// Payload of a processing-lane job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub scan_id: String,
}

pub const JOB_TYPE_CAPTURE: &str = "capture";
pub const JOB_TYPE_PROCESS: &str = "process_scan";

pub struct StageRunner<B: InferenceBackend> {
    pub store: ScanStore,
    pub queue: JobQueue,
    pub backend: Arc<B>,
    pub pipeline: Arc<dyn ImagePipeline>,
    pub catalog: CatalogHandle,
    pub reference: Arc<ReferenceStore>,
    pub config: ConfigHandle,
    pub processor: ProcessorId,
}

impl<B: InferenceBackend> StageRunner<B> {
    /// Dispatch a queue job to the matching handler.
    pub async fn run_job(&self, job: &QueueJob) -> Result<()> {
        match job.job_type.as_str() {
            JOB_TYPE_CAPTURE => {
                let payload: CapturePayload =
                    serde_json::from_str(&job.payload).context("bad capture payload")?;
                self.process_capture(payload).await
            }
            JOB_TYPE_PROCESS => {
                let payload: ProcessPayload =
                    serde_json::from_str(&job.payload).context("bad process payload")?;
                let id = JobId::parse(&payload.scan_id).context("bad scan id")?;
                self.process_scan(&id).await
            }
            other => {
                // Unknown types are a deploy skew bug, not a retry case.
                error!("Unknown job type {other}; dropping");
                Ok(())
            }
        }
    }

    /// Ingest a detected capture: create the scan aggregate and hand it to
    /// the processing lane. Idempotent on the capture path.
    pub async fn process_capture(&self, payload: CapturePayload) -> Result<()> {
        if let Some(existing) = self.store.find_by_raw_image(&payload.path).await? {
            info!("Capture {} already ingested as scan {existing}", payload.filename);
            return Ok(());
        }

        let cfg = self.config.snapshot();
        let scan_id = self.store.create(&payload.path).await?;
        let process = ProcessPayload {
            scan_id: scan_id.to_string(),
        };
        self.queue
            .push(
                Lane::Processing,
                JOB_TYPE_PROCESS,
                &serde_json::to_string(&process)?,
                0,
                cfg.queue.max_attempts,
            )
            .await?;
        info!(
            "Capture {} (seq {:?}) ingested as scan {scan_id}",
            payload.filename, payload.sequence
        );
        Ok(())
    }

    /// Advance a scan as far as the pipeline goes without an operator.
    ///
    /// Infra errors (`Err`) bubble to the queue for retry with backoff;
    /// stage errors terminate the scan as FAILED inline. A lost lease
    /// abandons without mutation.
    pub async fn process_scan(&self, scan_id: &JobId) -> Result<()> {
        let cfg = self.config.snapshot();

        match self
            .store
            .acquire_lease(scan_id, &self.processor, cfg.lease.expiry_secs)
            .await
        {
            Ok(()) => {}
            Err(StoreError::LeaseLost(_)) => {
                warn!("Scan {scan_id}: lease held elsewhere, abandoning");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        loop {
            let scan = self.store.get(scan_id).await?;
            match scan.status {
                JobStatus::Queued => {
                    self.store
                        .transition(
                            scan_id,
                            JobStatus::Queued,
                            JobStatus::Captured,
                            ScanPatch::default(),
                        )
                        .await?;
                }
                JobStatus::Captured => {
                    self.store
                        .transition(
                            scan_id,
                            JobStatus::Captured,
                            JobStatus::Preprocessing,
                            ScanPatch::default(),
                        )
                        .await?;
                }
                JobStatus::Preprocessing => {
                    if let Err(stage_err) = self.run_preprocess(&scan).await? {
                        return self.fail_scan(scan_id, scan.status, stage_err).await;
                    }
                }
                JobStatus::Inferencing => {
                    if let Err(stage_err) = self.run_inference(&scan).await? {
                        return self.fail_scan(scan_id, scan.status, stage_err).await;
                    }
                    // Inference either parked the scan (unmatched) or moved
                    // it to CANDIDATES_READY; the loop continues from there.
                    let after = self.store.get(scan_id).await?;
                    if after.status == JobStatus::UnmatchedNoReasonableCandidate {
                        self.store.release_lease(scan_id, &self.processor).await?;
                        return Ok(());
                    }
                }
                JobStatus::CandidatesReady => {
                    self.store
                        .transition(
                            scan_id,
                            JobStatus::CandidatesReady,
                            JobStatus::OperatorPending,
                            ScanPatch::default(),
                        )
                        .await?;
                    self.store.release_lease(scan_id, &self.processor).await?;
                    Metrics::inc(&METRICS.jobs_completed);
                    return Ok(());
                }
                // Operator-owned or terminal: nothing for a worker to do.
                JobStatus::BackImage
                | JobStatus::Capturing
                | JobStatus::OperatorPending
                | JobStatus::UnmatchedNoReasonableCandidate => {
                    self.store.release_lease(scan_id, &self.processor).await?;
                    return Ok(());
                }
                status if status.is_terminal() => {
                    return Ok(());
                }
                status => {
                    warn!("Scan {scan_id} in unexpected status {status}");
                    self.store.release_lease(scan_id, &self.processor).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Preprocess stage. Ok(Err(stage)) signals a stage-level failure.
    async fn run_preprocess(
        &self,
        scan: &crate::db::scans::ScanJob,
    ) -> Result<Result<(), StageError>> {
        let Some(raw) = scan.raw_image.as_deref() else {
            return Ok(Err(StageError::new(
                ErrorCode::InferParse,
                "scan has no raw image reference",
            )));
        };
        let started = Instant::now();
        let processed_path = processed_path_for(raw);
        let payload = match self.pipeline.prepare(Path::new(raw), Path::new(&processed_path)) {
            Ok(payload) => payload,
            Err(stage_err) => return Ok(Err(stage_err)),
        };
        let ImagePayload::File { path, .. } = &payload else {
            return Ok(Err(StageError::new(
                ErrorCode::Infer4xx,
                "preprocess produced a non-file payload",
            )));
        };

        let mut timings = scan.timings.clone();
        timings.preprocess_ms = Some(started.elapsed().as_millis() as u64);
        self.store
            .transition(
                &scan.id,
                JobStatus::Preprocessing,
                JobStatus::Inferencing,
                ScanPatch {
                    processed_image: Some(path.display().to_string()),
                    timings: Some(timings),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Ok(()))
    }

    /// Inference + resolution stage.
    async fn run_inference(
        &self,
        scan: &crate::db::scans::ScanJob,
    ) -> Result<Result<(), StageError>> {
        let cfg = self.config.snapshot();
        let image_ref = scan
            .processed_image
            .as_deref()
            .or(scan.raw_image.as_deref());
        let Some(image_ref) = image_ref else {
            return Ok(Err(StageError::new(
                ErrorCode::InferParse,
                "scan has no image reference",
            )));
        };
        let payload = match ImagePayload::from_file(Path::new(image_ref)) {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(Err(StageError::new(
                    ErrorCode::Infer4xx,
                    format!("image unreadable: {e}"),
                )))
            }
        };

        let started = Instant::now();
        let result = match self.backend.extract(&payload).await {
            Ok(result) => result,
            Err(stage_err) => return Ok(Err(stage_err)),
        };

        let catalog = self.catalog.snapshot();
        let resolution = cardmint_resolver::resolve(
            &result.fields,
            &catalog,
            &self.reference,
            &cfg.resolver,
        )?;

        let mut timings = scan.timings.clone();
        timings.infer_ms = Some(started.elapsed().as_millis() as u64);
        timings.retried_once = result.stats.retried;
        timings.inference_path = Some(result.path);
        timings.path_c = resolution.path_c.clone();

        let patch = ScanPatch {
            extracted_fields: Some(result.fields),
            candidates: Some(resolution.candidates),
            timings: Some(timings),
            inference_path: Some(result.path),
            ..Default::default()
        };

        match resolution.decision {
            ResolverDecision::NoReasonableCandidate => {
                self.store
                    .transition(
                        &scan.id,
                        JobStatus::Inferencing,
                        JobStatus::UnmatchedNoReasonableCandidate,
                        ScanPatch {
                            error: Some((
                                ErrorCode::CatalogMiss,
                                "no candidate above the acceptance floor".into(),
                            )),
                            ..patch
                        },
                    )
                    .await?;
            }
            _ => {
                self.store
                    .transition(
                        &scan.id,
                        JobStatus::Inferencing,
                        JobStatus::CandidatesReady,
                        patch,
                    )
                    .await?;
            }
        }
        Ok(Ok(()))
    }

    /// Terminal failure: attach the error and move to FAILED. The terminal
    /// transition releases the lease.
    async fn fail_scan(
        &self,
        scan_id: &JobId,
        from: JobStatus,
        stage_err: StageError,
    ) -> Result<()> {
        error!("Scan {scan_id} failed in {from}: {stage_err}");
        Metrics::inc(&METRICS.jobs_failed);
        self.store
            .transition(
                scan_id,
                from,
                JobStatus::Failed,
                ScanPatch {
                    error: Some((stage_err.code, stage_err.message)),
                    retry_increment: 0,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Derive the processed-image path next to the raw capture.
fn processed_path_for(raw: &str) -> String {
    match raw.rsplit_once('.') {
        Some((stem, _ext)) => format!("{stem}.processed.jpg"),
        None => format!("{raw}.processed.jpg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use cardmint_catalog::{CatalogHandle, CatalogIndex};
    use cardmint_inference::CallStats;
    use cardmint_protocol::config::Config;
    use cardmint_protocol::fields::{ExtractedFields, Rarity};
    use cardmint_protocol::timings::InferencePath;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubBackend {
        result: Mutex<Option<Result<InferenceResult, StageError>>>,
    }

    impl StubBackend {
        fn ok(fields: ExtractedFields) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(Ok(InferenceResult {
                    fields,
                    path: InferencePath::Primary,
                    stats: CallStats {
                        model: "stub".into(),
                        ..Default::default()
                    },
                }))),
            })
        }

        fn err(stage: StageError) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(Err(stage))),
            })
        }
    }

    impl InferenceBackend for StubBackend {
        async fn extract(&self, _image: &ImagePayload) -> Result<InferenceResult, StageError> {
            self.result
                .lock()
                .unwrap()
                .take()
                .expect("backend called once")
        }
    }

    fn test_catalog_csv() -> CatalogIndex {
        let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-58,Pikachu,base1,Base Set,BS,58,102,common,60,Lightning,25,1999-01-09,Mitsuhiro Arita
base1-63,Squirtle,base1,Base Set,BS,63,102,common,40,Water,7,1999-01-09,Mitsuhiro Arita
";
        CatalogIndex::from_csv(csv.as_bytes()).unwrap()
    }

    async fn runner_with(backend: Arc<StubBackend>) -> StageRunner<StubBackend> {
        let pool = test_pool().await;
        StageRunner {
            store: ScanStore::new(pool.clone()),
            queue: JobQueue::new(pool, 1000),
            backend,
            pipeline: Arc::new(cardmint_inference::PassthroughPipeline),
            catalog: CatalogHandle::new(test_catalog_csv()),
            reference: Arc::new(ReferenceStore::open(None, 8, Duration::from_secs(60))),
            config: ConfigHandle::new(Config::default()),
            processor: ProcessorId::new(),
        }
    }

    fn write_capture(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("DSC00001.JPG");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        path.display().to_string()
    }

    fn pikachu_fields() -> ExtractedFields {
        ExtractedFields {
            name: Some("Pikachu".into()),
            hp: Some(60),
            set_number: Some("58/102".into()),
            rarity: Some(Rarity::Common),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn capture_job_creates_scan_and_processing_job() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(StubBackend::ok(pikachu_fields())).await;
        let path = write_capture(&dir);

        let payload = CapturePayload {
            path: path.clone(),
            filename: "DSC00001.JPG".into(),
            arrived_at_ms: 0,
            sequence: Some(1),
            fingerprint: None,
        };
        runner.process_capture(payload.clone()).await.unwrap();

        let job = runner.queue.pop(Lane::Processing).await.unwrap().unwrap();
        assert_eq!(job.job_type, JOB_TYPE_PROCESS);

        // Second detection of the same capture is a no-op.
        runner.process_capture(payload).await.unwrap();
        assert!(runner.queue.pop(Lane::Processing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn happy_path_reaches_operator_pending_with_auto_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(StubBackend::ok(pikachu_fields())).await;
        let path = write_capture(&dir);
        let scan_id = runner.store.create(&path).await.unwrap();

        runner.process_scan(&scan_id).await.unwrap();

        let scan = runner.store.get(&scan_id).await.unwrap();
        assert_eq!(scan.status, JobStatus::OperatorPending);
        assert!(scan.processor_id.is_none(), "lease released on handoff");
        assert_eq!(scan.inference_path, Some(InferencePath::Primary));
        assert!(!scan.candidates.is_empty());
        assert!(scan.candidates[0].auto_confirm);
        assert!(scan.candidates[0].confidence >= 0.95);
        assert!(scan.timings.infer_ms.is_some());
        assert!(scan.timings.preprocess_ms.is_some());
        assert_eq!(scan.extracted_fields.unwrap().name.as_deref(), Some("Pikachu"));
    }

    #[tokio::test]
    async fn unmatched_fields_park_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let fields = ExtractedFields {
            name: Some("Zzzyxar".into()),
            ..Default::default()
        };
        let runner = runner_with(StubBackend::ok(fields)).await;
        let path = write_capture(&dir);
        let scan_id = runner.store.create(&path).await.unwrap();

        runner.process_scan(&scan_id).await.unwrap();

        let scan = runner.store.get(&scan_id).await.unwrap();
        assert_eq!(scan.status, JobStatus::UnmatchedNoReasonableCandidate);
        assert_eq!(scan.error_code, Some(ErrorCode::CatalogMiss));
        assert!(scan.processor_id.is_none());
    }

    #[tokio::test]
    async fn stage_error_fails_the_scan_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            runner_with(StubBackend::err(StageError::new(ErrorCode::InferOversize, "450 KiB image")))
                .await;
        let path = write_capture(&dir);
        let scan_id = runner.store.create(&path).await.unwrap();

        runner.process_scan(&scan_id).await.unwrap();

        let scan = runner.store.get(&scan_id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Failed);
        assert_eq!(scan.error_code, Some(ErrorCode::InferOversize));
        assert!(scan.processor_id.is_none(), "terminal transition unlocks");
    }

    #[tokio::test]
    async fn held_lease_makes_worker_abandon_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(StubBackend::ok(pikachu_fields())).await;
        let path = write_capture(&dir);
        let scan_id = runner.store.create(&path).await.unwrap();

        let other = ProcessorId::new();
        runner
            .store
            .acquire_lease(&scan_id, &other, 120)
            .await
            .unwrap();

        runner.process_scan(&scan_id).await.unwrap();

        let scan = runner.store.get(&scan_id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Queued, "no mutation after lost lease");
        assert_eq!(scan.processor_id, Some(other));
    }

    #[tokio::test]
    async fn terminal_scans_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(StubBackend::ok(pikachu_fields())).await;
        let path = write_capture(&dir);
        let scan_id = runner.store.create(&path).await.unwrap();
        runner
            .store
            .transition(
                &scan_id,
                JobStatus::Queued,
                JobStatus::Failed,
                ScanPatch {
                    error: Some((ErrorCode::FallbackFailed, "earlier run".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        runner.process_scan(&scan_id).await.unwrap();
        let scan = runner.store.get(&scan_id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Failed);
    }

    #[test]
    fn processed_path_replaces_extension() {
        assert_eq!(
            processed_path_for("/drop/DSC00001.JPG"),
            "/drop/DSC00001.processed.jpg"
        );
        assert_eq!(processed_path_for("noext"), "noext.processed.jpg");
    }
}
