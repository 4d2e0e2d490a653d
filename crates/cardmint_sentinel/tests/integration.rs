//! End-to-end pipeline scenarios over in-memory SQLite with scripted
//! extractors: ingest through operator handoff, retry and fallback
//! behavior, the oversize guardrail, Path C telemetry, and the watcher
//! backpressure bound.

use cardmint_catalog::{CatalogHandle, CatalogIndex, ReferenceStore};
use cardmint_inference::{
    check_upload_guardrail, CallStats, Extraction, Extractor, ImagePayload, InferenceOutcome,
    Orchestrator, PassthroughPipeline, QuotaLedger,
};
use cardmint_protocol::config::{Config, ConfigHandle};
use cardmint_protocol::error::{ErrorCode, StageError};
use cardmint_protocol::fields::{ExtractedFields, Rarity};
use cardmint_protocol::ids::ProcessorId;
use cardmint_protocol::status::JobStatus;
use cardmint_protocol::timings::{InferencePath, PathCAction};
use cardmint_sentinel::worker::{CapturePayload, StageRunner};
use cardmint_sentinel::{open_store, JobQueue, Lane, ScanStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Scripted extractors
// ============================================================================

struct Script {
    outcomes: Mutex<VecDeque<InferenceOutcome>>,
    calls: AtomicU32,
    /// Enforce the upload guardrail before consuming the script, the way
    /// the real primary path does.
    guarded: bool,
}

impl Script {
    fn new(outcomes: Vec<InferenceOutcome>) -> ScriptHandle {
        ScriptHandle(Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicU32::new(0),
            guarded: false,
        }))
    }

    fn guarded(outcomes: Vec<InferenceOutcome>) -> ScriptHandle {
        ScriptHandle(Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicU32::new(0),
            guarded: true,
        }))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Local newtype so `Extractor` (foreign trait) can be implemented for the
/// scripted extractor without running afoul of the orphan rule on `Arc<T>`.
#[derive(Clone)]
struct ScriptHandle(Arc<Script>);

impl std::ops::Deref for ScriptHandle {
    type Target = Script;

    fn deref(&self) -> &Script {
        &self.0
    }
}

impl Extractor for ScriptHandle {
    async fn extract(&self, image: &ImagePayload) -> InferenceOutcome {
        if self.guarded {
            if let Err(err) =
                check_upload_guardrail(image, cardmint_protocol::defaults::MAX_UPLOAD_BYTES)
            {
                return InferenceOutcome::PermanentFail(err);
            }
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted")
    }
}

fn ok_fields(fields: ExtractedFields) -> InferenceOutcome {
    InferenceOutcome::Ok(Box::new(Extraction {
        fields,
        stats: CallStats {
            model: "scripted".into(),
            ..Default::default()
        },
    }))
}

fn transient(code: ErrorCode) -> InferenceOutcome {
    InferenceOutcome::TransientFail(StageError::new(code, "scripted failure"))
}

// ============================================================================
// Fixtures
// ============================================================================

fn pikachu_catalog() -> CatalogIndex {
    let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-58,Pikachu,base1,Base Set,BS,58,102,common,60,Lightning,25,1999-01-09,Mitsuhiro Arita
base1-63,Squirtle,base1,Base Set,BS,63,102,common,40,Water,7,1999-01-09,Mitsuhiro Arita
base2-60,Pikachu,base2,Base Set 2,B2,60,130,common,60,Lightning,25,2000-02-24,Mitsuhiro Arita
";
    CatalogIndex::from_csv(csv.as_bytes()).unwrap()
}

/// Same Pikachu under the same collector number in two sets, tuned so the
/// signal vote lands in the soft-rerank band (3 of 4 signals agree).
fn competing_sets_catalog() -> CatalogIndex {
    let csv = "\
id,name,set_id,set_name,ptcgo_code,number,printed_total,rarity,hp,card_type,dex_numbers,release_date,artist
base1-58,Pikachu,base1,Base Set,BS,58,102,common,60,Lightning,25,2001-03-01,Mitsuhiro Arita
rg-58,Pikachu,rg,Retro Gallery,RG,58,150,rare,60,Lightning,25,2004-05-01,Another Artist
";
    CatalogIndex::from_csv(csv.as_bytes()).unwrap()
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

struct Station {
    runner: StageRunner<Orchestrator<ScriptHandle, ScriptHandle>>,
    primary: ScriptHandle,
    fallback: ScriptHandle,
    _dir: tempfile::TempDir,
    capture_path: String,
}

async fn station(
    catalog: CatalogIndex,
    primary: ScriptHandle,
    fallback: ScriptHandle,
    capture_bytes: usize,
) -> Station {
    let pool = open_store("sqlite::memory:").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("DSC00001.JPG");
    std::fs::write(&capture, vec![0u8; capture_bytes]).unwrap();

    let orchestrator = Orchestrator::new(
        Some(primary.clone()),
        fallback.clone(),
        QuotaLedger::new(None, 10),
    );
    let runner = StageRunner {
        store: ScanStore::new(pool.clone()),
        queue: JobQueue::new(pool, 1000),
        backend: Arc::new(orchestrator),
        pipeline: Arc::new(PassthroughPipeline),
        catalog: CatalogHandle::new(catalog),
        reference: Arc::new(ReferenceStore::open(None, 16, Duration::from_secs(60))),
        config: ConfigHandle::new(Config::default()),
        processor: ProcessorId::new(),
    };
    Station {
        runner,
        primary,
        fallback,
        capture_path: capture.display().to_string(),
        _dir: dir,
    }
}

async fn ingest_and_process(station: &Station) -> cardmint_sentinel::ScanJob {
    station
        .runner
        .process_capture(CapturePayload {
            path: station.capture_path.clone(),
            filename: "DSC00001.JPG".into(),
            arrived_at_ms: 0,
            sequence: Some(1),
            fingerprint: None,
        })
        .await
        .unwrap();

    let job = station
        .runner
        .queue
        .pop(Lane::Processing)
        .await
        .unwrap()
        .expect("processing job enqueued");
    station.runner.run_job(&job).await.unwrap();

    let scan_id = station
        .runner
        .store
        .find_by_raw_image(&station.capture_path)
        .await
        .unwrap()
        .expect("scan created");
    station.runner.store.get(&scan_id).await.unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_auto_confirms_top_candidate() {
    let primary = Script::new(vec![ok_fields(pikachu_fields())]);
    let fallback = Script::new(vec![]);
    let station = station(pikachu_catalog(), primary, fallback, 2048).await;

    let scan = ingest_and_process(&station).await;

    assert_eq!(scan.status, JobStatus::OperatorPending);
    assert_eq!(scan.inference_path, Some(InferencePath::Primary));
    let top = &scan.candidates[0];
    assert_eq!(top.catalog_id, "base1-58");
    assert!(top.auto_confirm);
    assert!(top.confidence >= 0.95);
    if let Some(next) = scan.candidates.get(1) {
        assert!(top.confidence - next.confidence >= 0.10);
    }
    assert_eq!(station.fallback.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn primary_timeout_then_retry_succeeds() {
    let primary = Script::new(vec![
        transient(ErrorCode::InferTimeout),
        ok_fields(pikachu_fields()),
    ]);
    let fallback = Script::new(vec![]);
    let station = station(pikachu_catalog(), primary, fallback, 2048).await;

    let scan = ingest_and_process(&station).await;

    assert_eq!(scan.status, JobStatus::OperatorPending);
    assert!(scan.timings.retried_once, "retry recorded in timings");
    assert_eq!(scan.inference_path, Some(InferencePath::Primary));
    assert_eq!(station.primary.calls(), 2);
    assert_eq!(station.fallback.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn primary_failing_twice_defers_to_fallback() {
    let primary = Script::new(vec![
        transient(ErrorCode::Infer5xx),
        transient(ErrorCode::Infer5xx),
    ]);
    let fallback = Script::new(vec![ok_fields(pikachu_fields())]);
    let station = station(pikachu_catalog(), primary, fallback, 2048).await;

    let scan = ingest_and_process(&station).await;

    assert_eq!(scan.status, JobStatus::OperatorPending, "no FAILED terminal");
    assert_eq!(scan.inference_path, Some(InferencePath::Fallback));
    assert_eq!(station.primary.calls(), 2);
    assert_eq!(station.fallback.calls(), 1);
}

#[tokio::test]
async fn oversize_image_fails_before_any_primary_call() {
    let oversize = (cardmint_protocol::defaults::MAX_UPLOAD_BYTES + 1) as usize;
    let primary = Script::guarded(vec![]);
    let fallback = Script::new(vec![]);
    let station = station(pikachu_catalog(), primary, fallback, oversize).await;

    let scan = ingest_and_process(&station).await;

    assert_eq!(scan.status, JobStatus::Failed);
    assert_eq!(scan.error_code, Some(ErrorCode::InferOversize));
    assert_eq!(station.primary.calls(), 0, "guardrail fired pre-call");
    assert_eq!(station.fallback.calls(), 0, "oversize never falls back");
}

#[tokio::test]
async fn path_c_soft_rerank_is_recorded_on_the_scan() {
    let fields = ExtractedFields {
        name: Some("Pikachu".into()),
        hp: Some(60),
        set_number: Some("58".into()),
        rarity: Some(Rarity::Common),
        artist: Some("Mitsuhiro Arita".into()),
        card_type: Some("Lightning".into()),
        first_edition_stamp: true,
        ..Default::default()
    };
    let primary = Script::new(vec![ok_fields(fields)]);
    let fallback = Script::new(vec![]);
    let station = station(competing_sets_catalog(), primary, fallback, 2048).await;

    let scan = ingest_and_process(&station).await;

    let path_c = scan.timings.path_c.expect("triangulation telemetry recorded");
    assert!(path_c.ran);
    assert_eq!(path_c.action, PathCAction::SoftRerank);
    assert_eq!(path_c.set_hint.as_deref(), Some("base1"));
    assert!(path_c.confidence >= 0.70 && path_c.confidence < 0.90);
    assert_eq!(scan.candidates[0].catalog_id, "base1-58");
    assert!(scan.candidates[0].confidence > scan.candidates[1].confidence);
}

#[tokio::test]
async fn worker_pool_processes_a_capture_end_to_end() {
    use cardmint_sentinel::{PoolConfig, PoolEvent, WorkerPool};

    let pool = open_store("sqlite::memory:").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("DSC00001.JPG");
    std::fs::write(&capture, vec![0u8; 2048]).unwrap();

    let primary = Script::new(vec![ok_fields(pikachu_fields())]);
    let store = ScanStore::new(pool.clone());
    let queue = JobQueue::new(pool, 1000);
    let runner = Arc::new(StageRunner {
        store: store.clone(),
        queue: queue.clone(),
        backend: Arc::new(Orchestrator::new(
            Some(primary.clone()),
            Script::new(vec![]),
            QuotaLedger::new(None, 10),
        )),
        pipeline: Arc::new(PassthroughPipeline),
        catalog: CatalogHandle::new(pikachu_catalog()),
        reference: Arc::new(ReferenceStore::open(None, 16, Duration::from_secs(60))),
        config: ConfigHandle::new(Config::default()),
        processor: ProcessorId::new(),
    });

    let worker_pool = WorkerPool::new(
        Arc::clone(&runner),
        queue.clone(),
        store.clone(),
        PoolConfig::from_config(&Config::default().queue),
    );
    let mut events = worker_pool.subscribe();

    let payload = CapturePayload {
        path: capture.display().to_string(),
        filename: "DSC00001.JPG".into(),
        arrived_at_ms: 0,
        sequence: Some(1),
        fingerprint: None,
    };
    queue
        .push(
            Lane::Capture,
            "capture",
            &serde_json::to_string(&payload).unwrap(),
            0,
            3,
        )
        .await
        .unwrap();

    worker_pool.start();

    // The capture job fans out a processing job; wait for the scan to reach
    // the operator.
    let mut scan = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(id) = store.find_by_raw_image(&payload.path).await.unwrap() {
            let current = store.get(&id).await.unwrap();
            if current.status == JobStatus::OperatorPending {
                scan = Some(current);
                break;
            }
        }
    }
    worker_pool.shutdown().await;

    let scan = scan.expect("scan reached the operator within the deadline");
    assert!(scan.candidates[0].auto_confirm);

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::JobCompleted(_)) {
            completed += 1;
        }
    }
    assert_eq!(completed, 2, "capture job and processing job both completed");
}

#[tokio::test]
async fn watcher_drops_at_the_depth_bound() {
    use cardmint_watcher::{CaptureEvent, CaptureSink, Watcher, WatcherConfig, WatcherEvent};

    struct QueueSink {
        queue: JobQueue,
    }

    impl CaptureSink for QueueSink {
        async fn depth(&self) -> anyhow::Result<u64> {
            Ok(self.queue.depth(Lane::Capture).await?)
        }

        async fn enqueue(&self, event: CaptureEvent) -> anyhow::Result<()> {
            self.queue
                .push(Lane::Capture, "capture", &event.filename, 0, 3)
                .await?;
            Ok(())
        }
    }

    let pool = open_store("sqlite::memory:").await.unwrap();
    let queue = JobQueue::new(pool, 1000);
    // Saturate the lane to exactly the bound.
    for i in 0..3 {
        queue
            .push(Lane::Capture, "capture", &format!("seed-{i}"), 0, 3)
            .await
            .unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("DSC00010.JPG"), b"unlucky").unwrap();

    let watcher = Watcher::new(
        WatcherConfig {
            drop_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            max_queue_depth: 3,
            detection_warn: Duration::from_millis(50),
        },
        Arc::new(QueueSink {
            queue: queue.clone(),
        }),
    );
    let mut events = watcher.subscribe();
    watcher.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.stop();

    // The capture was dropped, not enqueued.
    assert_eq!(queue.depth(Lane::Capture).await.unwrap(), 3);
    let mut saw_backpressure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WatcherEvent::Backpressure { depth: 3 }) {
            saw_backpressure = true;
        }
    }
    assert!(saw_backpressure);

    // One slot under the bound admits the next capture immediately.
    queue.pop(Lane::Capture).await.unwrap().unwrap();
    std::fs::remove_file(dir.path().join("DSC00010.JPG")).unwrap();
    std::fs::write(dir.path().join("DSC00011.JPG"), b"lucky").unwrap();
    watcher.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.stop();
    assert_eq!(queue.depth(Lane::Capture).await.unwrap(), 3);
}
