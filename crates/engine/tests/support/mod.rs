#![forbid(unsafe_code)]
#![allow(dead_code)]

use async_trait::async_trait;
use cx_core::{
    ArtifactRef, ArtifactStore, CompositionError, CompositionStage, DeliveryReceipt,
    ExplanationError, ExplanationStage, JobId, PersonaId, PersonaVideoError, PersonaVideoStage,
    ReplyDelivery, ReplyError, ReplyRequest, SpeechError, SpeechOutput, SpeechStage, TimedWord,
    Transcript, VisualsError, VisualsStage,
};
use cx_engine::{
    EngineError, JobQueue, Pipeline, PipelineConfig, SqliteJobQueue, Stages, StoreHandle,
    WorkerPool, WorkerPoolConfig,
};
use cx_storage::{Clock, DispatchPayload, QueueDelivery, SqliteStore};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub store: StoreHandle,
    pub clock: Arc<AtomicI64>,
    pub stages: Arc<FakeStages>,
    pub queue: Arc<SqliteJobQueue>,
}

impl Harness {
    pub fn new(stages: FakeStages) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let clock = Arc::new(AtomicI64::new(1_000_000));
        let handle = Arc::clone(&clock);
        let store_clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst));
        let store = SqliteStore::open_with_clock(dir.path(), store_clock).expect("open store");
        let store = StoreHandle::new(store);
        let queue = Arc::new(SqliteJobQueue::new(store.clone()));
        Self {
            dir,
            store,
            clock,
            stages: Arc::new(stages),
            queue,
        }
    }

    pub fn advance(&self, ms: i64) {
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn pipeline(&self, config: PipelineConfig) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            self.store.clone(),
            self.stages.as_stages(),
            config,
        ))
    }

    pub fn pool(&self, config: WorkerPoolConfig) -> Arc<WorkerPool> {
        let queue: Arc<dyn JobQueue> = self.queue.clone();
        Arc::new(WorkerPool::new(
            queue,
            self.pipeline(PipelineConfig::default()),
            self.store.clone(),
            config,
        ))
    }
}

pub fn quick_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        workers: 1,
        worker_prefix: "test".to_string(),
        poll_interval: Duration::from_millis(10),
        lease_ttl: Duration::from_secs(30),
        retry_delay: Duration::from_secs(60),
        max_deliveries: 3,
    }
}

#[derive(Default)]
pub struct FakeStages {
    pub fail_explanation: Option<ExplanationError>,
    pub fail_persona_video: Option<PersonaVideoError>,
    pub fail_visuals: Option<VisualsError>,
    pub panic_explanation: bool,
    pub panic_persona_video: bool,
    pub persona_video_delay: Option<Duration>,
    pub persona_video_finished: AtomicBool,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeStages {
    pub fn as_stages(self: &Arc<Self>) -> Stages {
        Stages {
            explanation: self.clone(),
            speech: self.clone(),
            persona_video: self.clone(),
            visuals: self.clone(),
            composition: self.clone(),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, stage: &'static str) {
        self.calls.lock().expect("calls lock").push(stage);
    }
}

#[async_trait]
impl ExplanationStage for FakeStages {
    async fn generate(
        &self,
        persona_id: &PersonaId,
        query: &str,
    ) -> Result<String, ExplanationError> {
        self.record("explanation");
        if self.panic_explanation {
            panic!("language model client crashed");
        }
        match &self.fail_explanation {
            Some(err) => Err(err.clone()),
            None => Ok(format!("{persona_id} on {query}")),
        }
    }
}

#[async_trait]
impl SpeechStage for FakeStages {
    async fn synthesize(
        &self,
        job_id: &JobId,
        _persona_id: &PersonaId,
        text: &str,
    ) -> Result<SpeechOutput, SpeechError> {
        self.record("speech");
        Ok(SpeechOutput {
            audio: ArtifactRef::new(format!("audio/{job_id}.wav")),
            transcript: Transcript {
                text: text.to_string(),
                words: vec![TimedWord {
                    word: "hello".to_string(),
                    start_s: 0.0,
                    end_s: 0.4,
                }],
            },
        })
    }
}

#[async_trait]
impl PersonaVideoStage for FakeStages {
    async fn render(
        &self,
        persona_id: &PersonaId,
        _audio: &ArtifactRef,
    ) -> Result<ArtifactRef, PersonaVideoError> {
        self.record("persona_video");
        if self.panic_persona_video {
            panic!("renderer crashed");
        }
        if let Some(delay) = self.persona_video_delay {
            tokio::time::sleep(delay).await;
        }
        self.persona_video_finished.store(true, Ordering::SeqCst);
        match &self.fail_persona_video {
            Some(err) => Err(err.clone()),
            None => Ok(ArtifactRef::new(format!("video/{persona_id}.mp4"))),
        }
    }
}

#[async_trait]
impl VisualsStage for FakeStages {
    async fn produce(&self, _transcript: &Transcript) -> Result<ArtifactRef, VisualsError> {
        self.record("visuals");
        match &self.fail_visuals {
            Some(err) => Err(err.clone()),
            None => Ok(ArtifactRef::new("visuals/overlay.mp4")),
        }
    }
}

#[async_trait]
impl CompositionStage for FakeStages {
    async fn compose(
        &self,
        video: &ArtifactRef,
        visuals: &ArtifactRef,
    ) -> Result<ArtifactRef, CompositionError> {
        self.record("composition");
        Ok(ArtifactRef::new(format!("final/{video}+{visuals}")))
    }
}

/// Reply delivery that fails its first `fail_first` calls.
#[derive(Default)]
pub struct FakeDelivery {
    pub fail_first: usize,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<ReplyRequest>>,
}

impl FakeDelivery {
    pub fn failing_forever() -> Self {
        Self {
            fail_first: usize::MAX,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ReplyDelivery for FakeDelivery {
    async fn deliver(&self, request: &ReplyRequest) -> Result<DeliveryReceipt, ReplyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if call < self.fail_first {
            return Err(ReplyError("platform unavailable".to_string()));
        }
        Ok(DeliveryReceipt(format!("reply-{}", call + 1)))
    }
}

pub struct FixedArtifacts(pub bool);

impl ArtifactStore for FixedArtifacts {
    fn is_retrievable(&self, _artifact: &ArtifactRef) -> bool {
        self.0
    }
}

/// Broker that refuses every message.
pub struct DownQueue;

#[async_trait]
impl JobQueue for DownQueue {
    async fn enqueue(&self, _payload: DispatchPayload) -> Result<i64, EngineError> {
        Err(EngineError::Join("broker unreachable".to_string()))
    }

    async fn lease(
        &self,
        _worker_id: &str,
        _lease_ttl: Duration,
    ) -> Result<Option<QueueDelivery>, EngineError> {
        Ok(None)
    }

    async fn renew(
        &self,
        _message_id: i64,
        _worker_id: &str,
        _lease_ttl: Duration,
    ) -> Result<bool, EngineError> {
        Ok(false)
    }

    async fn ack(&self, _message_id: i64, _worker_id: &str) -> Result<bool, EngineError> {
        Ok(false)
    }

    async fn release(
        &self,
        _message_id: i64,
        _worker_id: &str,
        _retry_delay: Duration,
    ) -> Result<bool, EngineError> {
        Ok(false)
    }
}
