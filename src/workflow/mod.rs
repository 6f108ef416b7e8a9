//! Embedding generation workflow.
//!
//! Ties the reuse lookup, admission control, image preparation, inference
//! call and persistence together:
//!
//! ```text
//! request -> cache lookup -> hit: respond with stored artifact
//!                         -> miss: admission
//!                              -> reject: rate-limit error
//!                              -> execute now: prepare -> invoke -> persist -> respond
//!                              -> defer: enqueue -> respond accepted
//! deferred job -> prepare -> invoke -> persist -> notify
//! ```
//!
//! Counters held by an admitted generation are released on every exit path,
//! success or failure. A failed generation is never retried; the failure is
//! reported once (sync: error response, deferred: failure notification).

mod job;

pub use job::{GenerateJob, JobId};

use crate::admission::{Admission, AdmissionController, CounterStore};
use crate::config::Settings;
use crate::error::EmbeddingError;
use crate::index::SpatialEmbeddingIndex;
use crate::inference::InferenceClient;
use crate::notify::{EmbeddingReady, NotificationDispatcher};
use crate::prepare::{prepare_buffer, PrepareConfig, SourceImage};
use crate::request::EmbeddingRequest;
use crate::store::{
    artifact_filename, ArtifactStore, Embedding, EmbeddingStore, ImageRecord, InsertOutcome,
    NewEmbedding,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of an embedding request.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A stored embedding satisfied the request. Its extent may differ from
    /// the requested one.
    Hit { embedding: Embedding, data: Vec<u8> },
    /// The embedding was generated inline.
    Generated { embedding: Embedding, data: Vec<u8> },
    /// The generation was deferred; completion arrives on the user's
    /// notification channel.
    Accepted { job_id: JobId },
}

/// Orchestrates embedding requests end to end.
pub struct GenerationWorkflow<S, A, I, N, C> {
    store: Arc<S>,
    artifacts: Arc<A>,
    inference: Arc<I>,
    notifier: Arc<N>,
    admission: AdmissionController<C>,
    index: SpatialEmbeddingIndex<S>,
    prepare_config: PrepareConfig,
    model_input_size: u32,
    queue_tx: mpsc::Sender<GenerateJob>,
}

impl<S, A, I, N, C> GenerationWorkflow<S, A, I, N, C>
where
    S: EmbeddingStore + 'static,
    A: ArtifactStore + 'static,
    I: InferenceClient + 'static,
    N: NotificationDispatcher + 'static,
    C: CounterStore + 'static,
{
    /// Creates the workflow and spawns its deferred-job worker. The handle
    /// finishes once the workflow (and with it the queue sender) is dropped.
    pub fn start(
        store: Arc<S>,
        artifacts: Arc<A>,
        inference: Arc<I>,
        notifier: Arc<N>,
        counters: Arc<C>,
        settings: &Settings,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (queue_tx, mut queue_rx) = mpsc::channel(settings.queue_capacity);

        let workflow = Arc::new(Self {
            index: SpatialEmbeddingIndex::new(Arc::clone(&store), settings.match_tolerance),
            store,
            artifacts,
            inference,
            notifier,
            admission: AdmissionController::new(counters, settings.queue_threshold),
            prepare_config: PrepareConfig {
                target_size: settings.model_input_size,
                quality: settings.encode_quality,
            },
            model_input_size: settings.model_input_size,
            queue_tx,
        });

        // The worker must not keep the workflow (and with it the queue
        // sender) alive, or the queue could never close. It upgrades per
        // job instead.
        let worker = Arc::downgrade(&workflow);
        let handle = tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                let Some(workflow) = worker.upgrade() else {
                    break;
                };
                workflow.process_deferred(job).await;
            }
            debug!("deferred-job worker stopped");
        });

        (workflow, handle)
    }

    /// Handles one embedding request.
    ///
    /// `source` is the resolved source image: the original bytes for plain
    /// images, the viewport tiles for tiled ones. Resolving it is the
    /// caller's concern; blob storage for originals is outside this crate.
    #[instrument(skip_all, fields(user_id = user_id, image_id = image.id))]
    pub async fn handle_request(
        &self,
        user_id: i64,
        image: &ImageRecord,
        source: SourceImage,
        request: &EmbeddingRequest,
    ) -> Result<RequestOutcome, EmbeddingError> {
        // Rejected requests must not touch the in-flight counters.
        request.validate(image, self.model_input_size)?;
        let extent = request.extent();

        if let Some(hit) = self
            .index
            .find_reusable(image.id, extent, request.exclude_embedding_id)
            .await?
        {
            let data = self.artifacts.read(&image.uuid, &hit.filename).await?;
            return Ok(RequestOutcome::Hit {
                embedding: hit,
                data,
            });
        }

        let admission = self.admission.admit(user_id)?;
        // Tiled stitches are too slow for the interactive path; they always
        // go through the queue.
        let admission = if source.is_tiled() {
            Admission::Defer
        } else {
            admission
        };

        let job = GenerateJob::new(user_id, image.clone(), extent, source);
        match admission {
            Admission::ExecuteNow => {
                let result = self.generate(&job).await;
                self.admission.release(user_id);
                let embedding = result?;
                let data = self
                    .artifacts
                    .read(&job.image.uuid, &embedding.filename)
                    .await?;
                info!(job_id = %job.id, embedding_id = embedding.id, "embedding generated inline");
                Ok(RequestOutcome::Generated { embedding, data })
            }
            Admission::Defer => {
                let job_id = job.id;
                if let Err(e) = self.queue_tx.send(job).await {
                    self.admission.release(user_id);
                    return Err(EmbeddingError::Internal(format!(
                        "deferred-job queue is gone: {e}"
                    )));
                }
                debug!(job_id = %job_id, "generation deferred");
                Ok(RequestOutcome::Accepted { job_id })
            }
        }
    }

    /// Runs a deferred job and notifies the user of the outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = job.user_id))]
    async fn process_deferred(&self, job: GenerateJob) {
        let result = self.generate(&job).await;
        self.admission.release(job.user_id);

        match result {
            Ok(embedding) => {
                let url = self.artifacts.url(&job.image.uuid, &embedding.filename);
                info!(
                    embedding_id = embedding.id,
                    elapsed_ms = job.elapsed().as_millis() as u64,
                    "deferred embedding generated"
                );
                self.notifier
                    .notify_success(
                        job.user_id,
                        EmbeddingReady {
                            id: embedding.id,
                            url,
                            extent: embedding.extent.to_array(),
                        },
                    )
                    .await;
            }
            Err(e) => {
                error!(error = %e, "deferred embedding generation failed");
                self.notifier.notify_failure(job.user_id).await;
            }
        }
    }

    /// Prepare -> invoke -> persist. Shared by the inline and deferred
    /// paths; the caller owns counter release and result delivery.
    async fn generate(&self, job: &GenerateJob) -> Result<Embedding, EmbeddingError> {
        let buffer = prepare_buffer(job.source.clone(), job.extent, self.prepare_config).await?;

        let filename = artifact_filename(job.image.id, &job.extent);
        let mut sink = self.artifacts.open_writer(&job.image.uuid, &filename).await?;

        if let Err(e) = self.inference.invoke(buffer, &filename, &mut *sink).await {
            // Drop the partial artifact so a later attempt starts clean.
            if let Err(del) = self.artifacts.delete(&job.image.uuid, &filename).await {
                warn!(error = %del, "failed to remove partial artifact");
            }
            return Err(e.into());
        }

        let outcome = self
            .store
            .insert(NewEmbedding {
                image_id: job.image.id,
                extent: job.extent,
                filename,
            })
            .await?;

        if let InsertOutcome::Existing(row) = &outcome {
            // A concurrent request for the identical viewport won the insert
            // race. The artifact name is deterministic, so our write landed
            // on the same file and the existing row is the result.
            debug!(embedding_id = row.id, "identical extent raced, reusing row");
        }
        Ok(outcome.into_embedding())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::InMemoryCounterStore;
    use crate::extent::Extent;
    use crate::inference::InferenceError;
    use crate::store::{ArtifactSink, InMemoryEmbeddingStore, MemoryArtifactStore};
    use bytes::Bytes;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const TARGET_SIZE: u32 = 64;

    /// Inference stub that writes a fixed payload into the sink.
    struct StubInference {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl StubInference {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceClient for StubInference {
        async fn invoke(
            &self,
            _image: Bytes,
            _filename: &str,
            sink: &mut ArtifactSink,
        ) -> Result<u64, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(InferenceError::Upstream {
                    status: 500,
                    body: "worker exploded".to_string(),
                });
            }
            sink.write_all(b"npy-bytes")
                .await
                .map_err(|e| InferenceError::Sink(e.to_string()))?;
            sink.shutdown()
                .await
                .map_err(|e| InferenceError::Sink(e.to_string()))?;
            Ok(9)
        }
    }

    /// Dispatcher that records what it delivered.
    #[derive(Default)]
    struct RecordingDispatcher {
        successes: Mutex<Vec<(i64, EmbeddingReady)>>,
        failures: Mutex<Vec<i64>>,
    }

    impl NotificationDispatcher for RecordingDispatcher {
        async fn notify_success(&self, user_id: i64, payload: EmbeddingReady) {
            self.successes.lock().push((user_id, payload));
        }

        async fn notify_failure(&self, user_id: i64) {
            self.failures.lock().push(user_id);
        }
    }

    struct Harness {
        workflow: Arc<
            GenerationWorkflow<
                InMemoryEmbeddingStore,
                MemoryArtifactStore,
                StubInference,
                RecordingDispatcher,
                InMemoryCounterStore,
            >,
        >,
        store: Arc<InMemoryEmbeddingStore>,
        inference: Arc<StubInference>,
        notifier: Arc<RecordingDispatcher>,
        counters: Arc<InMemoryCounterStore>,
        _worker: JoinHandle<()>,
    }

    fn harness(inference: StubInference) -> Harness {
        let settings = Settings {
            model_input_size: TARGET_SIZE,
            ..Settings::default()
        };
        let store = Arc::new(InMemoryEmbeddingStore::new());
        let inference = Arc::new(inference);
        let notifier = Arc::new(RecordingDispatcher::default());
        let counters = Arc::new(InMemoryCounterStore::new());
        let (workflow, worker) = GenerationWorkflow::start(
            Arc::clone(&store),
            Arc::new(MemoryArtifactStore::new()),
            Arc::clone(&inference),
            Arc::clone(&notifier),
            Arc::clone(&counters),
            &settings,
        );
        Harness {
            workflow,
            store,
            inference,
            notifier,
            counters,
            _worker: worker,
        }
    }

    fn image() -> ImageRecord {
        ImageRecord {
            id: 1,
            uuid: "a1b2c3d4".to_string(),
            width: 200,
            height: 200,
            tiled: false,
        }
    }

    fn source() -> SourceImage {
        let img = RgbaImage::new(200, 200);
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        SourceImage::Simple(Bytes::from(out))
    }

    fn request(extent: [f64; 4]) -> EmbeddingRequest {
        EmbeddingRequest {
            extent,
            exclude_embedding_id: None,
            tiles: None,
            tiled_image_extent: None,
            columns: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_inline_generation_persists_and_responds() {
        let h = harness(StubInference::new());
        let req = request([10.0, 10.0, 110.0, 110.0]);

        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &req)
            .await
            .unwrap();

        match outcome {
            RequestOutcome::Generated { embedding, data } => {
                assert_eq!(embedding.image_id, 1);
                assert_eq!(embedding.extent, Extent::new(10.0, 10.0, 110.0, 110.0));
                assert_eq!(data, b"npy-bytes");
            }
            other => panic!("expected inline generation, got {other:?}"),
        }
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.counters.global_in_flight(), 0);
        assert_eq!(h.inference.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_identical_request_is_a_cache_hit() {
        let h = harness(StubInference::new());
        let req = request([10.0, 10.0, 110.0, 110.0]);

        h.workflow
            .handle_request(1, &image(), source(), &req)
            .await
            .unwrap();
        let outcome = h
            .workflow
            .handle_request(2, &image(), source(), &req)
            .await
            .unwrap();

        assert!(matches!(outcome, RequestOutcome::Hit { .. }));
        // The external model is never re-invoked for a served extent.
        assert_eq!(h.inference.calls(), 1);
    }

    #[tokio::test]
    async fn test_nearby_request_reuses_stored_embedding() {
        let h = harness(StubInference::new());

        h.workflow
            .handle_request(1, &image(), source(), &request([100.0, 100.0, 200.0, 200.0]))
            .await
            .unwrap();
        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &request([105.0, 105.0, 200.0, 200.0]))
            .await
            .unwrap();

        match outcome {
            RequestOutcome::Hit { embedding, .. } => {
                // The serving extent differs from the requested one.
                assert_eq!(embedding.extent, Extent::new(100.0, 100.0, 200.0, 200.0));
            }
            other => panic!("expected reuse hit, got {other:?}"),
        }
        assert_eq!(h.inference.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_extent_rejected_without_touching_counters() {
        let h = harness(StubInference::new());
        // 50px wide, below the 64px input size.
        let req = request([0.0, 100.0, 50.0, 0.0]);

        let err = h
            .workflow
            .handle_request(1, &image(), source(), &req)
            .await
            .unwrap_err();

        assert!(matches!(err, EmbeddingError::Validation(_)));
        assert_eq!(h.counters.global_in_flight(), 0);
        assert_eq!(h.counters.user_in_flight(1), 0);
        assert_eq!(h.inference.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_user_request_rate_limited() {
        let h = harness(StubInference::slow(Duration::from_millis(300)));

        let workflow = Arc::clone(&h.workflow);
        let first = tokio::spawn(async move {
            workflow
                .handle_request(1, &image(), source(), &request([10.0, 10.0, 110.0, 110.0]))
                .await
        });

        wait_for(|| h.counters.user_in_flight(1) == 1).await;
        let err = h
            .workflow
            .handle_request(1, &image(), source(), &request([20.0, 20.0, 120.0, 120.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::RateLimited { pending: 1 }));

        first.await.unwrap().unwrap();
        // After completion the user is admissible again.
        assert_eq!(h.counters.user_in_flight(1), 0);
        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &request([20.0, 20.0, 120.0, 120.0]))
            .await
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Generated { .. }));
    }

    #[tokio::test]
    async fn test_high_load_defers_and_notifies() {
        let h = harness(StubInference::new());
        // Three generations already in flight elsewhere.
        for _ in 0..3 {
            h.counters.increment_global();
        }

        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &request([10.0, 10.0, 110.0, 110.0]))
            .await
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Accepted { .. }));

        wait_for(|| !h.notifier.successes.lock().is_empty()).await;
        let (user_id, payload) = h.notifier.successes.lock()[0].clone();
        assert_eq!(user_id, 1);
        assert_eq!(payload.extent, [10.0, 10.0, 110.0, 110.0]);
        assert!(payload.url.contains("a1b2c3d4"));
        assert_eq!(h.store.len(), 1);
        // The deferred path released its counters.
        assert_eq!(h.counters.user_in_flight(1), 0);
        assert_eq!(h.counters.global_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_inline_failure_propagates_and_releases_counters() {
        let h = harness(StubInference::failing());

        let err = h
            .workflow
            .handle_request(1, &image(), source(), &request([10.0, 10.0, 110.0, 110.0]))
            .await
            .unwrap_err();

        assert!(matches!(err, EmbeddingError::Upstream(_)));
        assert_eq!(h.counters.global_in_flight(), 0);
        assert_eq!(h.counters.user_in_flight(1), 0);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn test_deferred_failure_sends_failure_notification() {
        let h = harness(StubInference::failing());
        for _ in 0..3 {
            h.counters.increment_global();
        }

        h.workflow
            .handle_request(1, &image(), source(), &request([10.0, 10.0, 110.0, 110.0]))
            .await
            .unwrap();

        wait_for(|| !h.notifier.failures.lock().is_empty()).await;
        assert_eq!(h.notifier.failures.lock()[0], 1);
        assert!(h.notifier.successes.lock().is_empty());
        assert_eq!(h.counters.user_in_flight(1), 0);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_persist_one_row() {
        let h = harness(StubInference::new());
        let img = image();
        let req = request([10.0, 10.0, 110.0, 110.0]);

        let (a, b) = tokio::join!(
            h.workflow.handle_request(1, &img, source(), &req),
            h.workflow.handle_request(2, &img, source(), &req),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(h.store.len(), 1);

        let id_of = |outcome: &RequestOutcome| match outcome {
            RequestOutcome::Hit { embedding, .. }
            | RequestOutcome::Generated { embedding, .. } => embedding.id,
            RequestOutcome::Accepted { .. } => panic!("unexpected deferral"),
        };
        assert_eq!(id_of(&a), id_of(&b));
        assert_eq!(h.counters.global_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_workflow_is_dropped() {
        let h = harness(StubInference::new());
        let Harness {
            workflow,
            _worker: worker,
            ..
        } = h;

        // Dropping the last workflow handle drops the queue sender, which
        // ends the worker loop.
        drop(workflow);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should stop once the workflow is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_refinement_excludes_own_embedding() {
        let h = harness(StubInference::new());
        let req = request([10.0, 10.0, 110.0, 110.0]);

        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &req)
            .await
            .unwrap();
        let RequestOutcome::Generated { embedding, .. } = outcome else {
            panic!("expected inline generation");
        };

        let mut refine = req.clone();
        refine.exclude_embedding_id = Some(embedding.id);
        let outcome = h
            .workflow
            .handle_request(1, &image(), source(), &refine)
            .await
            .unwrap();

        // The excluded embedding is not returned as its own match; the
        // identical extent resolves to the same row at persist time instead.
        match outcome {
            RequestOutcome::Generated { embedding: e2, .. } => assert_eq!(e2.id, embedding.id),
            other => panic!("expected regeneration, got {other:?}"),
        }
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.inference.calls(), 2);
    }
}
