//! End-to-end scenarios for the identity pipeline.
//!
//! Uses the deterministic mock analyzer and the in-memory store backend, so
//! no model files or database are required.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faceid_core::analyzer::FACE_MARKER;
use faceid_core::{
    AdmissionGate, DetectedFace, FaceAnalyzer, FingerprintExtractor, IdentityPipeline,
    IdentityStore, MemoryBackend, MockFaceAnalyzer, PipelineError, RetryPolicy, StoreEndpoint,
};
use image::{ImageFormat, Rgb, RgbImage};

const THRESHOLD: f32 = 0.6;

/// Encode a synthetic portrait: a flat background with one marker pixel per face.
fn portrait(background: [u8; 3], faces: &[(u32, u32)]) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(48, 48, Rgb(background));
    for &(x, y) in faces {
        img.put_pixel(x, y, Rgb(FACE_MARKER));
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn build_pipeline(
    analyzer: Arc<dyn FaceAnalyzer>,
    capacity: usize,
) -> (Arc<MemoryBackend>, IdentityPipeline) {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(
        IdentityStore::new(backend.clone(), "face_embeddings").with_retry_policy(RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        }),
    );
    store.connect(StoreEndpoint::default()).await.unwrap();
    store.ensure_schema().await.unwrap();

    let pipeline = IdentityPipeline::new(
        FingerprintExtractor::new(analyzer),
        store,
        AdmissionGate::new(capacity).unwrap(),
        THRESHOLD,
    )
    .unwrap();
    (backend, pipeline)
}

#[tokio::test]
async fn test_alice_scenario() {
    let (_backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 6).await;
    let image_a = portrait([210, 170, 140], &[(20, 18)]);
    let image_b = portrait([90, 60, 40], &[(25, 22)]);

    // Enroll alice
    let enrolled = pipeline.enroll("alice", image_a.clone()).await.unwrap();
    assert_eq!(enrolled.identity_label, "alice");
    assert_eq!(enrolled.inserted, 1);
    assert!((0.0..=1.0).contains(&enrolled.detection_confidence));

    // Same image matches alice
    let verified = pipeline.verify(image_a.clone(), None).await.unwrap();
    assert!(verified.verdict.matched);
    assert_eq!(verified.verdict.identity_label.as_deref(), Some("alice"));
    assert!(verified.verdict.similarity >= THRESHOLD);
    assert!((verified.verdict.similarity - 1.0).abs() < 1e-4);

    // Unrelated face does not
    let other = pipeline.verify(image_b, None).await.unwrap();
    assert!(!other.verdict.matched);
    assert!(other.verdict.similarity < THRESHOLD);
    assert_eq!(other.verdict.identity_label, None);

    // Delete alice
    let deleted = pipeline.delete("alice").await.unwrap();
    assert_eq!(deleted.identity_label, "alice");
    assert_eq!(deleted.deleted, 1);

    // Alice no longer matches
    let after = pipeline.verify(image_a, None).await.unwrap();
    assert!(!after.verdict.matched);

    // Deleting again is not a no-op
    assert!(matches!(
        pipeline.delete("alice").await,
        Err(PipelineError::NotFound(label)) if label == "alice"
    ));
}

#[tokio::test]
async fn test_delete_ghost_is_not_found() {
    let (_backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 2).await;
    assert!(matches!(
        pipeline.delete("ghost-id").await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_identities() {
    let (_backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 2).await;
    pipeline
        .enroll("bob", portrait([1, 2, 3], &[(5, 5)]))
        .await
        .unwrap();
    pipeline
        .enroll("alice", portrait([4, 5, 6], &[(5, 5)]))
        .await
        .unwrap();
    pipeline
        .enroll("bob", portrait([7, 8, 9], &[(5, 5)]))
        .await
        .unwrap();

    let labels = pipeline.list_identities().await.unwrap();
    assert_eq!(labels, vec!["alice".to_string(), "bob".to_string()]);
}

#[tokio::test]
async fn test_extract_only_bypasses_store() {
    let (backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 2).await;
    backend.set_available(false);

    let extraction = pipeline
        .extract_only(portrait([50, 50, 50], &[(10, 11)]))
        .await
        .unwrap();
    assert_eq!(extraction.fingerprint.dimension(), 512);
    assert!((extraction.fingerprint.norm() - 1.0).abs() < 1e-3);
    assert_eq!(extraction.bounding_box.0, [10.0, 11.0, 11.0, 12.0]);
}

#[tokio::test]
async fn test_store_recovers_after_outage() {
    let (backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 2).await;
    let image = portrait([120, 130, 140], &[(8, 8)]);
    pipeline.enroll("carol", image.clone()).await.unwrap();

    backend.set_available(false);
    assert!(matches!(
        pipeline.verify(image.clone(), None).await,
        Err(PipelineError::StoreUnavailable(_))
    ));
    assert!(!pipeline.store().is_connected());

    backend.set_available(true);
    let outcome = pipeline.verify(image, None).await.unwrap();
    assert!(outcome.verdict.matched);
    assert_eq!(outcome.verdict.identity_label.as_deref(), Some("carol"));
    assert!(pipeline.readiness().await.ready);
}

/// Mock analyzer that records how many analyses run at the same time.
struct SlowAnalyzer {
    inner: MockFaceAnalyzer,
    running: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl FaceAnalyzer for SlowAnalyzer {
    fn analyze(&self, image: &RgbImage) -> faceid_core::Result<Vec<DetectedFace>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.inner.analyze(image)
    }

    fn name(&self) -> String {
        "slow-mock".to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_bounds_concurrent_extractions() {
    const CAPACITY: usize = 3;
    let analyzer = Arc::new(SlowAnalyzer {
        inner: MockFaceAnalyzer::default(),
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        started: AtomicUsize::new(0),
    });
    let (_backend, pipeline) = build_pipeline(analyzer.clone(), CAPACITY).await;
    let pipeline = Arc::new(pipeline);

    let mut handles = Vec::new();
    for i in 0..=CAPACITY {
        let pipeline = pipeline.clone();
        let image = portrait([i as u8, 0, 0], &[(3, 3)]);
        handles.push(tokio::spawn(async move {
            pipeline.extract_only(image).await
        }));
    }

    // While the first CAPACITY calls are inside the model, the extra one waits.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(analyzer.started.load(Ordering::SeqCst) <= CAPACITY);

    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(analyzer.started.load(Ordering::SeqCst), CAPACITY + 1);
    assert!(analyzer.peak.load(Ordering::SeqCst) <= CAPACITY);
    assert_eq!(pipeline.gate().in_flight(), 0);
}

#[tokio::test]
async fn test_ensure_schema_twice_keeps_collection() {
    let (_backend, pipeline) = build_pipeline(Arc::new(MockFaceAnalyzer::default()), 1).await;
    let store = pipeline.store();
    let before = store.describe().await.unwrap();
    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();
    assert_eq!(store.describe().await.unwrap(), before);
}
