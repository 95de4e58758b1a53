use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollcall_core::quality;
use rollcall_core::roster::normalize_reg_no;
use rollcall_core::{AttendanceRecord, CosineMatcher, Day, Matcher, Student};
use rollcall_embed::Embedder;

use crate::day::DayLedger;
use crate::error::AttendanceError;
use crate::store::Store;

/// Identifier sent to the embedding service for scan probes.
const SCAN_SUBJECT: &str = "scan";

/// Tunables for a scan.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub similarity_threshold: f32,
    pub min_variance: f64,
    pub canonical_size: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: rollcall_core::DEFAULT_SIMILARITY_THRESHOLD,
            min_variance: quality::MIN_VARIANCE,
            canonical_size: quality::CANONICAL_SIZE,
        }
    }
}

/// A successful Present mark.
#[derive(Debug, Clone)]
pub struct MarkedAttendance {
    pub student: Student,
    pub record: AttendanceRecord,
    pub score: f32,
}

/// Result of a scan that did not fail.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Marked(MarkedAttendance),
    /// Best score fell below the threshold, or there was nothing to compare.
    NoMatch { score: f32, compared: usize },
}

/// Orchestrates one scan: day gate, quality gate, embedding, matching,
/// duplicate gate, persistence.
pub struct AttendancePipeline {
    store: Store,
    ledger: DayLedger,
    embedder: Arc<dyn Embedder>,
    settings: ScanSettings,
}

impl AttendancePipeline {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, settings: ScanSettings) -> Self {
        Self {
            ledger: DayLedger::new(store.clone()),
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Scan one image on behalf of `operator` at `now`.
    pub async fn scan(
        &self,
        image: &[u8],
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome, AttendanceError> {
        if image.is_empty() {
            return Err(AttendanceError::BadInput("image is required".into()));
        }
        let today = Day::of(now);

        // Cheap rejection before any image work.
        if self.ledger.is_finalized(today).await? {
            return Err(AttendanceError::DayFinalized(today));
        }

        let probe_image = self.preprocess(image).await?;

        let probe = self
            .embedder
            .extract_embedding(&probe_image, SCAN_SUBJECT)
            .await?;

        let candidates = self.store.candidates().await?;
        let result = CosineMatcher.compare(&probe, &candidates, self.settings.similarity_threshold);
        tracing::info!(
            compared = result.compared,
            similarity = result.similarity,
            threshold = self.settings.similarity_threshold,
            matched = result.matched,
            "scan: similarity decision"
        );

        let Some(reg_no) = result.candidate_id else {
            return Ok(ScanOutcome::NoMatch {
                score: result.similarity,
                compared: result.compared,
            });
        };

        // Deleted between candidate load and now.
        let Some(student) = self.store.get_student(&reg_no).await? else {
            tracing::warn!(reg_no = %reg_no, "matched student no longer exists");
            return Ok(ScanOutcome::NoMatch {
                score: result.similarity,
                compared: result.compared,
            });
        };

        if let Some(existing) = self.store.record(&reg_no, today).await? {
            return Err(AttendanceError::AlreadyMarkedToday {
                student_id: reg_no,
                marked_at: existing.time,
            });
        }

        let record = self.store.mark_present(&reg_no, today, now, operator).await?;
        tracing::info!(
            reg_no = %reg_no,
            date = %today,
            operator,
            similarity = result.similarity,
            "attendance marked present"
        );

        Ok(ScanOutcome::Marked(MarkedAttendance {
            student,
            record,
            score: result.similarity,
        }))
    }

    /// Run the quality gate. Returns the bytes to embed: the resized
    /// re-encoded image, or the original if preprocessing itself failed.
    async fn preprocess(&self, image: &[u8]) -> Result<Vec<u8>, AttendanceError> {
        let owned = image.to_vec();
        let size = self.settings.canonical_size;
        let assessed = tokio::task::spawn_blocking(move || quality::assess(&owned, size)).await;

        match assessed {
            Ok(Ok(assessment)) => {
                tracing::debug!(variance = assessment.variance, "scan: image variance");
                if !assessment.passes(self.settings.min_variance) {
                    return Err(AttendanceError::LowQualityImage {
                        variance: assessment.variance,
                    });
                }
                Ok(assessment.processed)
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "image preprocessing failed; using original image");
                Ok(image.to_vec())
            }
            Err(err) => {
                tracing::warn!(error = %err, "image preprocessing task failed; using original image");
                Ok(image.to_vec())
            }
        }
    }

    /// Extract and store a student's face embedding. Rejected if one is
    /// already registered.
    pub async fn register_face(&self, reg_no: &str, image: &[u8]) -> Result<Student, AttendanceError> {
        let reg_no = normalize_reg_no(reg_no);
        if image.is_empty() {
            return Err(AttendanceError::BadInput("image is required".into()));
        }

        let student = self
            .store
            .get_student(&reg_no)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(reg_no.clone()))?;
        if student.face_registered {
            return Err(AttendanceError::AlreadyRegistered(reg_no));
        }

        if !self.embedder.is_healthy().await {
            return Err(AttendanceError::ServiceUnavailable(
                "face service waking up; try again shortly".into(),
            ));
        }

        let embedding = self.embedder.extract_embedding(image, &reg_no).await?;
        let student = self.store.register_embedding(&reg_no, &embedding).await?;
        tracing::info!(reg_no = %reg_no, dim = embedding.dim(), "face registered");
        Ok(student)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::tests::{new_student, noon};
    use async_trait::async_trait;
    use image::{GrayImage, ImageFormat, Luma};
    use parking_lot::Mutex;
    use rollcall_core::{AttendanceStatus, Embedding};
    use rollcall_embed::EmbedError;
    use std::io::Cursor;

    /// Returns a fixed embedding (or error) and records what it was given.
    pub(crate) struct StubEmbedder {
        pub response: Mutex<Result<Embedding, EmbedError>>,
        pub healthy: bool,
        pub calls: Mutex<Vec<Vec<u8>>>,
    }

    impl StubEmbedder {
        pub(crate) fn returning(values: &[f32]) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Ok(Embedding::from_raw(values.to_vec()).unwrap())),
                healthy: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: EmbedError) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Err(err)),
                healthy: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn extract_embedding(
            &self,
            image: &[u8],
            _subject: &str,
        ) -> Result<Embedding, EmbedError> {
            self.calls.lock().push(image.to_vec());
            self.response.lock().clone()
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }
    }

    /// Left half black, right half white: well above the variance floor.
    pub(crate) fn sharp_png() -> Vec<u8> {
        let img = GrayImage::from_fn(64, 64, |x, _| if x < 32 { Luma([0u8]) } else { Luma([255u8]) });
        encode(&img)
    }

    pub(crate) fn flat_png() -> Vec<u8> {
        encode(&GrayImage::from_pixel(64, 64, Luma([128u8])))
    }

    fn encode(img: &GrayImage) -> Vec<u8> {
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    async fn enrolled(store: &Store, reg_no: &str, values: &[f32]) {
        store.insert_student(new_student(reg_no, reg_no, "101"), noon()).await.unwrap();
        store
            .register_embedding(reg_no, &Embedding::from_raw(values.to_vec()).unwrap())
            .await
            .unwrap();
    }

    fn pipeline(store: &Store, embedder: Arc<dyn Embedder>) -> AttendancePipeline {
        AttendancePipeline::new(store.clone(), embedder, ScanSettings::default())
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_match() {
        let store = Store::open_in_memory().await.unwrap();
        let embedder = StubEmbedder::returning(&[1.0, 0.0]);
        let outcome = pipeline(&store, embedder.clone())
            .scan(&sharp_png(), "warden", noon())
            .await
            .unwrap();
        match outcome {
            ScanOutcome::NoMatch { score, compared } => {
                assert_eq!(compared, 0);
                assert_eq!(score, 0.0);
            }
            other => panic!("expected NoMatch, got {other:?}"),
        }
        assert_eq!(embedder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_low_variance_image_skips_embedding() {
        let store = Store::open_in_memory().await.unwrap();
        enrolled(&store, "A1", &[1.0, 0.0]).await;
        let embedder = StubEmbedder::returning(&[1.0, 0.0]);

        let err = pipeline(&store, embedder.clone())
            .scan(&flat_png(), "warden", noon())
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::LowQualityImage { variance } if variance < 500.0));
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_finalized_day_rejects_before_embedding() {
        let store = Store::open_in_memory().await.unwrap();
        store.finalize_day(Day::of(noon()), noon(), "warden").await.unwrap();
        let embedder = StubEmbedder::returning(&[1.0, 0.0]);

        let err = pipeline(&store, embedder.clone())
            .scan(&sharp_png(), "warden", noon())
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::DayFinalized(_)));
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_match_marks_present_once() {
        let store = Store::open_in_memory().await.unwrap();
        enrolled(&store, "A1", &[0.0, 1.0]).await;
        enrolled(&store, "B2", &[1.0, 0.1]).await;
        let p = pipeline(&store, StubEmbedder::returning(&[1.0, 0.0]));

        let outcome = p.scan(&sharp_png(), "warden-7", noon()).await.unwrap();
        let ScanOutcome::Marked(marked) = outcome else {
            panic!("expected a match");
        };
        assert_eq!(marked.student.reg_no, "B2");
        assert_eq!(marked.record.status, AttendanceStatus::Present);
        assert_eq!(marked.record.time, Some(noon()));
        assert_eq!(marked.record.marked_by, "warden-7");
        assert!(marked.score > 0.99);

        let later = noon() + chrono::Duration::minutes(10);
        let err = p.scan(&sharp_png(), "warden-7", later).await.unwrap_err();
        match err {
            AttendanceError::AlreadyMarkedToday { student_id, marked_at } => {
                assert_eq!(student_id, "B2");
                assert_eq!(marked_at, Some(noon()));
            }
            other => panic!("unexpected error: {other}"),
        }
        let records = store.records_on(Day::of(noon())).await.unwrap();
        assert_eq!(records.iter().filter(|r| r.student_id == "B2").count(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_reports_score() {
        let store = Store::open_in_memory().await.unwrap();
        // cos = 0.5 against the probe
        enrolled(&store, "A1", &[0.5, 0.866_025_4]).await;
        let outcome = pipeline(&store, StubEmbedder::returning(&[1.0, 0.0]))
            .scan(&sharp_png(), "warden", noon())
            .await
            .unwrap();
        match outcome {
            ScanOutcome::NoMatch { score, compared } => {
                assert!((score - 0.5).abs() < 1e-4);
                assert_eq!(compared, 1);
            }
            other => panic!("expected NoMatch, got {other:?}"),
        }
        assert!(store.records_on(Day::of(noon())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configurable_threshold() {
        let store = Store::open_in_memory().await.unwrap();
        enrolled(&store, "A1", &[0.5, 0.866_025_4]).await;
        let settings = ScanSettings {
            similarity_threshold: 0.45,
            ..ScanSettings::default()
        };
        let p = AttendancePipeline::new(store.clone(), StubEmbedder::returning(&[1.0, 0.0]), settings);
        assert!(matches!(
            p.scan(&sharp_png(), "warden", noon()).await.unwrap(),
            ScanOutcome::Marked(_)
        ));
    }

    #[tokio::test]
    async fn test_undecodable_image_falls_back_to_original() {
        let store = Store::open_in_memory().await.unwrap();
        let embedder = StubEmbedder::returning(&[1.0, 0.0]);
        let raw = b"not-an-image-but-maybe-the-service-knows".to_vec();

        pipeline(&store, embedder.clone())
            .scan(&raw, "warden", noon())
            .await
            .unwrap();
        assert_eq!(embedder.calls.lock().as_slice(), &[raw]);
    }

    #[tokio::test]
    async fn test_processed_image_is_sent_to_embedder() {
        let store = Store::open_in_memory().await.unwrap();
        let embedder = StubEmbedder::returning(&[1.0, 0.0]);
        pipeline(&store, embedder.clone())
            .scan(&sharp_png(), "warden", noon())
            .await
            .unwrap();

        let sent = embedder.calls.lock()[0].clone();
        let decoded = image::load_from_memory(&sent).unwrap();
        assert_eq!(decoded.width(), quality::CANONICAL_SIZE);
    }

    #[tokio::test]
    async fn test_embedding_failures_keep_their_kind() {
        let store = Store::open_in_memory().await.unwrap();
        for (embed_err, kind) in [
            (EmbedError::Timeout("60s".into()), "timeout"),
            (EmbedError::ServiceUnavailable("HTTP 503".into()), "service_unavailable"),
            (EmbedError::BadInput("HTTP 400".into()), "bad_input"),
            (EmbedError::NoFaceDetected, "no_face_detected"),
        ] {
            let err = pipeline(&store, StubEmbedder::failing(embed_err))
                .scan(&sharp_png(), "warden", noon())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_empty_image_is_bad_input() {
        let store = Store::open_in_memory().await.unwrap();
        let err = pipeline(&store, StubEmbedder::returning(&[1.0]))
            .scan(&[], "warden", noon())
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::BadInput(_)));
    }

    #[tokio::test]
    async fn test_register_face_once() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();
        let embedder = StubEmbedder::returning(&[3.0, 4.0]);
        let p = pipeline(&store, embedder.clone());

        let student = p.register_face(" 21cs001 ", b"jpeg").await.unwrap();
        assert!(student.face_registered);
        let stored = store.get_student("21CS001").await.unwrap().unwrap();
        let values = stored.face_embedding.unwrap().values;
        assert!((values[0] - 0.6).abs() < 1e-6 && (values[1] - 0.8).abs() < 1e-6);

        let err = p.register_face("21CS001", b"jpeg").await.unwrap_err();
        assert!(matches!(err, AttendanceError::AlreadyRegistered(_)));
        assert_eq!(embedder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_register_face_fails_fast_when_unhealthy() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_student(new_student("21CS001", "Asha", "101"), noon()).await.unwrap();
        let embedder = Arc::new(StubEmbedder {
            response: Mutex::new(Ok(Embedding { values: vec![1.0] })),
            healthy: false,
            calls: Mutex::new(Vec::new()),
        });

        let err = pipeline(&store, embedder.clone())
            .register_face("21CS001", b"jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::ServiceUnavailable(_)));
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_register_face_unknown_student() {
        let store = Store::open_in_memory().await.unwrap();
        let err = pipeline(&store, StubEmbedder::returning(&[1.0]))
            .register_face("NOPE", b"jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NotFound(_)));
    }
}
