//! Face matcher: one verification attempt as an explicit state machine.
//!
//! ```text
//! Idle → ModelsLoading → ModelsReady → CaptureStarting → CaptureActive → Comparing
//!                                                                         ↓
//!                                                    Matched | NotMatched | Failed
//! ```
//!
//! Any state may return to `Idle` through [`FaceMatcher::stop`] or when a new
//! attempt begins.

use crate::capture::{CaptureDevice, CaptureGuard};
use crate::extractor::{DescriptorExtractor, ModelLoader};
use crate::store::ReferenceImageSource;
use crate::types::{Descriptor, Frame, ImageRef, PersonId, VerificationOutcome};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

/// Default Euclidean distance below which two descriptors are the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Default number of frames grabbed while looking for a non-dark live frame.
pub const DEFAULT_FRAME_ATTEMPTS: usize = 5;

/// Which image a face was expected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSide {
    Reference,
    Live,
}

impl fmt::Display for FaceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("reference"),
            Self::Live => f.write_str("live camera"),
        }
    }
}

/// Why a verification attempt did not produce an outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchFailure {
    #[error("face model failed to load: {0}")]
    ModelLoad(String),
    #[error("reference image unavailable: {0}")]
    ReferenceUnavailable(String),
    #[error("camera unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("no face detected in the {0} image")]
    NoFaceDetected(FaceSide),
    #[error("descriptor extraction failed: {0}")]
    Extraction(String),
    #[error("a verification attempt is already in progress")]
    AttemptInProgress,
    #[error("verification was cancelled")]
    Cancelled,
}

impl MatchFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelLoad(_) => "model_load_error",
            Self::ReferenceUnavailable(_) => "reference_unavailable",
            Self::CaptureUnavailable(_) => "capture_unavailable",
            Self::NoFaceDetected(_) => "no_face_detected",
            Self::Extraction(_) => "extraction_error",
            Self::AttemptInProgress => "attempt_in_progress",
            Self::Cancelled => "verification_cancelled",
        }
    }
}

/// Lifecycle state of the matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum MatcherState {
    Idle,
    ModelsLoading,
    ModelsReady,
    CaptureStarting,
    CaptureActive,
    Comparing,
    Matched { distance: f32 },
    NotMatched { distance: f32 },
    Failed(MatchFailure),
}

impl MatcherState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ModelsLoading => "models_loading",
            Self::ModelsReady => "models_ready",
            Self::CaptureStarting => "capture_starting",
            Self::CaptureActive => "capture_active",
            Self::Comparing => "comparing",
            Self::Matched { .. } => "matched",
            Self::NotMatched { .. } => "not_matched",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Matched { .. } | Self::NotMatched { .. } | Self::Failed(_)
        )
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: &MatcherState) -> bool {
        use MatcherState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle, ModelsLoading) => true,
            (ModelsLoading, ModelsReady | Failed(_)) => true,
            // Reference fetch and extraction happen in ModelsReady.
            (ModelsReady, CaptureStarting | Failed(_)) => true,
            (CaptureStarting, CaptureActive | Failed(_)) => true,
            (CaptureActive, Comparing | Failed(_)) => true,
            (Comparing, Matched { .. } | NotMatched { .. } | Failed(_)) => true,
            (
                Idle | ModelsLoading | ModelsReady | CaptureStarting | CaptureActive | Comparing
                | Matched { .. } | NotMatched { .. } | Failed(_),
                _,
            ) => false,
        }
    }
}

/// Tunables for the matcher.
#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    /// A match requires `distance < threshold`.
    pub threshold: f32,
    /// Frames grabbed while skipping dark frames.
    pub frame_attempts: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            frame_attempts: DEFAULT_FRAME_ATTEMPTS,
        }
    }
}

/// Result of [`FaceMatcher::cancel_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No attempt was in flight.
    Idle,
    Cancelled,
    /// An attempt is in flight for another person.
    NotOwner,
}

/// The in-flight attempt: who started it and how to cancel it.
struct ActiveAttempt {
    owner: PersonId,
    token: CancellationToken,
}

/// Reference descriptor keyed by the digest of the image it came from.
struct CachedReference {
    image: ImageRef,
    digest: [u8; 32],
    descriptor: Descriptor,
}

/// Compares a live face against a person's reference face.
///
/// At most one attempt runs at a time per matcher. The camera is only held
/// between `CaptureStarting` and `Comparing`, through a [`CaptureGuard`].
pub struct FaceMatcher {
    loader: Arc<dyn ModelLoader>,
    camera: Arc<dyn CaptureDevice>,
    references: Arc<dyn ReferenceImageSource>,
    config: MatcherConfig,
    models: OnceCell<Arc<dyn DescriptorExtractor>>,
    reference_cache: Mutex<Option<CachedReference>>,
    state: watch::Sender<MatcherState>,
    attempt: Mutex<Option<ActiveAttempt>>,
}

/// Marks an attempt as in flight; resets the machine if the attempt is abandoned.
struct AttemptGuard<'a> {
    matcher: &'a FaceMatcher,
    token: CancellationToken,
    finished: bool,
}

impl<'a> AttemptGuard<'a> {
    /// Claim the matcher for `owner`. The slot and its cancellation token are
    /// installed under one lock, so a `stop` can never miss a started attempt.
    fn try_begin(matcher: &'a FaceMatcher, owner: PersonId) -> Option<Self> {
        let mut slot = lock(&matcher.attempt);
        if slot.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(ActiveAttempt {
            owner,
            token: token.clone(),
        });
        Some(Self {
            matcher,
            token,
            finished: false,
        })
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // The attempt future was dropped mid-flight (timeout, client gone).
            self.matcher.state.send_replace(MatcherState::Idle);
        }
        *lock(&self.matcher.attempt) = None;
    }
}

impl FaceMatcher {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        camera: Arc<dyn CaptureDevice>,
        references: Arc<dyn ReferenceImageSource>,
        config: MatcherConfig,
    ) -> Self {
        let (state, _) = watch::channel(MatcherState::Idle);
        Self {
            loader,
            camera,
            references,
            config,
            models: OnceCell::new(),
            reference_cache: Mutex::new(None),
            state,
            attempt: Mutex::new(None),
        }
    }

    pub fn config(&self) -> MatcherConfig {
        self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> MatcherState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MatcherState> {
        self.state.subscribe()
    }

    pub fn models_loaded(&self) -> bool {
        self.models.initialized()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.attempt).is_some()
    }

    pub fn camera_description(&self) -> String {
        self.camera.describe()
    }

    /// Cancel the in-flight attempt, if any, and return to `Idle`.
    ///
    /// The camera is released as soon as the attempt unwinds; `verify`
    /// returns [`MatchFailure::Cancelled`].
    pub fn stop(&self) {
        if let Some(active) = lock(&self.attempt).as_ref() {
            active.token.cancel();
        }
        self.state.send_replace(MatcherState::Idle);
        tracing::info!("face matcher stopped");
    }

    /// Cancel the in-flight attempt on behalf of `requester`.
    ///
    /// Only the person who started the attempt may cancel it, unless
    /// `override_owner` is set (administrators).
    pub fn cancel_attempt(&self, requester: PersonId, override_owner: bool) -> CancelOutcome {
        let slot = lock(&self.attempt);
        let Some(active) = slot.as_ref() else {
            return CancelOutcome::Idle;
        };
        let owner = active.owner;
        if owner != requester && !override_owner {
            tracing::warn!(requester, owner, "cancel refused: attempt belongs to another person");
            return CancelOutcome::NotOwner;
        }
        active.token.cancel();
        drop(slot);

        self.state.send_replace(MatcherState::Idle);
        tracing::info!(requester, owner, "verification attempt cancelled");
        CancelOutcome::Cancelled
    }

    /// Run one full attempt for `owner` against the reference image at `reference`.
    pub async fn verify(
        &self,
        owner: PersonId,
        reference: &ImageRef,
    ) -> Result<VerificationOutcome, MatchFailure> {
        let Some(mut attempt) = AttemptGuard::try_begin(self, owner) else {
            tracing::warn!(owner, "verification rejected: attempt already in progress");
            return Err(MatchFailure::AttemptInProgress);
        };

        let token = attempt.token.clone();
        self.state.send_replace(MatcherState::Idle);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(MatchFailure::Cancelled),
            result = self.run_attempt(reference) => result,
        };

        if matches!(result, Err(MatchFailure::Cancelled)) {
            self.state.send_replace(MatcherState::Idle);
            tracing::info!("verification cancelled");
        }
        attempt.finished = true;
        result
    }

    async fn run_attempt(&self, reference: &ImageRef) -> Result<VerificationOutcome, MatchFailure> {
        self.transition(MatcherState::ModelsLoading);
        let extractor = self
            .models
            .get_or_try_init(|| self.loader.load())
            .await
            .map_err(|e| self.fail(MatchFailure::ModelLoad(e.to_string())))?
            .clone();
        self.transition(MatcherState::ModelsReady);

        let reference_descriptor = self.reference_descriptor(extractor.as_ref(), reference).await?;

        self.transition(MatcherState::CaptureStarting);
        let mut capture = CaptureGuard::acquire(self.camera.as_ref())
            .await
            .map_err(|e| self.fail(MatchFailure::CaptureUnavailable(e.to_string())))?;
        self.transition(MatcherState::CaptureActive);

        let frame = capture
            .best_frame(self.config.frame_attempts)
            .await
            .map_err(|e| self.fail(MatchFailure::CaptureUnavailable(e.to_string())))?;
        drop(capture);

        self.transition(MatcherState::Comparing);
        let live = self
            .extract(extractor.as_ref(), &frame, FaceSide::Live)
            .await?;

        let distance = reference_descriptor
            .euclidean_distance(&live)
            .ok_or_else(|| {
                self.fail(MatchFailure::Extraction(format!(
                    "descriptor length mismatch: reference {} vs live {}",
                    reference_descriptor.values.len(),
                    live.values.len()
                )))
            })?;

        let matched = distance < self.config.threshold;
        tracing::info!(
            distance,
            threshold = self.config.threshold,
            matched,
            "face comparison complete"
        );
        self.transition(if matched {
            MatcherState::Matched { distance }
        } else {
            MatcherState::NotMatched { distance }
        });

        Ok(VerificationOutcome {
            matched,
            distance,
            threshold: self.config.threshold,
        })
    }

    /// Fetch the reference image and extract its descriptor.
    ///
    /// The image is fetched on every attempt; extraction is skipped when the
    /// fetched bytes are identical to those of the cached descriptor.
    async fn reference_descriptor(
        &self,
        extractor: &dyn DescriptorExtractor,
        reference: &ImageRef,
    ) -> Result<Descriptor, MatchFailure> {
        let bytes = self
            .references
            .fetch(reference)
            .await
            .map_err(|e| self.fail(MatchFailure::ReferenceUnavailable(e.to_string())))?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();

        if let Some(cached) = lock(&self.reference_cache).as_ref() {
            if cached.image == *reference && cached.digest == digest {
                tracing::debug!(reference = %reference, "reference descriptor unchanged; reusing");
                return Ok(cached.descriptor.clone());
            }
        }

        let image = Frame::decode(&bytes).map_err(|e| {
            self.fail(MatchFailure::ReferenceUnavailable(format!(
                "cannot decode reference image: {e}"
            )))
        })?;
        let descriptor = self.extract(extractor, &image, FaceSide::Reference).await?;

        *lock(&self.reference_cache) = Some(CachedReference {
            image: reference.clone(),
            digest,
            descriptor: descriptor.clone(),
        });
        Ok(descriptor)
    }

    async fn extract(
        &self,
        extractor: &dyn DescriptorExtractor,
        frame: &Frame,
        side: FaceSide,
    ) -> Result<Descriptor, MatchFailure> {
        match extractor.extract(frame).await {
            Ok(Some(descriptor)) => Ok(descriptor),
            Ok(None) => Err(self.fail(MatchFailure::NoFaceDetected(side))),
            Err(e) => Err(self.fail(MatchFailure::Extraction(e.to_string()))),
        }
    }

    fn transition(&self, next: MatcherState) {
        let name = next.name();
        let applied = self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if applied {
            tracing::debug!(state = name, "face matcher transition");
        } else {
            tracing::debug!(
                state = name,
                current = self.state.borrow().name(),
                "face matcher transition ignored"
            );
        }
    }

    fn fail(&self, failure: MatchFailure) -> MatchFailure {
        tracing::warn!(reason = failure.code(), error = %failure, "verification attempt failed");
        self.transition(MatcherState::Failed(failure.clone()));
        failure
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        descriptor_at, reference_png, CameraBehavior, MemoryReferenceSource, MockCamera,
        MockLoader, ScriptedExtractor,
    };

    const REF: &str = "https://images.example/face/1.png";
    const PERSON: PersonId = 7;
    const OTHER: PersonId = 8;

    struct Rig {
        matcher: Arc<FaceMatcher>,
        camera: Arc<MockCamera>,
        loader: Arc<MockLoader>,
        extractor: Arc<ScriptedExtractor>,
        references: Arc<MemoryReferenceSource>,
    }

    fn rig(live_distance: Option<f32>, camera: CameraBehavior) -> Rig {
        let extractor = Arc::new(ScriptedExtractor::new(
            Some(descriptor_at(0.0)),
            live_distance.map(descriptor_at),
        ));
        let loader = Arc::new(MockLoader::new(extractor.clone()));
        let camera = Arc::new(MockCamera::new(camera));
        let references = Arc::new(MemoryReferenceSource::default());
        references.insert(REF, reference_png());
        let matcher = Arc::new(FaceMatcher::new(
            loader.clone(),
            camera.clone(),
            references.clone(),
            MatcherConfig::default(),
        ));
        Rig {
            matcher,
            camera,
            loader,
            extractor,
            references,
        }
    }

    #[test]
    fn test_transition_table() {
        use MatcherState::*;
        assert!(Idle.can_transition_to(&ModelsLoading));
        assert!(ModelsLoading.can_transition_to(&ModelsReady));
        assert!(CaptureActive.can_transition_to(&Comparing));
        assert!(Comparing.can_transition_to(&Matched { distance: 0.1 }));
        assert!(CaptureActive.can_transition_to(&Idle));
        assert!(!Idle.can_transition_to(&CaptureActive));
        assert!(!ModelsLoading.can_transition_to(&Comparing));
        assert!(!Matched { distance: 0.1 }.can_transition_to(&ModelsLoading));
        assert!(!Comparing.can_transition_to(&CaptureStarting));
    }

    #[tokio::test]
    async fn test_match_below_threshold() {
        let rig = rig(Some(0.5), CameraBehavior::Frames);
        let outcome = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();

        assert!(outcome.matched);
        assert!((outcome.distance - 0.5).abs() < 1e-6);
        assert_eq!(rig.matcher.state(), MatcherState::Matched { distance: outcome.distance });
        assert_eq!(rig.camera.active_tracks(), 0);
        assert_eq!(rig.camera.starts(), 1);
    }

    #[tokio::test]
    async fn test_no_match_at_or_above_threshold() {
        let rig = rig(Some(0.7), CameraBehavior::Frames);
        let outcome = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert!(!outcome.matched);
        assert!(matches!(rig.matcher.state(), MatcherState::NotMatched { .. }));

        let rig = rig_with_threshold(0.6, 0.6);
        let outcome = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert!(!outcome.matched, "threshold is exclusive");
    }

    fn rig_with_threshold(live_distance: f32, threshold: f32) -> Rig {
        let base = rig(Some(live_distance), CameraBehavior::Frames);
        let matcher = Arc::new(FaceMatcher::new(
            base.loader.clone(),
            base.camera.clone(),
            base.references.clone(),
            MatcherConfig {
                threshold,
                ..MatcherConfig::default()
            },
        ));
        Rig { matcher, ..base }
    }

    #[tokio::test]
    async fn test_no_face_in_live_frame() {
        let rig = rig(None, CameraBehavior::Frames);
        let err = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap_err();
        assert_eq!(err, MatchFailure::NoFaceDetected(FaceSide::Live));
        assert_eq!(rig.matcher.state(), MatcherState::Failed(err));
        assert_eq!(rig.camera.active_tracks(), 0);
    }

    #[tokio::test]
    async fn test_no_face_in_reference_skips_camera() {
        let extractor = Arc::new(ScriptedExtractor::new(None, Some(descriptor_at(0.1))));
        let base = rig(Some(0.1), CameraBehavior::Frames);
        let matcher = FaceMatcher::new(
            Arc::new(MockLoader::new(extractor.clone())),
            base.camera.clone(),
            base.references.clone(),
            MatcherConfig::default(),
        );

        let err = matcher.verify(PERSON, &REF.to_string()).await.unwrap_err();
        assert_eq!(err, MatchFailure::NoFaceDetected(FaceSide::Reference));
        assert_eq!(err.code(), "no_face_detected");
        assert_eq!(base.camera.starts(), 0);
        assert_eq!(extractor.reference_calls(), 1);
        assert_eq!(extractor.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_camera_unavailable() {
        let rig = rig(Some(0.1), CameraBehavior::Unavailable);
        let err = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap_err();
        assert!(matches!(err, MatchFailure::CaptureUnavailable(_)));
        assert_eq!(err.code(), "capture_unavailable");
        assert_eq!(rig.camera.active_tracks(), 0);
    }

    #[tokio::test]
    async fn test_capture_error_mid_stream_releases_camera() {
        let rig = rig(Some(0.1), CameraBehavior::FailOnFrame);
        let err = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap_err();
        assert!(matches!(err, MatchFailure::CaptureUnavailable(_)));
        assert_eq!(rig.camera.starts(), 1);
        assert_eq!(rig.camera.active_tracks(), 0);
    }

    #[tokio::test]
    async fn test_missing_reference_image() {
        let rig = rig(Some(0.1), CameraBehavior::Frames);
        let err = rig
            .matcher
            .verify(PERSON, &"https://images.example/missing.png".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "reference_unavailable");
        assert_eq!(rig.camera.starts(), 0);
    }

    #[tokio::test]
    async fn test_model_load_failure_is_retryable() {
        let rig = rig(Some(0.2), CameraBehavior::Frames);
        rig.loader.fail_next(1);

        let err = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap_err();
        assert_eq!(err.code(), "model_load_error");
        assert!(!rig.matcher.models_loaded());
        assert_eq!(rig.camera.starts(), 0);

        let outcome = rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert!(outcome.matched);
        assert!(rig.matcher.models_loaded());
        assert_eq!(rig.loader.loads(), 2);

        // Loaded once, queried many times.
        rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert_eq!(rig.loader.loads(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_reference_is_extracted_once() {
        let rig = rig(Some(0.2), CameraBehavior::Frames);
        rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();

        assert_eq!(rig.references.fetches(), 2, "fetched once per attempt");
        assert_eq!(rig.extractor.reference_calls(), 1);

        // Re-registration replaces the image bytes.
        rig.references.insert(REF, crate::testing::reference_png_variant());
        rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert_eq!(rig.extractor.reference_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_capture_releases_camera() {
        let rig = rig(Some(0.2), CameraBehavior::Hang);
        let mut states = rig.matcher.subscribe();

        let matcher = rig.matcher.clone();
        let attempt = tokio::spawn(async move { matcher.verify(PERSON, &REF.to_string()).await });

        states
            .wait_for(|s| *s == MatcherState::CaptureActive)
            .await
            .unwrap();
        assert_eq!(rig.camera.active_tracks(), 1);

        rig.matcher.stop();
        let result = attempt.await.unwrap();

        assert_eq!(result, Err(MatchFailure::Cancelled));
        assert_eq!(rig.camera.active_tracks(), 0);
        assert_eq!(rig.matcher.state(), MatcherState::Idle);
        assert!(!rig.matcher.is_busy());
    }

    #[tokio::test]
    async fn test_concurrent_attempt_is_rejected() {
        let rig = rig(Some(0.2), CameraBehavior::Hang);
        let mut states = rig.matcher.subscribe();

        let matcher = rig.matcher.clone();
        let first = tokio::spawn(async move { matcher.verify(PERSON, &REF.to_string()).await });
        states
            .wait_for(|s| *s == MatcherState::CaptureActive)
            .await
            .unwrap();

        let second = rig.matcher.verify(PERSON, &REF.to_string()).await;
        assert_eq!(second, Err(MatchFailure::AttemptInProgress));
        assert_eq!(rig.camera.starts(), 1);
        assert_eq!(rig.matcher.state(), MatcherState::CaptureActive);

        rig.matcher.stop();
        assert_eq!(first.await.unwrap(), Err(MatchFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_attempt_resets_state() {
        let rig = rig(Some(0.2), CameraBehavior::Hang);
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            rig.matcher.verify(PERSON, &REF.to_string()),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(rig.camera.active_tracks(), 0);
        assert_eq!(rig.matcher.state(), MatcherState::Idle);
        assert!(!rig.matcher.is_busy());
    }

    #[tokio::test]
    async fn test_dark_frames_are_skipped() {
        let rig = rig(Some(0.2), CameraBehavior::DarkThenLit(2));
        rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap();
        assert_eq!(rig.camera.frames_served(), 3);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_harmless() {
        let rig = rig(Some(0.2), CameraBehavior::Frames);
        rig.matcher.stop();
        assert_eq!(rig.matcher.state(), MatcherState::Idle);
        assert!(rig.matcher.verify(PERSON, &REF.to_string()).await.unwrap().matched);
    }

    #[test]
    fn test_stop_reaches_attempt_as_soon_as_it_begins() {
        let rig = rig(Some(0.2), CameraBehavior::Frames);
        let attempt = AttemptGuard::try_begin(&rig.matcher, PERSON).unwrap();
        assert!(rig.matcher.is_busy());
        assert!(AttemptGuard::try_begin(&rig.matcher, OTHER).is_none());

        rig.matcher.stop();
        assert!(attempt.token.is_cancelled());

        drop(attempt);
        assert!(!rig.matcher.is_busy());
        let next = AttemptGuard::try_begin(&rig.matcher, PERSON).unwrap();
        assert!(!next.token.is_cancelled(), "each attempt gets a fresh token");
    }

    #[tokio::test]
    async fn test_cancel_attempt_is_limited_to_owner() {
        let rig = rig(Some(0.2), CameraBehavior::Hang);
        let mut states = rig.matcher.subscribe();
        assert_eq!(rig.matcher.cancel_attempt(PERSON, false), CancelOutcome::Idle);

        let matcher = rig.matcher.clone();
        let attempt = tokio::spawn(async move { matcher.verify(PERSON, &REF.to_string()).await });
        states
            .wait_for(|s| *s == MatcherState::CaptureActive)
            .await
            .unwrap();

        assert_eq!(rig.matcher.cancel_attempt(OTHER, false), CancelOutcome::NotOwner);
        assert!(rig.matcher.is_busy());
        assert_eq!(rig.matcher.state(), MatcherState::CaptureActive);
        assert_eq!(rig.camera.active_tracks(), 1);

        assert_eq!(rig.matcher.cancel_attempt(PERSON, false), CancelOutcome::Cancelled);
        assert_eq!(attempt.await.unwrap(), Err(MatchFailure::Cancelled));
        assert_eq!(rig.camera.active_tracks(), 0);
        assert!(!rig.matcher.is_busy());
    }

    #[tokio::test]
    async fn test_admin_may_cancel_any_attempt() {
        let rig = rig(Some(0.2), CameraBehavior::Hang);
        let mut states = rig.matcher.subscribe();

        let matcher = rig.matcher.clone();
        let attempt = tokio::spawn(async move { matcher.verify(PERSON, &REF.to_string()).await });
        states
            .wait_for(|s| *s == MatcherState::CaptureActive)
            .await
            .unwrap();

        assert_eq!(rig.matcher.cancel_attempt(OTHER, true), CancelOutcome::Cancelled);
        assert_eq!(attempt.await.unwrap(), Err(MatchFailure::Cancelled));
        assert_eq!(rig.matcher.state(), MatcherState::Idle);
    }
}
