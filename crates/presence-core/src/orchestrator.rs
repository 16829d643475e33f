//! Attendance submission: geofence gate, then biometric gate, then record.

use crate::geofence::{self, GeofenceError};
use crate::matcher::{FaceMatcher, MatchFailure};
use crate::store::{AttendanceStore, StoreError};
use crate::types::{
    AttendanceClaim, AttendanceEvent, ImageRef, NewAttendanceEvent, PersonId, SessionContext,
    VerificationOutcome, ZoneId,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("invalid coordinates: ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),
    #[error("outside allowed area: {distance_meters:.1} m from zone center, allowed radius {radius_meters:.1} m")]
    OutsideZone {
        distance_meters: f64,
        radius_meters: f64,
    },
    #[error("no reference face image registered; upload one in your profile")]
    NoReferenceImage,
    #[error("face does not match the reference image (distance {distance:.4}, threshold {threshold})")]
    BiometricMismatch { distance: f32, threshold: f32 },
    #[error(transparent)]
    Biometric(#[from] MatchFailure),
    #[error("face verification timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl VerificationError {
    /// Stable machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCoordinates { .. } => "invalid_coordinates",
            Self::ZoneNotFound(_) => "zone_not_found",
            Self::OutsideZone { .. } => "outside_zone",
            Self::NoReferenceImage => "no_reference_image",
            Self::BiometricMismatch { .. } => "biometric_mismatch",
            Self::Biometric(failure) => failure.code(),
            Self::Timeout(_) => "verification_timeout",
            Self::Storage(_) => "storage_error",
        }
    }
}

/// Runs one verification attempt per submission and records it on success.
pub struct Orchestrator {
    store: Arc<dyn AttendanceStore>,
    matcher: Arc<FaceMatcher>,
    verify_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn AttendanceStore>, matcher: Arc<FaceMatcher>) -> Self {
        Self {
            store,
            matcher,
            verify_timeout: None,
        }
    }

    /// Bound the biometric gate. On expiry the attempt future is dropped,
    /// which releases the camera and returns the matcher to `Idle`.
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.store
    }

    pub fn matcher(&self) -> &Arc<FaceMatcher> {
        &self.matcher
    }

    /// Verify `claim` for the caller in `session` and append the event.
    ///
    /// Input and geofence checks run before any model or camera work. The
    /// store's `create_event` is called at most once, and only after a match.
    pub async fn submit_attendance(
        &self,
        session: &SessionContext,
        claim: AttendanceClaim,
    ) -> Result<AttendanceEvent, VerificationError> {
        let person_id = session.person_id;
        let (latitude, longitude) = (claim.claimed_latitude, claim.claimed_longitude);

        if !geofence::is_valid_coordinate(latitude, longitude) {
            tracing::warn!(person_id, latitude, longitude, "rejected: invalid coordinates");
            return Err(VerificationError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }

        let zone = self
            .store
            .find_zone(claim.zone_id)
            .await?
            .ok_or(VerificationError::ZoneNotFound(claim.zone_id))?;

        let check = geofence::is_within_zone(latitude, longitude, &zone).map_err(|e| match e {
            GeofenceError::InvalidCoordinates {
                latitude,
                longitude,
            } => VerificationError::InvalidCoordinates {
                latitude,
                longitude,
            },
            GeofenceError::InvalidZone { .. } => StoreError::Corrupt(e.to_string()).into(),
        })?;

        if !check.inside {
            tracing::warn!(
                person_id,
                zone_id = zone.id,
                distance_m = check.distance_meters,
                radius_m = zone.radius_meters,
                "rejected: outside zone"
            );
            return Err(VerificationError::OutsideZone {
                distance_meters: check.distance_meters,
                radius_meters: zone.radius_meters,
            });
        }
        tracing::debug!(
            person_id,
            zone_id = zone.id,
            distance_m = check.distance_meters,
            "geofence passed"
        );

        let reference = self
            .store
            .reference_image(person_id)
            .await?
            .ok_or(VerificationError::NoReferenceImage)?;

        let outcome = self.verify_face(person_id, &reference).await?;
        if !outcome.matched {
            tracing::warn!(
                person_id,
                distance = outcome.distance,
                threshold = outcome.threshold,
                "rejected: biometric mismatch"
            );
            return Err(VerificationError::BiometricMismatch {
                distance: outcome.distance,
                threshold: outcome.threshold,
            });
        }

        let event = self
            .store
            .create_event(NewAttendanceEvent {
                person_id,
                zone_id: zone.id,
                check_type: claim.check_type,
                session_type: claim.session_type,
                latitude,
                longitude,
                verified: true,
                timestamp: Utc::now(),
            })
            .await?;

        tracing::info!(
            event_id = event.id,
            person_id,
            zone_id = zone.id,
            check_type = event.check_type.as_str(),
            session_type = event.session_type.as_str(),
            "attendance recorded"
        );
        Ok(event)
    }

    async fn verify_face(
        &self,
        person_id: PersonId,
        reference: &ImageRef,
    ) -> Result<VerificationOutcome, VerificationError> {
        let attempt = self.matcher.verify(person_id, reference);
        let Some(limit) = self.verify_timeout else {
            return Ok(attempt.await?);
        };
        match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => {
                tracing::warn!(person_id, timeout = ?limit, "rejected: verification timed out");
                Err(VerificationError::Timeout(limit))
            }
        }
    }
}
