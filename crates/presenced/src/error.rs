use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use presence_core::{MatchFailure, StoreError, VerificationError};
use serde_json::{json, Value};

/// Every error leaves the API as `{ "error": <message>, "code": <reason>, ...diagnostics }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Verification(e) => e.code(),
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Verification(e) => match e {
                VerificationError::InvalidCoordinates { .. } => StatusCode::BAD_REQUEST,
                VerificationError::ZoneNotFound(_) => StatusCode::NOT_FOUND,
                VerificationError::OutsideZone { .. }
                | VerificationError::BiometricMismatch { .. } => StatusCode::FORBIDDEN,
                VerificationError::NoReferenceImage => StatusCode::PRECONDITION_FAILED,
                VerificationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                VerificationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                VerificationError::Biometric(failure) => match failure {
                    MatchFailure::NoFaceDetected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    MatchFailure::AttemptInProgress | MatchFailure::Cancelled => {
                        StatusCode::CONFLICT
                    }
                    MatchFailure::ModelLoad(_) | MatchFailure::CaptureUnavailable(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    MatchFailure::ReferenceUnavailable(_) | MatchFailure::Extraction(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                },
            },
        }
    }

    fn body(&self) -> Value {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        let Self::Verification(e) = self else {
            return body;
        };
        let extra = match e {
            VerificationError::OutsideZone {
                distance_meters,
                radius_meters,
            } => json!({ "distance": distance_meters, "allowedRadius": radius_meters }),
            VerificationError::BiometricMismatch {
                distance,
                threshold,
            } => json!({ "distance": distance, "threshold": threshold }),
            VerificationError::Biometric(MatchFailure::NoFaceDetected(side)) => {
                json!({ "side": side })
            }
            VerificationError::Timeout(after) => json!({ "timeoutSecs": after.as_secs() }),
            VerificationError::ZoneNotFound(zone_id) => json!({ "locationId": zone_id }),
            _ => return body,
        };
        if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
            body.extend(extra);
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::FaceSide;
    use std::time::Duration;

    fn verification(e: VerificationError) -> ApiError {
        ApiError::Verification(e)
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                verification(VerificationError::InvalidCoordinates {
                    latitude: f64::NAN,
                    longitude: 0.0,
                }),
                StatusCode::BAD_REQUEST,
            ),
            (verification(VerificationError::ZoneNotFound(9)), StatusCode::NOT_FOUND),
            (
                verification(VerificationError::NoReferenceImage),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                verification(MatchFailure::NoFaceDetected(FaceSide::Live).into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                verification(MatchFailure::AttemptInProgress.into()),
                StatusCode::CONFLICT,
            ),
            (
                verification(MatchFailure::CaptureUnavailable("busy".into()).into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                verification(VerificationError::Timeout(Duration::from_secs(15))),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ApiError::Storage(StoreError::Database("locked".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::Unauthorized("Unauthorized".into()), StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("Forbidden".into()), StatusCode::FORBIDDEN),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err.code());
        }
    }

    #[test]
    fn test_outside_zone_body_carries_diagnostics() {
        let body = verification(VerificationError::OutsideZone {
            distance_meters: 4860.5,
            radius_meters: 200.0,
        })
        .body();
        assert_eq!(body["code"], "outside_zone");
        assert_eq!(body["distance"], 4860.5);
        assert_eq!(body["allowedRadius"], 200.0);
        assert!(body["error"].as_str().unwrap().contains("outside allowed area"));
    }

    #[test]
    fn test_no_face_body_names_side() {
        let body = verification(MatchFailure::NoFaceDetected(FaceSide::Reference).into()).body();
        assert_eq!(body["code"], "no_face_detected");
        assert_eq!(body["side"], "reference");
    }
}
