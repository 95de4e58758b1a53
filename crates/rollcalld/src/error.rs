use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use rollcall_core::roster::RosterError;
use rollcall_core::Day;
use rollcall_embed::EmbedError;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Every failure a scan, finalize or registration can surface to a caller.
#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("face service timeout: {0}")]
    Timeout(String),
    #[error("face service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("face service returned an unusable response: {0}")]
    MalformedResponse(String),
    #[error("attendance finalized for {0}; no further scans allowed")]
    DayFinalized(Day),
    #[error("attendance already marked today for {student_id}")]
    AlreadyMarkedToday {
        student_id: String,
        marked_at: Option<DateTime<Utc>>,
    },
    #[error("image too blurred or low contrast (variance {variance:.2})")]
    LowQualityImage { variance: f64 },
    #[error("face not detected; try a clear face image")]
    NoFaceDetected,
    #[error("attendance for {0} is already finalized")]
    AlreadyFinalized(Day),
    #[error("student {0} not found")]
    NotFound(String),
    #[error("face already registered for {0}")]
    AlreadyRegistered(String),
    #[error("register number {0} already exists")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; the same request may succeed later.
    Retry,
    /// Ask for a better image.
    Retake,
    /// Nothing more can happen for this request today.
    Final,
    /// The request itself must change.
    Fix,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Retry => "retry",
            Disposition::Retake => "retake",
            Disposition::Final => "final",
            Disposition::Fix => "fix",
        }
    }
}

impl AttendanceError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttendanceError::BadInput(_) => "bad_input",
            AttendanceError::Timeout(_) => "timeout",
            AttendanceError::ServiceUnavailable(_) => "service_unavailable",
            AttendanceError::MalformedResponse(_) => "malformed_response",
            AttendanceError::DayFinalized(_) => "day_finalized",
            AttendanceError::AlreadyMarkedToday { .. } => "already_marked_today",
            AttendanceError::LowQualityImage { .. } => "low_quality_image",
            AttendanceError::NoFaceDetected => "no_face_detected",
            AttendanceError::AlreadyFinalized(_) => "already_finalized",
            AttendanceError::NotFound(_) => "not_found",
            AttendanceError::AlreadyRegistered(_) => "already_registered",
            AttendanceError::Conflict(_) => "conflict",
            AttendanceError::Internal(_) => "internal",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            AttendanceError::Timeout(_)
            | AttendanceError::ServiceUnavailable(_)
            | AttendanceError::MalformedResponse(_)
            | AttendanceError::Internal(_) => Disposition::Retry,
            AttendanceError::LowQualityImage { .. } | AttendanceError::NoFaceDetected => {
                Disposition::Retake
            }
            AttendanceError::DayFinalized(_)
            | AttendanceError::AlreadyMarkedToday { .. }
            | AttendanceError::AlreadyFinalized(_)
            | AttendanceError::AlreadyRegistered(_) => Disposition::Final,
            AttendanceError::BadInput(_)
            | AttendanceError::NotFound(_)
            | AttendanceError::Conflict(_) => Disposition::Fix,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AttendanceError::BadInput(_) => StatusCode::BAD_REQUEST,
            AttendanceError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AttendanceError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AttendanceError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            AttendanceError::DayFinalized(_) => StatusCode::LOCKED,
            AttendanceError::AlreadyMarkedToday { .. }
            | AttendanceError::AlreadyFinalized(_)
            | AttendanceError::AlreadyRegistered(_)
            | AttendanceError::Conflict(_) => StatusCode::CONFLICT,
            AttendanceError::LowQualityImage { .. } | AttendanceError::NoFaceDetected => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AttendanceError::NotFound(_) => StatusCode::NOT_FOUND,
            AttendanceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EmbedError> for AttendanceError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::Timeout(msg) => AttendanceError::Timeout(msg),
            EmbedError::ServiceUnavailable(msg) => AttendanceError::ServiceUnavailable(msg),
            EmbedError::BadInput(msg) => AttendanceError::BadInput(msg),
            EmbedError::NoFaceDetected => AttendanceError::NoFaceDetected,
            EmbedError::MalformedResponse(msg) => AttendanceError::MalformedResponse(msg),
        }
    }
}

impl From<StoreError> for AttendanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateStudent(reg_no) => AttendanceError::Conflict(reg_no),
            StoreError::StudentNotFound(reg_no) => AttendanceError::NotFound(reg_no),
            StoreError::FaceAlreadyRegistered(reg_no) => AttendanceError::AlreadyRegistered(reg_no),
            StoreError::AlreadyMarked {
                student_id,
                marked_at,
            } => AttendanceError::AlreadyMarkedToday {
                student_id,
                marked_at,
            },
            StoreError::DayFinalized(day) => AttendanceError::DayFinalized(day),
            StoreError::AlreadyFinalized(day) => AttendanceError::AlreadyFinalized(day),
            other @ (StoreError::Database(_) | StoreError::Io(_) | StoreError::Encode(_)) => {
                AttendanceError::Internal(other.to_string())
            }
        }
    }
}

impl From<RosterError> for AttendanceError {
    fn from(err: RosterError) -> Self {
        AttendanceError::BadInput(err.to_string())
    }
}

impl IntoResponse for AttendanceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::info!(error = %self, kind = self.kind(), "request rejected");
        }

        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "action": self.disposition().as_str(),
        });
        match &self {
            AttendanceError::AlreadyMarkedToday { student_id, marked_at } => {
                body["studentId"] = json!(student_id);
                body["markedAt"] = json!(marked_at);
            }
            AttendanceError::LowQualityImage { variance } => {
                body["variance"] = json!(variance);
                body["matched"] = json!(false);
            }
            AttendanceError::DayFinalized(day) | AttendanceError::AlreadyFinalized(day) => {
                body["date"] = json!(day);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}
