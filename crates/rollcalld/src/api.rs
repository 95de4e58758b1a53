//! HTTP API under `/api`.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rollcall_core::roster::{normalize_reg_no, CATEGORIES, COLLEGES};
use rollcall_core::{Day, LeaveStatus, Month, NewStudent, StudentUpdate};
use rollcall_embed::Embedder;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::day::DayLedger;
use crate::error::AttendanceError;
use crate::pipeline::{AttendancePipeline, ScanOutcome, ScanSettings};
use crate::reports;
use crate::store::{Store, StoreError, StudentFilter};

/// Header carrying the acting operator's identity.
pub const OPERATOR_HEADER: &str = "x-operator";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub store: Store,
    pub ledger: DayLedger,
    pub pipeline: AttendancePipeline,
    pub embedder: Arc<dyn Embedder>,
}

impl AppState {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, settings: ScanSettings) -> Self {
        Self {
            ledger: DayLedger::new(store.clone()),
            pipeline: AttendancePipeline::new(store.clone(), embedder.clone(), settings),
            store,
            embedder,
        }
    }
}

type Shared = State<Arc<AppState>>;
type ApiResult<T = Json<Value>> = Result<T, AttendanceError>;

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/attendance/scan", post(scan))
        .route("/attendance/finalize", post(finalize))
        .route("/attendance/status", get(day_status))
        .route("/attendance/pending", get(pending))
        .route("/attendance/today", get(today_report))
        .route("/attendance/date/{date}", get(date_report))
        .route("/attendance/month/{month}", get(month_report))
        .route("/attendance/history/{reg_no}", get(student_history))
        .route("/students", post(create_student).get(list_students))
        .route("/students/bulk", post(bulk_create_students))
        .route("/students/count", get(count_students))
        .route("/students/categories", get(categories))
        .route("/students/colleges", get(colleges))
        .route(
            "/students/{reg_no}",
            get(get_student).patch(update_student).delete(delete_student),
        )
        .route("/students/{reg_no}/leave", patch(set_leave))
        .route("/students/{reg_no}/face", post(register_face))
        .route("/health", get(health));

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Operator identity from the `x-operator` header.
pub struct Operator(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Operator {
    type Rejection = AttendanceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OPERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Operator(v.to_string()))
            .ok_or_else(|| AttendanceError::BadInput(format!("{OPERATOR_HEADER} header is required")))
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AttendanceError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AttendanceError::BadInput(e.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AttendanceError> {
    params
        .map(|Query(v)| v)
        .map_err(|e| AttendanceError::BadInput(e.body_text()))
}

#[derive(Deserialize)]
struct ImageRequest {
    #[serde(rename = "imageBase64", alias = "image")]
    image: String,
}

/// Decode a base64 payload, tolerating a `data:image/...;base64,` prefix.
fn decode_image(raw: &str) -> Result<Vec<u8>, AttendanceError> {
    let data = raw.split_once(";base64,").map_or(raw, |(_, d)| d).trim();
    if data.is_empty() {
        return Err(AttendanceError::BadInput("image is required".into()));
    }
    STANDARD
        .decode(data)
        .map_err(|e| AttendanceError::BadInput(format!("image is not valid base64: {e}")))
}

// --- attendance ---

async fn scan(
    State(state): Shared,
    Operator(operator): Operator,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> ApiResult {
    let image = decode_image(&body(payload)?.image)?;
    let now = Utc::now();

    let response = match state.pipeline.scan(&image, &operator, now).await? {
        ScanOutcome::Marked(marked) => json!({
            "matched": true,
            "success": true,
            "message": format!("Attendance marked for {}", marked.student.name),
            "confidence": marked.score,
            "timestamp": now,
            "student": {
                "studentId": marked.student.reg_no,
                "name": marked.student.name,
                "roomNo": marked.student.room_no,
                "dept": marked.student.dept,
            },
            "attendance": {
                "date": marked.record.date,
                "time": marked.record.time,
                "status": marked.record.status,
            },
        }),
        ScanOutcome::NoMatch { score, compared } => json!({
            "matched": false,
            "success": false,
            "message": "Face not recognized",
            "confidence": score,
            "compared": compared,
        }),
    };
    Ok(Json(response))
}

async fn finalize(State(state): Shared, Operator(operator): Operator) -> ApiResult {
    let now = Utc::now();
    let summary = state.ledger.finalize(Day::of(now), &operator, now).await?;
    Ok(Json(json!({
        "message": format!("Attendance finalized for {}", summary.date),
        "date": summary.date,
        "finalizedAt": summary.finalized_at,
        "finalizedBy": operator,
        "absentCount": summary.absent.len(),
        "absent": summary.absent,
    })))
}

async fn day_status(State(state): Shared) -> ApiResult {
    let status = state.ledger.status(Day::of(Utc::now())).await?;
    Ok(Json(json!(status)))
}

async fn pending(State(state): Shared) -> ApiResult {
    let now = Utc::now();
    let today = Day::of(now);
    let students = state.store.pending(today, now).await?;
    Ok(Json(json!({
        "date": today,
        "count": students.len(),
        "students": students,
    })))
}

async fn today_report(State(state): Shared) -> ApiResult {
    let now = Utc::now();
    Ok(Json(json!(reports::daily(&state.store, Day::of(now), now).await?)))
}

async fn date_report(State(state): Shared, Path(date): Path<String>) -> ApiResult {
    let date: Day = date.parse()?;
    Ok(Json(json!(reports::daily(&state.store, date, Utc::now()).await?)))
}

async fn month_report(State(state): Shared, Path(month): Path<String>) -> ApiResult {
    let month: Month = month.parse()?;
    Ok(Json(json!(reports::monthly(&state.store, month, Utc::now()).await?)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    month: Option<String>,
}

async fn student_history(
    State(state): Shared,
    Path(reg_no): Path<String>,
    params: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult {
    let month = query(params)?
        .month
        .map(|m| m.parse::<Month>())
        .transpose()?;
    let history = reports::history(&state.store, &normalize_reg_no(&reg_no), month).await?;
    Ok(Json(json!(history)))
}

// --- students ---

async fn create_student(
    State(state): Shared,
    payload: Result<Json<NewStudent>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let new = body(payload)?.validated()?;
    let student = state.store.insert_student(new, Utc::now()).await?;
    tracing::info!(reg_no = %student.reg_no, "student enrolled");
    Ok((StatusCode::CREATED, Json(json!(student))))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BulkRequest {
    Rows(Vec<Value>),
    Wrapped { students: Vec<Value> },
}

/// Enroll many students; rows that fail are reported, not fatal.
async fn bulk_create_students(
    State(state): Shared,
    payload: Result<Json<BulkRequest>, JsonRejection>,
) -> ApiResult {
    let rows = match body(payload)? {
        BulkRequest::Rows(rows) | BulkRequest::Wrapped { students: rows } => rows,
    };
    if rows.is_empty() {
        return Err(AttendanceError::BadInput("no student rows provided".into()));
    }

    let now = Utc::now();
    let mut created = Vec::new();
    let mut failed = Vec::new();
    for (index, row) in rows.into_iter().enumerate() {
        let new = match serde_json::from_value::<NewStudent>(row) {
            Ok(new) => new,
            Err(_) => {
                failed.push(json!({ "row": index, "reason": "missing required fields" }));
                continue;
            }
        };
        let new = match new.validated() {
            Ok(new) => new,
            Err(e) => {
                failed.push(json!({ "row": index, "reason": e.to_string() }));
                continue;
            }
        };
        match state.store.insert_student(new, now).await {
            Ok(student) => created.push(student.reg_no),
            Err(StoreError::DuplicateStudent(reg_no)) => failed.push(json!({
                "row": index,
                "regNo": reg_no,
                "reason": "duplicate regNo",
            })),
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(created = created.len(), failed = failed.len(), "bulk enrollment finished");
    Ok(Json(json!({
        "createdCount": created.len(),
        "created": created,
        "failed": failed,
    })))
}

async fn categories() -> Json<&'static [&'static str]> {
    Json(CATEGORIES)
}

async fn colleges() -> Json<&'static [&'static str]> {
    Json(COLLEGES)
}

async fn list_students(
    State(state): Shared,
    params: Result<Query<StudentFilter>, QueryRejection>,
) -> ApiResult {
    let students = state.store.list_students(&query(params)?).await?;
    Ok(Json(json!(students)))
}

async fn count_students(State(state): Shared) -> ApiResult {
    let (total, registered) = state.store.count_students().await?;
    Ok(Json(json!({
        "total": total,
        "faceRegistered": registered,
        "facePending": total - registered,
    })))
}

async fn get_student(State(state): Shared, Path(reg_no): Path<String>) -> ApiResult {
    let reg_no = normalize_reg_no(&reg_no);
    let student = state
        .store
        .get_student(&reg_no)
        .await?
        .ok_or(AttendanceError::NotFound(reg_no))?;
    Ok(Json(json!(student)))
}

async fn update_student(
    State(state): Shared,
    Path(reg_no): Path<String>,
    payload: Result<Json<StudentUpdate>, JsonRejection>,
) -> ApiResult {
    let update = body(payload)?.validated()?;
    let student = state
        .store
        .update_student(&normalize_reg_no(&reg_no), update)
        .await?;
    tracing::info!(reg_no = %student.reg_no, "student updated");
    Ok(Json(json!(student)))
}

async fn delete_student(State(state): Shared, Path(reg_no): Path<String>) -> ApiResult {
    let reg_no = normalize_reg_no(&reg_no);
    if !state.store.delete_student(&reg_no).await? {
        return Err(AttendanceError::NotFound(reg_no));
    }
    tracing::info!(reg_no = %reg_no, "student removed");
    Ok(Json(json!({ "message": format!("Student {reg_no} deleted") })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRequest {
    leave_status: LeaveStatus,
    leave_until: Option<DateTime<Utc>>,
}

async fn set_leave(
    State(state): Shared,
    Path(reg_no): Path<String>,
    payload: Result<Json<LeaveRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let student = state
        .store
        .set_leave(&normalize_reg_no(&reg_no), req.leave_status, req.leave_until)
        .await?;
    tracing::info!(
        reg_no = %student.reg_no,
        leave_status = student.leave_status.as_str(),
        "leave updated"
    );
    Ok(Json(json!(student)))
}

async fn register_face(
    State(state): Shared,
    Operator(operator): Operator,
    Path(reg_no): Path<String>,
    payload: Result<Json<ImageRequest>, JsonRejection>,
) -> ApiResult {
    let image = decode_image(&body(payload)?.image)?;
    let student = state.pipeline.register_face(&reg_no, &image).await?;
    tracing::info!(reg_no = %student.reg_no, operator = %operator, "face registration accepted");
    Ok(Json(json!({
        "message": "Face registered successfully",
        "student": student,
    })))
}

async fn health(State(state): Shared) -> ApiResult {
    let face_service = state.embedder.is_healthy().await;
    let (total, registered) = state.store.count_students().await?;
    Ok(Json(json!({
        "status": "ok",
        "faceService": if face_service { "up" } else { "down" },
        "students": total,
        "faceRegistered": registered,
        "similarityThreshold": state.pipeline.settings().similarity_threshold,
    })))
}
