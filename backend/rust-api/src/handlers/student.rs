use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::EngineError;
use crate::extractors::{AppJson, StudentIdentity};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub exam_id: String,
    pub start_code: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaimSeatRequest {
    pub serial_number: u32,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub question_id: String,
    pub code: String,
}

pub async fn join_exam(
    State(state): State<AppState>,
    identity: StudentIdentity,
    AppJson(req): AppJson<JoinRequest>,
) -> Result<impl IntoResponse, EngineError> {
    tracing::info!(
        "student {} joining exam {}",
        identity.student_id,
        req.exam_id
    );
    let details = state
        .engine
        .join(&identity.student_id, &req.exam_id, &req.start_code)
        .await?;
    Ok(Json(details))
}

pub async fn claim_seat(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
    AppJson(req): AppJson<ClaimSeatRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let session = state
        .engine
        .claim_seat(&identity.student_id, &exam_id, req.serial_number)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "seat_number": session.seat_number,
            "assigned_questions": session.assigned_questions,
            "attempt_ends_at": session.attempt_ends_at,
            "duration_minutes": session.duration_minutes,
        })),
    ))
}

pub async fn get_assignment(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let session = state
        .engine
        .session_view(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(json!({
        "seat_number": session.seat_number,
        "assigned_questions": session.assigned_questions,
        "finished": session.finished,
    })))
}

pub async fn get_questions(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let questions = state
        .engine
        .assigned_questions(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(questions))
}

pub async fn submit_code(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
    AppJson(req): AppJson<CodeRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let attempt_id = state
        .engine
        .submit(&identity.student_id, &exam_id, &req.question_id, &req.code)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "attempt_id": attempt_id,
            "status": "processing",
        })),
    ))
}

pub async fn auto_save_code(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
    AppJson(req): AppJson<CodeRequest>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .engine
        .auto_save(&identity.student_id, &exam_id, &req.question_id, &req.code)
        .await?;
    Ok(Json(json!({ "saved": true })))
}

pub async fn get_timer(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let timer = state
        .engine
        .remaining_time(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(timer))
}

pub async fn get_saved_code(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path((exam_id, question_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, EngineError> {
    let code = state
        .engine
        .saved_code(&identity.student_id, &exam_id, &question_id)
        .await?;
    Ok(Json(json!({ "question_id": question_id, "code": code })))
}

pub async fn get_session(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let session = state
        .engine
        .session_view(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(session))
}

pub async fn get_submissions(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let attempts = state
        .engine
        .submissions(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(attempts))
}

pub async fn finish_exam(
    State(state): State<AppState>,
    identity: StudentIdentity,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let session = state
        .engine
        .finish(&identity.student_id, &exam_id)
        .await?;
    Ok(Json(json!({
        "finished": session.finished,
        "attempts": session.attempts.len(),
    })))
}
