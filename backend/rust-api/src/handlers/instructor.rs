use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::error::EngineError;
use crate::extractors::AppJson;
use crate::models::{Exam, StudentProfile};
use crate::services::AppState;

/// Force-finishes every active session of an exam, implicitly submitting any
/// buffered code.
pub async fn close_exam(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let finished = state.engine.finish_all_for_exam(&exam_id).await?;
    Ok(Json(json!({ "finished_sessions": finished })))
}

pub async fn assignment_feasibility(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let report = state.engine.assignment_feasibility(&exam_id).await?;
    Ok(Json(report))
}

pub async fn delete_sessions(
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let removed = state.engine.delete_sessions_for_exam(&exam_id).await?;
    Ok(Json(json!({ "deleted_sessions": removed })))
}

/// Clears one student's session so they can claim a seat again. Used when a
/// machine dies mid-exam.
pub async fn reset_student(
    State(state): State<AppState>,
    Path((exam_id, student_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .engine
        .reset_student_attempt(&exam_id, &student_id)
        .await?;
    tracing::info!("reset session of student {} in exam {}", student_id, exam_id);
    Ok(Json(json!({ "reset": true })))
}

pub async fn upsert_exam(
    State(state): State<AppState>,
    AppJson(exam): AppJson<Exam>,
) -> Result<impl IntoResponse, EngineError> {
    let exam_id = exam.exam_id.clone();
    state.engine.upsert_exam(exam).await?;
    Ok(Json(json!({ "exam_id": exam_id })))
}

pub async fn upsert_student(
    State(state): State<AppState>,
    AppJson(profile): AppJson<StudentProfile>,
) -> Result<impl IntoResponse, EngineError> {
    let student_id = profile.student_id.clone();
    state.engine.upsert_student(profile).await?;
    Ok(Json(json!({ "student_id": student_id })))
}
