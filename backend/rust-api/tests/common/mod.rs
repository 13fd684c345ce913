#![allow(dead_code)]

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;

use labsense_api::config::{Config, JudgeProvider};
use labsense_api::models::{Exam, Question, StudentProfile, TestCase};
use labsense_api::storage::MemorySnapshotStore;
use labsense_api::{create_router, AppState};

/// In-memory configuration: no sandbox, no judgment backend, so grading runs
/// the local executor and deterministic fallbacks only.
pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: "unused".to_string(),
        sandbox_url: None,
        sandbox_api_key: None,
        judge_provider: JudgeProvider::None,
        judge_url: String::new(),
        judge_model: String::new(),
        openai_api_key: None,
        anthropic_api_key: None,
        gemini_api_key: None,
        grading_concurrency: 4,
        grading_deadline_secs: 30,
        default_max_serial: 50,
    }
}

pub async fn test_state() -> AppState {
    let state = AppState::new(test_config(), Arc::new(MemorySnapshotStore::default()));
    state.engine.load().await.unwrap();
    state
}

pub async fn test_app(state: AppState) -> Router {
    create_router(state)
}

pub fn question(id: &str, cases: Vec<TestCase>) -> Question {
    Question {
        question_id: id.to_string(),
        text: format!("Problem {}", id),
        ideal_solution: "print(int(input()) * 2)".to_string(),
        test_cases: cases,
    }
}

pub fn public_case(input: &str, expected: &str) -> TestCase {
    TestCase {
        input: input.to_string(),
        expected_output: expected.to_string(),
        is_public: true,
    }
}

/// Exam with four questions and two per student: the smallest pool the
/// advisory feasibility formula accepts for adjacency-free assignment.
pub fn exam_fixture(exam_id: &str) -> Exam {
    Exam {
        exam_id: exam_id.to_string(),
        subject_name: "Data Structures".to_string(),
        language: "python".to_string(),
        is_live: true,
        start_code: "OPEN123".to_string(),
        duration_minutes: 60,
        questions: vec![
            question("qa", vec![]),
            question("qb", vec![]),
            question("qc", vec![]),
            question("qd", vec![]),
        ],
        questions_per_student: 2,
        tenant_id: None,
        layout: None,
    }
}

pub fn student_fixture(student_id: &str, tenant: Option<&str>) -> StudentProfile {
    StudentProfile {
        student_id: student_id.to_string(),
        tenant_id: tenant.map(str::to_string),
        department_id: Some("dep-cs".to_string()),
        department_name: Some("Computer Science".to_string()),
        section_id: Some("sec-a".to_string()),
        section_name: Some("Section A".to_string()),
        cohort_year: Some(2027),
    }
}

pub async fn seed(state: &AppState, exam: Exam, students: &[StudentProfile]) {
    state.engine.upsert_exam(exam).await.unwrap();
    for profile in students {
        state.engine.upsert_student(profile.clone()).await.unwrap();
    }
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    student_id: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    use tower::ServiceExt;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(id) = student_id {
        builder = builder.header("x-student-id", id);
    }
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };

    app.clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}
