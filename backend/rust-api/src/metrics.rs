use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Session lifecycle
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "exam_sessions_active",
        "Number of seated, unfinished exam sessions"
    )
    .unwrap();

    pub static ref SEATS_CLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_seats_claimed_total",
        "Seat claim outcomes",
        &["outcome"]
    )
    .unwrap();

    pub static ref SESSIONS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_sessions_finished_total",
        "Finished sessions by trigger (explicit, timer, faculty, rejoin)",
        &["trigger"]
    )
    .unwrap();

    // Grading pipeline
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_submissions_total",
        "Submission attempts by final status",
        &["status"]
    )
    .unwrap();

    pub static ref GRADING_DURATION_SECONDS: Histogram = register_histogram!(
        "exam_grading_duration_seconds",
        "End-to-end grading duration per attempt",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    // External collaborators
    pub static ref SANDBOX_EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_sandbox_executions_total",
        "Sandbox executions by outcome (remote, local_fallback, error)",
        &["outcome"]
    )
    .unwrap();

    pub static ref JUDGE_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_judge_fallbacks_total",
        "Judgment backend fallbacks by operation",
        &["operation"]
    )
    .unwrap();
}

pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
