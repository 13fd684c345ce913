use std::time::Duration;

use labsense_api::error::EngineError;
use labsense_api::models::AttemptStatus;

mod common;

#[tokio::test]
async fn join_requires_live_exam_and_start_code() {
    let state = common::test_state().await;
    let mut exam = common::exam_fixture("exam-1");
    exam.is_live = false;
    common::seed(&state, exam, &[common::student_fixture("s1", None)]).await;

    let err = state
        .engine
        .join("s1", "exam-1", "OPEN123")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    let mut exam = common::exam_fixture("exam-1");
    exam.is_live = true;
    state.engine.upsert_exam(exam).await.unwrap();

    let err = state
        .engine
        .join("s1", "exam-1", "WRONG")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    let details = state.engine.join("s1", "exam-1", "OPEN123").await.unwrap();
    assert_eq!(details.questions_per_student, 2);
}

#[tokio::test]
async fn tenant_scope_is_enforced() {
    let state = common::test_state().await;
    let mut exam = common::exam_fixture("exam-1");
    exam.tenant_id = Some("college-a".to_string());
    common::seed(
        &state,
        exam,
        &[
            common::student_fixture("insider", Some("college-a")),
            common::student_fixture("outsider", Some("college-b")),
        ],
    )
    .await;

    assert!(state.engine.join("insider", "exam-1", "OPEN123").await.is_ok());
    let err = state
        .engine
        .join("outsider", "exam-1", "OPEN123")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[tokio::test]
async fn seat_claim_assigns_questions_and_captures_snapshot() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    let session = state.engine.claim_seat("s1", "exam-1", 5).await.unwrap();
    assert_eq!(session.seat_number, Some(5));
    assert_eq!(session.assigned_questions.len(), 2);
    assert!(session.attempt_ends_at.is_some());
    assert_eq!(
        session.org_snapshot.department_name.as_deref(),
        Some("Computer Science")
    );
}

#[tokio::test]
async fn duplicate_seat_claim_is_rejected() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[
            common::student_fixture("s1", None),
            common::student_fixture("s2", None),
        ],
    )
    .await;

    state.engine.claim_seat("s1", "exam-1", 3).await.unwrap();
    let err = state.engine.claim_seat("s2", "exam-1", 3).await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[tokio::test]
async fn concurrent_claims_for_one_seat_grant_exactly_one() {
    let state = common::test_state().await;
    let students: Vec<_> = (0..10)
        .map(|i| common::student_fixture(&format!("s{}", i), None))
        .collect();
    common::seed(&state, common::exam_fixture("exam-1"), &students).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = state.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.claim_seat(&format!("s{}", i), "exam-1", 7).await
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn adjacent_seats_get_disjoint_questions() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[
            common::student_fixture("s1", None),
            common::student_fixture("s2", None),
        ],
    )
    .await;

    let first = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let second = state.engine.claim_seat("s2", "exam-1", 2).await.unwrap();

    for q in &second.assigned_questions {
        assert!(
            !first.assigned_questions.contains(q),
            "adjacent seats share question {}",
            q
        );
    }
}

#[tokio::test]
async fn rejoin_after_claim_is_rejected() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let err = state.engine.join("s1", "exam-1", "OPEN123").await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    let err = state.engine.claim_seat("s1", "exam-1", 2).await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[tokio::test]
async fn rejected_rejoin_finishes_the_prior_session() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    let session = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let question = session.assigned_questions[0].clone();
    state
        .engine
        .auto_save("s1", "exam-1", &question, "print('draft')")
        .await
        .unwrap();

    let err = state.engine.join("s1", "exam-1", "OPEN123").await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    // The prior session must not survive the rejection: it is finished and
    // its buffered draft becomes an implicit submission.
    let view = state.engine.session_view("s1", "exam-1").await.unwrap();
    assert!(view.finished);
    assert_eq!(view.attempts.len(), 1);
    assert_eq!(view.attempts[0].question_id, question);
    assert!(view.attempts[0].is_final);

    // A later join sees the completed session.
    let err = state.engine.join("s1", "exam-1", "OPEN123").await.unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[tokio::test]
async fn submit_rejects_unassigned_question_and_finished_session() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    let session = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let unassigned = ["qa", "qb", "qc", "qd"]
        .iter()
        .find(|q| !session.assigned_questions.iter().any(|a| a == *q))
        .unwrap();

    let err = state
        .engine
        .submit("s1", "exam-1", unassigned, "print(1)")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    state.engine.finish("s1", "exam-1").await.unwrap();
    let err = state
        .engine
        .submit("s1", "exam-1", &session.assigned_questions[0], "print(1)")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[tokio::test]
async fn finish_is_idempotent_and_submits_buffered_code() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    let session = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let question = session.assigned_questions[0].clone();

    state
        .engine
        .auto_save("s1", "exam-1", &question, "print('draft')")
        .await
        .unwrap();

    let finished = state.engine.finish("s1", "exam-1").await.unwrap();
    assert!(finished.finished);
    assert_eq!(finished.attempts.len(), 1);
    assert_eq!(finished.attempts[0].question_id, question);
    assert!(finished.attempts[0].is_final);

    // Second finish must not create another implicit attempt.
    let again = state.engine.finish("s1", "exam-1").await.unwrap();
    assert_eq!(again.attempts.len(), 1);
}

#[tokio::test]
async fn zero_duration_exam_expires_lazily() {
    let state = common::test_state().await;
    let mut exam = common::exam_fixture("exam-1");
    exam.duration_minutes = 0;
    common::seed(&state, exam, &[common::student_fixture("s1", None)]).await;

    let session = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let question = session.assigned_questions[0].clone();

    // Timer read applies the expiry and finishes the session.
    let timer = state.engine.remaining_time("s1", "exam-1").await.unwrap();
    assert_eq!(timer.remaining_seconds, 0);
    assert!(timer.finished);

    let err = state
        .engine
        .submit("s1", "exam-1", &question, "print(1)")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));

    let view = state.engine.session_view("s1", "exam-1").await.unwrap();
    assert!(view.finished);
}

#[tokio::test]
async fn session_and_draft_reads_apply_lazy_expiry() {
    let state = common::test_state().await;
    let mut exam = common::exam_fixture("exam-1");
    exam.duration_minutes = 0;
    common::seed(
        &state,
        exam,
        &[
            common::student_fixture("s1", None),
            common::student_fixture("s2", None),
        ],
    )
    .await;

    // Reading the session alone, with no prior timer call, must finish the
    // expired attempt instead of reporting it as still running.
    state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let view = state.engine.session_view("s1", "exam-1").await.unwrap();
    assert!(view.finished);

    // The draft read path applies the same expiry.
    let session = state.engine.claim_seat("s2", "exam-1", 2).await.unwrap();
    let question = session.assigned_questions[0].clone();
    let draft = state
        .engine
        .saved_code("s2", "exam-1", &question)
        .await
        .unwrap();
    assert_eq!(draft, "");
    let view = state.engine.session_view("s2", "exam-1").await.unwrap();
    assert!(view.finished);
}

#[tokio::test]
async fn submission_is_graded_in_background() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    let session = state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let question = session.assigned_questions[0].clone();

    let attempt_id = state
        .engine
        .submit("s1", "exam-1", &question, "print('answer')")
        .await
        .unwrap();
    assert!(!attempt_id.is_empty());

    let mut graded = None;
    for _ in 0..100 {
        let attempts = state.engine.submissions("s1", "exam-1").await.unwrap();
        let attempt = attempts
            .iter()
            .find(|a| a.attempt_id == attempt_id)
            .cloned()
            .expect("attempt must stay visible");
        if attempt.status != AttemptStatus::Processing {
            graded = Some(attempt);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let attempt = graded.expect("grading did not terminate");
    assert_eq!(attempt.status, AttemptStatus::Done);
    assert!(attempt.score.is_some());
    assert!(attempt.is_final);
    assert!(attempt.is_best);
    assert!(attempt.feedback.is_some());
}

#[tokio::test]
async fn faculty_close_and_reset_operations() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[
            common::student_fixture("s1", None),
            common::student_fixture("s2", None),
        ],
    )
    .await;

    state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    state.engine.claim_seat("s2", "exam-1", 2).await.unwrap();

    let closed = state.engine.finish_all_for_exam("exam-1").await.unwrap();
    assert_eq!(closed, 2);
    assert!(state
        .engine
        .session_view("s1", "exam-1")
        .await
        .unwrap()
        .finished);

    // Reset removes the session entirely, freeing the seat.
    state.engine.reset_student_attempt("exam-1", "s1").await.unwrap();
    assert!(state.engine.session_view("s1", "exam-1").await.is_err());
    state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
}

#[tokio::test]
async fn delete_sessions_clears_the_exam() {
    let state = common::test_state().await;
    common::seed(
        &state,
        common::exam_fixture("exam-1"),
        &[common::student_fixture("s1", None)],
    )
    .await;

    state.engine.claim_seat("s1", "exam-1", 1).await.unwrap();
    let removed = state.engine.delete_sessions_for_exam("exam-1").await.unwrap();
    assert_eq!(removed, 1);
    assert!(state.engine.session_view("s1", "exam-1").await.is_err());
}

#[tokio::test]
async fn feasibility_report_uses_advisory_formula() {
    let state = common::test_state().await;
    let mut exam = common::exam_fixture("exam-1");
    exam.questions_per_student = 3;
    common::seed(&state, exam, &[]).await;

    let report = state.engine.assignment_feasibility("exam-1").await.unwrap();
    assert_eq!(report.pool_size, 4);
    assert_eq!(report.minimum_needed, 6);
    assert!(!report.sufficient);
}
