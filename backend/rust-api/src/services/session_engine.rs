use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::assignment::{FeasibilityReport, QuestionAssignment};
use crate::config::Config;
use crate::error::EngineError;
use crate::grading::{GradeOutcome, GradingPipeline};
use crate::metrics::{
    SEATS_CLAIMED_TOTAL, SESSIONS_ACTIVE, SESSIONS_FINISHED_TOTAL, SUBMISSIONS_TOTAL,
};
use crate::models::{
    AttemptStatus, Exam, OrgSnapshot, StudentProfile, StudentSession, SubmissionAttempt, TestCase,
};
use crate::services::seat_registry::{max_serial, SeatRegistry};
use crate::storage::{
    load_collection, save_collection, SnapshotStore, EXAMS_SNAPSHOT, SESSIONS_SNAPSHOT,
    STUDENTS_SNAPSHOT,
};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

fn session_key(exam_id: &str, student_id: &str) -> String {
    format!("{}:{}", exam_id, student_id)
}

/// Exam overview returned to a student on a successful join. Questions are
/// withheld until a seat is claimed.
#[derive(Debug, Clone, Serialize)]
pub struct JoinDetails {
    pub exam_id: String,
    pub subject_name: String,
    pub language: String,
    pub duration_minutes: i64,
    pub questions_per_student: usize,
}

/// A question as shown to the seated student: prompt plus public test cases
/// only. The reference solution and private cases never leave the engine.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub question_id: String,
    pub text: String,
    pub public_test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerView {
    pub remaining_seconds: i64,
    pub finished: bool,
}

/// A grading task extracted while the session lock is held and executed
/// after it is released.
struct PendingGrade {
    attempt_id: String,
    question_id: String,
    code: String,
}

struct Inner {
    sessions: RwLock<HashMap<String, StudentSession>>,
    exams: RwLock<HashMap<String, Exam>>,
    students: RwLock<HashMap<String, StudentProfile>>,
    store: Arc<dyn SnapshotStore>,
    pipeline: Arc<GradingPipeline>,
    grading_slots: Semaphore,
    save_lock: Mutex<()>,
    grading_deadline: Duration,
    default_max_serial: u32,
}

/// Orchestrates the per-student session state machine.
///
/// All session mutation happens inside synchronous critical sections under
/// the `sessions` write lock, which serializes both per-session updates and
/// cross-session seat claims for the same exam. Grading runs in background
/// tasks bounded by a semaphore and reports back through `complete_attempt`.
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

impl SessionEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn SnapshotStore>,
        pipeline: Arc<GradingPipeline>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                exams: RwLock::new(HashMap::new()),
                students: RwLock::new(HashMap::new()),
                store,
                pipeline,
                grading_slots: Semaphore::new(config.grading_concurrency),
                save_lock: Mutex::new(()),
                grading_deadline: Duration::from_secs(config.grading_deadline_secs),
                default_max_serial: config.default_max_serial,
            }),
        }
    }

    /// Hydrates all collections from the snapshot store. Attempts that were
    /// mid-grading at shutdown come back as `failed`: their worker is gone
    /// and will never deliver a result.
    pub async fn load(&self) -> anyhow::Result<()> {
        let mut sessions: HashMap<String, StudentSession> =
            load_collection(self.inner.store.as_ref(), SESSIONS_SNAPSHOT).await?;
        let exams: HashMap<String, Exam> =
            load_collection(self.inner.store.as_ref(), EXAMS_SNAPSHOT).await?;
        let students: HashMap<String, StudentProfile> =
            load_collection(self.inner.store.as_ref(), STUDENTS_SNAPSHOT).await?;

        let mut orphaned = 0;
        for session in sessions.values_mut() {
            for attempt in &mut session.attempts {
                if attempt.status == AttemptStatus::Processing {
                    attempt.status = AttemptStatus::Failed;
                    orphaned += 1;
                }
            }
            session.recompute_attempt_flags();
        }
        if orphaned > 0 {
            tracing::warn!("marked {} orphaned grading attempts as failed", orphaned);
        }

        let active = sessions
            .values()
            .filter(|s| !s.finished && s.seat_number.is_some())
            .count();
        SESSIONS_ACTIVE.set(active as i64);

        tracing::info!(
            "loaded {} sessions, {} exams, {} students",
            sessions.len(),
            exams.len(),
            students.len()
        );

        *self.inner.sessions.write().await = sessions;
        *self.inner.exams.write().await = exams;
        *self.inner.students.write().await = students;
        Ok(())
    }

    async fn exam(&self, exam_id: &str) -> Result<Exam, EngineError> {
        self.inner
            .exams
            .read()
            .await
            .get(exam_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("exam"))
    }

    async fn check_tenant_scope(&self, exam: &Exam, student_id: &str) -> Result<(), EngineError> {
        let Some(exam_tenant) = &exam.tenant_id else {
            return Ok(());
        };
        let students = self.inner.students.read().await;
        let belongs = students
            .get(student_id)
            .and_then(|p| p.tenant_id.as_ref())
            .map(|t| t == exam_tenant)
            .unwrap_or(false);
        if !belongs {
            return Err(EngineError::policy(
                "you are not part of this exam's organization",
            ));
        }
        Ok(())
    }

    // ---- student operations ----

    /// Validates the start code and exam state. Does not create a session;
    /// that happens at seat claim.
    pub async fn join(
        &self,
        student_id: &str,
        exam_id: &str,
        start_code: &str,
    ) -> Result<JoinDetails, EngineError> {
        let exam = self.exam(exam_id).await?;
        if !exam.is_live {
            return Err(EngineError::policy("this exam is not live"));
        }
        if exam.start_code != start_code {
            return Err(EngineError::policy("invalid start code"));
        }
        self.check_tenant_scope(&exam, student_id).await?;

        // Rejoining is never permitted. A prior session that is still running
        // is force-finished (implicitly submitting its buffers) before the
        // rejection, so an abandoned seat cannot keep accruing time.
        let key = session_key(exam_id, student_id);
        let (rejection, pending) = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(&key) {
                None => (None, None),
                Some(existing) if existing.finished => {
                    (Some("you have already completed this exam"), None)
                }
                Some(existing) => (
                    Some("you have already joined this exam; rejoining is not allowed"),
                    Some(finish_session(existing, "rejoin")),
                ),
            }
        };
        if let Some(pending) = pending {
            self.spawn_pending(&key, &exam, pending);
            self.persist_sessions().await?;
        }
        if let Some(message) = rejection {
            return Err(EngineError::policy(message));
        }

        Ok(JoinDetails {
            exam_id: exam.exam_id,
            subject_name: exam.subject_name,
            language: exam.language,
            duration_minutes: exam.duration_minutes,
            questions_per_student: exam.questions_per_student,
        })
    }

    /// Claims a seat first-come-first-served and starts the timed attempt.
    /// The whole check-and-insert runs under the write lock, so two racing
    /// claims for the same serial cannot both succeed.
    pub async fn claim_seat(
        &self,
        student_id: &str,
        exam_id: &str,
        serial: u32,
    ) -> Result<StudentSession, EngineError> {
        let exam = self.exam(exam_id).await?;
        if !exam.is_live {
            return Err(EngineError::policy("this exam is not live"));
        }
        self.check_tenant_scope(&exam, student_id).await?;

        let upper = max_serial(&exam, self.inner.default_max_serial);
        if serial < 1 || serial > upper {
            SEATS_CLAIMED_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(EngineError::policy(format!(
                "serial number must be between 1 and {}",
                upper
            )));
        }
        if let Some(layout) = &exam.layout {
            if let Some(seat) = layout.seat(serial) {
                if !seat.is_working {
                    SEATS_CLAIMED_TOTAL.with_label_values(&["rejected"]).inc();
                    return Err(EngineError::policy("that seat is marked as not working"));
                }
            }
        }

        let snapshot = {
            let students = self.inner.students.read().await;
            OrgSnapshot::capture(students.get(student_id))
        };

        let session = {
            let mut sessions = self.inner.sessions.write().await;
            let key = session_key(exam_id, student_id);
            if sessions.contains_key(&key) {
                SEATS_CLAIMED_TOTAL.with_label_values(&["rejected"]).inc();
                return Err(EngineError::policy("you have already claimed a seat"));
            }

            let registry = SeatRegistry::rebuild(exam_id, sessions.values());
            if registry.is_taken(serial) {
                SEATS_CLAIMED_TOTAL.with_label_values(&["rejected"]).inc();
                return Err(EngineError::policy(format!(
                    "seat {} is already taken",
                    serial
                )));
            }

            let assigned = registry.assign_questions(&exam, serial)?;

            let now = Utc::now();
            let mut session = StudentSession::new(student_id, &exam);
            session.seat_number = Some(serial);
            session.assigned_questions = assigned;
            session.attempt_started_at = Some(now);
            session.attempt_ends_at = Some(now + ChronoDuration::minutes(exam.duration_minutes));
            session.org_snapshot = snapshot;

            sessions.insert(key, session.clone());
            session
        };

        SEATS_CLAIMED_TOTAL.with_label_values(&["granted"]).inc();
        SESSIONS_ACTIVE.inc();
        tracing::info!(
            "student {} claimed seat {} in exam {}",
            student_id,
            serial,
            exam_id
        );

        self.persist_sessions().await?;
        Ok(session)
    }

    /// The student's assigned questions, public test cases only.
    pub async fn assigned_questions(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Vec<QuestionView>, EngineError> {
        let exam = self.exam(exam_id).await?;
        let session = self.session_view(student_id, exam_id).await?;

        Ok(session
            .assigned_questions
            .iter()
            .filter_map(|qid| exam.question(qid))
            .map(|q| QuestionView {
                question_id: q.question_id.clone(),
                text: q.text.clone(),
                public_test_cases: q
                    .test_cases
                    .iter()
                    .filter(|c| c.is_public)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    /// Records a submission and schedules grading. Returns the attempt id
    /// immediately; the score arrives asynchronously.
    pub async fn submit(
        &self,
        student_id: &str,
        exam_id: &str,
        question_id: &str,
        code: &str,
    ) -> Result<String, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);

        let (attempt_id, expired) = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::not_found("session"))?;

            if !session.finished && session.is_time_up(Utc::now()) {
                let pending = finish_session(session, "timer");
                (None, Some(pending))
            } else if session.finished {
                return Err(EngineError::policy(
                    "this exam session is finished; submissions are closed",
                ));
            } else if !session.assigned_questions.iter().any(|q| q == question_id) {
                return Err(EngineError::policy("that question is not assigned to you"));
            } else {
                let attempt = SubmissionAttempt::processing(question_id, code);
                let id = attempt.attempt_id.clone();
                session.attempts.push(attempt);
                session.recompute_attempt_flags();
                (Some(id), None)
            }
        };

        if let Some(pending) = expired {
            self.spawn_pending(&key, &exam, pending);
            self.persist_sessions().await?;
            return Err(EngineError::policy("exam time is over"));
        }

        let attempt_id = attempt_id.unwrap_or_default();
        self.spawn_grading(&key, &exam, question_id, attempt_id.clone(), code.to_string());
        self.persist_sessions().await?;
        Ok(attempt_id)
    }

    /// Buffers draft code without grading it. Buffered code is implicitly
    /// submitted if the timer expires before an explicit submit.
    pub async fn auto_save(
        &self,
        student_id: &str,
        exam_id: &str,
        question_id: &str,
        code: &str,
    ) -> Result<(), EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);

        let expired = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::not_found("session"))?;

            if session.finished {
                return Err(EngineError::policy("this exam session is finished"));
            }
            if session.is_time_up(Utc::now()) {
                Some(finish_session(session, "timer"))
            } else {
                session
                    .buffered_code
                    .insert(question_id.to_string(), code.to_string());
                session.current_code = code.to_string();
                session.last_saved_at = Utc::now();
                None
            }
        };

        if let Some(pending) = expired {
            self.spawn_pending(&key, &exam, pending);
            self.persist_sessions().await?;
            return Err(EngineError::policy("exam time is over"));
        }

        self.persist_sessions().await?;
        Ok(())
    }

    /// Remaining time, applying lazy expiry: a timed-out session is finished
    /// here before the answer is computed.
    pub async fn remaining_time(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<TimerView, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);

        let (view, expired) = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::not_found("session"))?;

            if !session.finished && session.is_time_up(Utc::now()) {
                let pending = finish_session(session, "timer");
                (
                    TimerView {
                        remaining_seconds: 0,
                        finished: true,
                    },
                    Some(pending),
                )
            } else {
                (
                    TimerView {
                        remaining_seconds: session.remaining_seconds(Utc::now()).unwrap_or(0),
                        finished: session.finished,
                    },
                    None,
                )
            }
        };

        if let Some(pending) = expired {
            self.spawn_pending(&key, &exam, pending);
            self.persist_sessions().await?;
        }

        Ok(view)
    }

    /// Explicit finish. Idempotent: finishing a finished session is a no-op.
    pub async fn finish(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<StudentSession, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);

        let (session, pending) = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::not_found("session"))?;

            if session.finished {
                (session.clone(), Vec::new())
            } else {
                let pending = finish_session(session, "explicit");
                (session.clone(), pending)
            }
        };

        self.spawn_pending(&key, &exam, pending);
        self.persist_sessions().await?;
        Ok(session)
    }

    /// Full submission history with freshly derived flags.
    pub async fn submissions(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Vec<SubmissionAttempt>, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);

        let (attempts, expired) = {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| EngineError::not_found("session"))?;

            let pending = if !session.finished && session.is_time_up(Utc::now()) {
                Some(finish_session(session, "timer"))
            } else {
                None
            };
            session.recompute_attempt_flags();
            (session.attempts.clone(), pending)
        };

        if let Some(pending) = expired {
            self.spawn_pending(&key, &exam, pending);
            self.persist_sessions().await?;
        }

        Ok(attempts)
    }

    /// Current session state, after lazy expiry.
    pub async fn session_view(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<StudentSession, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);
        self.expire_if_due(&key, &exam).await?;

        self.inner
            .sessions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::not_found("session"))
    }

    /// Last auto-saved draft for one question, after lazy expiry.
    pub async fn saved_code(
        &self,
        student_id: &str,
        exam_id: &str,
        question_id: &str,
    ) -> Result<String, EngineError> {
        let exam = self.exam(exam_id).await?;
        let key = session_key(exam_id, student_id);
        self.expire_if_due(&key, &exam).await?;

        let sessions = self.inner.sessions.read().await;
        let session = sessions
            .get(&key)
            .ok_or_else(|| EngineError::not_found("session"))?;
        Ok(session
            .buffered_code
            .get(question_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Lazy expiry for read paths: a session whose timer has run out is
    /// finished here, implicitly submitting buffered code, before the caller
    /// reads it. A missing session is left to the caller's own lookup.
    async fn expire_if_due(&self, key: &str, exam: &Exam) -> Result<(), EngineError> {
        let expired = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(key) {
                Some(session) if !session.finished && session.is_time_up(Utc::now()) => {
                    Some(finish_session(session, "timer"))
                }
                _ => None,
            }
        };

        if let Some(pending) = expired {
            self.spawn_pending(key, exam, pending);
            self.persist_sessions().await?;
        }
        Ok(())
    }

    // ---- instructor operations ----

    /// Finishes every unfinished session for an exam, implicitly submitting
    /// buffered code. Used when faculty closes an exam early.
    pub async fn finish_all_for_exam(&self, exam_id: &str) -> Result<usize, EngineError> {
        let exam = self.exam(exam_id).await?;

        let jobs: Vec<(String, Vec<PendingGrade>)> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions
                .iter_mut()
                .filter(|(_, s)| s.exam_id == exam_id && !s.finished)
                .map(|(key, session)| (key.clone(), finish_session(session, "faculty")))
                .collect()
        };

        let finished = jobs.len();
        for (key, pending) in jobs {
            self.spawn_pending(&key, &exam, pending);
        }
        if finished > 0 {
            self.persist_sessions().await?;
        }
        tracing::info!("faculty finished {} sessions for exam {}", finished, exam_id);
        Ok(finished)
    }

    /// Deletes every session of an exam. The seat registry empties with it.
    pub async fn delete_sessions_for_exam(&self, exam_id: &str) -> Result<usize, EngineError> {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, s| {
                if s.exam_id == exam_id {
                    if !s.finished && s.seat_number.is_some() {
                        SESSIONS_ACTIVE.dec();
                    }
                    false
                } else {
                    true
                }
            });
            before - sessions.len()
        };

        self.persist_sessions().await?;
        tracing::info!("deleted {} sessions for exam {}", removed, exam_id);
        Ok(removed)
    }

    /// Removes one student's session so they can claim a seat again.
    pub async fn reset_student_attempt(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<(), EngineError> {
        {
            let mut sessions = self.inner.sessions.write().await;
            let session = sessions
                .remove(&session_key(exam_id, student_id))
                .ok_or_else(|| EngineError::not_found("session"))?;
            if !session.finished && session.seat_number.is_some() {
                SESSIONS_ACTIVE.dec();
            }
        }
        self.persist_sessions().await?;
        Ok(())
    }

    /// Advisory feasibility of the exam's question pool against its
    /// per-student count.
    pub async fn assignment_feasibility(
        &self,
        exam_id: &str,
    ) -> Result<FeasibilityReport, EngineError> {
        let exam = self.exam(exam_id).await?;
        Ok(QuestionAssignment::feasibility(
            exam.questions.len(),
            exam.questions_per_student,
        ))
    }

    // ---- authoring collaborators (seeding and admin tooling) ----

    pub async fn upsert_exam(&self, exam: Exam) -> Result<(), EngineError> {
        {
            let mut exams = self.inner.exams.write().await;
            exams.insert(exam.exam_id.clone(), exam);
        }
        let exams = self.inner.exams.read().await.clone();
        save_collection(self.inner.store.as_ref(), EXAMS_SNAPSHOT, &exams)
            .await
            .map_err(EngineError::Storage)
    }

    pub async fn upsert_student(&self, profile: StudentProfile) -> Result<(), EngineError> {
        {
            let mut students = self.inner.students.write().await;
            students.insert(profile.student_id.clone(), profile);
        }
        let students = self.inner.students.read().await.clone();
        save_collection(self.inner.store.as_ref(), STUDENTS_SNAPSHOT, &students)
            .await
            .map_err(EngineError::Storage)
    }

    // ---- grading plumbing ----

    fn spawn_pending(&self, key: &str, exam: &Exam, pending: Vec<PendingGrade>) {
        for job in pending {
            self.spawn_grading(key, exam, &job.question_id, job.attempt_id, job.code);
        }
    }

    fn spawn_grading(
        &self,
        key: &str,
        exam: &Exam,
        question_id: &str,
        attempt_id: String,
        code: String,
    ) {
        let engine = self.clone();
        let key = key.to_string();
        let language = exam.language.clone();
        let (prompt, reference, cases) = match exam.question(question_id) {
            Some(q) => (
                q.text.clone(),
                q.ideal_solution.clone(),
                q.test_cases.clone(),
            ),
            None => (String::new(), String::new(), Vec::new()),
        };

        tokio::spawn(async move {
            let Ok(_permit) = engine.inner.grading_slots.acquire().await else {
                return;
            };

            let graded = tokio::time::timeout(
                engine.inner.grading_deadline,
                engine
                    .inner
                    .pipeline
                    .grade(&language, &code, &reference, &prompt, &cases),
            )
            .await;

            let outcome = match graded {
                Ok(outcome) => Some(outcome),
                Err(_) => {
                    tracing::error!("grading attempt {} exceeded its deadline", attempt_id);
                    None
                }
            };

            if let Err(e) = engine.complete_attempt(&key, &attempt_id, outcome).await {
                tracing::error!("failed to record grading result: {}", e);
            }
        });
    }

    /// Applies a grading result to its attempt. Called exactly once per
    /// attempt; a second delivery for the same id is ignored.
    pub async fn complete_attempt(
        &self,
        key: &str,
        attempt_id: &str,
        outcome: Option<GradeOutcome>,
    ) -> Result<(), EngineError> {
        let status_label;
        {
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions.get_mut(key) else {
                tracing::warn!("grading result for deleted session {}", key);
                return Ok(());
            };
            let Some(attempt) = session
                .attempts
                .iter_mut()
                .find(|a| a.attempt_id == attempt_id)
            else {
                tracing::warn!("grading result for unknown attempt {}", attempt_id);
                return Ok(());
            };
            if attempt.status != AttemptStatus::Processing {
                return Ok(());
            }

            match outcome {
                Some(outcome) => {
                    attempt.status = AttemptStatus::Done;
                    attempt.score = Some(outcome.score);
                    attempt.public_case_results = outcome.public_case_flags;
                    attempt.detailed_results = outcome.case_details;
                    attempt.correctness = Some(outcome.correctness);
                    attempt.logic_similarity = Some(outcome.logic_similarity);
                    attempt.effort_score = Some(outcome.effort);
                    attempt.summary = Some(outcome.summary);
                    attempt.feedback = Some(outcome.feedback);
                    status_label = "done";
                }
                None => {
                    attempt.status = AttemptStatus::Failed;
                    status_label = "failed";
                }
            }
            session.recompute_attempt_flags();
        }

        SUBMISSIONS_TOTAL.with_label_values(&[status_label]).inc();
        self.persist_sessions().await
    }

    /// Full-snapshot persistence after every mutation, serialized so
    /// concurrent mutations cannot interleave their writes.
    async fn persist_sessions(&self) -> Result<(), EngineError> {
        let _guard = self.inner.save_lock.lock().await;
        let snapshot = self.inner.sessions.read().await.clone();
        retry_async_with_config(RetryConfig::persistent(), || {
            save_collection(self.inner.store.as_ref(), SESSIONS_SNAPSHOT, &snapshot)
        })
        .await
        .map_err(EngineError::Storage)
    }
}

/// Terminal transition, called under the sessions write lock. Buffered code
/// that was never explicitly submitted becomes an implicit attempt; the
/// returned jobs are graded after the lock is released.
fn finish_session(session: &mut StudentSession, trigger: &str) -> Vec<PendingGrade> {
    let mut pending = Vec::new();
    let last_submitted = session.last_submitted_code();

    for question_id in session.assigned_questions.clone() {
        let Some(buffered) = session.buffered_code.get(&question_id) else {
            continue;
        };
        if buffered.trim().is_empty() {
            continue;
        }
        if last_submitted.get(&question_id) == Some(buffered) {
            continue;
        }

        let attempt = SubmissionAttempt::processing(&question_id, buffered);
        pending.push(PendingGrade {
            attempt_id: attempt.attempt_id.clone(),
            question_id,
            code: attempt.code.clone(),
        });
        session.attempts.push(attempt);
    }

    session.finished = true;
    session.recompute_attempt_flags();

    SESSIONS_ACTIVE.dec();
    SESSIONS_FINISHED_TOTAL.with_label_values(&[trigger]).inc();
    tracing::info!(
        "session for student {} in exam {} finished ({}), {} implicit submissions",
        session.student_id,
        session.exam_id,
        trigger,
        pending.len()
    );
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;

    fn exam_fixture(duration_minutes: i64) -> Exam {
        Exam {
            exam_id: "e1".into(),
            subject_name: "DS".into(),
            language: "python".into(),
            is_live: true,
            start_code: "abc".into(),
            duration_minutes,
            questions: vec![
                Question {
                    question_id: "q1".into(),
                    text: "double it".into(),
                    ideal_solution: "print(int(input())*2)".into(),
                    test_cases: vec![],
                },
                Question {
                    question_id: "q2".into(),
                    text: "triple it".into(),
                    ideal_solution: "print(int(input())*3)".into(),
                    test_cases: vec![],
                },
            ],
            questions_per_student: 1,
            tenant_id: None,
            layout: None,
        }
    }

    #[test]
    fn finish_submits_buffered_code_once() {
        let exam = exam_fixture(60);
        let mut session = StudentSession::new("s1", &exam);
        session.seat_number = Some(1);
        session.assigned_questions = vec!["q1".into()];
        session
            .buffered_code
            .insert("q1".into(), "print(42)".into());

        let pending = finish_session(&mut session, "timer");
        assert_eq!(pending.len(), 1);
        assert!(session.finished);
        assert_eq!(session.attempts.len(), 1);
        assert!(session.attempts[0].is_final);
    }

    #[test]
    fn finish_skips_code_already_submitted() {
        let exam = exam_fixture(60);
        let mut session = StudentSession::new("s1", &exam);
        session.assigned_questions = vec!["q1".into()];
        session
            .attempts
            .push(SubmissionAttempt::processing("q1", "print(42)"));
        session
            .buffered_code
            .insert("q1".into(), "print(42)".into());

        let pending = finish_session(&mut session, "explicit");
        assert!(pending.is_empty());
        assert_eq!(session.attempts.len(), 1);
    }

    #[test]
    fn finish_skips_empty_buffers() {
        let exam = exam_fixture(60);
        let mut session = StudentSession::new("s1", &exam);
        session.assigned_questions = vec!["q1".into(), "q2".into()];
        session.buffered_code.insert("q1".into(), "   ".into());

        let pending = finish_session(&mut session, "timer");
        assert!(pending.is_empty());
        assert!(session.finished);
    }
}
