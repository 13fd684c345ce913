use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Score threshold above which a graded attempt counts as passing.
pub const PASSING_SCORE: f64 = 50.0;

/// Organizational data captured once at seat-claim time. Later edits to the
/// student's profile must never leak into historical exam records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgSnapshot {
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub department_name: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub section_name: Option<String>,
    #[serde(default)]
    pub cohort_year: Option<i32>,
}

impl OrgSnapshot {
    pub fn capture(profile: Option<&crate::models::StudentProfile>) -> Self {
        match profile {
            Some(p) => Self {
                department_id: p.department_id.clone(),
                department_name: p.department_name.clone(),
                section_id: p.section_id.clone(),
                section_name: p.section_name.clone(),
                cohort_year: p.cohort_year,
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Processing,
    Done,
    Failed,
}

/// Per-test-case execution detail stored on a graded attempt. Only public
/// cases ever appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Free-text critique produced by the judgment backend, or composed
/// deterministically when no backend is reachable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackBundle {
    pub feedback: String,
    #[serde(default)]
    pub critic: String,
    #[serde(default)]
    pub improvements: String,
    #[serde(default)]
    pub scope_for_improvement: String,
}

/// One submission. Created in `Processing` status by the submit operation and
/// updated exactly once by the background grading worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub attempt_id: String,
    pub question_id: String,
    pub code: String,
    pub status: AttemptStatus,
    #[serde(default)]
    pub score: Option<f64>,
    pub passed: bool,
    #[serde(default)]
    pub public_case_results: Vec<bool>,
    #[serde(default)]
    pub detailed_results: Vec<CaseResult>,
    #[serde(default)]
    pub correctness: Option<f64>,
    #[serde(default)]
    pub logic_similarity: Option<f64>,
    #[serde(default)]
    pub effort_score: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub feedback: Option<FeedbackBundle>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_best: bool,
}

impl SubmissionAttempt {
    pub fn processing(question_id: &str, code: &str) -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            question_id: question_id.to_string(),
            code: code.to_string(),
            status: AttemptStatus::Processing,
            score: None,
            passed: false,
            public_case_results: Vec::new(),
            detailed_results: Vec::new(),
            correctness: None,
            logic_similarity: None,
            effort_score: None,
            summary: None,
            feedback: None,
            submitted_at: Utc::now(),
            is_final: false,
            is_best: false,
        }
    }
}

/// The central mutable entity: one student's run through one exam.
///
/// Created on the first seat-number submission, not at join time. Seat number
/// and assigned questions are immutable once set; `finished` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSession {
    pub student_id: String,
    pub exam_id: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub seat_number: Option<u32>,
    #[serde(default)]
    pub assigned_questions: Vec<String>,
    #[serde(default)]
    pub attempt_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_ends_at: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub current_code: String,
    #[serde(default)]
    pub buffered_code: HashMap<String, String>,
    pub last_saved_at: DateTime<Utc>,
    #[serde(default)]
    pub org_snapshot: OrgSnapshot,
    #[serde(default)]
    pub attempts: Vec<SubmissionAttempt>,
}

impl StudentSession {
    pub fn new(student_id: &str, exam: &crate::models::Exam) -> Self {
        let now = Utc::now();
        Self {
            student_id: student_id.to_string(),
            exam_id: exam.exam_id.clone(),
            joined_at: now,
            seat_number: None,
            assigned_questions: Vec::new(),
            attempt_started_at: None,
            attempt_ends_at: None,
            duration_minutes: exam.duration_minutes,
            finished: false,
            current_code: String::new(),
            buffered_code: HashMap::new(),
            last_saved_at: now,
            org_snapshot: OrgSnapshot::default(),
            attempts: Vec::new(),
        }
    }

    /// Remaining seconds, `None` before seat claim or after finish.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.finished {
            return None;
        }
        let ends_at = self.attempt_ends_at?;
        Some((ends_at - now).num_seconds().max(0))
    }

    pub fn is_time_up(&self, now: DateTime<Utc>) -> bool {
        matches!(self.remaining_seconds(now), Some(0))
    }

    /// Code of the last submission per question, used to skip redundant
    /// implicit submits on auto-finish.
    pub fn last_submitted_code(&self) -> HashMap<String, String> {
        let mut last = HashMap::new();
        for attempt in &self.attempts {
            last.insert(attempt.question_id.clone(), attempt.code.clone());
        }
        last
    }

    /// Recompute `is_final`, `is_best` and `passed` across the whole attempt
    /// log. Flags are derived, never trusted incrementally.
    pub fn recompute_attempt_flags(&mut self) {
        for attempt in &mut self.attempts {
            attempt.is_final = false;
            attempt.is_best = false;
            attempt.passed = matches!(attempt.score, Some(s) if s >= PASSING_SCORE);
        }

        let mut last_per_question: HashMap<String, usize> = HashMap::new();
        let mut best_per_question: HashMap<String, (usize, f64)> = HashMap::new();

        for (idx, attempt) in self.attempts.iter().enumerate() {
            last_per_question.insert(attempt.question_id.clone(), idx);
            if let Some(score) = attempt.score {
                let entry = best_per_question.get(&attempt.question_id);
                // strict comparison: ties keep the first-seen maximum
                if entry.map(|(_, best)| score > *best).unwrap_or(true) {
                    best_per_question.insert(attempt.question_id.clone(), (idx, score));
                }
            }
        }

        for idx in last_per_question.values() {
            self.attempts[*idx].is_final = true;
        }
        for (idx, _) in best_per_question.values() {
            self.attempts[*idx].is_best = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(question: &str, score: Option<f64>) -> SubmissionAttempt {
        let mut a = SubmissionAttempt::processing(question, "code");
        if score.is_some() {
            a.status = AttemptStatus::Done;
            a.score = score;
        }
        a
    }

    fn session_with(attempts: Vec<SubmissionAttempt>) -> StudentSession {
        let exam = crate::models::Exam {
            exam_id: "e1".into(),
            subject_name: "DS".into(),
            language: "python".into(),
            is_live: true,
            start_code: "abc".into(),
            duration_minutes: 60,
            questions: vec![],
            questions_per_student: 1,
            tenant_id: None,
            layout: None,
        };
        let mut s = StudentSession::new("stu-1", &exam);
        s.attempts = attempts;
        s
    }

    #[test]
    fn final_flag_is_last_attempt_per_question() {
        let mut s = session_with(vec![
            attempt("q1", Some(40.0)),
            attempt("q2", Some(90.0)),
            attempt("q1", Some(70.0)),
        ]);
        s.recompute_attempt_flags();

        let finals: Vec<&SubmissionAttempt> =
            s.attempts.iter().filter(|a| a.is_final).collect();
        assert_eq!(finals.len(), 2);
        assert!(s.attempts[2].is_final);
        assert!(s.attempts[1].is_final);
        assert!(!s.attempts[0].is_final);
    }

    #[test]
    fn best_flag_keeps_first_seen_maximum_on_tie() {
        let mut s = session_with(vec![
            attempt("q1", Some(80.0)),
            attempt("q1", Some(80.0)),
            attempt("q1", Some(60.0)),
        ]);
        s.recompute_attempt_flags();

        assert!(s.attempts[0].is_best);
        assert!(!s.attempts[1].is_best);
    }

    #[test]
    fn no_best_flag_while_all_scores_pending() {
        let mut s = session_with(vec![attempt("q1", None), attempt("q1", None)]);
        s.recompute_attempt_flags();

        assert!(s.attempts.iter().all(|a| !a.is_best));
        assert!(s.attempts[1].is_final);
    }

    #[test]
    fn passed_is_derived_from_score_threshold() {
        let mut s = session_with(vec![attempt("q1", Some(49.9)), attempt("q1", Some(50.0))]);
        s.recompute_attempt_flags();

        assert!(!s.attempts[0].passed);
        assert!(s.attempts[1].passed);
    }
}
