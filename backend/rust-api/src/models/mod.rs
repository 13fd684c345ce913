use serde::{Deserialize, Serialize};

pub mod session;

pub use session::{
    AttemptStatus, CaseResult, FeedbackBundle, OrgSnapshot, StudentSession, SubmissionAttempt,
};

/// A single test case attached to a question. Private cases are withheld from
/// students and excluded from the grading pipeline's public pass ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    pub text: String,
    #[serde(default)]
    pub ideal_solution: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// One seat in a prebuilt lab layout. A seat may come pre-marked with
/// question ids, in which case that designation wins over the assignment
/// algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutSeat {
    pub serial_number: u32,
    #[serde(default = "default_true")]
    pub is_working: bool,
    #[serde(default)]
    pub assigned_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeatingLayout {
    #[serde(default)]
    pub seats: Vec<LayoutSeat>,
}

impl SeatingLayout {
    /// Number of usable seats, i.e. the upper bound for serial numbers.
    pub fn working_seat_count(&self) -> u32 {
        self.seats.iter().filter(|s| s.is_working).count() as u32
    }

    pub fn seat(&self, serial: u32) -> Option<&LayoutSeat> {
        self.seats.iter().find(|s| s.serial_number == serial)
    }
}

/// Exam authoring data. Created and edited by faculty tooling; the engine
/// only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exam {
    pub exam_id: String,
    pub subject_name: String,
    pub language: String,
    pub is_live: bool,
    pub start_code: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default = "default_one")]
    pub questions_per_student: usize,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub layout: Option<SeatingLayout>,
}

fn default_one() -> usize {
    1
}

impl Exam {
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    pub fn question_ids(&self) -> Vec<String> {
        self.questions
            .iter()
            .map(|q| q.question_id.clone())
            .collect()
    }
}

/// Student directory entry, maintained by the user-management collaborator.
/// The engine reads it for tenant-scope checks and for the organizational
/// snapshot captured at seat-claim time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentProfile {
    pub student_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
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
