use std::sync::Arc;
use std::time::Instant;

use crate::metrics::GRADING_DURATION_SECONDS;
use crate::models::{CaseResult, FeedbackBundle, TestCase};

pub mod execute;
pub mod judge;
pub mod similarity;

pub use execute::{CodeExecutor, ExecutionResult, SandboxExecutor};
pub use judge::{JudgmentBackend, LlmJudge};

/// Relevance sub-scores below this mean "code unrelated to the problem": the
/// semantic score is heavily penalized instead of blended with structural
/// similarity.
const LOW_RELEVANCE_THRESHOLD: f64 = 0.3;
const LOW_RELEVANCE_PENALTY: f64 = 0.5;
const NEUTRAL_SIMILARITY: f64 = 0.5;

const STRUCTURAL_WEIGHT: f64 = 0.6;
const SEMANTIC_WEIGHT: f64 = 0.4;

const EFFORT_SHARE: f64 = 0.2;
const LOGIC_SHARE: f64 = 0.4;
const CORRECTNESS_SHARE: f64 = 0.4;

/// Everything the grading pipeline produces for one attempt.
#[derive(Debug, Clone)]
pub struct GradeOutcome {
    pub score: f64,
    pub summary: String,
    pub correctness: f64,
    pub logic_similarity: f64,
    pub effort: f64,
    pub public_case_flags: Vec<bool>,
    pub feedback: FeedbackBundle,
    pub case_details: Vec<CaseResult>,
}

/// Turns a raw submission into a composite score. Every external signal
/// (sandbox, judgment backend) degrades to a deterministic fallback, so
/// grading always terminates with a result.
pub struct GradingPipeline {
    executor: Arc<dyn CodeExecutor>,
    judge: Option<Arc<dyn JudgmentBackend>>,
}

impl GradingPipeline {
    pub fn new(executor: Arc<dyn CodeExecutor>, judge: Option<Arc<dyn JudgmentBackend>>) -> Self {
        Self { executor, judge }
    }

    pub async fn grade(
        &self,
        language: &str,
        student_code: &str,
        reference_code: &str,
        prompt_text: &str,
        test_cases: &[TestCase],
    ) -> GradeOutcome {
        let started = Instant::now();

        // 1. Public test cases through the execution adapter.
        let public: Vec<&TestCase> = test_cases.iter().filter(|c| c.is_public).collect();
        let mut case_details = Vec::with_capacity(public.len());
        let mut public_case_flags = Vec::with_capacity(public.len());

        for case in &public {
            let case_started = Instant::now();
            let result = self
                .executor
                .execute(student_code, language, &case.input)
                .await;
            let elapsed_ms = case_started.elapsed().as_millis() as u64;

            let produced_output = !result.stdout.trim().is_empty();
            let ran_ok = result.exit_code == 0 || produced_output;
            let passed = ran_ok && outputs_match(&case.expected_output, &result.stdout);

            public_case_flags.push(passed);
            case_details.push(CaseResult {
                input: case.input.clone(),
                expected_output: case.expected_output.clone(),
                actual_output: result.stdout.clone(),
                passed,
                error: if result.stderr.is_empty() {
                    None
                } else {
                    Some(result.stderr.clone())
                },
                execution_time_ms: elapsed_ms,
            });
        }

        // 2. Correctness ratio.
        let passed_count = public_case_flags.iter().filter(|p| **p).count();
        let total = public.len();
        let correctness = if total == 0 {
            0.0
        } else {
            passed_count as f64 / total as f64
        };
        let summary = format!("Passed {}/{} public test cases.", passed_count, total);

        // 3. Effort, with heuristic fallback.
        let effort_context = format!("{}\n\nReference solution:\n{}", prompt_text, reference_code);
        let effort = match &self.judge {
            Some(judge) => match judge.assess_effort(&effort_context, student_code).await {
                Ok(j) => j.effort_score,
                Err(e) => {
                    tracing::warn!("effort judgment unavailable, using heuristic: {}", e);
                    judge::heuristic_effort(student_code).effort_score
                }
            },
            None => judge::heuristic_effort(student_code).effort_score,
        };

        // 4. Logic similarity: structural/semantic blend, overridden when the
        //    judge reports the code as unrelated to the problem.
        let (semantic, relevance) = match &self.judge {
            Some(judge) => match judge
                .assess_logic(prompt_text, reference_code, student_code)
                .await
            {
                Ok(j) => (j.logic_similarity, j.relevance),
                Err(e) => {
                    tracing::warn!("logic judgment unavailable, using neutral score: {}", e);
                    (NEUTRAL_SIMILARITY, judge::FULL_RELEVANCE)
                }
            },
            None => (NEUTRAL_SIMILARITY, judge::FULL_RELEVANCE),
        };

        let structural = similarity::structural_similarity(language, student_code, reference_code)
            .filter(|s| *s > 0.0);

        let logic_similarity = if relevance < LOW_RELEVANCE_THRESHOLD {
            semantic * LOW_RELEVANCE_PENALTY
        } else {
            match structural {
                Some(s) => STRUCTURAL_WEIGHT * s + SEMANTIC_WEIGHT * semantic,
                None => semantic,
            }
        };

        // 5. Final score. A fully-passing submission gets full marks no
        //    matter what the softer signals say.
        let score = if total > 0 && passed_count == total {
            100.0
        } else {
            100.0
                * (EFFORT_SHARE * effort
                    + LOGIC_SHARE * logic_similarity
                    + CORRECTNESS_SHARE * correctness)
        };

        // 6. Feedback bundle.
        let feedback = match &self.judge {
            Some(judge) => match judge
                .compose_feedback(prompt_text, student_code, &summary)
                .await
            {
                Ok(fb) => fb,
                Err(e) => {
                    tracing::warn!("feedback judgment unavailable, using template: {}", e);
                    judge::fallback_feedback(passed_count, total)
                }
            },
            None => judge::fallback_feedback(passed_count, total),
        };

        GRADING_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        GradeOutcome {
            score,
            summary,
            correctness,
            logic_similarity,
            effort,
            public_case_flags,
            feedback,
            case_details,
        }
    }
}

/// Expected vs actual output comparison: exact after trimming, or equal once
/// all whitespace runs are collapsed.
fn outputs_match(expected: &str, actual: &str) -> bool {
    if expected.trim() == actual.trim() {
        return true;
    }
    let collapse = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    collapse(expected) == collapse(actual)
}
