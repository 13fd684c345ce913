use itertools::Itertools;
use serde::Serialize;
use std::collections::HashSet;

use crate::error::EngineError;

/// Adjacency-aware question assignment.
///
/// Seats claim questions one at a time in serial order; the goal is that two
/// neighboring seats share no question. The pool-size recommendation below is
/// a sufficient condition, not a hard gate: when no zero-overlap combination
/// remains the algorithm accepts the least-conflicting one instead of
/// failing, favoring availability over a strict guarantee.
#[derive(Debug)]
pub struct QuestionAssignment {
    pool: Vec<String>,
    per_student: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeasibilityReport {
    pub pool_size: usize,
    pub questions_per_student: usize,
    pub minimum_needed: usize,
    pub sufficient: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentStats {
    pub total_seats: usize,
    pub unique_combinations: usize,
    pub adjacency_conflicts: usize,
    pub success_rate: f64,
}

const NEIGHBOR_CONFLICT_WEIGHT: u32 = 10;
const RECENT_REUSE_WEIGHT: u32 = 2;
const RECENT_WINDOW: usize = 3;

impl QuestionAssignment {
    pub fn new(pool: Vec<String>, per_student: usize) -> Result<Self, EngineError> {
        if pool.is_empty() {
            return Err(EngineError::policy("no questions configured"));
        }
        if per_student == 0 {
            return Err(EngineError::policy("questions per student must be at least 1"));
        }
        if per_student > pool.len() {
            return Err(EngineError::policy(format!(
                "cannot assign {} questions when only {} available",
                per_student,
                pool.len()
            )));
        }
        Ok(Self { pool, per_student })
    }

    /// Advisory minimum pool size for adjacency-free assignment. Sufficient,
    /// not necessary; callers must treat it as a recommendation.
    pub fn minimum_pool_size(per_student: usize) -> usize {
        (2 * per_student).max(per_student + 1)
    }

    pub fn feasibility(pool_size: usize, per_student: usize) -> FeasibilityReport {
        if per_student > pool_size {
            return FeasibilityReport {
                pool_size,
                questions_per_student: per_student,
                minimum_needed: pool_size,
                sufficient: false,
                recommendation: format!(
                    "Cannot assign {} questions when only {} are available; add at least {} questions.",
                    per_student,
                    pool_size,
                    per_student - pool_size
                ),
            };
        }
        let minimum_needed = Self::minimum_pool_size(per_student);
        FeasibilityReport {
            pool_size,
            questions_per_student: per_student,
            minimum_needed,
            sufficient: pool_size >= minimum_needed,
            recommendation: format!(
                "You need at least {} questions to assign {} per student without adjacency conflicts.",
                minimum_needed, per_student
            ),
        }
    }

    /// All K-combinations of the pool, in enumeration order. Ties in the
    /// conflict score are broken by this order.
    fn combinations(&self) -> Vec<Vec<String>> {
        self.pool
            .iter()
            .cloned()
            .combinations(self.per_student)
            .collect()
    }

    /// Pick the question set for one seat given its already-assigned
    /// neighbors and the most recently assigned seats.
    pub fn choose(
        &self,
        left_neighbor: Option<&[String]>,
        right_neighbor: Option<&[String]>,
        recent: &[&[String]],
        used: &HashSet<Vec<String>>,
    ) -> Vec<String> {
        let all = self.combinations();
        let unused: Vec<&Vec<String>> = all.iter().filter(|c| !used.contains(*c)).collect();
        // When every combination is taken, reuse rather than fail.
        let candidates: Vec<&Vec<String>> = if unused.is_empty() {
            all.iter().collect()
        } else {
            unused
        };

        let mut best: Option<(&Vec<String>, u32)> = None;
        for combo in candidates {
            let score = conflict_score(combo, left_neighbor, right_neighbor, recent);
            if best.map(|(_, b)| score < b).unwrap_or(true) {
                best = Some((combo, score));
            }
        }

        best.map(|(c, _)| c.clone()).unwrap_or_default()
    }

    /// Batch assignment for `num_seats` consecutive seats, used by feasibility
    /// previews and tests. Seats are filled left to right, so only the left
    /// neighbor is known at selection time.
    pub fn assign(&self, num_seats: usize) -> Vec<Vec<String>> {
        let mut assignments: Vec<Vec<String>> = Vec::with_capacity(num_seats);
        let mut used: HashSet<Vec<String>> = HashSet::new();

        for _ in 0..num_seats {
            let recent: Vec<&[String]> = assignments
                .iter()
                .rev()
                .take(RECENT_WINDOW)
                .map(|a| a.as_slice())
                .collect();
            let chosen = self.choose(
                assignments.last().map(|a| a.as_slice()),
                None,
                &recent,
                &used,
            );
            used.insert(chosen.clone());
            assignments.push(chosen);
        }

        assignments
    }

    pub fn stats(assignments: &[Vec<String>]) -> AssignmentStats {
        if assignments.is_empty() {
            return AssignmentStats {
                total_seats: 0,
                unique_combinations: 0,
                adjacency_conflicts: 0,
                success_rate: 0.0,
            };
        }

        let unique: HashSet<Vec<String>> = assignments
            .iter()
            .map(|a| {
                let mut sorted = a.clone();
                sorted.sort();
                sorted
            })
            .collect();

        let mut conflicts = 0;
        for pair in assignments.windows(2) {
            if shared_count(&pair[0], &pair[1]) > 0 {
                conflicts += 1;
            }
        }

        AssignmentStats {
            total_seats: assignments.len(),
            unique_combinations: unique.len(),
            adjacency_conflicts: conflicts,
            success_rate: (assignments.len() - conflicts) as f64 / assignments.len() as f64
                * 100.0,
        }
    }
}

fn shared_count(a: &[String], b: &[String]) -> u32 {
    a.iter().filter(|q| b.contains(q)).count() as u32
}

fn conflict_score(
    combo: &[String],
    left: Option<&[String]>,
    right: Option<&[String]>,
    recent: &[&[String]],
) -> u32 {
    let mut score = 0;
    if let Some(left) = left {
        score += shared_count(combo, left) * NEIGHBOR_CONFLICT_WEIGHT;
    }
    if let Some(right) = right {
        score += shared_count(combo, right) * NEIGHBOR_CONFLICT_WEIGHT;
    }
    for earlier in recent.iter().take(RECENT_WINDOW) {
        score += shared_count(combo, earlier) * RECENT_REUSE_WEIGHT;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_k_larger_than_pool() {
        let err = QuestionAssignment::new(pool(&["a", "b"]), 3).unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation(_)));
    }

    #[test]
    fn every_seat_gets_k_distinct_questions() {
        let algo = QuestionAssignment::new(pool(&["a", "b", "c", "d", "e"]), 2).unwrap();
        let assignments = algo.assign(12);
        assert_eq!(assignments.len(), 12);
        for seat in &assignments {
            assert_eq!(seat.len(), 2);
            assert_ne!(seat[0], seat[1]);
        }
    }

    #[test]
    fn first_neighbor_pair_is_disjoint_when_pool_is_sufficient() {
        // N=4, K=2 satisfies max(2K, K+1) = 4: the second seat always has a
        // zero-overlap combination left, e.g. {a,b} then {c,d}.
        let algo = QuestionAssignment::new(pool(&["a", "b", "c", "d"]), 2).unwrap();
        let assignments = algo.assign(2);
        assert_eq!(shared_count(&assignments[0], &assignments[1]), 0);
    }

    #[test]
    fn overlap_stays_rare_across_a_longer_row() {
        // No exact adjacency guarantee once combinations run low; the
        // conflict scoring should still keep most neighbor pairs disjoint.
        let algo = QuestionAssignment::new(pool(&["a", "b", "c", "d"]), 2).unwrap();
        let assignments = algo.assign(4);
        let stats = QuestionAssignment::stats(&assignments);
        assert!(
            stats.adjacency_conflicts <= 1,
            "too many neighbor conflicts: {}",
            stats.adjacency_conflicts
        );
    }

    #[test]
    fn insufficient_pool_still_assigns() {
        // K=3 against N=4: advisory minimum is 6, assignment must not fail.
        let report = QuestionAssignment::feasibility(4, 3);
        assert!(!report.sufficient);
        assert_eq!(report.minimum_needed, 6);

        let algo = QuestionAssignment::new(pool(&["a", "b", "c", "d"]), 3).unwrap();
        let assignments = algo.assign(5);
        assert_eq!(assignments.len(), 5);
    }

    #[test]
    fn feasibility_flags_impossible_request() {
        let report = QuestionAssignment::feasibility(2, 3);
        assert!(!report.sufficient);
        assert_eq!(report.minimum_needed, 2);
    }

    #[test]
    fn minimum_pool_size_formula() {
        assert_eq!(QuestionAssignment::minimum_pool_size(1), 2);
        assert_eq!(QuestionAssignment::minimum_pool_size(2), 4);
        assert_eq!(QuestionAssignment::minimum_pool_size(3), 6);
    }

    #[test]
    fn choose_respects_both_neighbors() {
        let algo = QuestionAssignment::new(pool(&["a", "b", "c", "d", "e", "f"]), 2).unwrap();
        let left = pool(&["a", "b"]);
        let right = pool(&["c", "d"]);
        let chosen = algo.choose(Some(&left), Some(&right), &[], &HashSet::new());
        assert!(!chosen.iter().any(|q| left.contains(q) || right.contains(q)));
    }

    #[test]
    fn exhausted_combinations_are_reused() {
        let algo = QuestionAssignment::new(pool(&["a", "b"]), 1).unwrap();
        // Only two combinations exist; the third seat must still be served.
        let assignments = algo.assign(3);
        assert_eq!(assignments.len(), 3);
        assert!(assignments.iter().all(|a| a.len() == 1));
    }

    #[test]
    fn stats_count_adjacency_conflicts() {
        let assignments = vec![pool(&["a", "b"]), pool(&["b", "c"]), pool(&["d", "e"])];
        let stats = QuestionAssignment::stats(&assignments);
        assert_eq!(stats.total_seats, 3);
        assert_eq!(stats.adjacency_conflicts, 1);
        assert_eq!(stats.unique_combinations, 3);
    }
}
