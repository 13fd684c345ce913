use std::collections::{HashMap, HashSet};

use crate::assignment::QuestionAssignment;
use crate::error::EngineError;
use crate::models::{Exam, StudentSession};

/// Per-exam view of who sits where. Never stored: rebuilt from session state
/// on demand, so a restart (or a deleted session) can never desynchronize the
/// registry from the sessions that are its source of truth.
pub struct SeatRegistry {
    seats: HashMap<u32, String>,
    assignments: HashMap<u32, Vec<String>>,
    /// Serial numbers in claim order, oldest first.
    claim_order: Vec<u32>,
}

impl SeatRegistry {
    pub fn rebuild<'a, I>(exam_id: &str, sessions: I) -> Self
    where
        I: IntoIterator<Item = &'a StudentSession>,
    {
        let mut claimed: Vec<&StudentSession> = sessions
            .into_iter()
            .filter(|s| s.exam_id == exam_id && s.seat_number.is_some())
            .collect();
        claimed.sort_by_key(|s| s.attempt_started_at);

        let mut seats = HashMap::new();
        let mut assignments = HashMap::new();
        let mut claim_order = Vec::new();
        for session in claimed {
            let serial = session.seat_number.unwrap_or_default();
            seats.insert(serial, session.student_id.clone());
            assignments.insert(serial, session.assigned_questions.clone());
            claim_order.push(serial);
        }

        Self {
            seats,
            assignments,
            claim_order,
        }
    }

    pub fn is_taken(&self, serial: u32) -> bool {
        self.seats.contains_key(&serial)
    }

    pub fn occupant(&self, serial: u32) -> Option<&str> {
        self.seats.get(&serial).map(String::as_str)
    }

    pub fn claimed_count(&self) -> usize {
        self.seats.len()
    }

    fn neighbor_assignment(&self, serial: Option<u32>) -> Option<&[String]> {
        serial
            .and_then(|s| self.assignments.get(&s))
            .map(Vec::as_slice)
    }

    fn recent(&self, n: usize) -> Vec<&[String]> {
        self.claim_order
            .iter()
            .rev()
            .take(n)
            .filter_map(|serial| self.assignments.get(serial).map(Vec::as_slice))
            .collect()
    }

    fn used(&self) -> HashSet<Vec<String>> {
        self.assignments.values().cloned().collect()
    }

    /// Questions for a newly claimed seat. A prebuilt layout designation wins
    /// outright; otherwise the assignment algorithm picks against the current
    /// neighborhood.
    pub fn assign_questions(&self, exam: &Exam, serial: u32) -> Result<Vec<String>, EngineError> {
        if let Some(layout) = &exam.layout {
            if let Some(seat) = layout.seat(serial) {
                if !seat.assigned_questions.is_empty() {
                    return Ok(seat.assigned_questions.clone());
                }
            }
        }

        let algorithm =
            QuestionAssignment::new(exam.question_ids(), exam.questions_per_student)?;
        let left = self.neighbor_assignment(serial.checked_sub(1).filter(|s| *s >= 1));
        let right = self.neighbor_assignment(serial.checked_add(1));
        let recent = self.recent(3);
        Ok(algorithm.choose(left, right, &recent, &self.used()))
    }
}

/// Upper bound for valid serial numbers: the layout's working seat count when
/// a layout exists, otherwise a configured default.
pub fn max_serial(exam: &Exam, default_max: u32) -> u32 {
    match &exam.layout {
        Some(layout) if !layout.seats.is_empty() => layout.working_seat_count(),
        _ => default_max,
    }
}
