//! Interface to the external schedule-file parser.
//!
//! The file grammar is owned by the parser implementation. The orchestration
//! layer only needs the parse report and a way to resolve lesson indices
//! found in solutions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::InvalidAssignment;
use crate::protocol::Solution;

/// A record the parser could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// Identifier of the offending record (line number, primary key, ...).
    pub record: String,
    pub error: String,
}

/// Outcome of parsing a schedule file. Parse errors are not fatal; whether a
/// partially parsed plan is usable is the controller's call.
#[derive(Debug, Clone)]
pub struct ParseReport<P> {
    pub plan: P,
    pub errors: Vec<ParseError>,
}

impl<P> ParseReport<P> {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Lesson lines of a parsed plan, addressed by the indices solvers emit.
pub trait LessonTable {
    fn lesson_count(&self) -> usize;

    /// Subject short name of the lesson at `index`.
    fn subject_of(&self, index: usize) -> Option<&str>;

    /// Checks that every index in `solution` resolves in this table.
    fn check(&self, solution: &Solution) -> Result<(), InvalidAssignment> {
        solution.validate(self.lesson_count())
    }
}

/// Parses raw schedule text.
pub trait PlanParser {
    type Plan: LessonTable;

    fn parse_plan(&self, raw: &str) -> ParseReport<Self::Plan>;
}

/// Number of recorded lessons per subject. Subjects missing from the map
/// have no periods in the plan.
pub fn subject_counts<T: LessonTable + ?Sized>(table: &T) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for index in 0..table.lesson_count() {
        if let Some(subject) = table.subject_of(index) {
            *counts.entry(subject.to_string()).or_insert(0) += 1;
        }
    }
    counts
}
