//! Message protocol between the controller and a worker context.
//!
//! Commands flow controller → worker, events flow worker → controller. Both
//! travel as JSON text. Every event is wrapped in an [`Envelope`] carrying the
//! generation of the worker context that emitted it, so the controller can
//! drop anything produced by a context it already tore down.
//!
//! Unknown message types are reported as [`ProtocolError::UnknownType`] and
//! malformed payloads as [`ProtocolError::Malformed`]; receivers log and skip
//! both.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InvalidAssignment, ProtocolError};

const COMMAND_TYPES: &[&str] = &["start"];
const EVENT_TYPES: &[&str] = &["progress", "solution", "final", "error"];

/// Day-major assignment matrix produced by a solver.
///
/// Outer index is the day of week (Monday first), inner index the period.
/// Days may differ in length and may be empty. A present value is a row index
/// into the plan's lesson table; `None` is an unassigned period.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Solution(Vec<Vec<Option<usize>>>);

impl Solution {
    pub fn new(days: Vec<Vec<Option<usize>>>) -> Self {
        Self(days)
    }

    pub fn days(&self) -> &[Vec<Option<usize>>] {
        &self.0
    }

    /// Lesson index at `day`/`period`, `None` when unassigned or out of range.
    pub fn get(&self, day: usize, period: usize) -> Option<usize> {
        self.0.get(day).and_then(|d| d.get(period).copied().flatten())
    }

    /// Number of periods that carry a lesson.
    pub fn assigned_count(&self) -> usize {
        self.0.iter().flatten().filter(|p| p.is_some()).count()
    }

    /// Length of the longest day.
    pub fn longest_day(&self) -> usize {
        self.0.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Period-major view: one row per period up to the longest day, one
    /// column per day, padded with `None` where a day is shorter.
    pub fn by_period(&self) -> Vec<Vec<Option<usize>>> {
        (0..self.longest_day())
            .map(|period| {
                self.0
                    .iter()
                    .map(|day| day.get(period).copied().flatten())
                    .collect()
            })
            .collect()
    }

    /// Checks that every present index is below `lesson_count`.
    pub fn validate(&self, lesson_count: usize) -> Result<(), InvalidAssignment> {
        for (day, periods) in self.0.iter().enumerate() {
            for (period, slot) in periods.iter().enumerate() {
                if let Some(index) = *slot {
                    if index >= lesson_count {
                        return Err(InvalidAssignment {
                            day,
                            period,
                            index,
                            len: lesson_count,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> Vec<Vec<Option<usize>>> {
        self.0
    }
}

impl From<Vec<Vec<Option<usize>>>> for Solution {
    fn from(days: Vec<Vec<Option<usize>>>) -> Self {
        Self(days)
    }
}

/// Search statistics reported while a solver runs.
///
/// `best` is infinite until the search has found its first solution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(with = "float_or_symbol")]
    pub best: f64,
    #[serde(with = "float_or_symbol")]
    pub current_cost: f64,
    pub current_classes: u32,
    pub visited: u64,
}

/// Controller → worker message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Start {
        /// Raw serialized schedule.
        plan: String,
        /// Subject short names, highest priority first.
        subjects: Vec<String>,
        excluded_teachers: BTreeSet<String>,
    },
}

impl Command {
    pub fn start(
        plan: impl Into<String>,
        subjects: Vec<String>,
        excluded_teachers: BTreeSet<String>,
    ) -> Self {
        Self::Start {
            plan: plan.into(),
            subjects,
            excluded_teachers,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, COMMAND_TYPES)
    }
}

/// Worker → controller message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Informational; may arrive thousands of times per second.
    Progress { progress: Progress },
    /// Intermediate candidate, superseded by later events.
    Solution { solution: Solution },
    /// Terminal result of one request.
    Final { solution: Solution },
    /// Terminal failure of one request.
    Error { message: String },
}

impl Event {
    /// Whether this event ends a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// Wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Solution { .. } => "solution",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
        }
    }
}

/// An [`Event`] stamped with the generation of the context that emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub generation: u64,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(generation: u64, event: Event) -> Self {
        Self { generation, event }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, EVENT_TYPES)
    }
}

/// JSON numbers cannot hold infinities or NaN. Those travel as the strings
/// `"Infinity"`, `"-Infinity"` and `"NaN"`.
mod float_or_symbol {
    use serde::de::{self, Deserializer};
    use serde::Deserialize;
    use serde::Serializer;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(f64),
        Symbol(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Ok(n),
            Wire::Symbol(s) => match s.as_str() {
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(de::Error::custom(format!("invalid float `{other}`"))),
            },
        }
    }
}

fn decode_tagged<T>(raw: &str, known: &[&str]) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing `type` tag".to_string()))?;
    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Solution {
        Solution::new(vec![vec![Some(0), Some(1)], vec![Some(2), None], vec![]])
    }

    #[test]
    fn start_command_wire_shape() {
        let cmd = Command::start(
            "P",
            vec!["Chemie".to_string(), "Physik".to_string()],
            BTreeSet::from(["MUE".to_string()]),
        );
        let json: Value = serde_json::from_str(&cmd.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["plan"], "P");
        assert_eq!(json["subjects"], serde_json::json!(["Chemie", "Physik"]));
        assert_eq!(json["excluded_teachers"], serde_json::json!(["MUE"]));
    }

    #[test]
    fn subjects_keep_priority_order() {
        let raw = r#"{"type":"start","plan":"x","subjects":["Physik","Chemie","Bio"],"excluded_teachers":[]}"#;
        let Command::Start { subjects, .. } = Command::decode(raw).unwrap();
        assert_eq!(subjects, vec!["Physik", "Chemie", "Bio"]);
    }

    #[test]
    fn envelope_carries_generation_next_to_tag() {
        let env = Envelope::new(
            7,
            Event::Progress {
                progress: Progress {
                    best: 3.5,
                    current_cost: 4.0,
                    current_classes: 2,
                    visited: 10,
                },
            },
        );
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["generation"], 7);
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"]["current_classes"], 2);
        assert_eq!(json["progress"]["visited"], 10);
    }

    #[test]
    fn final_event_decodes_nulls_as_empty_periods() {
        let raw = r#"{"generation":1,"type":"final","solution":[[0,1],[2,null]]}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.generation, 1);
        assert!(env.event.is_terminal());
        let Event::Final { solution } = env.event else {
            panic!("expected final");
        };
        assert_eq!(solution.get(1, 0), Some(2));
        assert_eq!(solution.get(1, 1), None);
    }

    #[test]
    fn unknown_event_type_is_reported_not_fatal() {
        let raw = r#"{"generation":1,"type":"result","solution":[]}"#;
        match Envelope::decode(raw) {
            Err(ProtocolError::UnknownType(kind)) => assert_eq!(kind, "result"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"generation":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"generation":1,"type":"error"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Command::decode(r#"{"type":"stop"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let raw = r#"{"generation":2,"type":"error","message":"boom","detail":42}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(
            env.event,
            Event::Error {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn unsolved_progress_keeps_infinite_best() {
        let env = Envelope::new(
            1,
            Event::Progress {
                progress: Progress {
                    best: f64::INFINITY,
                    current_cost: f64::NEG_INFINITY,
                    current_classes: 0,
                    visited: 10,
                },
            },
        );
        let raw = env.encode().unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["progress"]["best"], "Infinity");

        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded, env);

        let raw = r#"{"generation":1,"type":"progress","progress":{"best":"NaN","current_cost":7,"current_classes":1,"visited":2}}"#;
        let Event::Progress { progress } = Envelope::decode(raw).unwrap().event else {
            panic!("expected progress");
        };
        assert!(progress.best.is_nan());
        assert_eq!(progress.current_cost, 7.0);

        let raw = r#"{"generation":1,"type":"progress","progress":{"best":"lots","current_cost":7,"current_classes":1,"visited":2}}"#;
        assert!(matches!(
            Envelope::decode(raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn solution_is_not_rectangular() {
        let s = sample();
        assert_eq!(s.days().len(), 3);
        assert_eq!(s.longest_day(), 2);
        assert_eq!(s.assigned_count(), 3);
        assert_eq!(s.get(2, 0), None);
        assert_eq!(s.get(9, 9), None);
    }

    #[test]
    fn by_period_pads_short_days() {
        let grid = sample().by_period();
        assert_eq!(
            grid,
            vec![vec![Some(0), Some(2), None], vec![Some(1), None, None]]
        );
        assert!(Solution::default().by_period().is_empty());
    }

    #[test]
    fn validate_reports_first_out_of_range_index() {
        let s = sample();
        assert!(s.validate(3).is_ok());
        let err = s.validate(2).unwrap_err();
        assert_eq!(
            err,
            InvalidAssignment {
                day: 1,
                period: 0,
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn event_kind_matches_wire_tag() {
        let ev = Event::Solution {
            solution: sample(),
        };
        let json: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
        assert!(!ev.is_terminal());
    }
}
