use std::fmt;
use crate::data::{Loc, Time};

/// Failures the caller may want to tell apart.  Everything else travels as a plain
/// `anyhow::Error`; these are attached to it and can be recovered with `downcast_ref`.
#[derive(Debug, Clone, PartialEq)]
pub enum DarpError {
    Parse(String),
    InfeasibleInstance(String),
    TimeWindow { node: Loc, start: Time, end: Time },
    SolverFailure { milp: usize, reason: String },
}

impl fmt::Display for DarpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DarpError::Parse(msg) => write!(f, "malformed input: {}", msg),
            DarpError::InfeasibleInstance(msg) => write!(f, "infeasible instance: {}", msg),
            DarpError::TimeWindow { node, start, end } =>
                write!(f, "empty time window at node {}: [{}, {}]", node, start, end),
            DarpError::SolverFailure { milp, reason } =>
                write!(f, "MILP {} could not be solved: {}", milp, reason),
        }
    }
}

impl std::error::Error for DarpError {}
