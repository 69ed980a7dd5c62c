use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a replay oracle or solver backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    /// The backend could not be started or rejected its configuration
    /// (bad command, malformed target, missing classpath, ...).
    #[error("oracle configuration error: {0}")]
    Config(String),

    /// The backend answered with something that does not follow the protocol.
    #[error("oracle protocol error: {0}")]
    Protocol(String),

    /// The backend did not answer in time; the run is treated as incomplete.
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),

    /// The input handed to the backend could not be read.
    #[error("oracle input error: {0}")]
    Input(String),
}

impl OracleError {
    /// Fatal errors abort the engine; everything else skips the current candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OracleError::Config(_) | OracleError::Protocol(_))
    }
}

/// One branch decision: the outcome taken and how many outcomes the
/// decision instruction can produce (2 for a conditional, N+1 for a switch
/// with N labeled targets, 3 for a three-way comparison).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decision {
    pub choice: u32,
    pub branch_count: u32,
}

impl Decision {
    pub fn new(choice: u32, branch_count: u32) -> Self {
        Self {
            choice,
            branch_count,
        }
    }
}

/// Ordered conjunction of symbolic constraints, one per decision on a path.
/// Constraint text is opaque to the engine and only passed back to the solver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct PathCondition {
    constraints: Vec<String>,
}

impl PathCondition {
    pub fn new(constraints: Vec<String>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    pub fn push(&mut self, constraint: impl Into<String>) {
        self.constraints.push(constraint.into());
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl fmt::Display for PathCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.constraints.is_empty() {
            return f.write_str("true");
        }
        f.write_str(&self.constraints.join(" && "))
    }
}

/// Concrete values for symbolic variables, keyed by variable name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Solution {
    values: BTreeMap<String, i64>,
}

impl Solution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl<S: Into<String>> FromIterator<(S, i64)> for Solution {
    fn from_iter<T: IntoIterator<Item = (S, i64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// How a run ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum TraceEnd {
    /// The target finished. Concrete runs report the cost the target measured.
    Terminated { cost: Option<f64> },
    /// A guided run stopped at the next decision after the forced choice.
    /// `branch_count` describes that decision when the backend knows it.
    Suspended { branch_count: Option<u32> },
    /// The run did not complete (uncaught exception in the target, missing
    /// constraints, ...). Nothing may be optimized or materialized from it.
    Incomplete { reason: String },
}

/// What the backend observed during one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Trace {
    /// Every decision from program start, in order.
    pub decisions: Vec<Decision>,
    pub end: TraceEnd,
    /// Constraints collected along `decisions`.
    #[serde(default)]
    pub path_condition: PathCondition,
    /// Input length the run used, when the target is size sensitive.
    #[serde(default)]
    pub input_size: Option<usize>,
}

impl Trace {
    pub fn is_incomplete(&self) -> bool {
        matches!(self.end, TraceEnd::Incomplete { .. })
    }
}

/// Value ranges the backend gives symbolic variables of each kind.
/// Unset fields keep the backend's own defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SymbolicBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_char: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_char: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_byte: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_byte: Option<i64>,
}

impl SymbolicBounds {
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    /// Names the first kind whose minimum exceeds its maximum.
    pub fn inverted(&self) -> Option<&'static str> {
        [
            ("int", self.min_int, self.max_int),
            ("char", self.min_char, self.max_char),
            ("byte", self.min_byte, self.max_byte),
        ]
        .into_iter()
        .find_map(|(kind, min, max)| match (min, max) {
            (Some(min), Some(max)) if min > max => Some(kind),
            _ => None,
        })
    }
}

/// A guided replay: follow `prior_choices` exactly, then force one new choice.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub prior_choices: Vec<u32>,
    pub forced_choice: u32,
    /// Pinned length for variable-length symbolic inputs.
    pub input_size: usize,
}

/// Result of a dry optimizing run over a concrete input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Optimization {
    /// The backend has no optimizing mode.
    Unsupported,
    /// Same meaning as [`TraceEnd::Incomplete`].
    Incomplete { reason: String },
    /// An assignment along the same path that pushes the cost towards the
    /// configured strategy.
    Found {
        original_cost: f64,
        path_condition: PathCondition,
        solution: Solution,
        #[serde(default)]
        input_size: Option<usize>,
    },
}

/// The symbolic-execution backend that executes the target program.
///
/// Only one run may be in flight at a time: implementations may assume
/// calls are strictly sequential.
pub trait ReplayOracle: Send {
    /// Runs `input` concretely while collecting the path condition along the
    /// concrete trace. No choices are forced.
    fn run_concrete(&mut self, input: &Path) -> Result<Trace, OracleError>;

    /// Replays `request.prior_choices` without consulting a solver, then
    /// forces `request.forced_choice` at the decision that follows.
    ///
    /// The returned trace starts with the replayed prefix as the backend
    /// observed it, so callers can check it was reproduced exactly.
    fn replay(&mut self, request: &ReplayRequest) -> Result<Trace, OracleError>;

    /// Dry run over `input` that leaves the trie alone and proposes a
    /// cost-optimized assignment for the same path.
    fn optimize(&mut self, _input: &Path) -> Result<Optimization, OracleError> {
        Ok(Optimization::Unsupported)
    }
}

/// Constraint solver.
pub trait Solver: Send {
    /// `Ok(None)` means unsatisfiable, which is a normal outcome.
    fn solve(&mut self, condition: &PathCondition) -> Result<Option<Solution>, OracleError>;
}
