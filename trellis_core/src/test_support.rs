use crate::oracle::{
    Decision, OracleError, Optimization, PathCondition, ReplayOracle, ReplayRequest, Solution,
    Solver, Trace, TraceEnd,
};
use std::fs;
use std::path::Path;

/// Tiny program model: binary decisions on input bytes ending in leaves.
///
/// Variable `sym_i` is byte `i` of the input file (zero past the end).
/// A `Branch` takes choice 1 when the variable is greater than `threshold`
/// and choice 0 otherwise.
#[derive(Debug, Clone)]
pub enum Program {
    Leaf {
        cost: f64,
        /// Adds the value of this variable to the cost.
        bonus_var: Option<usize>,
    },
    Branch {
        var: usize,
        threshold: i64,
        below: Box<Program>,
        above: Box<Program>,
    },
}

impl Program {
    pub fn leaf(cost: f64) -> Self {
        Program::Leaf {
            cost,
            bonus_var: None,
        }
    }

    pub fn scaled_leaf(cost: f64, var: usize) -> Self {
        Program::Leaf {
            cost,
            bonus_var: Some(var),
        }
    }

    pub fn branch(var: usize, threshold: i64, below: Program, above: Program) -> Self {
        Program::Branch {
            var,
            threshold,
            below: Box::new(below),
            above: Box::new(above),
        }
    }

    /// `if sym_0 > 100 { cost 10 } else { cost 0 }`
    pub fn two_way() -> Self {
        Program::branch(0, 100, Program::leaf(0.0), Program::leaf(10.0))
    }

    fn constraint(var: usize, threshold: i64, choice: u32) -> String {
        if choice == 0 {
            format!("sym_{var} <= {threshold}")
        } else {
            format!("sym_{var} > {threshold}")
        }
    }
}

fn value_of(bytes: &[u8], var: usize) -> i64 {
    bytes.get(var).copied().map_or(0, i64::from)
}

/// Simulated target implementing [`ReplayOracle`].
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    program: Program,
    pub concrete_runs: usize,
    pub replays: Vec<ReplayRequest>,
    /// Returned by every `replay` call when set.
    pub replay_error: Option<OracleError>,
    /// Report a different branch count for the first replayed decision.
    pub corrupt_prefix: bool,
    pub optimizing: bool,
    /// Report guided and optimizing runs without any constraints.
    pub drop_constraints: bool,
}

impl SimulatedTarget {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            concrete_runs: 0,
            replays: Vec::new(),
            replay_error: None,
            corrupt_prefix: false,
            optimizing: false,
            drop_constraints: false,
        }
    }

    fn execute(&self, bytes: &[u8]) -> (Trace, Option<usize>) {
        let mut decisions = Vec::new();
        let mut path_condition = PathCondition::default();
        let mut node = &self.program;
        loop {
            match node {
                Program::Leaf { cost, bonus_var } => {
                    let bonus = bonus_var.map_or(0, |var| value_of(bytes, var)) as f64;
                    let trace = Trace {
                        decisions,
                        end: TraceEnd::Terminated {
                            cost: Some(cost + bonus),
                        },
                        path_condition,
                        input_size: Some(bytes.len()),
                    };
                    return (trace, *bonus_var);
                }
                Program::Branch {
                    var,
                    threshold,
                    below,
                    above,
                } => {
                    let choice = u32::from(value_of(bytes, *var) > *threshold);
                    decisions.push(Decision::new(choice, 2));
                    path_condition.push(Program::constraint(*var, *threshold, choice));
                    node = if choice == 0 { below } else { above };
                }
            }
        }
    }
}

impl ReplayOracle for SimulatedTarget {
    fn run_concrete(&mut self, input: &Path) -> Result<Trace, OracleError> {
        self.concrete_runs += 1;
        let bytes = fs::read(input).map_err(|e| OracleError::Input(e.to_string()))?;
        Ok(self.execute(&bytes).0)
    }

    fn replay(&mut self, request: &ReplayRequest) -> Result<Trace, OracleError> {
        self.replays.push(request.clone());
        if let Some(err) = &self.replay_error {
            return Err(err.clone());
        }
        let mut decisions = Vec::new();
        let mut path_condition = PathCondition::default();
        let mut node = &self.program;
        let choices = request
            .prior_choices
            .iter()
            .chain(std::iter::once(&request.forced_choice));
        for &choice in choices {
            match node {
                Program::Leaf { .. } => {
                    return Ok(Trace {
                        decisions,
                        end: TraceEnd::Incomplete {
                            reason: "prefix runs past the end of the program".into(),
                        },
                        path_condition,
                        input_size: None,
                    });
                }
                Program::Branch {
                    var,
                    threshold,
                    below,
                    above,
                } => {
                    decisions.push(Decision::new(choice, 2));
                    path_condition.push(Program::constraint(*var, *threshold, choice));
                    node = if choice == 0 { below } else { above };
                }
            }
        }
        if self.drop_constraints {
            path_condition = PathCondition::default();
        }
        if self.corrupt_prefix {
            if let Some(first) = decisions.first_mut() {
                first.branch_count += 1;
            }
        }
        let end = match node {
            Program::Leaf { .. } => TraceEnd::Terminated { cost: None },
            Program::Branch { .. } => TraceEnd::Suspended {
                branch_count: Some(2),
            },
        };
        Ok(Trace {
            decisions,
            end,
            path_condition,
            input_size: None,
        })
    }

    fn optimize(&mut self, input: &Path) -> Result<Optimization, OracleError> {
        if !self.optimizing {
            return Ok(Optimization::Unsupported);
        }
        let bytes = fs::read(input).map_err(|e| OracleError::Input(e.to_string()))?;
        let (trace, bonus_var) = self.execute(&bytes);
        let TraceEnd::Terminated {
            cost: Some(original_cost),
        } = trace.end
        else {
            return Ok(Optimization::Incomplete {
                reason: "run did not terminate".into(),
            });
        };
        let Some(mut solution) = BoundsSolver::bounds(&trace.path_condition) else {
            return Ok(Optimization::Incomplete {
                reason: "concrete path is unsatisfiable".into(),
            });
        };
        for (index, byte) in bytes.iter().enumerate() {
            let name = format!("sym_{index}");
            if solution.get(&name).is_none() {
                solution.insert(name, i64::from(*byte));
            }
        }
        if let Some(var) = bonus_var {
            let mut maximized = trace.path_condition.clone();
            maximized.push(format!("sym_{var} > 254"));
            if let Some(best) = BoundsSolver::bounds(&maximized) {
                solution.insert(format!("sym_{var}"), best.get(&format!("sym_{var}")).unwrap_or(0));
            }
        }
        let path_condition = if self.drop_constraints {
            PathCondition::default()
        } else {
            trace.path_condition
        };
        Ok(Optimization::Found {
            original_cost,
            path_condition,
            solution,
            input_size: trace.input_size,
        })
    }
}

/// Interval solver for the constraints [`SimulatedTarget`] emits.
/// Picks the smallest byte value satisfying every bound.
#[derive(Debug, Default, Clone)]
pub struct BoundsSolver {
    pub calls: usize,
}

impl BoundsSolver {
    fn bounds(condition: &PathCondition) -> Option<Solution> {
        let mut ranges: std::collections::BTreeMap<String, (i64, i64)> = Default::default();
        for constraint in condition.constraints() {
            let parts: Vec<_> = constraint.split_whitespace().collect();
            let [name, op, value] = parts[..] else {
                continue;
            };
            let Ok(value) = value.parse::<i64>() else {
                continue;
            };
            let range = ranges.entry(name.to_string()).or_insert((0, 255));
            match op {
                "<=" => range.1 = range.1.min(value),
                ">" => range.0 = range.0.max(value + 1),
                _ => {}
            }
        }
        let mut solution = Solution::new();
        for (name, (lo, hi)) in ranges {
            if lo > hi {
                return None;
            }
            solution.insert(name, lo);
        }
        Some(solution)
    }
}

impl Solver for BoundsSolver {
    fn solve(&mut self, condition: &PathCondition) -> Result<Option<Solution>, OracleError> {
        self.calls += 1;
        Ok(Self::bounds(condition))
    }
}
