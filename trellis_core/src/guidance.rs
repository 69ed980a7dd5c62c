use crate::feedback::ImportOutcome;
use crate::observer::CostObserver;
use crate::oracle::{
    Decision, OracleError, Optimization, ReplayOracle, ReplayRequest, Solver, TraceEnd,
};
use crate::queue::{PendingSolution, QueueError, SolutionQueue};
use crate::trie::{NodeId, Trie, TrieError};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("trie rejected the recorded path: {0}")]
    Trie(#[from] TrieError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A replay did not reproduce the recorded prefix of `node`.
    #[error(
        "replay of node {node:?} diverged at decision {position}: expected {expected:?}, observed {observed:?}"
    )]
    PrefixDiverged {
        node: NodeId,
        position: usize,
        expected: Option<Decision>,
        observed: Option<Decision>,
    },

    /// The run ended without usable constraints (exception in the target,
    /// unsatisfiable concrete path, ...).
    #[error("incomplete run: {0}")]
    IncompleteRun(String),
}

impl GuidanceError {
    /// Fatal errors must stop the engine: the backend is misconfigured or the
    /// target is not deterministic, so nothing it reports can be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            GuidanceError::Oracle(e) => e.is_fatal(),
            GuidanceError::Trie(TrieError::NonFiniteCost(_)) => false,
            GuidanceError::Trie(_)
            | GuidanceError::Queue(_)
            | GuidanceError::PrefixDiverged { .. } => true,
            GuidanceError::IncompleteRun(_) => false,
        }
    }
}

/// Runs `input` concretely and folds the observed path into the trie.
///
/// An incomplete run leaves the trie untouched.
pub fn import_input(
    trie: &mut Trie,
    oracle: &mut dyn ReplayOracle,
    observer: &mut CostObserver,
    input: &Path,
) -> Result<ImportOutcome, GuidanceError> {
    observer.reset();
    let trace = oracle.run_concrete(input)?;
    observer.observe(&trace);
    if let TraceEnd::Incomplete { reason } = &trace.end {
        return Err(GuidanceError::IncompleteRun(reason.clone()));
    }

    let insert = trie.create_or_get_node(&trace.decisions, observer.last_input_size(), true)?;
    let mut outcome = ImportOutcome {
        exposed_new_branch: insert.exposed_new_branch(),
        observed_better_score: false,
        cost: observer.last_cost(),
    };
    match trace.end {
        TraceEnd::Terminated { cost: Some(cost) } => {
            outcome.observed_better_score = trie.record_leaf(insert.node, cost)?;
        }
        TraceEnd::Terminated { cost: None } => trie.mark_terminal(insert.node)?,
        TraceEnd::Suspended {
            branch_count: Some(branch_count),
        } => trie.set_branch_count(insert.node, branch_count)?,
        TraceEnd::Suspended { branch_count: None } | TraceEnd::Incomplete { .. } => {}
    }
    log::debug!(
        "imported {input:?}: {} decisions, cost {:?}, new branch {}, better score {}",
        trace.decisions.len(),
        outcome.cost,
        outcome.exposed_new_branch,
        outcome.observed_better_score
    );
    Ok(outcome)
}

/// Summary of one explore-mode call.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExploreReport {
    /// Untaken children replayed.
    pub attempted: usize,
    /// Children whose path condition was solved and queued.
    pub queued: usize,
    /// Children the solver proved unsatisfiable.
    pub unsatisfiable: usize,
    /// Children whose guided run did not complete.
    pub incomplete: usize,
}

/// Forces up to `budget` untaken children of `node`, in ascending choice order.
///
/// Each forced run replays the recorded prefix of `node` exactly. Any
/// deviation from the recorded decisions is fatal. Children that turn out to
/// be unsatisfiable or whose run is incomplete are pruned, so the node never
/// stays on the frontier because of them. A run without constraints or with
/// an empty assignment counts as incomplete.
///
/// Stops early once `queue` is full; the remaining children stay untaken.
#[allow(clippy::too_many_arguments)]
pub fn explore(
    trie: &mut Trie,
    oracle: &mut dyn ReplayOracle,
    solver: &mut dyn Solver,
    queue: &SolutionQueue,
    observer: &mut CostObserver,
    node: NodeId,
    budget: usize,
    input_size: usize,
) -> Result<ExploreReport, GuidanceError> {
    let mut report = ExploreReport::default();
    let target = trie.node(node).ok_or(TrieError::UnknownNode(node))?;
    let branch_count = target.branch_count().unwrap_or(0);
    let choices: Vec<u32> = target.unexplored_choices().into_iter().take(budget).collect();
    let recorded = trie.decisions_to(node);
    let prior_choices: Vec<u32> = recorded.iter().map(|d| d.choice).collect();

    for choice in choices {
        if queue.len() >= queue.capacity() {
            log::debug!(
                "solution queue is full, leaving the other children of {node:?} for later"
            );
            break;
        }
        report.attempted += 1;
        let request = ReplayRequest {
            prior_choices: prior_choices.clone(),
            forced_choice: choice,
            input_size,
        };
        observer.reset();
        observer.pin_input_size(input_size);

        let trace = match oracle.replay(&request) {
            Ok(trace) => trace,
            Err(e) if !e.is_fatal() => {
                log::warn!("guided run for choice {choice} of node {node:?} failed: {e}");
                report.incomplete += 1;
                trie.mark_pruned(node, choice)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        observer.observe(&trace);
        if let TraceEnd::Incomplete { reason } = &trace.end {
            log::warn!("guided run for choice {choice} of node {node:?} is incomplete: {reason}");
            report.incomplete += 1;
            trie.mark_pruned(node, choice)?;
            continue;
        }

        let mut expected = recorded.clone();
        expected.push(Decision::new(choice, branch_count));
        check_prefix(node, &expected, &trace.decisions)?;
        if trace.path_condition.is_empty() {
            log::warn!(
                "guided run for choice {choice} of node {node:?} produced no constraints"
            );
            report.incomplete += 1;
            trie.mark_pruned(node, choice)?;
            continue;
        }

        let solution = match solver.solve(&trace.path_condition) {
            Ok(Some(solution)) if solution.is_empty() => {
                log::warn!(
                    "solver returned an empty assignment for choice {choice} of node {node:?}"
                );
                report.incomplete += 1;
                trie.mark_pruned(node, choice)?;
                continue;
            }
            Ok(Some(solution)) => solution,
            Ok(None) => {
                log::debug!("choice {choice} of node {node:?} is unsatisfiable");
                report.unsatisfiable += 1;
                trie.mark_pruned(node, choice)?;
                continue;
            }
            Err(e) if !e.is_fatal() => {
                log::warn!("solver gave up on choice {choice} of node {node:?}: {e}");
                report.incomplete += 1;
                trie.mark_pruned(node, choice)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let reached = trie
            .create_or_get_node(&trace.decisions, Some(input_size), false)?
            .node;
        match trace.end {
            TraceEnd::Terminated { .. } => trie.mark_terminal(reached)?,
            TraceEnd::Suspended {
                branch_count: Some(count),
            } => trie.set_branch_count(reached, count)?,
            TraceEnd::Suspended { branch_count: None } | TraceEnd::Incomplete { .. } => {}
        }
        trie.mark_explored(node, choice)?;

        queue.put(PendingSolution {
            path_condition: trace.path_condition,
            solution,
            input_size: observer.last_input_size().unwrap_or(input_size),
        })?;
        report.queued += 1;
    }
    Ok(report)
}

fn check_prefix(
    node: NodeId,
    expected: &[Decision],
    observed: &[Decision],
) -> Result<(), GuidanceError> {
    for position in 0..expected.len() {
        let (want, got) = (expected.get(position), observed.get(position));
        if want != got {
            return Err(GuidanceError::PrefixDiverged {
                node,
                position,
                expected: want.copied(),
                observed: got.copied(),
            });
        }
    }
    Ok(())
}

/// Assignment proposed by an optimizing dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedCandidate {
    /// Cost of the unmodified input.
    pub original_cost: f64,
    pub pending: PendingSolution,
}

/// Dry optimizing run over `input`. Leaves the trie untouched.
///
/// Returns `Ok(None)` when the backend cannot optimize, in which case the
/// caller falls back to a plain import.
pub fn optimize_input(
    oracle: &mut dyn ReplayOracle,
    observer: &mut CostObserver,
    input: &Path,
    default_input_size: usize,
) -> Result<Option<OptimizedCandidate>, GuidanceError> {
    observer.reset();
    match oracle.optimize(input)? {
        Optimization::Unsupported => Ok(None),
        Optimization::Incomplete { reason } => Err(GuidanceError::IncompleteRun(reason)),
        Optimization::Found {
            original_cost,
            path_condition,
            solution,
            input_size,
        } => {
            if path_condition.is_empty() || solution.is_empty() {
                return Err(GuidanceError::IncompleteRun(
                    "optimizing run returned no constraints or no assignment".into(),
                ));
            }
            Ok(Some(OptimizedCandidate {
                original_cost,
                pending: PendingSolution {
                    path_condition,
                    solution,
                    input_size: input_size.unwrap_or(default_input_size),
                },
            }))
        }
    }
}
