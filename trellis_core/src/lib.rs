pub mod config;
pub mod corpus;
pub mod engine;
pub mod executor;
pub mod feedback;
pub mod guidance;
pub mod heuristic;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod queue;
pub mod shutdown;
pub mod stats;
pub mod trie;

#[cfg(test)]
mod test_support;

pub use config::TrellisConfig;
pub use corpus::{CorpusError, Exporter, SeenInputs, SequenceCounter};
pub use engine::{CycleOutcome, Engine, EngineError, EngineTotals, ImportMode};
pub use executor::{CommandBackend, CommandBackendConfig};
pub use feedback::ImportOutcome;
pub use guidance::{ExploreReport, GuidanceError};
pub use heuristic::{HeuristicKind, TrieAnalysis};
pub use mutator::{InputEncoding, MaterializeError, Materializer};
pub use observer::CostObserver;
pub use oracle::{
    Decision, OracleError, PathCondition, ReplayOracle, ReplayRequest, Solution, Solver,
    SymbolicBounds, Trace, TraceEnd,
};
pub use queue::{PendingSolution, QueueError, SolutionQueue};
pub use shutdown::Shutdown;
pub use stats::AuditLog;
pub use trie::{CostStrategy, NodeId, NodeStatus, Trie, TrieError};
