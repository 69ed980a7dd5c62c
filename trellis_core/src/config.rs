use crate::executor::CommandBackendConfig;
use crate::heuristic::HeuristicKind;
use crate::mutator::InputEncoding;
use crate::oracle::SymbolicBounds;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::trie::CostStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Directory the external fuzzer writes its initial inputs to.
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    /// Read instead of `input-dir` from the second cycle on (the fuzzer's queue).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_input_dir: Option<PathBuf>,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// Scratch directory for materialized inputs awaiting import.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// CSV audit trail; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_dir: Option<PathBuf>,
    /// Graphviz dumps of the trie after every phase; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trie_dot_dir: Option<PathBuf>,
    #[serde(default)]
    pub init_delay_ms: u64,
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Upper bound on explore/materialize/import rounds per cycle.
    #[serde(default = "default_max_inner_iterations")]
    pub max_inner_iterations: u64,
    /// Stop after this many cycles; runs until interrupted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cycles: Option<u64>,
    /// Untaken children forced per explore-mode call.
    #[serde(default = "default_additional_decisions")]
    pub additional_decisions: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub strategy: CostStrategy,
    /// Input size pinned for guided runs from nodes without one of their own.
    /// Defaults to the maximum the encoding can express.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_size: Option<usize>,
    /// First sequence number used for exported file names.
    #[serde(default)]
    pub export_id_start: u64,
    /// Dry-run every imported input for a cost-optimized variant first.
    #[serde(default)]
    pub optimize: bool,
    #[serde(default)]
    pub heuristic: HeuristicKind,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./in")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("./out")
}

pub fn default_tmp_dir() -> PathBuf {
    PathBuf::from("./.trellis/tmp")
}

fn default_idle_wait_ms() -> u64 {
    5_000
}

pub fn default_max_inner_iterations() -> u64 {
    10
}

fn default_additional_decisions() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            sync_input_dir: None,
            export_dir: default_export_dir(),
            tmp_dir: default_tmp_dir(),
            audit_dir: None,
            trie_dot_dir: None,
            init_delay_ms: 0,
            idle_wait_ms: default_idle_wait_ms(),
            max_inner_iterations: default_max_inner_iterations(),
            max_cycles: None,
            additional_decisions: default_additional_decisions(),
            queue_capacity: default_queue_capacity(),
            strategy: CostStrategy::default(),
            max_input_size: None,
            export_id_start: 0,
            optimize: false,
            heuristic: HeuristicKind::default(),
        }
    }
}

impl EngineSettings {
    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    /// Backend program and its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "SymbolicBounds::is_unbounded")]
    pub bounds: SymbolicBounds,
}

fn default_timeout_ms() -> u64 {
    60_000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TrellisConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub encoding: InputEncoding,
    #[serde(default)]
    pub oracle: OracleSettings,
}

impl TrellisConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: TrellisConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let engine = &self.engine;
        if engine.additional_decisions == 0 {
            anyhow::bail!("engine.additional-decisions must be at least 1");
        }
        if engine.max_inner_iterations == 0 {
            anyhow::bail!("engine.max-inner-iterations must be at least 1");
        }
        // The queue is drained only after an explore call returns, so a
        // single call must never produce more entries than fit.
        if engine.additional_decisions > engine.queue_capacity {
            anyhow::bail!(
                "engine.additional-decisions ({}) exceeds engine.queue-capacity ({})",
                engine.additional_decisions,
                engine.queue_capacity
            );
        }
        if self.oracle.command.is_empty() {
            anyhow::bail!("oracle.command must name the backend program");
        }
        if self.encoding.max_input_size() == 0 {
            anyhow::bail!("encoding must produce at least one variable");
        }
        if let Some(kind) = self.oracle.bounds.inverted() {
            anyhow::bail!("oracle.bounds: min-{kind} is greater than max-{kind}");
        }
        Ok(())
    }

    /// Input size for guided runs from nodes that recorded none.
    pub fn default_input_size(&self) -> usize {
        self.engine
            .max_input_size
            .unwrap_or_else(|| self.encoding.max_input_size())
    }

    pub fn backend_config(&self) -> CommandBackendConfig {
        CommandBackendConfig {
            command: self.oracle.command.clone(),
            timeout: Duration::from_millis(self.oracle.timeout_ms),
            working_dir: self.oracle.working_dir.clone(),
            strategy: self.engine.strategy,
            bounds: self.oracle.bounds,
        }
    }
}
