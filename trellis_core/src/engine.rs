//! The control loop.
//!
//! ```text
//! INIT --(startup delay)--> CYCLE <--(idle wait)--> IDLE
//! ```
//!
//! A cycle imports every new file from the watched directory, then runs up
//! to `max-inner-iterations` rounds of: pick a frontier node, explore it,
//! materialize the queued solutions, import the generated files and export
//! the interesting ones. A cycle with no new input and an empty frontier
//! goes idle instead. The loop only ends on cancellation, after
//! `max-cycles`, or on a fatal error.

use crate::config::{EngineSettings, TrellisConfig};
use crate::corpus::{Exporter, SeenInputs, SequenceCounter};
use crate::feedback::{ImportOutcome, optimized_export_tags};
use crate::guidance::{self, GuidanceError, OptimizedCandidate};
use crate::heuristic::TrieAnalysis;
use crate::mutator::Materializer;
use crate::observer::CostObserver;
use crate::oracle::{ReplayOracle, Solver};
use crate::queue::SolutionQueue;
use crate::shutdown::Shutdown;
use crate::stats::AuditLog;
use crate::trie::{NodeId, Trie};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    #[error("failed to prepare directory {path:?}: {source}")]
    Setup { path: PathBuf, source: io::Error },
}

/// Where an imported file came from, which decides what happens to it after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Produced by the external fuzzer. Logged, never moved.
    Import,
    /// Generated by the engine. Exported when interesting, deleted otherwise.
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Progressed,
    /// Nothing to import and nothing left to explore.
    Idle,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineTotals {
    pub cycles: u64,
    pub imported: u64,
    pub explored_nodes: u64,
    pub generated: u64,
    pub exported: u64,
}

pub struct Engine {
    settings: EngineSettings,
    default_input_size: usize,
    trie: Trie,
    heuristic: Box<dyn TrieAnalysis>,
    queue: SolutionQueue,
    seen: SeenInputs,
    materializer: Materializer,
    exporter: Exporter,
    audit: AuditLog,
    observer: CostObserver,
    oracle: Box<dyn ReplayOracle>,
    solver: Box<dyn Solver>,
    shutdown: Shutdown,
    totals: EngineTotals,
}

impl Engine {
    pub fn new(
        config: &TrellisConfig,
        oracle: Box<dyn ReplayOracle>,
        solver: Box<dyn Solver>,
        shutdown: Shutdown,
    ) -> Result<Self, EngineError> {
        let settings = config.engine.clone();
        for dir in [&settings.tmp_dir, &settings.export_dir] {
            fs::create_dir_all(dir).map_err(|source| EngineError::Setup {
                path: dir.clone(),
                source,
            })?;
        }
        let audit = settings
            .audit_dir
            .clone()
            .map_or_else(AuditLog::disabled, AuditLog::new);
        let heuristic = settings.heuristic.build();
        log::info!(
            "trellis engine: strategy {:?}, heuristic {}, {} additional decision(s) per explore",
            settings.strategy,
            heuristic.name(),
            settings.additional_decisions
        );

        Ok(Self {
            default_input_size: config.default_input_size(),
            trie: Trie::new(settings.strategy),
            heuristic,
            queue: SolutionQueue::with_shutdown(settings.queue_capacity, shutdown.clone()),
            seen: SeenInputs::new(),
            materializer: Materializer::new(
                settings.tmp_dir.clone(),
                config.encoding.clone(),
                Arc::new(SequenceCounter::default()),
                audit.clone(),
            ),
            exporter: Exporter::new(
                settings.export_dir.clone(),
                SequenceCounter::starting_at(settings.export_id_start),
            ),
            audit,
            observer: CostObserver::new(),
            oracle,
            solver,
            shutdown,
            totals: EngineTotals::default(),
            settings,
        })
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn seen_inputs(&self) -> &SeenInputs {
        &self.seen
    }

    pub fn totals(&self) -> EngineTotals {
        self.totals
    }

    /// Runs the state machine until cancelled, `max-cycles` is reached, or a
    /// fatal error occurs.
    pub fn run(&mut self) -> Result<EngineTotals, EngineError> {
        if self.shutdown.sleep(self.settings.init_delay()) {
            log::info!("cancelled during startup delay");
            return Ok(self.totals);
        }

        while !self.shutdown.is_triggered() {
            if self
                .settings
                .max_cycles
                .is_some_and(|max| self.totals.cycles >= max)
            {
                log::info!("reached {} cycle(s), stopping", self.totals.cycles);
                break;
            }
            if self.cycle()? == CycleOutcome::Idle {
                log::info!(
                    "nothing to process, waiting {:?} for new input",
                    self.settings.idle_wait()
                );
                if self.shutdown.sleep(self.settings.idle_wait()) {
                    break;
                }
            }
        }

        self.queue.close();
        log::info!(
            "engine stopped: {} cycles, {} imported, {} generated, {} exported, best cost {:?}",
            self.totals.cycles,
            self.totals.imported,
            self.totals.generated,
            self.totals.exported,
            self.trie.best_cost()
        );
        Ok(self.totals)
    }

    fn watched_dir(&self) -> &Path {
        match (&self.settings.sync_input_dir, self.totals.cycles) {
            (Some(sync), cycles) if cycles > 0 => sync,
            _ => &self.settings.input_dir,
        }
    }

    /// One CYCLE of the state machine.
    pub fn cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let dir = self.watched_dir().to_path_buf();
        self.totals.cycles += 1;

        let new_files = self.seen.poll_new_files(&dir).unwrap_or_else(|e| {
            log::warn!("{e}");
            Vec::new()
        });
        if new_files.is_empty() && self.trie.is_frontier_empty() {
            return Ok(CycleOutcome::Idle);
        }

        if !new_files.is_empty() {
            log::info!("importing {} new input(s) from {dir:?}", new_files.len());
            for file in &new_files {
                self.process_input(file, ImportMode::Import)?;
            }
            self.record_statistics();
        }

        for iteration in 0..self.settings.max_inner_iterations {
            if self.shutdown.is_triggered() {
                break;
            }
            let selected = self.heuristic.analyze(&self.trie);
            self.dump_trie("trie-analyzed.dot");
            let Some(node) = selected else {
                log::debug!("no frontier node left after {iteration} iteration(s)");
                break;
            };
            self.explore(node)?;
            self.record_statistics();
            self.dump_trie("trie-explored.dot");

            for file in self.materialize_pending() {
                self.process_input(&file, ImportMode::Export)?;
            }
            self.dump_trie("trie-extended.dot");
            self.record_statistics();
        }
        Ok(CycleOutcome::Progressed)
    }

    fn explore(&mut self, node: NodeId) -> Result<(), EngineError> {
        let input_size = self
            .trie
            .node(node)
            .and_then(|n| n.input_size())
            .unwrap_or(self.default_input_size);
        log::info!(
            "exploring node {:?} (prefix {:?}, best cost {:?}, input size {input_size})",
            node,
            self.trie.prefix(node),
            self.trie.best_cost_of(node)
        );
        self.totals.explored_nodes += 1;
        let result = guidance::explore(
            &mut self.trie,
            self.oracle.as_mut(),
            self.solver.as_mut(),
            &self.queue,
            &mut self.observer,
            node,
            self.settings.additional_decisions,
            input_size,
        );
        match result {
            Ok(report) => {
                log::debug!("explore report for {node:?}: {report:?}");
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                log::error!("guided exploration of {node:?} failed: {e}");
                Err(e.into())
            }
            Err(e) => {
                log::warn!("guided exploration of {node:?} skipped: {e}");
                Ok(())
            }
        }
    }

    fn materialize_pending(&mut self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        while let Some(pending) = self.queue.try_take() {
            match self.materializer.materialize(&pending) {
                Ok(Some(file)) => {
                    self.totals.generated += 1;
                    files.push(file);
                }
                Ok(None) => {}
                Err(e) => log::warn!("{e}"),
            }
        }
        files
    }

    fn process_input(&mut self, file: &Path, mode: ImportMode) -> Result<(), EngineError> {
        if self.settings.optimize {
            let candidate = guidance::optimize_input(
                self.oracle.as_mut(),
                &mut self.observer,
                file,
                self.default_input_size,
            );
            match candidate {
                Ok(Some(candidate)) => return self.import_optimized(file, candidate, mode),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return self.skip_or_fail(file, e, mode),
                Err(e) => log::debug!("no optimized variant of {file:?}: {e}"),
            }
        }
        self.import(file, mode)
    }

    fn import(&mut self, file: &Path, mode: ImportMode) -> Result<(), EngineError> {
        let outcome = match self.run_import(file) {
            Ok(outcome) => outcome,
            Err(e) => return self.skip_or_fail(file, e, mode),
        };
        match mode {
            ImportMode::Import => {
                let tags = outcome.import_tags(self.trie.strategy());
                self.audit.import(file, &tags);
            }
            ImportMode::Export => self.export_or_discard(file, &outcome),
        }
        Ok(())
    }

    fn run_import(&mut self, file: &Path) -> Result<ImportOutcome, GuidanceError> {
        let outcome =
            guidance::import_input(&mut self.trie, self.oracle.as_mut(), &mut self.observer, file)?;
        self.totals.imported += 1;
        Ok(outcome)
    }

    /// Imports the optimized variant of `original` in its place.
    fn import_optimized(
        &mut self,
        original: &Path,
        candidate: OptimizedCandidate,
        mode: ImportMode,
    ) -> Result<(), EngineError> {
        let optimized = match self.materializer.materialize(&candidate.pending) {
            Ok(Some(file)) => file,
            Ok(None) => return self.import(original, mode),
            Err(e) => {
                log::warn!("{e}");
                return self.import(original, mode);
            }
        };
        self.totals.generated += 1;
        if mode == ImportMode::Export {
            discard(original);
        }

        let outcome = match self.run_import(&optimized) {
            Ok(outcome) => outcome,
            Err(e) => return self.skip_or_fail(&optimized, e, ImportMode::Export),
        };
        match mode {
            ImportMode::Import => {
                let strategy = self.trie.strategy();
                self.audit.import(&optimized, &outcome.import_tags(strategy));
                let improved = outcome
                    .cost
                    .is_some_and(|cost| strategy.is_better(cost, Some(candidate.original_cost)));
                if improved && outcome.observed_better_score {
                    self.export(&optimized, &optimized_export_tags(strategy, outcome.cost));
                } else {
                    discard(&optimized);
                }
            }
            ImportMode::Export => self.export_or_discard(&optimized, &outcome),
        }
        Ok(())
    }

    fn skip_or_fail(
        &mut self,
        file: &Path,
        err: GuidanceError,
        mode: ImportMode,
    ) -> Result<(), EngineError> {
        if err.is_fatal() {
            log::error!("import of {file:?} failed: {err}");
            return Err(err.into());
        }
        log::warn!("skipping {file:?}: {err}");
        if mode == ImportMode::Export {
            discard(file);
        }
        Ok(())
    }

    fn export_or_discard(&mut self, file: &Path, outcome: &ImportOutcome) {
        if outcome.is_interesting() {
            self.export(file, &outcome.export_tags(self.trie.strategy()));
        } else {
            discard(file);
        }
    }

    fn export(&mut self, file: &Path, tags: &str) {
        match self.exporter.export(file) {
            Ok(destination) => {
                log::info!("exported {file:?} as {destination:?}{tags}");
                self.audit.export(file, &destination, tags);
                self.totals.exported += 1;
            }
            Err(e) => log::warn!("{e}"),
        }
    }

    fn record_statistics(&self) {
        let stats = self.trie.stats();
        log::debug!(
            "trie: {} nodes, {} frontier, {} leaves, best cost {:?}",
            stats.nodes,
            stats.frontier,
            stats.leaves,
            stats.best_cost
        );
        self.audit
            .trie_statistics(&stats, self.queue.len(), self.seen.len());
    }

    fn dump_trie(&self, name: &str) {
        let Some(dir) = &self.settings.trie_dot_dir else {
            return;
        };
        let path = dir.join(name);
        if let Err(e) = fs::create_dir_all(dir).and_then(|()| fs::write(&path, self.trie.to_dot())) {
            log::warn!("could not write trie dump {path:?}: {e}");
        }
    }
}

fn discard(file: &Path) {
    if let Err(e) = fs::remove_file(file) {
        log::warn!("could not remove generated input {file:?}: {e}");
    }
}
