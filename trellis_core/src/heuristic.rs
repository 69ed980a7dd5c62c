use crate::trie::{CostStrategy, NodeId, Trie};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Picks the frontier node the next guided replay should expand.
///
/// Implementations must be deterministic for a given trie state (and seed),
/// so that a session can be replayed while debugging. Ties are broken by the
/// lexicographically smallest choice prefix.
pub trait TrieAnalysis: Send {
    fn name(&self) -> &'static str;

    /// Returns `None` when the trie has no frontier node left; the control
    /// loop treats that as the end of the current guided-exploration phase.
    fn analyze(&mut self, trie: &Trie) -> Option<NodeId>;
}

/// Configuration-selectable set of heuristics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum HeuristicKind {
    /// Frontier node whose subtree holds the best cost; deeper first on ties,
    /// since an ancestor always shares the best cost of its descendants.
    #[default]
    HighestCost,
    /// Shallowest frontier node first (breadth-first flavour).
    Shallowest,
    /// Uniformly random frontier node from a seeded generator.
    Random {
        #[serde(default)]
        seed: u64,
    },
}

impl HeuristicKind {
    pub fn build(&self) -> Box<dyn TrieAnalysis> {
        match self {
            HeuristicKind::HighestCost => Box::new(HighestCostFirst),
            HeuristicKind::Shallowest => Box::new(ShallowestFirst),
            HeuristicKind::Random { seed } => Box::new(RandomFrontier::new(*seed)),
        }
    }
}

/// Prefix of every frontier node, sorted lexicographically.
fn frontier_by_prefix(trie: &Trie) -> Vec<(Vec<u32>, NodeId)> {
    let mut nodes: Vec<_> = trie
        .frontier_nodes()
        .map(|id| (trie.prefix(id), id))
        .collect();
    nodes.sort();
    nodes
}

/// Orders two optional costs so that the better one comes first;
/// nodes without any recorded cost go last.
fn compare_cost(strategy: CostStrategy, a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            match strategy {
                CostStrategy::Maximize => ord.reverse(),
                CostStrategy::Minimize => ord,
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HighestCostFirst;

impl TrieAnalysis for HighestCostFirst {
    fn name(&self) -> &'static str {
        "highest-cost"
    }

    fn analyze(&mut self, trie: &Trie) -> Option<NodeId> {
        let strategy = trie.strategy();
        frontier_by_prefix(trie)
            .into_iter()
            .min_by(|(prefix_a, a), (prefix_b, b)| {
                compare_cost(strategy, trie.best_cost_of(*a), trie.best_cost_of(*b))
                    .then(prefix_b.len().cmp(&prefix_a.len()))
                    .then_with(|| prefix_a.cmp(prefix_b))
            })
            .map(|(_, id)| id)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShallowestFirst;

impl TrieAnalysis for ShallowestFirst {
    fn name(&self) -> &'static str {
        "shallowest"
    }

    fn analyze(&mut self, trie: &Trie) -> Option<NodeId> {
        frontier_by_prefix(trie)
            .into_iter()
            .min_by(|(prefix_a, _), (prefix_b, _)| {
                prefix_a
                    .len()
                    .cmp(&prefix_b.len())
                    .then_with(|| prefix_a.cmp(prefix_b))
            })
            .map(|(_, id)| id)
    }
}

#[derive(Debug)]
pub struct RandomFrontier {
    rng: ChaCha8Rng,
}

impl RandomFrontier {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl TrieAnalysis for RandomFrontier {
    fn name(&self) -> &'static str {
        "random"
    }

    fn analyze(&mut self, trie: &Trie) -> Option<NodeId> {
        let candidates = frontier_by_prefix(trie);
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..candidates.len());
        Some(candidates[index].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Decision;

    /// root: 3-way decision
    ///   0 -> leaf cost 1
    ///   1 -> 2-way decision, child 0 -> leaf cost 9
    fn sample_trie(strategy: CostStrategy) -> Trie {
        let mut trie = Trie::new(strategy);
        let low = trie
            .create_or_get_node(&[Decision::new(0, 3)], None, true)
            .unwrap()
            .node;
        trie.record_leaf(low, 1.0).unwrap();
        let high = trie
            .create_or_get_node(&[Decision::new(1, 3), Decision::new(0, 2)], None, true)
            .unwrap()
            .node;
        trie.record_leaf(high, 9.0).unwrap();
        trie
    }

    #[test]
    fn empty_frontier_yields_none() {
        let trie = Trie::new(CostStrategy::Maximize);
        for kind in [
            HeuristicKind::HighestCost,
            HeuristicKind::Shallowest,
            HeuristicKind::Random { seed: 1 },
        ] {
            assert_eq!(kind.build().analyze(&trie), None, "{kind:?}");
        }
    }

    #[test]
    fn highest_cost_prefers_the_expensive_subtree() {
        let trie = sample_trie(CostStrategy::Maximize);
        let picked = HighestCostFirst.analyze(&trie).unwrap();
        assert_eq!(trie.prefix(picked), vec![1]);
    }

    #[test]
    fn highest_cost_flips_under_minimize() {
        let trie = sample_trie(CostStrategy::Minimize);
        let picked = HighestCostFirst.analyze(&trie).unwrap();
        // The root holds the cheapest leaf (cost 1) beneath it.
        assert_eq!(trie.prefix(picked), Vec::<u32>::new());
    }

    #[test]
    fn shallowest_picks_the_root_first() {
        let trie = sample_trie(CostStrategy::Maximize);
        assert_eq!(ShallowestFirst.analyze(&trie), Some(NodeId::ROOT));
    }

    #[test]
    fn ties_break_on_lexicographic_prefix() {
        let mut trie = Trie::new(CostStrategy::Maximize);
        trie.create_or_get_node(&[Decision::new(1, 2), Decision::new(0, 2)], None, true)
            .unwrap();
        trie.create_or_get_node(&[Decision::new(0, 2), Decision::new(0, 2)], None, true)
            .unwrap();
        // root is fully explored now; both depth-1 nodes are frontier without costs.
        let picked = ShallowestFirst.analyze(&trie).unwrap();
        assert_eq!(trie.prefix(picked), vec![0]);
        let picked = HighestCostFirst.analyze(&trie).unwrap();
        assert_eq!(trie.prefix(picked), vec![0]);
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let trie = sample_trie(CostStrategy::Maximize);
        let picks = |seed| {
            let mut heuristic = RandomFrontier::new(seed);
            (0..10)
                .map(|_| heuristic.analyze(&trie).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
        let frontier: Vec<_> = trie.frontier_nodes().collect();
        assert!(picks(7).iter().all(|id| frontier.contains(id)));
    }

    #[test]
    fn heuristic_kind_parses_from_toml() {
        let kind: HeuristicKind = toml::from_str("kind = \"random\"\nseed = 3\n").unwrap();
        assert_eq!(kind, HeuristicKind::Random { seed: 3 });
        assert_eq!(kind.build().name(), "random");
        let kind: HeuristicKind = toml::from_str("kind = \"shallowest\"\n").unwrap();
        assert_eq!(kind.build().name(), "shallowest");
    }
}
