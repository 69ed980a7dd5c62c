use crate::oracle::Decision;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use thiserror::Error;

/// Errors raised when a recorded path contradicts the trie.
///
/// The structural variants mean the target did not behave deterministically
/// (or the oracle reported inconsistent branch structure), so callers treat
/// them as fatal. A non-finite cost only invalidates the run that reported it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    /// A choice index was not smaller than the decision's branch count.
    #[error("choice {choice} is out of range for a decision with {branch_count} branches")]
    ChoiceOutOfRange { choice: u32, branch_count: u32 },

    /// The same prefix produced a different branch count than first recorded.
    #[error("node {node:?} was recorded with {recorded} branches but the run reported {observed}")]
    BranchCountMismatch {
        node: NodeId,
        recorded: u32,
        observed: u32,
    },

    /// A leaf was reported for a node that already has children, or vice versa.
    #[error("node {0:?} is both a decision point and a terminal")]
    TerminalConflict(NodeId),

    /// The node id does not belong to this trie.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// A leaf cost was NaN or infinite.
    #[error("node {0:?} reported a non-finite cost")]
    NonFiniteCost(NodeId),
}

/// Which direction of cost counts as "better".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CostStrategy {
    #[default]
    Maximize,
    Minimize,
}

impl CostStrategy {
    /// `true` when `candidate` is strictly better than `current`.
    /// Any cost beats no cost at all.
    pub fn is_better(self, candidate: f64, current: Option<f64>) -> bool {
        match current {
            None => true,
            Some(current) => match self {
                CostStrategy::Maximize => candidate > current,
                CostStrategy::Minimize => candidate < current,
            },
        }
    }

    /// Combines two costs, keeping the better one.
    pub fn pick(self, a: f64, b: f64) -> f64 {
        match self {
            CostStrategy::Maximize => a.max(b),
            CostStrategy::Minimize => a.min(b),
        }
    }

    /// Outcome tag used in the audit log for an improved score.
    pub fn score_tag(self) -> &'static str {
        match self {
            CostStrategy::Maximize => "highscore",
            CostStrategy::Minimize => "lowscore",
        }
    }
}

/// Arena index of a trie node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// Exploration status of a node, derived from its structure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    /// Known to exist, but no run has reported its branch structure yet.
    Unvisited,
    /// Decision point with at least one child that is neither taken nor pruned.
    Frontier,
    /// Every child is either taken or pruned.
    FullyExplored,
    /// End of execution.
    Leaf,
}

#[derive(Debug, Clone)]
pub struct TrieNode {
    parent: Option<NodeId>,
    /// Choice taken at the parent to reach this node.
    choice: u32,
    depth: usize,
    branch_count: Option<u32>,
    children: BTreeMap<u32, NodeId>,
    pruned: BTreeSet<u32>,
    terminal: bool,
    witnessed: bool,
    leaf_cost: Option<f64>,
    best_cost: Option<f64>,
    input_size: Option<usize>,
}

impl TrieNode {
    fn new(parent: Option<NodeId>, choice: u32, depth: usize, input_size: Option<usize>) -> Self {
        Self {
            parent,
            choice,
            depth,
            branch_count: None,
            children: BTreeMap::new(),
            pruned: BTreeSet::new(),
            terminal: false,
            witnessed: false,
            leaf_cost: None,
            best_cost: None,
            input_size,
        }
    }

    pub fn status(&self) -> NodeStatus {
        if self.terminal {
            return NodeStatus::Leaf;
        }
        match self.branch_count {
            None => NodeStatus::Unvisited,
            Some(count) if (self.children.len() + self.pruned.len()) as u32 >= count => {
                NodeStatus::FullyExplored
            }
            Some(_) => NodeStatus::Frontier,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn choice(&self) -> u32 {
        self.choice
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn branch_count(&self) -> Option<u32> {
        self.branch_count
    }

    pub fn child(&self, choice: u32) -> Option<NodeId> {
        self.children.get(&choice).copied()
    }

    pub fn children(&self) -> impl Iterator<Item = (u32, NodeId)> + '_ {
        self.children.iter().map(|(choice, id)| (*choice, *id))
    }

    pub fn is_pruned(&self, choice: u32) -> bool {
        self.pruned.contains(&choice)
    }

    /// Choices that are neither taken nor pruned, in ascending order.
    pub fn unexplored_choices(&self) -> Vec<u32> {
        match self.branch_count {
            Some(count) if !self.terminal => (0..count)
                .filter(|c| !self.children.contains_key(c) && !self.pruned.contains(c))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Reached by at least one concrete run.
    pub fn is_witnessed(&self) -> bool {
        self.witnessed
    }

    pub fn leaf_cost(&self) -> Option<f64> {
        self.leaf_cost
    }

    pub fn best_cost(&self) -> Option<f64> {
        self.best_cost
    }

    /// Input length of the run that first discovered this node.
    pub fn input_size(&self) -> Option<usize> {
        self.input_size
    }
}

/// Result of inserting a recorded path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInsert {
    /// Node reached after the last decision of the path.
    pub node: NodeId,
    /// Number of nodes that did not exist before.
    pub created: usize,
    /// Number of existing nodes that were witnessed for the first time.
    pub newly_witnessed: usize,
}

impl PathInsert {
    pub fn exposed_new_branch(&self) -> bool {
        self.created > 0 || self.newly_witnessed > 0
    }
}

/// Aggregate numbers reported after every phase of the control loop.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct TrieStats {
    pub nodes: usize,
    pub frontier: usize,
    pub fully_explored: usize,
    pub unvisited: usize,
    pub leaves: usize,
    pub best_cost: Option<f64>,
}

/// Persistent prefix tree of branch decisions with cost bookkeeping.
#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<TrieNode>,
    strategy: CostStrategy,
    frontier: BTreeSet<NodeId>,
    best_cost: Option<f64>,
}

impl Trie {
    pub fn new(strategy: CostStrategy) -> Self {
        Self {
            nodes: vec![TrieNode::new(None, 0, 0, None)],
            strategy,
            frontier: BTreeSet::new(),
            best_cost: None,
        }
    }

    pub fn strategy(&self) -> CostStrategy {
        self.strategy
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` while only the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn node(&self, id: NodeId) -> Option<&TrieNode> {
        self.nodes.get(id.0)
    }

    fn node_ref(&self, id: NodeId) -> Result<&TrieNode, TrieError> {
        self.nodes.get(id.0).ok_or(TrieError::UnknownNode(id))
    }

    /// Global best leaf cost recorded so far.
    pub fn best_cost(&self) -> Option<f64> {
        self.best_cost
    }

    /// Best leaf cost in the subtree below `id`.
    pub fn best_cost_of(&self, id: NodeId) -> Option<f64> {
        self.node(id).and_then(TrieNode::best_cost)
    }

    /// `true` when no node with an unexplored child remains.
    pub fn is_frontier_empty(&self) -> bool {
        self.frontier.is_empty()
    }

    /// Frontier nodes in ascending id order.
    pub fn frontier_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.frontier.iter().copied()
    }

    /// Choice sequence leading from the root to `id`.
    pub fn prefix(&self, id: NodeId) -> Vec<u32> {
        let mut choices = Vec::new();
        let mut current = id;
        while let Some(node) = self.nodes.get(current.0) {
            match node.parent {
                Some(parent) => {
                    choices.push(node.choice);
                    current = parent;
                }
                None => break,
            }
        }
        choices.reverse();
        choices
    }

    /// Recorded decisions (choice plus branch count) leading to `id`.
    pub fn decisions_to(&self, id: NodeId) -> Vec<Decision> {
        let mut decisions = Vec::new();
        let mut current = id;
        while let Some(node) = self.nodes.get(current.0) {
            let Some(parent) = node.parent else { break };
            let branch_count = self.nodes[parent.0].branch_count.unwrap_or(0);
            decisions.push(Decision::new(node.choice, branch_count));
            current = parent;
        }
        decisions.reverse();
        decisions
    }

    /// Walks `path` from the root, creating every missing node, and returns
    /// the node reached after the last decision.
    ///
    /// Branch counts are recorded on first sight and must agree afterwards.
    /// When `witness` is set every node on the path, the final one included,
    /// is marked as reached by a concrete run. New nodes inherit `input_size`.
    pub fn create_or_get_node(
        &mut self,
        path: &[Decision],
        input_size: Option<usize>,
        witness: bool,
    ) -> Result<PathInsert, TrieError> {
        // Validate first so a bad path leaves the trie untouched.
        let mut cursor = Some(NodeId::ROOT);
        for decision in path {
            if decision.choice >= decision.branch_count {
                return Err(TrieError::ChoiceOutOfRange {
                    choice: decision.choice,
                    branch_count: decision.branch_count,
                });
            }
            if let Some(id) = cursor {
                let node = &self.nodes[id.0];
                if node.terminal {
                    return Err(TrieError::TerminalConflict(id));
                }
                if let Some(recorded) = node.branch_count {
                    if recorded != decision.branch_count {
                        return Err(TrieError::BranchCountMismatch {
                            node: id,
                            recorded,
                            observed: decision.branch_count,
                        });
                    }
                }
                cursor = node.child(decision.choice);
            }
        }

        let mut outcome = PathInsert {
            node: NodeId::ROOT,
            created: 0,
            newly_witnessed: 0,
        };
        let mut current = NodeId::ROOT;
        for decision in path {
            self.witness(current, witness, &mut outcome);
            if self.nodes[current.0].branch_count.is_none() {
                self.nodes[current.0].branch_count = Some(decision.branch_count);
            }
            let parent = current;
            current = match self.nodes[parent.0].child(decision.choice) {
                Some(child) => child,
                None => {
                    outcome.created += 1;
                    let child = self.push_child(parent, decision.choice, input_size);
                    self.nodes[child.0].witnessed = witness;
                    child
                }
            };
            self.refresh_frontier(parent);
        }
        self.witness(current, witness, &mut outcome);
        self.refresh_frontier(current);
        outcome.node = current;
        Ok(outcome)
    }

    fn witness(&mut self, id: NodeId, witness: bool, outcome: &mut PathInsert) {
        let node = &mut self.nodes[id.0];
        if witness && !node.witnessed {
            node.witnessed = true;
            // The root exists before any run, so witnessing it is not a new branch.
            if id != NodeId::ROOT {
                outcome.newly_witnessed += 1;
            }
        }
    }

    fn push_child(&mut self, parent: NodeId, choice: u32, input_size: Option<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let depth = self.nodes[parent.0].depth + 1;
        self.nodes
            .push(TrieNode::new(Some(parent), choice, depth, input_size));
        self.nodes[parent.0].children.insert(choice, id);
        id
    }

    /// Records the branch count of a node that a run reached but did not
    /// decide at (the run stopped right before the decision).
    pub fn set_branch_count(&mut self, id: NodeId, branch_count: u32) -> Result<(), TrieError> {
        let node = self.node_ref(id)?;
        if node.terminal {
            return Err(TrieError::TerminalConflict(id));
        }
        match node.branch_count {
            Some(recorded) if recorded != branch_count => Err(TrieError::BranchCountMismatch {
                node: id,
                recorded,
                observed: branch_count,
            }),
            _ => {
                self.nodes[id.0].branch_count = Some(branch_count);
                self.refresh_frontier(id);
                Ok(())
            }
        }
    }

    /// Marks `id` as end of execution without a cost (structure only).
    pub fn mark_terminal(&mut self, id: NodeId) -> Result<(), TrieError> {
        let node = self.node_ref(id)?;
        if !node.children.is_empty() || node.branch_count.is_some_and(|count| count > 0) {
            return Err(TrieError::TerminalConflict(id));
        }
        self.nodes[id.0].terminal = true;
        self.refresh_frontier(id);
        Ok(())
    }

    /// Marks `id` as a leaf with the given cost and folds the cost into every
    /// ancestor. Returns `true` when the cost strictly improved the global best.
    ///
    /// The comparison against the global best and its update happen under the
    /// same `&mut self` borrow, so two recordings can never both claim a new best.
    pub fn record_leaf(&mut self, id: NodeId, cost: f64) -> Result<bool, TrieError> {
        if !cost.is_finite() {
            return Err(TrieError::NonFiniteCost(id));
        }
        self.mark_terminal(id)?;
        let strategy = self.strategy;
        let node = &mut self.nodes[id.0];
        node.leaf_cost = Some(match node.leaf_cost {
            Some(previous) => strategy.pick(previous, cost),
            None => cost,
        });

        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &mut self.nodes[node_id.0];
            if strategy.is_better(cost, node.best_cost) {
                node.best_cost = Some(cost);
            }
            current = node.parent;
        }

        let improved = strategy.is_better(cost, self.best_cost);
        if improved {
            self.best_cost = Some(cost);
        }
        Ok(improved)
    }

    /// Marks child `choice` of `id` as taken without a leaf cost, creating
    /// the (unvisited) child if needed. Returns the child.
    pub fn mark_explored(&mut self, id: NodeId, choice: u32) -> Result<NodeId, TrieError> {
        let node = self.node_ref(id)?;
        let branch_count = node.branch_count.unwrap_or(0);
        if choice >= branch_count {
            return Err(TrieError::ChoiceOutOfRange {
                choice,
                branch_count,
            });
        }
        if let Some(child) = node.child(choice) {
            return Ok(child);
        }
        let input_size = node.input_size;
        self.nodes[id.0].pruned.remove(&choice);
        let child = self.push_child(id, choice, input_size);
        self.refresh_frontier(id);
        Ok(child)
    }

    /// Gives up on child `choice` of `id` (unsatisfiable or unreachable).
    pub fn mark_pruned(&mut self, id: NodeId, choice: u32) -> Result<(), TrieError> {
        let node = self.node_ref(id)?;
        let branch_count = node.branch_count.unwrap_or(0);
        if choice >= branch_count {
            return Err(TrieError::ChoiceOutOfRange {
                choice,
                branch_count,
            });
        }
        if node.child(choice).is_none() {
            self.nodes[id.0].pruned.insert(choice);
            self.refresh_frontier(id);
        }
        Ok(())
    }

    fn refresh_frontier(&mut self, id: NodeId) {
        if self.nodes[id.0].status() == NodeStatus::Frontier {
            self.frontier.insert(id);
        } else {
            self.frontier.remove(&id);
        }
    }

    pub fn stats(&self) -> TrieStats {
        let mut stats = TrieStats {
            nodes: self.nodes.len(),
            best_cost: self.best_cost,
            ..TrieStats::default()
        };
        for node in &self.nodes {
            match node.status() {
                NodeStatus::Unvisited => stats.unvisited += 1,
                NodeStatus::Frontier => stats.frontier += 1,
                NodeStatus::FullyExplored => stats.fully_explored += 1,
                NodeStatus::Leaf => stats.leaves += 1,
            }
        }
        stats
    }

    /// Graphviz rendering for debugging.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph trie {\n  node [shape=box];\n");
        for (index, node) in self.nodes.iter().enumerate() {
            let color = match node.status() {
                NodeStatus::Unvisited => "gray",
                NodeStatus::Frontier => "orange",
                NodeStatus::FullyExplored => "black",
                NodeStatus::Leaf => "green",
            };
            let cost = node
                .best_cost
                .map_or_else(|| "-".to_string(), |c| format!("{c}"));
            let _ = writeln!(
                out,
                "  n{index} [label=\"{index}\\nbest={cost}\\nsize={}\" color={color}];",
                node.input_size
                    .map_or_else(|| "-".to_string(), |s| s.to_string())
            );
            for (choice, child) in &node.children {
                let _ = writeln!(out, "  n{index} -> n{} [label=\"{choice}\"];", child.0);
            }
        }
        out.push_str("}\n");
        out
    }
}
