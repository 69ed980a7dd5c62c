use crate::trie::CostStrategy;
use serde::Serialize;

/// Classification of one import-mode run.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ImportOutcome {
    /// At least one node on the path was created or reached concretely for
    /// the first time.
    pub exposed_new_branch: bool,
    /// The leaf cost strictly improved the global best.
    pub observed_better_score: bool,
    /// Cost the target reported for this run, if any.
    pub cost: Option<f64>,
}

impl ImportOutcome {
    /// Whether the input is worth handing to the external fuzzer.
    pub fn is_interesting(&self) -> bool {
        self.exposed_new_branch || self.observed_better_score
    }

    /// Outcome suffix for export log lines, e.g. `,branch,highscore,10`.
    pub fn export_tags(&self, strategy: CostStrategy) -> String {
        let mut tags = String::new();
        if self.exposed_new_branch {
            tags.push_str(",branch");
        }
        if self.observed_better_score {
            tags.push(',');
            tags.push_str(strategy.score_tag());
            tags.push(',');
            tags.push_str(&format_cost(self.cost));
        }
        tags
    }

    /// Outcome suffix for import log lines, e.g. `,10,highscore`.
    pub fn import_tags(&self, strategy: CostStrategy) -> String {
        let mut tags = format!(",{}", format_cost(self.cost));
        if self.observed_better_score {
            tags.push(',');
            tags.push_str(strategy.score_tag());
        }
        tags
    }
}

/// Export suffix for an optimized variant, e.g. `,highscore,maximized,42`.
pub fn optimized_export_tags(strategy: CostStrategy, cost: Option<f64>) -> String {
    let direction = match strategy {
        CostStrategy::Maximize => "maximized",
        CostStrategy::Minimize => "minimized",
    };
    format!(",{},{direction},{}", strategy.score_tag(), format_cost(cost))
}

pub fn format_cost(cost: Option<f64>) -> String {
    cost.map_or_else(|| "none".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_run_is_not_interesting() {
        let outcome = ImportOutcome {
            cost: Some(3.0),
            ..ImportOutcome::default()
        };
        assert!(!outcome.is_interesting());
        assert_eq!(outcome.export_tags(CostStrategy::Maximize), "");
        assert_eq!(outcome.import_tags(CostStrategy::Maximize), ",3");
    }

    #[test]
    fn tags_follow_strategy() {
        let outcome = ImportOutcome {
            exposed_new_branch: true,
            observed_better_score: true,
            cost: Some(10.0),
        };
        assert!(outcome.is_interesting());
        assert_eq!(
            outcome.export_tags(CostStrategy::Maximize),
            ",branch,highscore,10"
        );
        assert_eq!(
            outcome.export_tags(CostStrategy::Minimize),
            ",branch,lowscore,10"
        );
        assert_eq!(
            outcome.import_tags(CostStrategy::Minimize),
            ",10,lowscore"
        );
    }

    #[test]
    fn optimized_tags_name_the_direction() {
        assert_eq!(
            optimized_export_tags(CostStrategy::Maximize, Some(42.0)),
            ",highscore,maximized,42"
        );
        assert_eq!(
            optimized_export_tags(CostStrategy::Minimize, Some(0.5)),
            ",lowscore,minimized,0.5"
        );
    }

    #[test]
    fn new_branch_alone_is_interesting() {
        let outcome = ImportOutcome {
            exposed_new_branch: true,
            observed_better_score: false,
            cost: None,
        };
        assert!(outcome.is_interesting());
        assert_eq!(outcome.export_tags(CostStrategy::Maximize), ",branch");
        assert_eq!(outcome.import_tags(CostStrategy::Maximize), ",none");
    }
}
