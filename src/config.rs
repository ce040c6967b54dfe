//! Analysis configuration.

use serde::{Deserialize, Serialize};

use crate::cfg::EdgeFilter;
use crate::dataflow::DEFAULT_MAX_ITERATIONS;

/// Settings shared by every engine run through an
/// [`AnalysisContext`](crate::context::AnalysisContext).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Full passes allowed before a dataflow run is declared divergent.
    pub max_iterations: usize,

    /// Drop implicit (undeclared runtime) exception edges when computing
    /// post-dominators.
    pub ignore_implicit_exceptions_for_post_dominators: bool,

    /// Obligation counts saturate at plus or minus this value.
    pub obligation_count_limit: u8,

    /// Drop obligation states on paths that leave the method by an uncaught throw.
    pub obligation_ignore_unhandled_exception_paths: bool,

    /// Analyze classes in parallel.
    pub parallel: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            ignore_implicit_exceptions_for_post_dominators: true,
            obligation_count_limit: 8,
            obligation_ignore_unhandled_exception_paths: true,
            parallel: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn post_dominator_filter(&self) -> EdgeFilter {
        if self.ignore_implicit_exceptions_for_post_dominators {
            EdgeFilter::without_implicit_exceptions()
        } else {
            EdgeFilter::ALL
        }
    }
}
