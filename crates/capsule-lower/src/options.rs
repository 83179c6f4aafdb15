//! Lowering knobs.

use serde::{Deserialize, Serialize};

/// When nested scopes may share one environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Every scope with captures gets its own environment.
    #[default]
    Never,
    /// Fold a scope's environment into the nearest enclosing one of the same
    /// function when no loop or closure boundary separates them, both have the
    /// same representation, and every closure using the inner environment
    /// also uses the outer one.
    Contained,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowerOptions {
    pub merge: MergePolicy,
    /// Reserve an expansion field on value-type environments so later
    /// generations can grow them in place.
    pub incremental: bool,
}

impl LowerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}
