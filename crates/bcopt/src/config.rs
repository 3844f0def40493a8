use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Pass toggles and iteration count for one optimizer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Dead-store removal, single-use inlining and push/pop collapsing.
    pub remove_dead_stores: bool,
    /// Self tail calls become jumps to the entry, including nested closures.
    pub tail_call_optimize: bool,
    /// Store/load elision, constant folding, dead-branch pruning and trimming
    /// of code after returns.
    pub optimize_accessors_and_constants: bool,
    /// Rebuild names/locals/constants so only referenced entries remain.
    pub compact_tables: bool,
    /// How many times the whole pipeline runs over the top-level body.
    pub iterations: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            remove_dead_stores: true,
            tail_call_optimize: true,
            optimize_accessors_and_constants: true,
            compact_tables: true,
            iterations: 3,
        }
    }
}

impl OptimizerConfig {
    /// Configuration with every pass disabled; only fixup, trimming,
    /// stack sizing and re-encoding run.
    #[must_use]
    pub fn passthrough() -> Self {
        Self {
            remove_dead_stores: false,
            tail_call_optimize: false,
            optimize_accessors_and_constants: false,
            compact_tables: false,
            iterations: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::InvalidConfig(
                "iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
