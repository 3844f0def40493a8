use rayon::prelude::*;

use crate::{FunctionBody, Optimized, OptimizerConfig, optimize};

/// Decides which top-level units are passed through without optimization.
pub trait ExclusionPolicy {
    fn should_skip(&self, body: &FunctionBody) -> bool;
}

/// Optimizes everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSkip;

impl ExclusionPolicy for NeverSkip {
    fn should_skip(&self, _body: &FunctionBody) -> bool {
        false
    }
}

/// Optimize one top-level unit unless `policy` excludes it.
#[must_use]
pub fn optimize_unit(
    body: &FunctionBody,
    config: &OptimizerConfig,
    policy: &dyn ExclusionPolicy,
) -> Optimized {
    if policy.should_skip(body) {
        tracing::debug!("Skipping excluded unit {}", body.name());
        return Optimized {
            body: body.clone(),
            diagnostic: None,
        };
    }
    optimize(body, config)
}

/// Optimize independent units in parallel. Results keep the input order.
#[must_use]
pub fn optimize_batch(
    bodies: &[FunctionBody],
    config: &OptimizerConfig,
    policy: &(dyn ExclusionPolicy + Sync),
) -> Vec<Optimized> {
    tracing::debug!("Optimizing {} units", bodies.len());
    bodies
        .par_iter()
        .map(|body| optimize_unit(body, config, policy))
        .collect()
}
