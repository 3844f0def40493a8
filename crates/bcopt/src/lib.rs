#![allow(
    clippy::cast_possible_truncation, // intentional: word-code operands are u32, offsets are bytes
    clippy::cast_possible_wrap, // intentional: stack effects mix signed deltas with u32 operands
    clippy::cast_sign_loss, // intentional: folded ints are i64, table indices are u32
    clippy::too_many_lines, // opcode tables are intentionally monolithic
    clippy::missing_errors_doc // error variants are documented on `Error`
)]

pub mod batch;
pub mod code;
pub mod config;
pub mod error;
pub mod opt;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use batch::{ExclusionPolicy, NeverSkip, optimize_batch, optimize_unit};
pub use code::{FunctionBody, Instruction, Opcode, Value};
pub use config::OptimizerConfig;
pub use error::{Error, FoldError, Result};

/// Result of optimizing one body: the optimized body, or the caller's
/// original body plus the error that made optimization fall back.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    pub body: FunctionBody,
    pub diagnostic: Option<Error>,
}

impl Optimized {
    #[must_use]
    pub const fn fell_back(&self) -> bool {
        self.diagnostic.is_some()
    }
}

/// Optimize `body` and everything nested in it, surfacing structural
/// failures directly.
pub fn try_optimize(body: &FunctionBody, config: &OptimizerConfig) -> Result<FunctionBody> {
    opt::optimize_body(body, config)
}

/// Optimize `body`, falling back to an unchanged copy when any part of it
/// cannot be optimized.
#[must_use]
pub fn optimize(body: &FunctionBody, config: &OptimizerConfig) -> Optimized {
    match try_optimize(body, config) {
        Ok(optimized) => Optimized {
            body: optimized,
            diagnostic: None,
        },
        Err(err) => {
            tracing::warn!("Leaving {} unoptimized: {err}", body.name());
            Optimized {
                body: body.clone(),
                diagnostic: Some(err),
            }
        }
    }
}
