/// Structural failures that abort optimization of a function body.
///
/// Any of these makes the driver fall back to the caller's original body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Malformed instruction stream at byte {offset}: {reason}")]
    MalformedInstructionStream { offset: usize, reason: String },

    #[error("Unresolved jump target {target} for instruction at position {position}")]
    UnresolvedJumpTarget { position: usize, target: u32 },

    #[error("Operand {operand} of {opcode} at position {position} does not fit in 32 bits")]
    OperandOverflow {
        position: usize,
        opcode: &'static str,
        operand: u64,
    },

    #[error("Operand {operand} of {opcode} at position {position} is out of range for its table")]
    OperandOutOfRange {
        position: usize,
        opcode: &'static str,
        operand: u32,
    },

    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    #[error("In nested function {name}: {source}")]
    Nested {
        name: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a single fold opportunity is skipped.
///
/// Never propagated out of the peephole pass: the instructions are left
/// in place and the pass moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FoldError {
    #[error("Cannot evaluate {operator} on {lhs} and {rhs}")]
    FoldEvaluation {
        operator: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("Arithmetic error while folding {operator}: {reason}")]
    Arithmetic {
        operator: &'static str,
        reason: &'static str,
    },

    #[error("Folded result too large ({len} elements)")]
    TooLarge { len: usize },

    #[error("Comparison kind {0} does not map to a foldable comparator")]
    AmbiguousComparisonKind(u32),
}
