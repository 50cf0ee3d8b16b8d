use crate::ExecutionMode;

/// Errors raised by the loop and reduction primitives.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// The requested execution mode has no loop support.
    #[error("Loops are not implemented for the {0:?} execution mode")]
    NotImplemented(ExecutionMode),

    /// The arguments given to a primitive contradict each other.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A loop body produced outputs that do not match the declared templates.
    #[error("Output structure mismatch at step {step}: {reason}")]
    StructureMismatch {
        /// Loop iteration that produced the offending outputs.
        step: usize,
        /// What did not match.
        reason: String,
    },

    /// An axis is out of range or cannot be reduced as requested.
    #[error("Invalid axis: {0}")]
    Axis(String),
}
