use burn_loop::LoopError;

/// Errors raised while building an output layer or computing its cost.
#[derive(thiserror::Error, Debug)]
pub enum LossError {
    /// A loss name that no layer knows.
    #[error("Unknown loss: {0}")]
    UnknownLoss(String),

    /// A loss that exists but is not handled by this layer kind.
    #[error("The {layer} output layer does not support the {loss} loss")]
    InvalidLoss {
        /// Layer kind.
        layer: &'static str,
        /// Rejected loss name.
        loss: String,
    },

    /// An option value is out of its valid range or contradicts another option.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An option required by the configured loss is missing.
    #[error("The {loss} loss requires the {option} option")]
    MissingOption {
        /// Loss that needs the option.
        loss: &'static str,
        /// Missing option name.
        option: &'static str,
    },

    /// The sprint options could not be parsed into a JSON object.
    #[error("Invalid sprint options: {0}")]
    SprintOptions(String),

    /// The prior table does not have one entry per output class.
    #[error("Prior dimension mismatch: expected {expected} values, got {actual}")]
    PriorDimMismatch {
        /// Number of output classes.
        expected: usize,
        /// Number of values found.
        actual: usize,
    },

    /// The prior file could not be read or parsed.
    #[error("Failed to load the prior file {path}: {reason}")]
    PriorFile {
        /// Path of the prior file.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// The target kind cannot be used with the configured loss.
    #[error("The {loss} loss cannot use a {target} target")]
    UnsupportedTarget {
        /// Loss name.
        loss: &'static str,
        /// Target kind.
        target: &'static str,
    },

    /// Tensor shapes that cannot be reconciled.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An external operator needed by the configured loss was not provided.
    #[error("The {loss} loss needs a {operator} operator")]
    MissingOperator {
        /// Loss name.
        loss: &'static str,
        /// Operator kind.
        operator: &'static str,
    },

    /// A value produced by another layer was not provided.
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// An external operator failed.
    #[error("Operator failure: {0}")]
    Operator(String),

    /// The requested combination is not implemented.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A loop primitive failed.
    #[error(transparent)]
    Loop(#[from] LoopError),
}
