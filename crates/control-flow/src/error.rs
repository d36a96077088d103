use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlFlowError>;

/// Every failure in this crate is fatal to the invoking operator; nothing is
/// retried or silently coerced. Messages name the operator, the structural
/// property that failed, and the leaf involved so a branch author can fix the
/// callable without inspecting captured internals.
#[derive(Error, Debug)]
pub enum ControlFlowError {
    /// Bad arguments detected before any branch runs: wrong predicate shape,
    /// empty carries, zero-length scan axes.
    #[error("{op}: {message}")]
    Precondition { op: &'static str, message: String },

    /// Branch or carry outputs disagree structurally.
    #[error("{op}: arguments mismatch at {site}: {detail}")]
    ContractMismatch {
        op: &'static str,
        site: String,
        detail: String,
    },

    /// A captured branch mutates one of its own inputs in place.
    #[error("{op}: {branch} is mutating an input (leaf {leaf})")]
    Mutation {
        op: &'static str,
        branch: &'static str,
        leaf: String,
    },

    /// A captured branch returns an input leaf without transforming it.
    #[error("{op}: {branch} might be aliasing an input (leaf {leaf})")]
    Aliasing {
        op: &'static str,
        branch: &'static str,
        leaf: String,
    },

    /// `combine_mode = Pointwise` was requested but the combine function
    /// contains an operation outside the pointwise registry.
    #[error("{op}: combine_fn needs to be pointwise, found op {kind}")]
    NonPointwise { op: &'static str, kind: String },

    #[error("tensor backend error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub(crate) fn precondition<S: Into<String>>(op: &'static str, message: S) -> ControlFlowError {
    ControlFlowError::Precondition {
        op,
        message: message.into(),
    }
}
