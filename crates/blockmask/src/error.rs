use thiserror::Error;

pub type Result<T> = std::result::Result<T, MaskError>;

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

pub(crate) fn shape_err<S: Into<String>>(msg: S) -> MaskError {
    MaskError::InvalidShape(msg.into())
}
