use thiserror::Error;

#[derive(Error, Debug)]
pub enum RollmixError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("degenerate sampling configuration: {0}")]
    ArithmeticDegenerate(String),
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RollmixError>;

/// Returns early with [`RollmixError::Validation`] when the condition does not hold.
#[macro_export]
macro_rules! ensure_valid {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::RollmixError::Validation(format!($($arg)+)));
        }
    };
}
