use rollmix_core::RollmixError;
use std::{fmt, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTaskFailure {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for VideoTaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Rollmix(#[from] RollmixError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("{} video task(s) failed: {}", .0.len(), join_failures(.0))]
    VideoTasks(Vec<VideoTaskFailure>),
}

impl EvalError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Rollmix(RollmixError::Validation(message.into()))
    }
}

fn join_failures(failures: &[VideoTaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, EvalError>;
