use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("unknown lens model name: {0}")]
    UnknownModelName(String),
    #[error("bad lens model configuration: {0}")]
    BadModelConfig(String),
    #[error("no family sequence from {now} to {target}")]
    NoFamilySequence { now: String, target: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("projection failed: {0}")]
    ProjectionFailed(&'static str),
    #[error("expected {expected} intrinsics values, got {actual}")]
    WrongIntrinsicsCount { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
