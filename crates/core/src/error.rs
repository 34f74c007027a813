use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Worker count must be at least 1")]
    NoWorkers,

    #[error("Too many workers: {0} (at most 65536)")]
    TooManyWorkers(usize),
}

pub type Result<T> = std::result::Result<T, CoreError>;
