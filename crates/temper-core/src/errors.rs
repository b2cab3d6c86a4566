use thiserror::Error;

/// Error type for the sampling engine.
///
/// Fatal distributed conditions carry the full rank of the process that
/// raised them: once any rank diverges from the collective decision
/// schedule the run cannot continue, so the error message must identify
/// where it happened.
#[derive(Error, Debug)]
pub enum TemperError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("rank {rank}: {context}: parallel sequence sizes disagree")]
    SizeMismatch { rank: usize, context: String },
    #[error("rank {rank}: {context}: value disagrees across ranks (spread {spread:e})")]
    RankDisagreement {
        rank: usize,
        context: String,
        spread: f64,
    },
    #[error("rank {rank}: transport failure in {context}")]
    Transport { rank: usize, context: String },
    #[error("rank {rank}: {context}: matrix is not positive definite")]
    NotPositiveDefinite { rank: usize, context: String },
    #[error("rank {rank}: effective sample size ratio {ratio} exceeds 1")]
    EffectiveSizeOutOfRange { rank: usize, ratio: f64 },
    #[error("rank {rank}: likelihood returned NaN")]
    NonFiniteLikelihood { rank: usize },
    #[error("rank {rank}: output failure: {message}")]
    Output { rank: usize, message: String },
    #[error("rank {rank}: {context}: unreachable branch")]
    InternalLogic { rank: usize, context: String },
}

/// Convenience type for `Result<T, TemperError>`.
pub type TemperResult<T> = Result<T, TemperError>;
