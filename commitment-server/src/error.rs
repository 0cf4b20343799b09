use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommitmentError>;

/// Failures surfaced by the store, the engine and the command parser.
///
/// The display text is what a client sees on the wire, so the first three
/// variants keep the wording existing clients already match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    #[error("A row for the provided UUID could not be found")]
    NotFound,

    #[error("Message does not have enough paramenters")]
    MalformedCommand { required: usize, found: usize },

    #[error("You have reached the maximum number of attempts per hour")]
    RateLimited,

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),
}
