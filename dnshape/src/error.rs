use crate::{command, types::RuleId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid bandwidth: {0:?}, expected `unlimited` or bits per second")]
    InvalidBandwidth(String),
    #[error("invalid delay: {0:?}, expected milliseconds")]
    InvalidDelay(String),
    #[error("invalid loss rate: {0:?}, expected a decimal between 0 and 1")]
    InvalidLossRate(String),
    #[error("backend call failed: {0}")]
    BackendCallFailed(#[from] command::Error),
    #[error("unexpected backend output: {0:?}")]
    ProtocolViolation(String),
    #[error("no free rule number below {0}")]
    RuleNumbersExhausted(RuleId),
}

impl Error {
    /// Returns true if the error was raised while validating input, before touching the backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_)
                | Self::InvalidBandwidth(_)
                | Self::InvalidDelay(_)
                | Self::InvalidLossRate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
