//! Error types for charging services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OcsError>;

#[derive(Error, Debug)]
pub enum OcsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rating profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Rating plan not found: {0}")]
    RatingPlanNotFound(String),

    #[error("Shared group not found: {0}")]
    SharedGroupNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Actions not found: {0}")]
    ActionsNotFound(String),

    #[error("Fallback subject cycle at {0}")]
    FallbackCycle(String),

    #[error("No rate interval covers instant {0}")]
    NoRateInterval(String),

    #[error("Invalid increment: {0}")]
    InvalidIncrement(String),

    #[error("Insufficient credit")]
    InsufficientCredit,

    #[error("Connect fee not covered")]
    ConnectFeeNotCovered,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcsError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::InsufficientCredit | Self::ConnectFeeNotCovered => 402,
            Self::ProfileNotFound(_)
            | Self::DestinationNotFound(_)
            | Self::RatingPlanNotFound(_)
            | Self::SharedGroupNotFound(_)
            | Self::AccountNotFound(_)
            | Self::ActionsNotFound(_) => 404,
            Self::FallbackCycle(_) | Self::NoRateInterval(_) | Self::InvalidIncrement(_) => 422,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::DestinationNotFound(_) => "DESTINATION_NOT_FOUND",
            Self::RatingPlanNotFound(_) => "RATING_PLAN_NOT_FOUND",
            Self::SharedGroupNotFound(_) => "SHARED_GROUP_NOT_FOUND",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::ActionsNotFound(_) => "ACTIONS_NOT_FOUND",
            Self::FallbackCycle(_) => "FALLBACK_CYCLE",
            Self::NoRateInterval(_) => "NO_RATE_INTERVAL",
            Self::InvalidIncrement(_) => "INVALID_INCREMENT",
            Self::InsufficientCredit => "INSUFFICIENT_CREDIT",
            Self::ConnectFeeNotCovered => "CONNECT_FEE_NOT_COVERED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Credit shortfalls are reported to the caller with an empty call cost
    /// instead of a transport failure.
    pub fn is_credit_error(&self) -> bool {
        matches!(self, Self::InsufficientCredit | Self::ConnectFeeNotCovered)
    }
}

impl From<std::io::Error> for OcsError {
    fn from(err: std::io::Error) -> Self {
        OcsError::Network(err.to_string())
    }
}
