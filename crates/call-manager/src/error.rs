use thiserror::Error;

/// Call manager errors
#[derive(Error, Debug)]
pub enum CallManagerError {
    /// Malformed request or option
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The PBX rejected or failed a control command
    #[error("PBX error: {0}")]
    Pbx(String),

    /// Persistence layer failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),

    /// Payload (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Infrastructure errors (tasks, logging, config loading)
    #[error("Infrastructure error: {0}")]
    Infra(#[from] rvoip_infra_common::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallManagerError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn pbx<S: Into<String>>(msg: S) -> Self {
        Self::Pbx(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Status code reported on the command surface
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::Serialization(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for call manager operations
pub type Result<T> = std::result::Result<T, CallManagerError>;
