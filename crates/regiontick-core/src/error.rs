use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl CoreError {
    /// Short error code string for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidValue { .. } => "CONFIG_INVALID_VALUE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
