use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {message}")]
    Database { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    /// Whether retrying the bootstrap step could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_failures_are_transient() {
        assert!(InfraError::database("refused").is_transient());
        assert!(!InfraError::configuration("missing url").is_transient());
    }

    #[test]
    fn messages_carry_their_context() {
        assert_eq!(
            InfraError::configuration("database url is not configured").to_string(),
            "configuration error: database url is not configured"
        );
    }
}
