use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("descriptor validation failed: {message}")]
    Validation { message: String },
    #[error("cannot decode `{value}` as {kind} for field `{field}`")]
    Decode {
        field: String,
        value: String,
        kind: &'static str,
    },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn decode(field: &str, value: &str, kind: &'static str) -> Self {
        Self::Decode {
            field: field.to_string(),
            value: value.to_string(),
            kind,
        }
    }
}
