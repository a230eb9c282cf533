use thiserror::Error;

use crate::application::kv::KvError;
use crate::application::repos::RepoError;
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("`{entity}` record not found: {detail}")]
    NotFound { entity: String, detail: String },
    #[error("field `{field}` is not declared as a {kind} of `{entity}`")]
    Configuration {
        entity: String,
        field: String,
        kind: &'static str,
    },
    #[error("cannot decode `{value}` as {kind} for field `{field}`")]
    Decode {
        field: String,
        value: String,
        kind: &'static str,
    },
    #[error("backing store error for `{entity}`: {source}")]
    Repo {
        entity: String,
        #[source]
        source: RepoError,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("write-back worker failed: {0}")]
    Detached(String),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            detail: detail.into(),
        }
    }

    pub fn configuration(entity: &str, field: &str, kind: &'static str) -> Self {
        Self::Configuration {
            entity: entity.to_string(),
            field: field.to_string(),
            kind,
        }
    }

    /// A missing row becomes [`StoreError::NotFound`]; everything else keeps its source.
    pub fn repo(entity: &str, source: RepoError, detail: impl FnOnce() -> String) -> Self {
        match source {
            RepoError::NotFound => Self::not_found(entity, detail()),
            source => Self::Repo {
                entity: entity.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation { message } => Self::Validation { message },
            DomainError::Decode { field, value, kind } => Self::Decode { field, value, kind },
        }
    }
}

/// Swallow only `NotFound`, letting every other failure through.
pub(crate) fn optional<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
