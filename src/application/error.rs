use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::store::StoreError, config::LoadError, domain::error::DomainError,
    infra::error::InfraError,
};

/// Failure of a binary command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// The error followed by each of its sources.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            let message = inner.to_string();
            if messages.last() != Some(&message) {
                messages.push(message);
            }
            current = inner.source();
        }
        messages
    }
}
