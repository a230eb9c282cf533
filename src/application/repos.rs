//! Repository traits describing backing-store adapters.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::descriptor::EntityDescriptor;
use crate::domain::filter::Filter;
use crate::domain::value::Record;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Rows of one entity table.
#[async_trait]
pub trait EntityRepo: Send + Sync {
    async fn find_many(&self, filter: &Filter) -> Result<Vec<Record>, RepoError>;

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, RepoError>;

    async fn find_one_or_fail(&self, filter: &Filter) -> Result<Record, RepoError> {
        self.find_one(filter).await?.ok_or(RepoError::NotFound)
    }

    /// Insert or update; returns the stored row, including generated keys.
    async fn save(&self, record: &Record) -> Result<Record, RepoError>;

    /// Overwrite `fields` on the row selected by `filter`, leaving other
    /// columns as stored. Fails with [`RepoError::NotFound`] when no row matches.
    async fn patch(&self, filter: &Filter, fields: &Record) -> Result<(), RepoError>;

    async fn remove(&self, record: &Record) -> Result<(), RepoError>;
}

/// Hands out the repository backing an entity.
pub trait RepoProvider: Send + Sync {
    fn repository(&self, descriptor: &EntityDescriptor) -> Arc<dyn EntityRepo>;
}
