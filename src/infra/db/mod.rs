//! Postgres-backed repositories.

mod entity;
mod util;

pub use entity::PgEntityRepo;
pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::repos::{EntityRepo, RepoProvider};
use crate::domain::descriptor::EntityDescriptor;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

impl RepoProvider for PostgresRepositories {
    fn repository(&self, descriptor: &EntityDescriptor) -> Arc<dyn EntityRepo> {
        Arc::new(PgEntityRepo::new(
            self.pool.clone(),
            descriptor.table(),
            descriptor.unique_key(),
        ))
    }
}
