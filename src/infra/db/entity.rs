//! Generic row access for one table.
//!
//! Records map column-for-column onto rows. Column values are decoded by
//! their Postgres type name; unsupported types are reported as invalid input
//! rather than silently dropped.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Postgres, QueryBuilder, Row, TypeInfo};
use time::{OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use super::util::map_sqlx_error;
use crate::application::repos::{EntityRepo, RepoError};
use crate::domain::filter::Filter;
use crate::domain::value::{FieldValue, Record};

pub struct PgEntityRepo {
    pool: Arc<PgPool>,
    table: String,
    unique_key: String,
}

impl PgEntityRepo {
    pub fn new(pool: Arc<PgPool>, table: &str, unique_key: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            unique_key: unique_key.to_string(),
        }
    }

    fn select(&self, filter: &Filter, limit: Option<i64>) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("SELECT * FROM ");
        qb.push(quote_table(&self.table));
        push_where(&mut qb, filter);
        qb.push(" ORDER BY ");
        qb.push(quote_ident(&self.unique_key));
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }
        qb
    }

    fn upsert(&self, record: &Record) -> QueryBuilder<'static, Postgres> {
        let has_key = record
            .get(&self.unique_key)
            .is_some_and(|value| !value.is_null());
        let columns: Vec<(&str, &FieldValue)> = record
            .iter()
            .filter(|(field, _)| has_key || *field != self.unique_key)
            .collect();

        let mut qb = QueryBuilder::new("INSERT INTO ");
        qb.push(quote_table(&self.table));
        if columns.is_empty() {
            qb.push(" DEFAULT VALUES RETURNING *");
            return qb;
        }

        qb.push(" (");
        let mut names = qb.separated(", ");
        for (field, _) in &columns {
            names.push(quote_ident(field));
        }
        qb.push(") VALUES (");
        for (position, (_, value)) in columns.iter().enumerate() {
            if position > 0 {
                qb.push(", ");
            }
            push_value(&mut qb, value);
        }
        qb.push(")");

        if has_key {
            qb.push(" ON CONFLICT (");
            qb.push(quote_ident(&self.unique_key));
            qb.push(") DO UPDATE SET ");
            let mut updates = qb.separated(", ");
            for (field, _) in &columns {
                let column = quote_ident(field);
                updates.push(format!("{column} = EXCLUDED.{column}"));
            }
        }
        qb.push(" RETURNING *");
        qb
    }

    fn update(&self, filter: &Filter, fields: &Record) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("UPDATE ");
        qb.push(quote_table(&self.table));
        qb.push(" SET ");
        for (position, (field, value)) in fields.iter().enumerate() {
            if position > 0 {
                qb.push(", ");
            }
            qb.push(quote_ident(field));
            qb.push(" = ");
            push_value(&mut qb, value);
        }
        push_where(&mut qb, filter);
        qb
    }

    fn delete(&self, key: &FieldValue) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("DELETE FROM ");
        qb.push(quote_table(&self.table));
        push_where(&mut qb, &Filter::eq(self.unique_key.clone(), key.clone()));
        qb
    }
}

#[async_trait]
impl EntityRepo for PgEntityRepo {
    async fn find_many(&self, filter: &Filter) -> Result<Vec<Record>, RepoError> {
        let mut qb = self.select(filter, None);
        let mut rows = qb.build().fetch(self.pool.as_ref());
        let mut records = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(map_sqlx_error)? {
            records.push(decode_row(&row)?);
        }
        Ok(records)
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, RepoError> {
        let mut qb = self.select(filter, Some(1));
        let row = qb
            .build()
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn save(&self, record: &Record) -> Result<Record, RepoError> {
        let mut qb = self.upsert(record);
        let row = qb
            .build()
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)?;
        decode_row(&row)
    }

    async fn patch(&self, filter: &Filter, fields: &Record) -> Result<(), RepoError> {
        if filter.is_empty() {
            return Err(RepoError::invalid_input("refusing to patch without a filter"));
        }
        if fields.is_empty() {
            return self.find_one_or_fail(filter).await.map(|_| ());
        }
        let mut qb = self.update(filter, fields);
        let result = qb
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn remove(&self, record: &Record) -> Result<(), RepoError> {
        let key = record
            .get(&self.unique_key)
            .filter(|value| !value.is_null())
            .ok_or_else(|| RepoError::invalid_input("cannot remove a row without a key"))?;
        let mut qb = self.delete(key);
        let result = qb
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote each part of a possibly schema-qualified table name.
fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Null => {
            qb.push("NULL");
        }
        FieldValue::Bool(value) => {
            qb.push_bind(*value);
        }
        FieldValue::Int(value) => {
            qb.push_bind(*value);
        }
        FieldValue::Float(value) => {
            qb.push_bind(*value);
        }
        FieldValue::Uuid(value) => {
            qb.push_bind(*value);
        }
        FieldValue::Timestamp(value) => {
            qb.push_bind(*value);
        }
        FieldValue::Text(value) => {
            qb.push_bind(value.clone());
        }
    }
}

/// Text conditions compare the column's text form, so cached string values
/// match typed columns.
fn push_where(qb: &mut QueryBuilder<'static, Postgres>, filter: &Filter) {
    for (position, (field, value)) in filter.conditions().iter().enumerate() {
        qb.push(if position == 0 { " WHERE " } else { " AND " });
        qb.push(quote_ident(field));
        match value {
            FieldValue::Null => {
                qb.push(" IS NULL");
            }
            FieldValue::Text(_) => {
                qb.push("::text = ");
                push_value(qb, value);
            }
            _ => {
                qb.push(" = ");
                push_value(qb, value);
            }
        }
    }
}

fn decode_row(row: &PgRow) -> Result<Record, RepoError> {
    let mut record = Record::new();
    for column in row.columns() {
        let name = column.name();
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(index).map(FieldValue::from),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map(|value| FieldValue::from(value.map(i64::from))),
            "INT4" => row.try_get::<Option<i32>, _>(index).map(FieldValue::from),
            "INT8" => row.try_get::<Option<i64>, _>(index).map(FieldValue::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map(|value| FieldValue::from(value.map(f64::from))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(FieldValue::from),
            "UUID" => row.try_get::<Option<Uuid>, _>(index).map(FieldValue::from),
            "TIMESTAMPTZ" => row
                .try_get::<Option<OffsetDateTime>, _>(index)
                .map(FieldValue::from),
            "TIMESTAMP" => row
                .try_get::<Option<PrimitiveDateTime>, _>(index)
                .map(|value| FieldValue::from(value.map(PrimitiveDateTime::assume_utc))),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => row
                .try_get::<Option<String>, _>(index)
                .map(FieldValue::from),
            other => {
                return Err(RepoError::invalid_input(format!(
                    "column `{name}` has unsupported type {other}"
                )));
            }
        }
        .map_err(map_sqlx_error)?;
        record.insert(name, value);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> PgEntityRepo {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/blendstore")
            .expect("lazy pool");
        PgEntityRepo::new(Arc::new(pool), "app.users", "id")
    }

    #[tokio::test]
    async fn select_quotes_identifiers_and_casts_text_filters() {
        let repo = repo();
        let qb = repo.select(&Filter::eq("id", "7").and("groupId", 10), Some(1));
        assert_eq!(
            qb.sql(),
            r#"SELECT * FROM "app"."users" WHERE "id"::text = $1 AND "groupId" = $2 ORDER BY "id" LIMIT $3"#
        );
    }

    #[tokio::test]
    async fn upsert_without_key_lets_the_database_assign_it() {
        let repo = repo();
        let qb = repo.upsert(&Record::new().with("id", FieldValue::Null).with("name", "A"));
        assert_eq!(
            qb.sql(),
            r#"INSERT INTO "app"."users" ("name") VALUES ($1) RETURNING *"#
        );
    }

    #[tokio::test]
    async fn upsert_with_key_updates_on_conflict() {
        let repo = repo();
        let qb = repo.upsert(&Record::new().with("id", 1).with("name", "A"));
        assert_eq!(
            qb.sql(),
            r#"INSERT INTO "app"."users" ("id", "name") VALUES ($1, $2) ON CONFLICT ("id") DO UPDATE SET "id" = EXCLUDED."id", "name" = EXCLUDED."name" RETURNING *"#
        );
    }

    #[tokio::test]
    async fn update_sets_only_the_given_columns() {
        let repo = repo();
        let qb = repo.update(&Filter::eq("id", "1"), &Record::new().with("age", 31));
        assert_eq!(
            qb.sql(),
            r#"UPDATE "app"."users" SET "age" = $1 WHERE "id"::text = $2"#
        );
    }

    #[tokio::test]
    async fn empty_record_inserts_defaults() {
        let repo = repo();
        assert_eq!(
            repo.upsert(&Record::new()).sql(),
            r#"INSERT INTO "app"."users" DEFAULT VALUES RETURNING *"#
        );
    }

    #[test]
    fn null_conditions_use_is_null() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        push_where(&mut qb, &Filter::eq("deleted_at", FieldValue::Null));
        assert_eq!(qb.sql(), r#"SELECT 1 WHERE "deleted_at" IS NULL"#);
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}
