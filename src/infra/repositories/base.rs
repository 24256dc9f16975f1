//! Base repository traits following Interface Segregation Principle (ISP).
//!
//! Read, write and delete operations are separate traits with default
//! implementations over a [`RepositoryContext`], so a repository only has to
//! say where its context lives. Reads are cache-aside; writes evict the
//! entity key at once and mark the namespace for invalidation when the
//! transaction ends.

use std::fmt::Display;

use async_trait::async_trait;
use sea_orm::{DbBackend, JsonValue, Value};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::patch::FieldPatch;
use crate::errors::{DataError, DataResult};
use crate::infra::cache::CacheManager;
use crate::infra::db::SessionHandle;
use crate::infra::unit_of_work::ChangeTracker;

/// A row type with a numeric optimistic-lock `version` column.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Id: Clone + Display + Into<Value> + Send + Sync;

    const TABLE: &'static str;
    /// Cache keys of this entity are `<namespace>:<id>`
    const CACHE_NAMESPACE: &'static str;
    /// Columns `update` may change
    const MUTABLE_FIELDS: &'static [&'static str];

    fn id(&self) -> Self::Id;

    fn version(&self) -> i64;

    /// Column/value pairs written by `insert`.
    fn columns(&self) -> Vec<(&'static str, Value)>;
}

/// Cache key of one entity.
pub fn entity_cache_key<E: Entity>(id: &E::Id) -> String {
    CacheManager::make_key(&[E::CACHE_NAMESPACE, &id.to_string()])
}

/// What a repository shares with its unit of work.
#[derive(Clone)]
pub struct RepositoryContext {
    pub session: SessionHandle,
    pub cache: CacheManager,
    pub tracker: ChangeTracker,
}

impl RepositoryContext {
    /// Bind-parameter marker for the session's dialect (1-based).
    pub fn placeholder(&self, index: usize) -> String {
        match self.session.backend() {
            DbBackend::Postgres => format!("${}", index),
            _ => "?".to_string(),
        }
    }

    pub async fn execute(&self, sql: &str, values: Vec<Value>) -> DataResult<u64> {
        let affected = self
            .session
            .execute(self.session.statement(sql, values))
            .await?;
        self.tracker.record("execute", sql);
        Ok(affected)
    }

    pub async fn query(&self, sql: &str, values: Vec<Value>) -> DataResult<Vec<JsonValue>> {
        let rows = self
            .session
            .query(self.session.statement(sql, values))
            .await?;
        self.tracker.record("query", sql);
        Ok(rows)
    }

    /// Drop the entity key now and its namespace when the transaction ends.
    pub async fn evict<E: Entity>(&self, id: &E::Id) {
        self.cache.delete(&entity_cache_key::<E>(id)).await;
        self.tracker.touch(E::CACHE_NAMESPACE);
    }

    fn is_dirty(&self, namespace: &str) -> bool {
        self.tracker
            .touched_namespaces()
            .iter()
            .any(|touched| touched == namespace)
    }
}

/// Built lazily by `UnitOfWork::repository`.
pub trait Repository: Send + Sync + 'static {
    fn new(context: RepositoryContext) -> Self;
}

/// Read operations (Query) - Single Responsibility
#[async_trait]
pub trait ReadRepository<E: Entity>: Send + Sync {
    fn context(&self) -> &RepositoryContext;

    /// Cache-aside lookup by primary key.
    ///
    /// Rows read after this transaction wrote to the namespace are not cached.
    async fn find_by_id(&self, id: &E::Id) -> DataResult<Option<E>> {
        let ctx = self.context();
        let key = entity_cache_key::<E>(id);

        if let Some(entity) = ctx.cache.get::<E>(&key).await? {
            debug!(%key, "Entity served from cache");
            return Ok(Some(entity));
        }

        let sql = format!("SELECT * FROM {} WHERE id = {}", E::TABLE, ctx.placeholder(1));
        let rows = ctx.query(&sql, vec![id.clone().into()]).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let entity: E = serde_json::from_value(row)?;
        if !ctx.is_dirty(E::CACHE_NAMESPACE) {
            ctx.cache.set(&key, &entity, None).await?;
        }
        Ok(Some(entity))
    }

    async fn find_all(&self, limit: u64) -> DataResult<Vec<E>> {
        let ctx = self.context();
        let sql = format!(
            "SELECT * FROM {} ORDER BY id LIMIT {}",
            E::TABLE,
            ctx.placeholder(1)
        );
        let rows = ctx.query(&sql, vec![limit.into()]).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(DataError::from))
            .collect()
    }
}

/// Write operations (Command) - Single Responsibility
#[async_trait]
pub trait WriteRepository<E: Entity>: Send + Sync {
    fn context(&self) -> &RepositoryContext;

    async fn insert(&self, entity: &E) -> DataResult<()> {
        let ctx = self.context();
        let columns = entity.columns();
        let names = columns
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        let markers = (1..=columns.len())
            .map(|i| ctx.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", E::TABLE, names, markers);

        ctx.execute(&sql, columns.into_iter().map(|(_, value)| value).collect())
            .await?;
        ctx.evict::<E>(&entity.id()).await;
        Ok(())
    }

    /// Apply `patch` if the stored version is still `expected_version`.
    ///
    /// Returns the new version. A version mismatch (or missing row) is a
    /// [`DataError::Concurrency`] and is never retried.
    async fn update(&self, id: &E::Id, expected_version: i64, patch: &FieldPatch) -> DataResult<i64> {
        patch.ensure_allowed(E::MUTABLE_FIELDS)?;
        let ctx = self.context();

        let mut assignments = Vec::with_capacity(patch.len() + 1);
        let mut values = Vec::with_capacity(patch.len() + 2);
        for (index, (field, value)) in patch.fields().iter().enumerate() {
            assignments.push(format!("{} = {}", field, ctx.placeholder(index + 1)));
            values.push(value.clone());
        }
        assignments.push("version = version + 1".to_string());

        let id_marker = ctx.placeholder(values.len() + 1);
        let version_marker = ctx.placeholder(values.len() + 2);
        values.push(id.clone().into());
        values.push(expected_version.into());

        let sql = format!(
            "UPDATE {} SET {} WHERE id = {} AND version = {}",
            E::TABLE,
            assignments.join(", "),
            id_marker,
            version_marker
        );

        let affected = ctx.execute(&sql, values).await?;
        ctx.evict::<E>(id).await;
        if affected == 0 {
            return Err(DataError::Concurrency {
                entity: E::TABLE.to_string(),
                id: id.to_string(),
                expected_version,
            });
        }
        Ok(expected_version + 1)
    }
}

/// Delete operations - Single Responsibility
#[async_trait]
pub trait DeleteRepository<E: Entity>: Send + Sync {
    fn context(&self) -> &RepositoryContext;

    /// Returns whether a row was deleted.
    async fn delete_by_id(&self, id: &E::Id) -> DataResult<bool> {
        let ctx = self.context();
        let sql = format!("DELETE FROM {} WHERE id = {}", E::TABLE, ctx.placeholder(1));
        let affected = ctx.execute(&sql, vec![id.clone().into()]).await?;
        ctx.evict::<E>(id).await;
        Ok(affected > 0)
    }
}

/// Full CRUD repository - Combines all operations
pub trait CrudRepository<E: Entity>:
    ReadRepository<E> + WriteRepository<E> + DeleteRepository<E>
{
}

impl<T, E> CrudRepository<E> for T
where
    E: Entity,
    T: ReadRepository<E> + WriteRepository<E> + DeleteRepository<E>,
{
}
