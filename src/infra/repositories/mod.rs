//! Repository layer - Data access abstraction
//!
//! Repositories are obtained from a unit of work and run every statement on
//! its session, so they see (and contribute to) the same transaction.

mod base;
mod patch;

use std::marker::PhantomData;

pub use base::{
    entity_cache_key, CrudRepository, DeleteRepository, Entity, ReadRepository, Repository,
    RepositoryContext, WriteRepository,
};
pub use patch::FieldPatch;

/// Generic CRUD repository for any [`Entity`].
pub struct EntityRepository<E: Entity> {
    context: RepositoryContext,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Repository for EntityRepository<E> {
    fn new(context: RepositoryContext) -> Self {
        Self {
            context,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> ReadRepository<E> for EntityRepository<E> {
    fn context(&self) -> &RepositoryContext {
        &self.context
    }
}

impl<E: Entity> WriteRepository<E> for EntityRepository<E> {
    fn context(&self) -> &RepositoryContext {
        &self.context
    }
}

impl<E: Entity> DeleteRepository<E> for EntityRepository<E> {
    fn context(&self) -> &RepositoryContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ConnectionConfig, UnitOfWorkConfig};
    use crate::errors::DataError;
    use crate::infra::cache::{CacheManager, MemoryCacheBackend};
    use crate::infra::db::testing::FakeConnector;
    use crate::infra::db::ConnectionManager;
    use crate::infra::unit_of_work::UnitOfWork;
    use sea_orm::Value;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: i64,
        customer: String,
        status: String,
        version: i64,
    }

    impl Entity for Order {
        type Id = i64;

        const TABLE: &'static str = "orders";
        const CACHE_NAMESPACE: &'static str = "orders";
        const MUTABLE_FIELDS: &'static [&'static str] = &["status"];

        fn id(&self) -> i64 {
            self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn columns(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", self.id.into()),
                ("customer", self.customer.clone().into()),
                ("status", self.status.clone().into()),
                ("version", self.version.into()),
            ]
        }
    }

    type Orders = EntityRepository<Order>;

    async fn setup() -> (UnitOfWork, FakeConnector, CacheManager) {
        let connector = FakeConnector::new();
        let manager = ConnectionManager::with_connector(
            ConnectionConfig::new("postgres://localhost/shop"),
            Arc::new(connector.clone()),
        )
        .unwrap();
        manager.initialize().await.unwrap();
        let cache = CacheManager::with_backend(
            CacheConfig::memory(),
            Arc::new(MemoryCacheBackend::new(100, true)),
        );
        let session = manager.get_session().await.unwrap();
        let uow = UnitOfWork::new(session, cache.clone(), UnitOfWorkConfig::default());
        (uow, connector, cache)
    }

    fn order_row() -> serde_json::Value {
        json!({"id": 1, "customer": "ada", "status": "new", "version": 3})
    }

    #[tokio::test]
    async fn test_find_by_id_is_cache_aside() {
        let (uow, connector, cache) = setup().await;
        connector.push_query_result(vec![order_row()]);
        let orders = uow.repository::<Orders>();

        let first = orders.find_by_id(&1).await.unwrap().unwrap();
        let second = orders.find_by_id(&1).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(
            connector.count_statements("SELECT * FROM orders WHERE id = $1"),
            1
        );
        assert!(cache.exists("orders:1").await);
        uow.close().await;
    }

    #[tokio::test]
    async fn test_find_by_id_missing_row() {
        let (uow, _connector, cache) = setup().await;
        let orders = uow.repository::<Orders>();

        assert_eq!(orders.find_by_id(&42).await.unwrap(), None);
        assert!(!cache.exists("orders:42").await);
        uow.close().await;
    }

    #[tokio::test]
    async fn test_repository_instances_are_shared() {
        let (uow, _connector, _cache) = setup().await;
        let a = uow.repository::<Orders>();
        let b = uow.repository::<Orders>();
        assert!(Arc::ptr_eq(&a, &b));
        uow.close().await;
    }

    #[tokio::test]
    async fn test_insert_builds_statement_and_touches_namespace() {
        let (mut uow, connector, cache) = setup().await;
        cache.set("orders:7", &"stale", None).await.unwrap();
        uow.begin().await.unwrap();

        let order = Order {
            id: 1,
            customer: "ada".to_string(),
            status: "new".to_string(),
            version: 1,
        };
        uow.repository::<Orders>().insert(&order).await.unwrap();

        assert_eq!(
            connector.count_statements(
                "INSERT INTO orders (id, customer, status, version) VALUES ($1, $2, $3, $4)"
            ),
            1
        );
        assert!(cache.exists("orders:7").await);

        uow.commit().await.unwrap();
        assert!(!cache.exists("orders:7").await);
        uow.close().await;
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let (mut uow, connector, cache) = setup().await;
        cache.set("orders:1", &order_row(), None).await.unwrap();
        uow.begin().await.unwrap();

        let patch = FieldPatch::new().set("status", "paid");
        let version = uow
            .repository::<Orders>()
            .update(&1, 3, &patch)
            .await
            .unwrap();

        assert_eq!(version, 4);
        assert_eq!(
            connector.count_statements(
                "UPDATE orders SET status = $1, version = version + 1 WHERE id = $2 AND version = $3"
            ),
            1
        );
        assert!(!cache.exists("orders:1").await);
        uow.commit().await.unwrap();
        uow.close().await;
    }

    #[tokio::test]
    async fn test_update_with_stale_version_is_conflict() {
        let (mut uow, connector, _cache) = setup().await;
        uow.begin().await.unwrap();
        connector.push_execute_result(0);

        let patch = FieldPatch::new().set("status", "paid");
        let err = uow
            .repository::<Orders>()
            .update(&1, 2, &patch)
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            DataError::Concurrency { expected_version: 2, .. }
        ));
        assert!(!err.is_transient());
        uow.rollback().await.unwrap();
        uow.close().await;
    }

    #[tokio::test]
    async fn test_update_rejects_immutable_fields() {
        let (mut uow, connector, _cache) = setup().await;
        uow.begin().await.unwrap();
        let before = connector.statements().len();

        let patch = FieldPatch::new().set("customer", "mallory");
        let err = uow
            .repository::<Orders>()
            .update(&1, 3, &patch)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, DataError::Validation(_)));
        assert_eq!(connector.statements().len(), before);
        uow.rollback().await.unwrap();
        uow.close().await;
    }

    #[tokio::test]
    async fn test_reads_after_write_are_not_cached() {
        let (mut uow, connector, cache) = setup().await;
        uow.begin().await.unwrap();
        let orders = uow.repository::<Orders>();

        orders.delete_by_id(&2).await.unwrap();
        connector.push_query_result(vec![order_row()]);
        orders.find_by_id(&1).await.unwrap();

        assert!(!cache.exists("orders:1").await);
        uow.rollback().await.unwrap();
        uow.close().await;
    }

    #[tokio::test]
    async fn test_delete_reports_whether_row_existed() {
        let (mut uow, connector, _cache) = setup().await;
        uow.begin().await.unwrap();
        let orders = uow.repository::<Orders>();

        connector.push_execute_result(1);
        assert!(orders.delete_by_id(&1).await.unwrap());
        connector.push_execute_result(0);
        assert!(!orders.delete_by_id(&1).await.unwrap());

        uow.commit().await.unwrap();
        uow.close().await;
    }

    #[tokio::test]
    async fn test_find_all_uses_limit() {
        let (uow, connector, _cache) = setup().await;
        connector.push_query_result(vec![order_row(), order_row()]);

        let all = uow.repository::<Orders>().find_all(10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            connector.count_statements("SELECT * FROM orders ORDER BY id LIMIT $1"),
            1
        );
        uow.close().await;
    }
}
