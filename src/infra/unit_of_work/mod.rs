//! Unit of Work pattern implementation.
//!
//! A [`UnitOfWork`] owns one session and drives one transaction at a time
//! through `Inactive → Active → {Committed, RolledBack}`. Repositories
//! obtained from it share the session, the cache manager and the change
//! tracker, so every operation sees the same transactional view and the
//! cache namespaces they touch are invalidated when the transaction ends.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sea_orm::{JsonValue, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod factory;
mod state;

pub use factory::UnitOfWorkFactory;
pub use state::{
    ChangeTracker, OperationRecord, Savepoint, TransactionState, UnitOfWorkStatus,
};

use super::cache::CacheManager;
use super::db::{Session, SessionHandle};
use super::repositories::{Repository, RepositoryContext};
use crate::config::{UnitOfWorkConfig, SAVEPOINT_PREFIX};
use crate::errors::{DataError, DataResult};

/// Callback run around commit or rollback.
pub type Hook = Box<dyn Fn() -> BoxFuture<'static, DataResult<()>> + Send + Sync>;

/// Where a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Failure aborts the commit and rolls back
    BeforeCommit,
    /// Failure is logged; the commit already happened
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

#[derive(Default)]
struct Hooks {
    before_commit: Vec<Hook>,
    after_commit: Vec<Hook>,
    before_rollback: Vec<Hook>,
    after_rollback: Vec<Hook>,
}

impl Hooks {
    fn at(&self, point: HookPoint) -> &[Hook] {
        match point {
            HookPoint::BeforeCommit => &self.before_commit,
            HookPoint::AfterCommit => &self.after_commit,
            HookPoint::BeforeRollback => &self.before_rollback,
            HookPoint::AfterRollback => &self.after_rollback,
        }
    }

    fn at_mut(&mut self, point: HookPoint) -> &mut Vec<Hook> {
        match point {
            HookPoint::BeforeCommit => &mut self.before_commit,
            HookPoint::AfterCommit => &mut self.after_commit,
            HookPoint::BeforeRollback => &mut self.before_rollback,
            HookPoint::AfterRollback => &mut self.after_rollback,
        }
    }
}

/// Transactional scope over one session.
///
/// Owned by a single flow; not `Clone`.
pub struct UnitOfWork {
    id: Uuid,
    session: Option<Session>,
    handle: SessionHandle,
    cache: CacheManager,
    config: UnitOfWorkConfig,
    state: Option<TransactionState>,
    tracker: ChangeTracker,
    hooks: Hooks,
    repositories: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    savepoint_seq: u32,
}

impl UnitOfWork {
    pub fn new(session: Session, cache: CacheManager, config: UnitOfWorkConfig) -> Self {
        let handle = session.handle();
        Self {
            id: Uuid::new_v4(),
            session: Some(session),
            handle,
            cache,
            config,
            state: None,
            tracker: ChangeTracker::default(),
            hooks: Hooks::default(),
            repositories: Mutex::new(HashMap::new()),
            savepoint_seq: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn status(&self) -> UnitOfWorkStatus {
        self.state
            .as_ref()
            .map_or(UnitOfWorkStatus::Inactive, TransactionState::status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == UnitOfWorkStatus::Active
    }

    /// Snapshot of the current (or last) transaction, with its operation log.
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.state.as_ref().map(|state| {
            let mut snapshot = state.clone();
            snapshot.operations = self.tracker.operations();
            snapshot
        })
    }

    /// Register a hook. Hooks stay registered for later transactions.
    pub fn add_hook<F, Fut>(&mut self, point: HookPoint, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DataResult<()>> + Send + 'static,
    {
        self.hooks
            .at_mut(point)
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Repository of type `R`, built on first use and shared afterwards.
    pub fn repository<R: Repository>(&self) -> Arc<R> {
        let mut repositories = self.repositories.lock();
        let entry = repositories
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Arc::new(R::new(self.repository_context())) as Arc<dyn Any + Send + Sync>)
            .clone();
        drop(repositories);

        match entry.downcast::<R>() {
            Ok(repository) => repository,
            // Keys are the TypeId of the stored value, so this cannot mismatch.
            Err(_) => Arc::new(R::new(self.repository_context())),
        }
    }

    fn repository_context(&self) -> RepositoryContext {
        RepositoryContext {
            session: self.handle.clone(),
            cache: self.cache.clone(),
            tracker: self.tracker.clone(),
        }
    }

    // =========================================================================
    // Transaction lifecycle
    // =========================================================================

    /// Start a transaction. Allowed when inactive or after a finished one.
    pub async fn begin(&mut self) -> DataResult<()> {
        if self.is_active() {
            return Err(DataError::unit_of_work("transaction is already active"));
        }

        self.handle.begin().await?;
        self.tracker.reset();
        let state = TransactionState::begin();
        debug!(unit_of_work = %self.id, transaction = %state.id, "Transaction started");
        self.state = Some(state);
        Ok(())
    }

    /// Commit: before hooks, commit, cache invalidation, after hooks.
    pub async fn commit(&mut self) -> DataResult<()> {
        self.require_active("commit")?;

        if let Err(e) = self.run_hooks(HookPoint::BeforeCommit).await {
            warn!(unit_of_work = %self.id, "Before-commit hook failed, rolling back: {}", e);
            self.rollback_after_failure().await;
            return Err(e);
        }

        if let Err(e) = self.handle.commit().await {
            error!(unit_of_work = %self.id, "Commit failed, rolling back: {}", e);
            self.rollback_after_failure().await;
            return Err(DataError::transaction_caused_by("commit failed", e));
        }

        self.finish(true).await;
        if let Err(e) = self.run_hooks(HookPoint::AfterCommit).await {
            warn!(unit_of_work = %self.id, "After-commit hook failed: {}", e);
        }
        Ok(())
    }

    /// Roll back. A no-op when no transaction was started.
    pub async fn rollback(&mut self) -> DataResult<()> {
        match self.status() {
            UnitOfWorkStatus::Inactive => return Ok(()),
            UnitOfWorkStatus::Active => {}
            finished => {
                return Err(DataError::unit_of_work(format!(
                    "cannot roll back: transaction already {}",
                    finished
                )))
            }
        }

        if let Err(e) = self.run_hooks(HookPoint::BeforeRollback).await {
            warn!(unit_of_work = %self.id, "Before-rollback hook failed: {}", e);
        }

        let result = self.handle.rollback().await;
        self.finish(false).await;

        if let Err(e) = self.run_hooks(HookPoint::AfterRollback).await {
            warn!(unit_of_work = %self.id, "After-rollback hook failed: {}", e);
        }

        result.map_err(|e| DataError::transaction_caused_by("rollback failed", e))
    }

    /// Roll back after a failed commit path; errors are only logged.
    async fn rollback_after_failure(&mut self) {
        if let Err(e) = self.rollback().await {
            error!(unit_of_work = %self.id, "Rollback after failure also failed: {}", e);
        }
    }

    async fn finish(&mut self, committed: bool) {
        if let Some(state) = self.state.as_mut() {
            state.finish(committed);
            info!(
                unit_of_work = %self.id,
                transaction = %state.id,
                operations = self.tracker.operations().len(),
                outcome = if committed { "committed" } else { "rolled back" },
                "Transaction finished"
            );
        }
        self.invalidate_touched().await;
    }

    async fn invalidate_touched(&self) {
        for namespace in self.tracker.take_namespaces() {
            let pattern = format!("{}:*", namespace);
            let removed = self.cache.invalidate_pattern(&pattern).await;
            debug!(%namespace, removed, "Invalidated cache namespace");
        }
    }

    async fn run_hooks(&self, point: HookPoint) -> DataResult<()> {
        for hook in self.hooks.at(point) {
            hook().await?;
        }
        Ok(())
    }

    fn require_active(&self, operation: &str) -> DataResult<()> {
        match self.status() {
            UnitOfWorkStatus::Active => Ok(()),
            UnitOfWorkStatus::Inactive => Err(DataError::unit_of_work(format!(
                "cannot {}: no active transaction",
                operation
            ))),
            finished => Err(DataError::unit_of_work(format!(
                "cannot {}: transaction already {}",
                operation, finished
            ))),
        }
    }

    // =========================================================================
    // Savepoints
    // =========================================================================

    /// Open a savepoint. Without a name one is generated (`sp_1`, `sp_2`, ...).
    pub async fn create_savepoint(&mut self, name: Option<&str>) -> DataResult<Savepoint> {
        self.require_active("create a savepoint")?;

        let name = match name {
            Some(name) => {
                validate_savepoint_name(name)?;
                name.to_string()
            }
            None => {
                self.savepoint_seq += 1;
                format!("{}{}", SAVEPOINT_PREFIX, self.savepoint_seq)
            }
        };

        self.handle.savepoint(&name).await?;
        self.tracker.record("savepoint", name.clone());

        let state = self.active_state()?;
        state.savepoints.push(name.clone());
        Ok(Savepoint::new(name, state.id))
    }

    /// Undo everything after `savepoint`. The savepoint stays open.
    pub async fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> DataResult<()> {
        let position = self.savepoint_position(savepoint, "roll back to a savepoint")?;
        self.handle.rollback_to_savepoint(savepoint.name()).await?;
        self.tracker
            .record("rollback_to_savepoint", savepoint.name().to_string());
        self.active_state()?.savepoints.truncate(position + 1);
        Ok(())
    }

    /// Release `savepoint` and every savepoint opened after it.
    pub async fn release_savepoint(&mut self, savepoint: &Savepoint) -> DataResult<()> {
        let position = self.savepoint_position(savepoint, "release a savepoint")?;
        self.handle.release_savepoint(savepoint.name()).await?;
        self.tracker
            .record("release_savepoint", savepoint.name().to_string());
        self.active_state()?.savepoints.truncate(position);
        Ok(())
    }

    fn savepoint_position(&self, savepoint: &Savepoint, operation: &str) -> DataResult<usize> {
        self.require_active(operation)?;
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| DataError::unit_of_work("no transaction state"))?;

        if savepoint.transaction_id() != state.id {
            return Err(DataError::unit_of_work(format!(
                "savepoint {} belongs to another transaction",
                savepoint.name()
            )));
        }
        state
            .savepoints
            .iter()
            .rposition(|name| name == savepoint.name())
            .ok_or_else(|| {
                DataError::unit_of_work(format!("savepoint {} is not open", savepoint.name()))
            })
    }

    fn active_state(&mut self) -> DataResult<&mut TransactionState> {
        self.state
            .as_mut()
            .filter(|state| state.is_active)
            .ok_or_else(|| DataError::unit_of_work("no active transaction"))
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Execute a statement on the unit of work's session.
    pub async fn execute(&self, sql: &str, values: Vec<Value>) -> DataResult<u64> {
        let statement = self.handle.statement(sql, values);
        let affected = self.handle.execute(statement).await?;
        self.tracker.record("execute", sql);
        Ok(affected)
    }

    pub async fn query(&self, sql: &str, values: Vec<Value>) -> DataResult<Vec<JsonValue>> {
        let statement = self.handle.statement(sql, values);
        let rows = self.handle.query(statement).await?;
        self.tracker.record("query", sql);
        Ok(rows)
    }

    // =========================================================================
    // Retry
    // =========================================================================

    /// Run `operation` in the current transaction, retrying transient failures.
    ///
    /// A transaction is started if none is active. On a transient failure the
    /// transaction is rolled back, the call waits `retry_delay * 2^attempt`,
    /// begins again and retries, up to `max_retry_attempts` attempts in total.
    /// Other failures are returned at once, rolled back when
    /// `rollback_on_error` is set. The result is not committed.
    pub async fn execute_with_retry<T, F>(&mut self, operation: F) -> DataResult<T>
    where
        F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, DataResult<T>>,
    {
        self.retry(operation, false).await
    }

    pub(crate) async fn retry<T, F>(&mut self, mut operation: F, commit_each: bool) -> DataResult<T>
    where
        F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, DataResult<T>>,
    {
        let attempts = self.config.max_retry_attempts.max(1);
        if !self.is_active() {
            self.begin().await?;
        }

        let mut last_error = None;
        for attempt in 0..attempts {
            let result = match operation(&mut *self).await {
                Ok(value) if commit_each => self.commit().await.map(|_| value),
                other => other,
            };

            let e = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !e.is_transient() {
                if self.config.rollback_on_error && self.is_active() {
                    self.rollback_after_failure().await;
                }
                return Err(e);
            }

            warn!(
                unit_of_work = %self.id,
                attempt = attempt + 1,
                attempts,
                "Transient failure: {}",
                e
            );
            if self.is_active() {
                self.rollback_after_failure().await;
            }
            last_error = Some(e);

            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                self.begin().await?;
            }
        }

        let message = format!("operation failed after {} attempts", attempts);
        error!(unit_of_work = %self.id, attempts, "Giving up on transient failures");
        Err(match last_error {
            Some(cause) => DataError::transaction_caused_by(message, cause),
            None => DataError::transaction(message),
        })
    }

    /// Roll back anything still active and return the session to the pool.
    pub async fn close(mut self) {
        if self.is_active() {
            warn!(unit_of_work = %self.id, "Closing unit of work with an active transaction, rolling back");
            self.rollback_after_failure().await;
        }
        if let Some(session) = self.session.take() {
            session.release().await;
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(
                unit_of_work = %self.id,
                "Unit of work dropped with an active transaction; it is rolled back when the connection returns to the pool"
            );
        }
    }
}

fn validate_savepoint_name(name: &str) -> DataResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DataError::validation(format!("invalid savepoint name: {}", name)))
    }
}

/// Run a block inside [`UnitOfWorkFactory::transaction`].
///
/// ```ignore
/// let id = in_transaction!(factory, |uow| {
///     uow.execute("INSERT INTO audit (event) VALUES ($1)", vec!["login".into()]).await?;
///     Ok(42)
/// })?;
/// ```
#[macro_export]
macro_rules! in_transaction {
    ($factory:expr, |$uow:ident| $body:expr) => {
        $factory
            .transaction(|$uow| Box::pin(async move { $body }))
            .await
    };
}
