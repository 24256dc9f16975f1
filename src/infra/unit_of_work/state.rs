//! Transaction bookkeeping shared by a unit of work and its repositories.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOfWorkStatus {
    Inactive,
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for UnitOfWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitOfWorkStatus::Inactive => "inactive",
            UnitOfWorkStatus::Active => "active",
            UnitOfWorkStatus::Committed => "committed",
            UnitOfWorkStatus::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// One entry in the operation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub operation: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// State of one transaction. Created by `begin`, final after commit or rollback.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionState {
    pub id: Uuid,
    pub is_active: bool,
    pub is_committed: bool,
    pub is_rolled_back: bool,
    pub operations: Vec<OperationRecord>,
    /// Open savepoints, innermost last
    pub savepoints: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TransactionState {
    pub(crate) fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            is_active: true,
            is_committed: false,
            is_rolled_back: false,
            operations: Vec::new(),
            savepoints: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn status(&self) -> UnitOfWorkStatus {
        if self.is_active {
            UnitOfWorkStatus::Active
        } else if self.is_committed {
            UnitOfWorkStatus::Committed
        } else {
            UnitOfWorkStatus::RolledBack
        }
    }

    pub(crate) fn finish(&mut self, committed: bool) {
        self.is_active = false;
        self.is_committed = committed;
        self.is_rolled_back = !committed;
        self.savepoints.clear();
        self.ended_at = Some(Utc::now());
    }
}

/// Handle to a savepoint created by `create_savepoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
    transaction_id: Uuid,
}

impl Savepoint {
    pub(crate) fn new(name: String, transaction_id: Uuid) -> Self {
        Self {
            name,
            transaction_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }
}

#[derive(Default)]
struct TrackerInner {
    operations: Vec<OperationRecord>,
    namespaces: BTreeSet<String>,
}

/// Operation log and dirty cache namespaces of the current transaction.
///
/// Cloned into every repository of a unit of work.
#[derive(Clone, Default)]
pub struct ChangeTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl ChangeTracker {
    pub fn record(&self, operation: impl Into<String>, detail: impl Into<String>) {
        self.inner.lock().operations.push(OperationRecord {
            operation: operation.into(),
            detail: detail.into(),
            at: Utc::now(),
        });
    }

    /// Mark a cache namespace for invalidation when the transaction ends.
    pub fn touch(&self, namespace: impl Into<String>) {
        self.inner.lock().namespaces.insert(namespace.into());
    }

    pub fn operations(&self) -> Vec<OperationRecord> {
        self.inner.lock().operations.clone()
    }

    pub fn touched_namespaces(&self) -> Vec<String> {
        self.inner.lock().namespaces.iter().cloned().collect()
    }

    pub(crate) fn take_namespaces(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().namespaces)
            .into_iter()
            .collect()
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.operations.clear();
        inner.namespaces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_exactly_one_outcome() {
        let mut state = TransactionState::begin();
        assert_eq!(state.status(), UnitOfWorkStatus::Active);

        state.savepoints.push("sp_1".to_string());
        state.finish(false);

        assert_eq!(state.status(), UnitOfWorkStatus::RolledBack);
        assert!(!state.is_committed);
        assert!(state.savepoints.is_empty());
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn test_tracker_deduplicates_namespaces() {
        let tracker = ChangeTracker::default();
        tracker.touch("orders");
        tracker.touch("orders");
        tracker.touch("customers");
        tracker.record("insert", "orders");

        assert_eq!(tracker.take_namespaces(), vec!["customers", "orders"]);
        assert!(tracker.touched_namespaces().is_empty());
        assert_eq!(tracker.operations().len(), 1);
    }
}
