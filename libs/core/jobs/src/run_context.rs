//! Ambient values a job runs with: correlation id, transaction, extensions.

use crate::transaction::{Transaction, TransactionScope};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Values visible to a job for the extent of its execution.
///
/// Passed explicitly through [`JobInput`](crate::JobInput) and read back from
/// the [`JobContext`](crate::JobContext) handed to the running task.
/// Extensions are keyed by type, so each type has at most one slot.
#[derive(Clone, Default)]
pub struct RunContext {
    correlation_id: Option<String>,
    transaction: Option<Transaction>,
    transaction_scope: TransactionScope,
    extensions: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Clear the correlation id.
    pub fn without_correlation_id(mut self) -> Self {
        self.correlation_id = None;
        self
    }

    /// Run within the given transaction.
    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Set how the scheduler manages transactions.
    pub fn with_transaction_scope(mut self, scope: TransactionScope) -> Self {
        self.transaction_scope = scope;
        self
    }

    /// Store a typed value, replacing any value of the same type.
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        Arc::make_mut(&mut self.extensions).insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_scope(&self) -> TransactionScope {
        self.transaction_scope
    }

    /// Read a typed value.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("correlation_id", &self.correlation_id)
            .field("transaction", &self.transaction)
            .field("transaction_scope", &self.transaction_scope)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}
