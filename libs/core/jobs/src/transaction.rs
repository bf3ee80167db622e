//! Two-phase transactions spanning the resources a job touches.

use crate::error::JobError;
use crate::sync::lock;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use strum::Display;
use tracing::{debug, warn};
use uuid::Uuid;

/// A resource participating in a [`Transaction`].
#[async_trait]
pub trait TransactionMember: Send + Sync {
    /// Unique id of this member within its transaction.
    fn member_id(&self) -> &str;

    /// Whether the member has work to commit.
    fn needs_commit(&self) -> bool {
        true
    }

    /// Prepare: return `false` to vote for rollback.
    async fn commit_phase1(&self) -> bool {
        true
    }

    /// Make the prepared work durable.
    async fn commit_phase2(&self) -> Result<(), JobError>;

    /// Discard the work.
    async fn rollback(&self);

    /// Release resources, after commit or rollback.
    async fn release(&self) {}

    /// Upcast used to recover the concrete member type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// How the scheduler treats transactions for a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionScope {
    /// Use the transaction already in the run context, if any.
    #[default]
    Required,
    /// Start a fresh transaction for each run: commit on success, roll back on failure.
    RequiresNew,
}

/// A two-phase transaction. Cloning yields another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    members: Mutex<Vec<Arc<dyn TransactionMember>>>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                members: Mutex::new(Vec::new()),
                state: Mutex::new(TransactionState::Active),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        *lock(&self.inner.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Register a member. Fails if the transaction already completed.
    pub fn register_member(&self, member: Arc<dyn TransactionMember>) -> Result<(), JobError> {
        self.ensure_active()?;
        let mut members = lock(&self.inner.members);
        members.retain(|m| m.member_id() != member.member_id());
        members.push(member);
        Ok(())
    }

    /// Look up a member by id.
    pub fn member(&self, member_id: &str) -> Option<Arc<dyn TransactionMember>> {
        lock(&self.inner.members)
            .iter()
            .find(|m| m.member_id() == member_id)
            .cloned()
    }

    /// Look up a member by id, recovering its concrete type.
    pub fn member_as<M: TransactionMember + 'static>(&self, member_id: &str) -> Option<Arc<M>> {
        self.member(member_id)
            .and_then(|m| m.as_any().downcast::<M>().ok())
    }

    /// Return the member with the given id, registering the one built by
    /// `create` if there is none yet.
    pub fn register_member_if_absent<M, F>(&self, member_id: &str, create: F) -> Result<Arc<M>, JobError>
    where
        M: TransactionMember + 'static,
        F: FnOnce() -> M,
    {
        self.ensure_active()?;
        let mut members = lock(&self.inner.members);
        if let Some(existing) = members.iter().find(|m| m.member_id() == member_id) {
            return Arc::clone(existing)
                .as_any()
                .downcast::<M>()
                .map_err(|_| JobError::Transaction(format!("member '{member_id}' has a different type")));
        }
        let member = Arc::new(create());
        members.push(member.clone());
        Ok(member)
    }

    /// Two-phase commit. If any member votes against, everything is rolled back.
    pub async fn commit(&self) -> Result<(), JobError> {
        self.ensure_active()?;
        let members = self.take_members();

        for member in members.iter().filter(|m| m.needs_commit()) {
            if !member.commit_phase1().await {
                warn!(
                    transaction = %self.inner.id,
                    member = member.member_id(),
                    "Transaction member voted for rollback"
                );
                self.finish(&members, TransactionState::RolledBack).await;
                return Err(JobError::Transaction(format!(
                    "member '{}' failed to prepare",
                    member.member_id()
                )));
            }
        }

        let mut failure = None;
        for member in members.iter().filter(|m| m.needs_commit()) {
            if let Err(e) = member.commit_phase2().await {
                warn!(transaction = %self.inner.id, member = member.member_id(), error = %e, "Commit failed");
                failure.get_or_insert(e);
            }
        }

        *lock(&self.inner.state) = TransactionState::Committed;
        for member in &members {
            member.release().await;
        }
        debug!(transaction = %self.inner.id, members = members.len(), "Transaction committed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back every member. No-op if already completed.
    pub async fn rollback(&self) {
        if !self.is_active() {
            return;
        }
        let members = self.take_members();
        self.finish(&members, TransactionState::RolledBack).await;
        debug!(transaction = %self.inner.id, "Transaction rolled back");
    }

    async fn finish(&self, members: &[Arc<dyn TransactionMember>], state: TransactionState) {
        *lock(&self.inner.state) = state;
        for member in members {
            member.rollback().await;
        }
        for member in members {
            member.release().await;
        }
    }

    fn take_members(&self) -> Vec<Arc<dyn TransactionMember>> {
        std::mem::take(&mut *lock(&self.inner.members))
    }

    fn ensure_active(&self) -> Result<(), JobError> {
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(JobError::Transaction(format!(
                "transaction {} is already {state}",
                self.inner.id
            ))),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("members", &lock(&self.inner.members).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingMember {
        id: String,
        vote: bool,
        committed: AtomicBool,
        rolled_back: AtomicBool,
        released: AtomicUsize,
    }

    impl RecordingMember {
        fn new(id: &str, vote: bool) -> Self {
            Self {
                id: id.to_string(),
                vote,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TransactionMember for RecordingMember {
        fn member_id(&self) -> &str {
            &self.id
        }

        async fn commit_phase1(&self) -> bool {
            self.vote
        }

        async fn commit_phase2(&self) -> Result<(), JobError> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self) {
            self.rolled_back.store(true, Ordering::SeqCst);
        }

        async fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_commit_runs_both_phases() {
        let tx = Transaction::new();
        let member = tx
            .register_member_if_absent("a", || RecordingMember::new("a", true))
            .unwrap();

        tx.commit().await.unwrap();

        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(member.committed.load(Ordering::SeqCst));
        assert!(!member.rolled_back.load(Ordering::SeqCst));
        assert_eq!(member.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_vote_rolls_back_everyone() {
        let tx = Transaction::new();
        let good = tx
            .register_member_if_absent("good", || RecordingMember::new("good", true))
            .unwrap();
        let bad = tx
            .register_member_if_absent("bad", || RecordingMember::new("bad", false))
            .unwrap();

        assert!(tx.commit().await.is_err());
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(!good.committed.load(Ordering::SeqCst));
        assert!(good.rolled_back.load(Ordering::SeqCst));
        assert!(bad.rolled_back.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_register_if_absent_returns_existing() {
        let tx = Transaction::new();
        let first = tx
            .register_member_if_absent("m", || RecordingMember::new("m", true))
            .unwrap();
        let second = tx
            .register_member_if_absent("m", || RecordingMember::new("other", true))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(tx.member_as::<RecordingMember>("m").is_some());
    }

    #[tokio::test]
    async fn test_completed_transaction_refuses_members() {
        let tx = Transaction::new();
        tx.rollback().await;
        let result = tx.register_member(Arc::new(RecordingMember::new("late", true)));
        assert!(result.is_err());
        assert!(tx.commit().await.is_err());
    }
}
