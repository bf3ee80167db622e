//! Broker sessions as members of a job transaction.

use crate::transport::BrokerSession;
use async_trait::async_trait;
use jobs::{JobError, TransactionMember};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Member id of the session a MOM stages its transactional publishes in.
pub(crate) fn publish_member_id(mom_uid: &str) -> String {
    format!("mom.publish.{mom_uid}")
}

/// Commits or rolls back a transacted broker session with its transaction.
pub(crate) struct SessionMember {
    id: String,
    session: Arc<dyn BrokerSession>,
    close_on_release: bool,
    used: AtomicBool,
}

impl SessionMember {
    pub(crate) fn new(id: impl Into<String>, session: Arc<dyn BrokerSession>, close_on_release: bool) -> Self {
        Self {
            id: id.into(),
            session,
            close_on_release,
            used: AtomicBool::new(false),
        }
    }

    pub(crate) fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    /// Mark that the session holds work to commit.
    pub(crate) fn mark_used(&self) {
        self.used.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionMember for SessionMember {
    fn member_id(&self) -> &str {
        &self.id
    }

    fn needs_commit(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    async fn commit_phase2(&self) -> Result<(), JobError> {
        self.session.commit().await.map_err(JobError::failed)
    }

    async fn rollback(&self) {
        if let Err(e) = self.session.rollback().await {
            warn!(member = %self.id, error = %e, "Failed to roll back broker session");
        }
    }

    async fn release(&self) {
        if self.close_on_release {
            self.session.close().await;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
