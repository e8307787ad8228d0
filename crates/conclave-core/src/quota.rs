use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::RuntimeError;
use crate::storage::Storage;

/// Per-user daily admission control. Increment happens before the task row
/// exists; a failed create pays it back through `rollback`.
#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<Storage>,
    enabled: bool,
}

impl QuotaGate {
    pub fn new(store: Arc<Storage>, enabled: bool) -> Self {
        if !enabled {
            warn!("quota checks are disabled");
        }
        Self { store, enabled }
    }

    pub async fn reserve(&self, user_id: &str) -> Result<(), RuntimeError> {
        if !self.enabled {
            return Ok(());
        }
        match self.store.increment_daily_used(user_id).await? {
            Some(daily_used) => {
                info!(user_id, daily_used, "quota reserved");
                Ok(())
            }
            None => Err(RuntimeError::QuotaExceeded),
        }
    }

    /// Compensating decrement; never fails the caller, only logs.
    pub async fn rollback(&self, user_id: &str) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self.store.decrement_daily_used(user_id).await {
            warn!(user_id, "quota rollback failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::UserRecord;

    #[tokio::test]
    async fn reserve_rejects_once_exhausted_and_rollback_restores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        store.upsert_user(UserRecord::new("u-1", 1)).await.expect("user");

        let gate = QuotaGate::new(store.clone(), true);
        gate.reserve("u-1").await.expect("first");
        assert!(matches!(
            gate.reserve("u-1").await,
            Err(RuntimeError::QuotaExceeded)
        ));
        gate.rollback("u-1").await;
        gate.reserve("u-1").await.expect("after rollback");
    }

    #[tokio::test]
    async fn disabled_gate_admits_everyone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        let gate = QuotaGate::new(store, false);
        gate.reserve("nobody").await.expect("bypass");
    }
}
