use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// A named single-holder lease held across one background execution. The TTL
/// keeps a crashed holder from wedging the task forever.
#[async_trait]
pub trait TaskLocks: Send + Sync {
    async fn acquire(&self, task_id: &str, ttl: Duration) -> bool;
    async fn release(&self, task_id: &str);
}

/// Single-process lease table. Expired leases are reaped on the next
/// acquire attempt.
#[derive(Default)]
pub struct MemoryTaskLocks {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryTaskLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskLocks for MemoryTaskLocks {
    async fn acquire(&self, task_id: &str, ttl: Duration) -> bool {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        held.retain(|_, expires| *expires > now);
        if held.contains_key(task_id) {
            return false;
        }
        held.insert(task_id.to_string(), now + ttl);
        true
    }

    async fn release(&self, task_id: &str) {
        self.held.lock().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let locks = MemoryTaskLocks::new();
        assert!(locks.acquire("t-1", Duration::from_secs(3600)).await);
        assert!(!locks.acquire("t-1", Duration::from_secs(3600)).await);
        locks.release("t-1").await;
        assert!(locks.acquire("t-1", Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let locks = MemoryTaskLocks::new();
        assert!(locks.acquire("t-1", Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(locks.acquire("t-1", Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn locks_are_per_task() {
        let locks = MemoryTaskLocks::new();
        assert!(locks.acquire("t-1", Duration::from_secs(3600)).await);
        assert!(locks.acquire("t-2", Duration::from_secs(3600)).await);
    }
}
