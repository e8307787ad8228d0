//! Redis-backed variants of the task lock and the progress store, for
//! multi-worker deployments (`USE_REDIS_LOCK` / `USE_REDIS_CACHE`). The hub
//! and its subscriber registry stay in-process; only leases, counters and
//! buffers move into the shared store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use conclave_types::{CompletionEnvelope, ProgressItem};

use crate::fanout::{ProgressStore, RING_CAPACITY};
use crate::locks::TaskLocks;

#[derive(Clone)]
pub struct RedisTaskLocks {
    conn: ConnectionManager,
}

impl RedisTaskLocks {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
        })
    }
}

#[async_trait]
impl TaskLocks for RedisTaskLocks {
    async fn acquire(&self, task_id: &str, ttl: Duration) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(format!("task:lock:{task_id}"))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(reply) => reply.is_some(),
            Err(err) => {
                warn!(task_id, "redis lock acquire failed: {err}");
                false
            }
        }
    }

    async fn release(&self, task_id: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.del(format!("task:lock:{task_id}")).await;
        if let Err(err) = result {
            warn!(task_id, "redis lock release failed: {err}");
        }
    }
}

#[derive(Clone)]
pub struct RedisProgressStore {
    conn: ConnectionManager,
    completion_ttl: Duration,
}

impl RedisProgressStore {
    pub async fn connect(url: &str, completion_ttl: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
            completion_ttl,
        })
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn next_sequence(&self, task_id: &str) -> u64 {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.incr(format!("seq:{task_id}"), 1).await;
        match result {
            // INCR starts the per-task sequence at 1.
            Ok(value) => value.max(0) as u64,
            Err(err) => {
                warn!(task_id, "redis INCR failed: {err}");
                0
            }
        }
    }

    async fn push_item(&self, item: ProgressItem) {
        let Ok(payload) = serde_json::to_string(&item) else {
            return;
        };
        let mut conn = self.conn.clone();
        let key = format!("progress:{}", item.task_id);
        let pushed: redis::RedisResult<i64> = conn.rpush(&key, payload).await;
        if let Err(err) = pushed {
            warn!(task_id = %item.task_id, "redis RPUSH failed: {err}");
            return;
        }
        let trimmed: redis::RedisResult<()> =
            conn.ltrim(&key, -(RING_CAPACITY as isize), -1).await;
        if let Err(err) = trimmed {
            warn!(task_id = %item.task_id, "redis LTRIM failed: {err}");
        }
    }

    async fn items(&self, task_id: &str) -> Vec<ProgressItem> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Vec<String>> =
            conn.lrange(format!("progress:{task_id}"), 0, -1).await;
        match result {
            Ok(raw) => raw
                .iter()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(err) => {
                warn!(task_id, "redis LRANGE failed: {err}");
                Vec::new()
            }
        }
    }

    async fn put_completion(&self, envelope: CompletionEnvelope) {
        let Ok(payload) = serde_json::to_string(&envelope) else {
            return;
        };
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(
                format!("complete:{}", envelope.task_id),
                payload,
                self.completion_ttl.as_secs().max(1),
            )
            .await;
        if let Err(err) = result {
            warn!(task_id = %envelope.task_id, "redis completion cache failed: {err}");
        }
    }

    async fn completion(&self, task_id: &str) -> Option<CompletionEnvelope> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> =
            conn.get(format!("complete:{task_id}")).await;
        match result {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(task_id, "redis completion read failed: {err}");
                None
            }
        }
    }

    async fn evict(&self, task_id: &str) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn
            .del(vec![
                format!("seq:{task_id}"),
                format!("progress:{task_id}"),
                format!("complete:{task_id}"),
            ])
            .await;
        if let Err(err) = result {
            warn!(task_id, "redis eviction failed: {err}");
        }
    }
}
