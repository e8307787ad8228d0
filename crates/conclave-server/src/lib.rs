use std::sync::Arc;

use conclave_core::{
    EngineConfig, MemoryProgressStore, MemoryTaskLocks, ProgressStore, QuotaGate, RuntimeOptions,
    Storage, TaskLocks, TaskRuntime,
};
use conclave_providers::ClientManager;

mod http;

pub use http::serve;

#[derive(Clone)]
pub struct AppState {
    pub runtime: TaskRuntime,
    pub manager: Arc<ClientManager>,
    pub config: EngineConfig,
}

/// Wires storage, upstream clients, fan-out and the runtime from one config.
/// `USE_REDIS_LOCK` / `USE_REDIS_CACHE` pick the distributed variants when
/// the `redis-backend` feature is compiled in.
pub async fn build_state(config: EngineConfig) -> anyhow::Result<AppState> {
    let store = Arc::new(Storage::new(config.state_dir.join("storage")).await?);
    let manager = Arc::new(ClientManager::new(
        config.meta_endpoint.clone(),
        config.ai_a_endpoint.clone(),
        config.ai_b_endpoint.clone(),
        config.retry,
    )?);

    let progress_store = build_progress_store(&config).await?;
    let hub = conclave_core::ProgressHub::new(progress_store, config.completion_cache_ttl);
    let locks = build_locks(&config).await?;
    let quota = QuotaGate::new(store.clone(), config.quota_enabled);
    let runtime = TaskRuntime::new(
        store,
        manager.clone(),
        hub,
        locks,
        quota,
        RuntimeOptions::from(&config),
    );

    Ok(AppState {
        runtime,
        manager,
        config,
    })
}

#[cfg(feature = "redis-backend")]
async fn build_progress_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn ProgressStore>> {
    if config.use_redis_cache {
        let store = conclave_core::distributed::RedisProgressStore::connect(
            &config.redis_url,
            config.completion_cache_ttl,
        )
        .await?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(MemoryProgressStore::new()))
}

#[cfg(not(feature = "redis-backend"))]
async fn build_progress_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn ProgressStore>> {
    if config.use_redis_cache {
        tracing::warn!("USE_REDIS_CACHE is set but the redis-backend feature is not compiled in");
    }
    Ok(Arc::new(MemoryProgressStore::new()))
}

#[cfg(feature = "redis-backend")]
async fn build_locks(config: &EngineConfig) -> anyhow::Result<Arc<dyn TaskLocks>> {
    if config.use_redis_lock {
        let locks =
            conclave_core::distributed::RedisTaskLocks::connect(&config.redis_url).await?;
        return Ok(Arc::new(locks));
    }
    Ok(Arc::new(MemoryTaskLocks::new()))
}

#[cfg(not(feature = "redis-backend"))]
async fn build_locks(config: &EngineConfig) -> anyhow::Result<Arc<dyn TaskLocks>> {
    if config.use_redis_lock {
        tracing::warn!("USE_REDIS_LOCK is set but the redis-backend feature is not compiled in");
    }
    Ok(Arc::new(MemoryTaskLocks::new()))
}
