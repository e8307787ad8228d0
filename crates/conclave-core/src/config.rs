use std::path::PathBuf;
use std::time::Duration;

use conclave_providers::{EndpointConfig, RetryPolicy};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub meta_endpoint: EndpointConfig,
    pub ai_a_endpoint: EndpointConfig,
    pub ai_b_endpoint: EndpointConfig,
    pub retry: RetryPolicy,
    /// `DISABLE_QUOTA_CHECK=true` bypasses the quota gate entirely (dev).
    pub quota_enabled: bool,
    pub cors_origins: String,
    /// Collaboration stops once accumulated cost crosses this line.
    pub max_task_cost: f64,
    /// Upper bound accepted on a client-echoed `total_cost`.
    pub intermediate_cost_ceiling: f64,
    pub lock_ttl: Duration,
    pub subscriber_wait: Duration,
    pub completion_cache_ttl: Duration,
    pub use_redis_lock: bool,
    pub use_redis_cache: bool,
    pub redis_url: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: PathBuf::from(env_or("CONCLAVE_STATE_DIR", ".conclave")),
            meta_endpoint: EndpointConfig {
                id: "meta".to_string(),
                name: env_or("CONCLAVE_META_NAME", "DeepSeek"),
                base_url: env_or("CONCLAVE_META_BASE_URL", "https://api.deepseek.com/v1"),
                api_key: std::env::var("CONCLAVE_META_API_KEY").ok(),
                model: env_or("CONCLAVE_META_MODEL", "deepseek-chat"),
                // Jan-2025 list prices; configuration, not behavior.
                prompt_price_per_1k: env_f64("CONCLAVE_META_PROMPT_PRICE", 0.001),
                completion_price_per_1k: env_f64("CONCLAVE_META_COMPLETION_PRICE", 0.002),
            },
            ai_a_endpoint: EndpointConfig {
                id: "ai_a".to_string(),
                name: env_or("CONCLAVE_AI_A_NAME", "Kimi"),
                base_url: env_or("CONCLAVE_AI_A_BASE_URL", "https://api.moonshot.cn/v1"),
                api_key: std::env::var("CONCLAVE_AI_A_API_KEY").ok(),
                model: env_or("CONCLAVE_AI_A_MODEL", "moonshot-v1-8k"),
                prompt_price_per_1k: env_f64("CONCLAVE_AI_A_PROMPT_PRICE", 0.012),
                completion_price_per_1k: env_f64("CONCLAVE_AI_A_COMPLETION_PRICE", 0.012),
            },
            ai_b_endpoint: EndpointConfig {
                id: "ai_b".to_string(),
                name: env_or("CONCLAVE_AI_B_NAME", "Qwen"),
                base_url: env_or(
                    "CONCLAVE_AI_B_BASE_URL",
                    "https://dashscope.aliyuncs.com/compatible-mode/v1",
                ),
                api_key: std::env::var("CONCLAVE_AI_B_API_KEY").ok(),
                model: env_or("CONCLAVE_AI_B_MODEL", "qwen-plus"),
                prompt_price_per_1k: env_f64("CONCLAVE_AI_B_PROMPT_PRICE", 0.0008),
                completion_price_per_1k: env_f64("CONCLAVE_AI_B_COMPLETION_PRICE", 0.002),
            },
            retry: RetryPolicy::from_version(&env_or("AI_CLIENT_VERSION", "fixed")),
            quota_enabled: !env_flag("DISABLE_QUOTA_CHECK"),
            cors_origins: env_or("CORS_ORIGINS", "*"),
            max_task_cost: env_f64("CONCLAVE_MAX_TASK_COST", 1.0),
            intermediate_cost_ceiling: env_f64("CONCLAVE_INTERMEDIATE_COST_CEILING", 1000.0),
            lock_ttl: Duration::from_secs(3600),
            subscriber_wait: Duration::from_secs(10),
            completion_cache_ttl: Duration::from_secs(300),
            use_redis_lock: env_flag("USE_REDIS_LOCK"),
            use_redis_cache: env_flag("USE_REDIS_CACHE"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_reference_deployment() {
        let config = EngineConfig::from_env();
        assert_eq!(config.meta_endpoint.id, "meta");
        assert_eq!(config.lock_ttl, Duration::from_secs(3600));
        assert_eq!(config.completion_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.subscriber_wait, Duration::from_secs(10));
        assert!(config.intermediate_cost_ceiling >= 1000.0);
    }
}
