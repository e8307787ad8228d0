use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Consecutive final failures after which an endpoint's circuit opens.
pub const CIRCUIT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable identifier, e.g. `meta`.
    pub id: String,
    /// Display name used in logs and audit entries, e.g. `DeepSeek`.
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Unit prices per 1K tokens; part of endpoint configuration, not code.
    pub prompt_price_per_1k: f64,
    pub completion_price_per_1k: f64,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl ChatOptions {
    pub fn temperature(value: f64) -> Self {
        Self {
            temperature: value,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One successful chat call, with its accounting already computed.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: ChatUsage,
    pub cost: f64,
    pub duration: Duration,
    pub model: String,
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect refused, read timeout, protocol breakage. Retryable.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The endpoint understood the request and said no. Not retryable.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{endpoint}: {detail}")]
    CallFailed { endpoint: String, detail: String },
    #[error("all upstream endpoints unavailable")]
    AllUnavailable,
}

#[derive(Debug, Clone)]
pub struct TransportReply {
    pub content: String,
    pub usage: ChatUsage,
}

/// The wire seam. The production implementation speaks the
/// OpenAI-compatible `/chat/completions` shape; tests script their own.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<TransportReply, TransportError>;
}

/// Retry schedule for transport-level failures. `AI_CLIENT_VERSION=original`
/// keeps the legacy single-attempt behavior.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn original() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_version(version: &str) -> Self {
        if version.trim().eq_ignore_ascii_case("original") {
            Self::original()
        } else {
            Self::fixed()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

pub struct HttpTransport {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &EndpointConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<TransportReply, TransportError> {
        let wire_messages = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "temperature": opts.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = opts.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| TransportError::Transport(err.to_string()))?;

        if !status.is_success() {
            let detail = extract_error_message(&value)
                .unwrap_or_else(|| format!("request failed with status {status}"));
            if status.is_server_error() {
                return Err(TransportError::Transport(detail));
            }
            return Err(TransportError::Rejected(detail));
        }
        if let Some(detail) = extract_error_message(&value) {
            return Err(TransportError::Rejected(detail));
        }

        let Some(content) = extract_completion_text(&value) else {
            return Err(TransportError::Rejected(format!(
                "no completion content for model `{model}`"
            )));
        };
        Ok(TransportReply {
            content,
            usage: extract_usage(&value).unwrap_or_default(),
        })
    }
}

/// One upstream endpoint: chat with retry, cost accounting and a
/// consecutive-failure counter that feeds the circuit breaker.
pub struct UpstreamClient {
    config: EndpointConfig,
    transport: Arc<dyn ChatTransport>,
    retry: RetryPolicy,
    total_tokens: AtomicU64,
    total_cost: RwLock<f64>,
    failure_count: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub name: String,
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
    pub failure_count: u32,
    pub circuit_open: bool,
}

impl UpstreamClient {
    pub fn new(config: EndpointConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, retry, transport))
    }

    pub fn with_transport(
        config: EndpointConfig,
        retry: RetryPolicy,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            config,
            transport,
            retry,
            total_tokens: AtomicU64::new(0),
            total_cost: RwLock::new(0.0),
            failure_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let reply = loop {
            match self.transport.send(&self.config.model, messages, opts).await {
                Ok(reply) => break reply,
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        endpoint = %self.config.name,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "upstream transport error, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        endpoint = %self.config.name,
                        failures,
                        "upstream call failed: {err}"
                    );
                    return Err(UpstreamError::CallFailed {
                        endpoint: self.config.name.clone(),
                        detail: err.to_string(),
                    });
                }
            }
        };

        self.failure_count.store(0, Ordering::SeqCst);
        let cost = self.cost_for(&reply.usage);
        self.total_tokens
            .fetch_add(reply.usage.total_tokens, Ordering::SeqCst);
        {
            let mut total = self.total_cost.write().await;
            *total += cost;
        }
        let duration = started.elapsed();
        info!(
            endpoint = %self.config.name,
            tokens = reply.usage.total_tokens,
            duration_secs = duration.as_secs_f64(),
            "upstream call succeeded"
        );
        Ok(ChatOutcome {
            content: reply.content,
            usage: reply.usage,
            cost,
            duration,
            model: self.config.model.clone(),
            endpoint: self.config.name.clone(),
        })
    }

    fn cost_for(&self, usage: &ChatUsage) -> f64 {
        let prompt = usage.prompt_tokens as f64 / 1000.0 * self.config.prompt_price_per_1k;
        let completion =
            usage.completion_tokens as f64 / 1000.0 * self.config.completion_price_per_1k;
        prompt + completion
    }

    pub fn circuit_open(&self) -> bool {
        self.failure_count.load(Ordering::SeqCst) >= CIRCUIT_THRESHOLD
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub async fn reset_stats(&self) {
        self.total_tokens.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        *self.total_cost.write().await = 0.0;
    }

    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            name: self.config.name.clone(),
            model: self.config.model.clone(),
            tokens: self.total_tokens.load(Ordering::SeqCst),
            cost: *self.total_cost.read().await,
            failure_count: self.failure_count(),
            circuit_open: self.circuit_open(),
        }
    }
}

/// The three logical roles. Meta moderates and plans; A argues depth, B
/// argues practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Meta,
    A,
    B,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub meta: ClientStats,
    pub ai_a: ClientStats,
    pub ai_b: ClientStats,
    pub total_cost: f64,
}

/// Routes roles to endpoints and masks single-endpoint outages: an open
/// circuit or a failed call falls over to the next endpoint in the ring
/// meta -> A -> B -> meta.
pub struct ClientManager {
    meta: Arc<UpstreamClient>,
    ai_a: Arc<UpstreamClient>,
    ai_b: Arc<UpstreamClient>,
}

impl ClientManager {
    pub fn new(
        meta: EndpointConfig,
        ai_a: EndpointConfig,
        ai_b: EndpointConfig,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            meta: Arc::new(UpstreamClient::new(meta, retry)?),
            ai_a: Arc::new(UpstreamClient::new(ai_a, retry)?),
            ai_b: Arc::new(UpstreamClient::new(ai_b, retry)?),
        })
    }

    pub fn from_clients(
        meta: Arc<UpstreamClient>,
        ai_a: Arc<UpstreamClient>,
        ai_b: Arc<UpstreamClient>,
    ) -> Self {
        Self { meta, ai_a, ai_b }
    }

    pub fn endpoint_name(&self, role: Role) -> &str {
        self.client_for(role).name()
    }

    fn client_for(&self, role: Role) -> &UpstreamClient {
        match role {
            Role::Meta => &self.meta,
            Role::A => &self.ai_a,
            Role::B => &self.ai_b,
        }
    }

    fn fallback_for(&self, role: Role) -> &UpstreamClient {
        match role {
            Role::Meta => &self.ai_a,
            Role::A => &self.ai_b,
            Role::B => &self.meta,
        }
    }

    pub async fn call_meta(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        self.call_role(Role::Meta, messages, opts).await
    }

    pub async fn call_a(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        self.call_role(Role::A, messages, opts).await
    }

    pub async fn call_b(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        self.call_role(Role::B, messages, opts).await
    }

    pub async fn call_role(
        &self,
        role: Role,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        let primary = self.client_for(role);
        let fallback = self.fallback_for(role);

        if primary.circuit_open() {
            warn!(
                primary = %primary.name(),
                fallback = %fallback.name(),
                "circuit open, failing over"
            );
            return self.call_fallback(fallback, messages, opts).await;
        }

        match primary.chat(messages, opts).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(
                    primary = %primary.name(),
                    fallback = %fallback.name(),
                    "primary endpoint failed, failing over: {err}"
                );
                self.call_fallback(fallback, messages, opts).await
            }
        }
    }

    async fn call_fallback(
        &self,
        fallback: &UpstreamClient,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, UpstreamError> {
        fallback.chat(messages, opts).await.map_err(|err| {
            error!("all upstream endpoints unavailable: {err}");
            UpstreamError::AllUnavailable
        })
    }

    pub async fn total_cost(&self) -> f64 {
        self.meta.stats().await.cost + self.ai_a.stats().await.cost + self.ai_b.stats().await.cost
    }

    pub async fn stats(&self) -> ManagerStats {
        let meta = self.meta.stats().await;
        let ai_a = self.ai_a.stats().await;
        let ai_b = self.ai_b.stats().await;
        let total_cost = meta.cost + ai_a.cost + ai_b.cost;
        ManagerStats {
            meta,
            ai_a,
            ai_b,
            total_cost,
        }
    }

    pub async fn reset_stats(&self) {
        self.meta.reset_stats().await;
        self.ai_a.reset_stats().await;
        self.ai_b.reset_stats().await;
    }
}

fn extract_error_message(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_completion_text(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
    {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    value
        .get("output_text")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_usage(value: &serde_json::Value) -> Option<ChatUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(ChatUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}
