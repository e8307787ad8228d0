use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use conclave_providers::{
    ChatMessage, ChatOptions, ChatTransport, ChatUsage, ClientManager, EndpointConfig,
    RetryPolicy, TransportError, TransportReply, UpstreamClient,
};

/// Plays back canned replies in order; an exhausted script rejects so a test
/// that makes an unexpected call fails loudly instead of hanging.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<TransportReply, TransportError>>>,
    calls: AtomicU32,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new(contents: Vec<&str>) -> Arc<Self> {
        Self::from_results(contents.into_iter().map(|content| Ok(reply(content))).collect())
    }

    pub fn from_results(replies: Vec<Result<TransportReply, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    pub fn slow(contents: Vec<&str>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                contents
                    .into_iter()
                    .map(|content| Ok(reply(content)))
                    .collect(),
            ),
            calls: AtomicU32::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<TransportReply, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Rejected("script exhausted".to_string())))
    }
}

pub fn reply(content: &str) -> TransportReply {
    TransportReply {
        content: content.to_string(),
        usage: ChatUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
        },
    }
}

pub fn endpoint(id: &str, name: &str) -> EndpointConfig {
    EndpointConfig {
        id: id.to_string(),
        name: name.to_string(),
        base_url: "http://127.0.0.1:9".to_string(),
        api_key: None,
        model: format!("{id}-model"),
        prompt_price_per_1k: 0.001,
        completion_price_per_1k: 0.002,
    }
}

pub fn manager_from_transports(
    meta: Arc<dyn ChatTransport>,
    ai_a: Arc<dyn ChatTransport>,
    ai_b: Arc<dyn ChatTransport>,
) -> Arc<ClientManager> {
    Arc::new(ClientManager::from_clients(
        Arc::new(UpstreamClient::with_transport(
            endpoint("meta", "Meta"),
            RetryPolicy::original(),
            meta,
        )),
        Arc::new(UpstreamClient::with_transport(
            endpoint("ai_a", "Kimi"),
            RetryPolicy::original(),
            ai_a,
        )),
        Arc::new(UpstreamClient::with_transport(
            endpoint("ai_b", "Qwen"),
            RetryPolicy::original(),
            ai_b,
        )),
    ))
}

pub fn scripted_manager(meta: Vec<&str>, ai_a: Vec<&str>, ai_b: Vec<&str>) -> Arc<ClientManager> {
    manager_from_transports(
        ScriptedTransport::new(meta),
        ScriptedTransport::new(ai_a),
        ScriptedTransport::new(ai_b),
    )
}

pub const EVAL_SUFFICIENT: &str = r#"{"provided_info": {"audience": "programmers aged 25-35"},
  "missing_critical_info": [], "info_sufficiency": 0.9, "need_inquiry": false,
  "reason": "plenty to work with"}"#;

pub const EVAL_INSUFFICIENT: &str = r#"{"provided_info": {"topic": "AI Agent video"},
  "missing_critical_info": ["audience", "goal"], "info_sufficiency": 0.3,
  "need_inquiry": true, "reason": "audience and goal unknown"}"#;

pub const QUESTIONS_THREE: &str = r#"{"questions": [
  {"id": 1, "question": "Who is the audience?", "placeholder": "e.g. junior developers", "required": true},
  {"id": 2, "question": "What is the goal?", "placeholder": "e.g. subscribers", "required": true},
  {"id": 3, "question": "How long should it be?", "placeholder": "e.g. 10 minutes", "required": false}
]}"#;

pub const ANSWERS_EXTRACTED: &str = r#"{"extracted_info": {"audience": "junior developers",
  "goal": "subscriber growth"}, "summary": "audience and goal are now known"}"#;

pub const PLAN_DEBATE: &str = r#"{"task_type": "topic feasibility analysis",
  "collaboration_mode": "debate", "ai_a_role": "depth and professional rigor",
  "ai_b_role": "reach and practicality", "max_rounds": 3, "reasoning": "contested call"}"#;

pub const PLAN_REVIEW: &str = r#"{"task_type": "content creation",
  "collaboration_mode": "review", "ai_a_role": "write the article",
  "ai_b_role": "review for clarity", "max_rounds": 3, "reasoning": "creation task"}"#;

pub const DIVERGENCE_NONE: &str = r#"{"has_significant_divergence": false,
  "divergence_points": [], "reason": "both endorse the same direction"}"#;

pub const DIVERGENCE_FOUND: &str = r#"{"has_significant_divergence": true,
  "divergence_points": ["timing"], "reason": "they disagree on timing"}"#;

pub const NOVELTY_NONE: &str = r#"{"has_novelty": false, "new_points": [],
  "reason": "the positions repeat round one"}"#;

pub const IMPROVEMENT_NOT_NEEDED: &str = r#"{"needs_improvement": false, "severity": "low",
  "key_issues": [], "reason": "draft is publishable"}"#;

pub const IMPROVEMENT_NEEDED: &str = r#"{"needs_improvement": true, "severity": "medium",
  "key_issues": ["intro is jargon-heavy"], "reason": "accessibility issues remain"}"#;

pub const REPORT_JSON: &str = r#"{
  "executive_summary": {"tldr": "Make the video now.", "key_actions": ["outline this week", "film next week"]},
  "certain_advice": {"title": "Proceed", "content": "The niche is underserved...", "risks": ["timing"]},
  "hypothetical_advice": [{"condition": "if views stall", "suggestion": "narrow the topic"}],
  "divergences": [],
  "hooks": {"satisfaction_check": "if this misses the mark, tell us more", "missing_info_hint": ["budget"]}
}"#;
