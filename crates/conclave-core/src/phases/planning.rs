use serde::Deserialize;
use tracing::warn;

use conclave_providers::{ChatMessage, ChatOptions, ClientManager};
use conclave_types::{AuditNote, CollaborationMode, PhaseDelta, PhaseState};

use super::{parse_reply, pretty, META_ACTOR, PHASE_PLANNING};

#[derive(Debug, Deserialize)]
struct Plan {
    #[serde(default = "default_task_type")]
    task_type: String,
    #[serde(default)]
    collaboration_mode: CollaborationMode,
    #[serde(default = "default_a_role")]
    ai_a_role: String,
    #[serde(default = "default_b_role")]
    ai_b_role: String,
    #[serde(default = "default_rounds")]
    max_rounds: u32,
    #[serde(default)]
    reasoning: String,
}

fn default_task_type() -> String {
    "general analysis".to_string()
}

fn default_a_role() -> String {
    "analyze from depth and professional rigor".to_string()
}

fn default_b_role() -> String {
    "analyze from practicality and operational impact".to_string()
}

fn default_rounds() -> u32 {
    3
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            task_type: default_task_type(),
            collaboration_mode: CollaborationMode::Debate,
            ai_a_role: default_a_role(),
            ai_b_role: default_b_role(),
            max_rounds: default_rounds(),
            reasoning: String::new(),
        }
    }
}

fn planning_prompt(state: &PhaseState) -> String {
    let complete_info = serde_json::json!({
        "original user input": state.user_input,
        "scene": state.scene,
        "provided information": state.provided_info,
        "collected information": state.collected_info,
    });
    format!(
        r#"You are the moderator of a multi-AI collaboration, planning how two analyst AIs should work on this task.

**Everything we know:**
{info}

**Collaboration modes:**
1. **debate** - for contested calls and trade-offs
   - AI-A and AI-B analyze from different angles
   - If their views diverge, they argue it out
   - Fits: topic feasibility, strategy, risk assessment
2. **review** - for content creation and plan polishing
   - AI-A drafts, AI-B critiques, AI-A revises
   - Fits: articles, copy, code review

Reply with JSON only:
{{
  "task_type": "the concrete task type",
  "collaboration_mode": "debate or review",
  "ai_a_role": "AI-A's role and remit",
  "ai_b_role": "AI-B's role and remit",
  "max_rounds": 3,
  "reasoning": "why this strategy"
}}

Notes:
- AI-A usually owns depth, rigor and long-term value
- AI-B usually owns practicality, reach and short-term impact"#,
        info = pretty(&complete_info),
    )
}

/// Phase 2. A failed or unparseable plan degrades to the stock debate setup
/// rather than killing the task.
pub async fn planning(manager: &ClientManager, state: &PhaseState) -> PhaseDelta {
    let messages = vec![ChatMessage::user(planning_prompt(state))];
    let mut delta = PhaseDelta::default();

    let (plan, tokens_used, cost) = match manager
        .call_meta(&messages, &ChatOptions::temperature(0.4))
        .await
    {
        Ok(outcome) => {
            delta.added_cost = outcome.cost;
            match parse_reply::<Plan>(&outcome.content) {
                Some(plan) => (plan, outcome.usage.total_tokens, outcome.cost),
                None => {
                    warn!(task_id = %state.task_id, "plan reply was not valid JSON, using the default strategy");
                    delta.error = Some("plan reply was not valid JSON".to_string());
                    (Plan::default(), outcome.usage.total_tokens, outcome.cost)
                }
            }
        }
        Err(err) => {
            warn!(task_id = %state.task_id, "planning call failed, using the default strategy: {err}");
            delta.error = Some(format!("planning failed: {err}"));
            (Plan::default(), 0, 0.0)
        }
    };

    delta.audit.push(AuditNote {
        phase: PHASE_PLANNING.to_string(),
        actor: META_ACTOR.to_string(),
        action: "plan the collaboration".to_string(),
        input: format!("scene: {}", state.scene),
        output: pretty(&serde_json::json!({
            "task_type": plan.task_type.clone(),
            "collaboration_mode": plan.collaboration_mode.as_str(),
            "max_rounds": plan.max_rounds,
        })),
        reasoning: plan.reasoning.clone(),
        tokens_used,
        cost,
    });
    delta.task_type = Some(plan.task_type);
    delta.collaboration_mode = Some(plan.collaboration_mode);
    delta.ai_a_role = Some(plan.ai_a_role);
    delta.ai_b_role = Some(plan.ai_b_role);
    delta.max_rounds = Some(plan.max_rounds);
    delta.current_round = Some(0);
    delta.should_stop = Some(false);
    delta
}
