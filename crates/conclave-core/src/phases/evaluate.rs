use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use conclave_providers::{ChatMessage, ChatOptions, ClientManager};
use conclave_types::{AuditNote, PhaseDelta, PhaseState};

use super::{clip, parse_reply, pretty, META_ACTOR, PHASE_EVALUATION};

const UNPARSEABLE_MARKER: &str = "automatic evaluation unavailable; more input needed";

#[derive(Debug, Deserialize)]
struct Evaluation {
    #[serde(default)]
    provided_info: Map<String, Value>,
    #[serde(default)]
    missing_critical_info: Vec<String>,
    #[serde(default = "half")]
    info_sufficiency: f64,
    #[serde(default)]
    need_inquiry: bool,
    #[serde(default)]
    reason: String,
}

fn half() -> f64 {
    0.5
}

fn evaluation_prompt(state: &PhaseState) -> String {
    format!(
        r#"You are the moderator of a multi-AI collaboration, judging whether the user has given us enough to work with.

**Scene:** {scene}

**User input:**
{user_input}

**Your job:**
1. List the information the user has already provided
2. For the "{scene}" scene, name the *critical* information still missing
3. Decide whether follow-up questions are required

**Judgement criteria:**
- If missing information would make any advice flat-out wrong or worthless, we must inquire
- If it would only make advice less precise, work from assumptions instead
- Respect the user's time; never over-inquire

Reply with JSON only:
{{
  "provided_info": {{"key": "what the user told us"}},
  "missing_critical_info": ["missing item 1", "missing item 2"],
  "info_sufficiency": 0.7,
  "need_inquiry": true,
  "reason": "why"
}}"#,
        scene = state.scene,
        user_input = state.user_input,
    )
}

/// Phase 0. Never fails: an unreachable or incoherent moderator downgrades to
/// "ask the user", so task creation always produces something actionable.
pub async fn evaluate(manager: &ClientManager, state: &PhaseState) -> PhaseDelta {
    let messages = vec![ChatMessage::user(evaluation_prompt(state))];
    let mut delta = PhaseDelta::default();

    let outcome = match manager
        .call_meta(&messages, &ChatOptions::temperature(0.3))
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(task_id = %state.task_id, "evaluation call failed: {err}");
            delta.need_inquiry = Some(true);
            delta.missing_info = Some(vec![UNPARSEABLE_MARKER.to_string()]);
            delta.error = Some(format!("evaluation failed: {err}"));
            delta.audit.push(AuditNote {
                phase: PHASE_EVALUATION.to_string(),
                actor: META_ACTOR.to_string(),
                action: "evaluate information sufficiency".to_string(),
                input: clip(&state.user_input, 200),
                output: "upstream call failed".to_string(),
                reasoning: err.to_string(),
                tokens_used: 0,
                cost: 0.0,
            });
            return delta;
        }
    };

    delta.added_cost = outcome.cost;
    match parse_reply::<Evaluation>(&outcome.content) {
        Some(evaluation) => {
            delta.audit.push(AuditNote {
                phase: PHASE_EVALUATION.to_string(),
                actor: META_ACTOR.to_string(),
                action: "evaluate information sufficiency".to_string(),
                input: clip(&state.user_input, 200),
                output: pretty(&serde_json::json!({
                    "need_inquiry": evaluation.need_inquiry,
                    "info_sufficiency": evaluation.info_sufficiency,
                    "missing": evaluation.missing_critical_info.clone(),
                })),
                reasoning: evaluation.reason.clone(),
                tokens_used: outcome.usage.total_tokens,
                cost: outcome.cost,
            });
            delta.need_inquiry = Some(evaluation.need_inquiry);
            delta.provided_info = Some(evaluation.provided_info);
            delta.missing_info = Some(evaluation.missing_critical_info);
            delta.info_sufficiency = Some(evaluation.info_sufficiency);
        }
        None => {
            warn!(task_id = %state.task_id, "evaluation reply was not valid JSON");
            delta.need_inquiry = Some(true);
            delta.missing_info = Some(vec![UNPARSEABLE_MARKER.to_string()]);
            delta.error = Some("evaluation reply was not valid JSON".to_string());
            delta.audit.push(AuditNote {
                phase: PHASE_EVALUATION.to_string(),
                actor: META_ACTOR.to_string(),
                action: "evaluate information sufficiency".to_string(),
                input: clip(&state.user_input, 200),
                output: clip(&outcome.content, 200),
                reasoning: "reply did not contain parseable JSON".to_string(),
                tokens_used: outcome.usage.total_tokens,
                cost: outcome.cost,
            });
        }
    }
    delta
}
