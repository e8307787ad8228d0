use tracing::warn;

use conclave_providers::{ChatMessage, ChatOptions, ClientManager};
use conclave_types::{
    AuditNote, CertainAdvice, ExecutiveSummary, FinalReport, Hooks, PhaseDelta, PhaseState,
};

use super::{clip, parse_reply, pretty, META_ACTOR, PHASE_INTEGRATION};

const REPORT_MAX_TOKENS: u32 = 3000;

fn condensed_rounds(state: &PhaseState) -> String {
    state
        .debate_rounds
        .iter()
        .map(|round| {
            format!(
                "round {}: A: {} | B: {} | verdict: {}",
                round.round,
                clip(&round.ai_a, 300),
                clip(&round.ai_b, 300),
                round.check.reason(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn integration_prompt(state: &PhaseState) -> String {
    let known = serde_json::json!({
        "scene": state.scene,
        "task type": state.task_type,
        "original user input": state.user_input,
        "provided information": state.provided_info,
        "collected information": state.collected_info,
        "collaboration mode": state.collaboration_mode.as_str(),
    });
    format!(
        r#"You are the moderator of a multi-AI collaboration, writing the final report.

**The task:**
{known}

**AI-A's final position:**
{ai_a}

**AI-B's final position:**
{ai_b}

**How the collaboration went:**
{rounds}

**Your job:**
Integrate everything above into one complete report.

Reply with JSON only, in exactly this structure:
{{
  "executive_summary": {{
    "tldr": "the core conclusion in one sentence",
    "key_actions": ["action 1", "action 2", "action 3"]
  }},
  "certain_advice": {{
    "title": "advice grounded in what we know",
    "content": "the detailed recommendation (300-500 words, markdown)",
    "risks": ["risk 1", "risk 2"]
  }},
  "hypothetical_advice": [
    {{"condition": "if X", "suggestion": "then Y"}}
  ],
  "divergences": [
    {{
      "issue": "the contested point",
      "ai_a_view": "…", "ai_a_reason": "…",
      "ai_b_view": "…", "ai_b_reason": "…",
      "our_suggestion": "…"
    }}
  ],
  "hooks": {{
    "satisfaction_check": "if this misses the mark…",
    "missing_info_hint": ["what else would sharpen the advice"]
  }}
}}

Requirements:
1. The executive summary must be tight and decisive
2. Certain advice must be concrete and actionable
3. Cover 2-3 plausible what-if scenarios
4. Only list divergences that genuinely matter; an empty array is fine
5. Hooks invite, never pressure"#,
        known = pretty(&known),
        ai_a = state.ai_a_output,
        ai_b = state.ai_b_output,
        rounds = condensed_rounds(state),
    )
}

/// A report assembled from the raw positions when the moderator cannot
/// deliver a structured one. Degraded, but never empty.
fn fallback_report(state: &PhaseState) -> FinalReport {
    FinalReport {
        executive_summary: ExecutiveSummary {
            tldr: "Report assembly was degraded; both analyst positions are included in full below.".to_string(),
            key_actions: vec!["Read both positions and weigh them against your constraints".to_string()],
        },
        certain_advice: CertainAdvice {
            title: "The analysts' final positions".to_string(),
            content: format!(
                "## Perspective A\n\n{}\n\n## Perspective B\n\n{}",
                state.ai_a_output, state.ai_b_output
            ),
            risks: Vec::new(),
        },
        hypothetical_advice: Vec::new(),
        divergences: Vec::new(),
        hooks: Hooks::default(),
        audit_summary: Vec::new(),
    }
}

/// Phase 5. Always yields a report; failures downgrade to the fallback
/// assembly instead of erroring the task this late.
pub async fn integrate(manager: &ClientManager, state: &PhaseState) -> PhaseDelta {
    let messages = vec![ChatMessage::user(integration_prompt(state))];
    let mut delta = PhaseDelta::default();

    let mut report = match manager
        .call_meta(
            &messages,
            &ChatOptions::temperature(0.5).with_max_tokens(REPORT_MAX_TOKENS),
        )
        .await
    {
        Ok(outcome) => {
            delta.added_cost = outcome.cost;
            match parse_reply::<FinalReport>(&outcome.content) {
                Some(report) => {
                    delta.audit.push(AuditNote {
                        phase: PHASE_INTEGRATION.to_string(),
                        actor: META_ACTOR.to_string(),
                        action: "assemble the report".to_string(),
                        input: format!(
                            "integrating {} collaboration rounds",
                            state.debate_rounds.len()
                        ),
                        output: "structured report produced".to_string(),
                        reasoning: "combined both perspectives into final advice".to_string(),
                        tokens_used: outcome.usage.total_tokens,
                        cost: outcome.cost,
                    });
                    report
                }
                None => {
                    warn!(task_id = %state.task_id, "report reply was not valid JSON, using the fallback assembly");
                    delta.error = Some("report reply was not valid JSON".to_string());
                    delta.audit.push(AuditNote {
                        phase: PHASE_INTEGRATION.to_string(),
                        actor: META_ACTOR.to_string(),
                        action: "assemble the report".to_string(),
                        input: format!(
                            "integrating {} collaboration rounds",
                            state.debate_rounds.len()
                        ),
                        output: clip(&outcome.content, 200),
                        reasoning: "reply unparseable, fell back to raw positions".to_string(),
                        tokens_used: outcome.usage.total_tokens,
                        cost: outcome.cost,
                    });
                    fallback_report(state)
                }
            }
        }
        Err(err) => {
            warn!(task_id = %state.task_id, "integration call failed, using the fallback assembly: {err}");
            delta.error = Some(format!("integration failed: {err}"));
            delta.audit.push(AuditNote {
                phase: PHASE_INTEGRATION.to_string(),
                actor: META_ACTOR.to_string(),
                action: "assemble the report".to_string(),
                input: format!(
                    "integrating {} collaboration rounds",
                    state.debate_rounds.len()
                ),
                output: "upstream call failed".to_string(),
                reasoning: err.to_string(),
                tokens_used: 0,
                cost: 0.0,
            });
            fallback_report(state)
        }
    };

    // The audit summary covers everything up to and including this phase.
    let mut trail = state.audit_trail.clone();
    for (offset, note) in delta.audit.iter().enumerate() {
        trail.push(conclave_types::AuditEntry {
            step: state.audit_trail.len() + offset,
            note: note.clone(),
        });
    }
    report.audit_summary = FinalReport::summarize_audit(&trail);

    delta.final_output = Some(report);
    delta
}
