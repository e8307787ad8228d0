use conclave_providers::{ChatMessage, ChatOptions, ClientManager, Role};
use conclave_types::{
    AuditNote, DebateRound, DivergenceCheck, ImprovementCheck, NoveltyCheck, PhaseDelta,
    PhaseState, RoundCheck,
};
use tracing::warn;

use super::{clip, parse_reply, pretty, META_ACTOR, PHASE_COLLABORATION};

const DRAFT_MAX_TOKENS: u32 = 2000;

fn build_context(state: &PhaseState) -> String {
    let known = serde_json::json!({
        "scene": state.scene,
        "task type": state.task_type,
        "original user input": state.user_input,
        "provided information": state.provided_info,
        "collected information": state.collected_info,
    });
    format!("**The task:**\n{}", pretty(&known))
}

fn condensed_rounds(state: &PhaseState) -> String {
    state
        .debate_rounds
        .iter()
        .map(|round| {
            format!(
                "round {}: A: {} | B: {} | verdict: {}",
                round.round,
                clip(&round.ai_a, 200),
                clip(&round.ai_b, 200),
                round.check.reason(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn check_divergence(
    manager: &ClientManager,
    ai_a: &str,
    ai_b: &str,
) -> anyhow::Result<DivergenceCheck> {
    let prompt = format!(
        r#"Two analysts examined the same problem independently.

**Analyst A:**
{ai_a}

**Analyst B:**
{ai_b}

Do their views diverge in ways that would materially change the recommendation?

Reply with JSON only:
{{
  "has_significant_divergence": true,
  "divergence_points": ["point 1"],
  "reason": "why"
}}"#
    );
    let outcome = manager
        .call_meta(
            &[ChatMessage::user(prompt)],
            &ChatOptions::temperature(0.3),
        )
        .await?;
    let mut check = parse_reply::<DivergenceCheck>(&outcome.content).unwrap_or_else(|| {
        warn!("divergence check unparseable, conservatively assuming divergence");
        DivergenceCheck {
            has_significant_divergence: true,
            divergence_points: Vec::new(),
            reason: "check reply unparseable; assuming the views diverge".to_string(),
            tokens_used: 0,
            cost: 0.0,
        }
    });
    check.tokens_used = outcome.usage.total_tokens;
    check.cost = outcome.cost;
    Ok(check)
}

async fn check_novelty(
    manager: &ClientManager,
    history: &str,
    ai_a: &str,
    ai_b: &str,
) -> anyhow::Result<NoveltyCheck> {
    let prompt = format!(
        r#"A debate between two analysts is in progress.

**Earlier rounds:**
{history}

**This round, analyst A said:**
{ai_a}

**This round, analyst B said:**
{ai_b}

Did this round add genuinely new arguments or information, or are they circling?

Reply with JSON only:
{{
  "has_novelty": false,
  "new_points": [],
  "reason": "why"
}}"#
    );
    let outcome = manager
        .call_meta(
            &[ChatMessage::user(prompt)],
            &ChatOptions::temperature(0.3),
        )
        .await?;
    let mut check = parse_reply::<NoveltyCheck>(&outcome.content).unwrap_or_else(|| {
        warn!("novelty check unparseable, conservatively assuming no new ground");
        NoveltyCheck {
            has_novelty: false,
            new_points: Vec::new(),
            reason: "check reply unparseable; assuming no new ground".to_string(),
            tokens_used: 0,
            cost: 0.0,
        }
    });
    check.tokens_used = outcome.usage.total_tokens;
    check.cost = outcome.cost;
    Ok(check)
}

async fn check_improvement(
    manager: &ClientManager,
    draft: &str,
    review: &str,
) -> anyhow::Result<ImprovementCheck> {
    let prompt = format!(
        r#"A draft and its review.

**Draft:**
{draft}

**Review:**
{review}

Does the draft still need another revision pass, and how severe are the
remaining issues?

Reply with JSON only:
{{
  "needs_improvement": false,
  "severity": "low",
  "key_issues": [],
  "reason": "why"
}}"#
    );
    let outcome = manager
        .call_meta(
            &[ChatMessage::user(prompt)],
            &ChatOptions::temperature(0.3),
        )
        .await?;
    let mut check = parse_reply::<ImprovementCheck>(&outcome.content).unwrap_or_else(|| {
        warn!("improvement check unparseable, conservatively accepting the draft");
        ImprovementCheck {
            needs_improvement: false,
            severity: String::new(),
            key_issues: Vec::new(),
            reason: "check reply unparseable; accepting the current draft".to_string(),
            tokens_used: 0,
            cost: 0.0,
        }
    });
    check.tokens_used = outcome.usage.total_tokens;
    check.cost = outcome.cost;
    Ok(check)
}

/// One debate-mode round. Round 1 runs A and B concurrently and asks the
/// moderator whether their views diverge; later rounds are symmetric
/// rebuttals gated by a novelty check. Upstream exhaustion propagates and
/// fails the task.
pub async fn debate_round(
    manager: &ClientManager,
    state: &PhaseState,
) -> anyhow::Result<PhaseDelta> {
    let context = build_context(state);
    let a_name = manager.endpoint_name(Role::A).to_string();
    let b_name = manager.endpoint_name(Role::B).to_string();
    let mut delta = PhaseDelta::default();

    if state.current_round == 0 {
        let a_prompt = format!(
            "{context}\n\n**Your role:** {}\n\nGive your analysis and concrete recommendations from this perspective. Commit to positions; do not hedge.",
            state.ai_a_role
        );
        let b_prompt = format!(
            "{context}\n\n**Your role:** {}\n\nGive your analysis and concrete recommendations from this perspective. Commit to positions; do not hedge.",
            state.ai_b_role
        );
        let opts = ChatOptions::temperature(0.7);
        let a_messages = [ChatMessage::user(a_prompt)];
        let b_messages = [ChatMessage::user(b_prompt)];
        let (a_result, b_result) = tokio::join!(
            manager.call_a(&a_messages, &opts),
            manager.call_b(&b_messages, &opts),
        );
        let a = a_result?;
        let b = b_result?;
        let check = check_divergence(manager, &a.content, &b.content).await?;

        delta.added_cost = a.cost + b.cost + check.cost;
        delta.audit.push(AuditNote {
            phase: PHASE_COLLABORATION.to_string(),
            actor: a_name,
            action: "independent analysis".to_string(),
            input: format!("role: {}", state.ai_a_role),
            output: clip(&a.content, 200),
            reasoning: "first-round position".to_string(),
            tokens_used: a.usage.total_tokens,
            cost: a.cost,
        });
        delta.audit.push(AuditNote {
            phase: PHASE_COLLABORATION.to_string(),
            actor: b_name,
            action: "independent analysis".to_string(),
            input: format!("role: {}", state.ai_b_role),
            output: clip(&b.content, 200),
            reasoning: "first-round position".to_string(),
            tokens_used: b.usage.total_tokens,
            cost: b.cost,
        });
        delta.audit.push(AuditNote {
            phase: PHASE_COLLABORATION.to_string(),
            actor: META_ACTOR.to_string(),
            action: "divergence check".to_string(),
            input: "compare the two positions".to_string(),
            output: pretty(&serde_json::json!({
                "has_significant_divergence": check.has_significant_divergence,
                "points": check.divergence_points.clone(),
            })),
            reasoning: check.reason.clone(),
            tokens_used: check.tokens_used,
            cost: check.cost,
        });

        let converged = !check.has_significant_divergence;
        delta.rounds.push(DebateRound {
            round: 1,
            ai_a: a.content.clone(),
            ai_b: b.content.clone(),
            check: RoundCheck::Divergence(check),
        });
        delta.ai_a_output = Some(a.content);
        delta.ai_b_output = Some(b.content);
        delta.current_round = Some(1);
        if converged {
            delta.should_stop = Some(true);
            delta.stop_reason = Some("converged".to_string());
        } else {
            delta.should_stop = Some(false);
        }
        return Ok(delta);
    }

    let round = state.current_round + 1;
    let a_prompt = format!(
        "{context}\n\n**Your role:** {}\n\n**The opposing view:**\n{}\n\nRespond to it: where is it wrong, what does it miss, what would you add? Concede the points that are right.",
        state.ai_a_role, state.ai_b_output
    );
    let b_prompt = format!(
        "{context}\n\n**Your role:** {}\n\n**The opposing view:**\n{}\n\nRespond to it: where is it wrong, what does it miss, what would you add? Concede the points that are right.",
        state.ai_b_role, state.ai_a_output
    );
    let opts = ChatOptions::temperature(0.7);
    let a_messages = [ChatMessage::user(a_prompt)];
    let b_messages = [ChatMessage::user(b_prompt)];
    let (a_result, b_result) = tokio::join!(
        manager.call_a(&a_messages, &opts),
        manager.call_b(&b_messages, &opts),
    );
    let a = a_result?;
    let b = b_result?;
    let check = check_novelty(manager, &condensed_rounds(state), &a.content, &b.content).await?;

    delta.added_cost = a.cost + b.cost + check.cost;
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: a_name,
        action: format!("debate round {round}"),
        input: format!("countering: {}", clip(&state.ai_b_output, 100)),
        output: clip(&a.content, 200),
        reasoning: "rebuttal or reinforcement".to_string(),
        tokens_used: a.usage.total_tokens,
        cost: a.cost,
    });
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: b_name,
        action: format!("debate round {round}"),
        input: format!("countering: {}", clip(&state.ai_a_output, 100)),
        output: clip(&b.content, 200),
        reasoning: "rebuttal or reinforcement".to_string(),
        tokens_used: b.usage.total_tokens,
        cost: b.cost,
    });
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: META_ACTOR.to_string(),
        action: "novelty check".to_string(),
        input: "did this round add new ground?".to_string(),
        output: pretty(&serde_json::json!({
            "has_novelty": check.has_novelty,
            "new_points": check.new_points.clone(),
        })),
        reasoning: check.reason.clone(),
        tokens_used: check.tokens_used,
        cost: check.cost,
    });

    let should_stop = !check.has_novelty || round >= state.max_rounds;
    let stop_reason = if should_stop {
        Some(if !check.has_novelty {
            "no novelty".to_string()
        } else {
            "max rounds reached".to_string()
        })
    } else {
        None
    };
    delta.rounds.push(DebateRound {
        round,
        ai_a: a.content.clone(),
        ai_b: b.content.clone(),
        check: RoundCheck::Novelty(check),
    });
    delta.ai_a_output = Some(a.content);
    delta.ai_b_output = Some(b.content);
    delta.current_round = Some(round);
    delta.should_stop = Some(should_stop);
    delta.stop_reason = stop_reason;
    Ok(delta)
}

/// One review-mode round. A drafts (or revises), B critiques without
/// rewriting, the moderator decides whether another pass is worth it.
pub async fn review_round(
    manager: &ClientManager,
    state: &PhaseState,
) -> anyhow::Result<PhaseDelta> {
    let context = build_context(state);
    let a_name = manager.endpoint_name(Role::A).to_string();
    let b_name = manager.endpoint_name(Role::B).to_string();
    let mut delta = PhaseDelta::default();

    let first_round = state.current_round == 0;
    let round = state.current_round + 1;

    let draft = if first_round {
        let prompt = format!(
            "{context}\n\n**Your role:** {}\n\nProduce the complete deliverable now, not an outline.",
            state.ai_a_role
        );
        manager
            .call_a(
                &[ChatMessage::user(prompt)],
                &ChatOptions::temperature(0.7).with_max_tokens(DRAFT_MAX_TOKENS),
            )
            .await?
    } else {
        let prompt = format!(
            "{context}\n\n**Your role:** {}\n\n**Your previous draft:**\n{}\n\n**The reviewer's feedback:**\n{}\n\nRevise the draft. Address every actionable point; keep what already works.",
            state.ai_a_role, state.ai_a_output, state.ai_b_output
        );
        manager
            .call_a(
                &[ChatMessage::user(prompt)],
                &ChatOptions::temperature(0.7).with_max_tokens(DRAFT_MAX_TOKENS),
            )
            .await?
    };

    let review_prompt = format!(
        "{context}\n\n**Your role:** {}\n\n**The draft under review:**\n{}\n\nReview it. List concrete issues and suggestions only; do not rewrite the draft yourself.",
        state.ai_b_role, draft.content
    );
    let review = manager
        .call_b(
            &[ChatMessage::user(review_prompt)],
            &ChatOptions::temperature(0.5),
        )
        .await?;
    let check = check_improvement(manager, &draft.content, &review.content).await?;

    delta.added_cost = draft.cost + review.cost + check.cost;
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: a_name,
        action: if first_round {
            "draft content".to_string()
        } else {
            format!("revise draft, round {round}")
        },
        input: format!("role: {}", state.ai_a_role),
        output: clip(&draft.content, 200),
        reasoning: if first_round {
            "initial draft".to_string()
        } else {
            "revision guided by the review".to_string()
        },
        tokens_used: draft.usage.total_tokens,
        cost: draft.cost,
    });
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: b_name,
        action: format!("review round {round}"),
        input: format!("draft: {}", clip(&draft.content, 100)),
        output: clip(&review.content, 200),
        reasoning: "issues and suggestions only".to_string(),
        tokens_used: review.usage.total_tokens,
        cost: review.cost,
    });
    delta.audit.push(AuditNote {
        phase: PHASE_COLLABORATION.to_string(),
        actor: META_ACTOR.to_string(),
        action: "improvement check".to_string(),
        input: "is another pass worth it?".to_string(),
        output: pretty(&serde_json::json!({
            "needs_improvement": check.needs_improvement,
            "severity": check.severity.clone(),
            "key_issues": check.key_issues.clone(),
        })),
        reasoning: check.reason.clone(),
        tokens_used: check.tokens_used,
        cost: check.cost,
    });

    let should_stop = !check.needs_improvement || round >= state.max_rounds;
    let stop_reason = if should_stop {
        Some(if !check.needs_improvement {
            "quality acceptable".to_string()
        } else {
            "max rounds reached".to_string()
        })
    } else {
        None
    };
    delta.rounds.push(DebateRound {
        round,
        ai_a: draft.content.clone(),
        ai_b: review.content.clone(),
        check: RoundCheck::Improvement(check),
    });
    delta.ai_a_output = Some(draft.content);
    delta.ai_b_output = Some(review.content);
    delta.current_round = Some(round);
    delta.should_stop = Some(should_stop);
    delta.stop_reason = stop_reason;
    Ok(delta)
}
