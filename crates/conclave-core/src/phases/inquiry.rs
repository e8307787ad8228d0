use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use conclave_providers::{ChatMessage, ChatOptions, ClientManager};
use conclave_types::{AuditNote, InquiryQuestion, PhaseDelta, PhaseState};

use super::{clip, parse_reply, pretty, META_ACTOR, PHASE_INQUIRY, USER_ACTOR};

const MIN_QUESTIONS: usize = 3;
const MAX_QUESTIONS: usize = 5;

/// Fillers appended when the moderator under-delivers. Distinct texts so a
/// padded questionnaire still reads sensibly.
const GENERIC_FOLLOW_UPS: [(&str, &str); 3] = [
    (
        "Is there any other background we should know about?",
        "e.g. deadlines, budget, special requirements...",
    ),
    (
        "What outcome would make this a success for you?",
        "e.g. a clear go/no-go call, a ranked shortlist...",
    ),
    (
        "Are there constraints we must work within?",
        "e.g. platform rules, team size, timeline...",
    ),
];

#[derive(Debug, Deserialize)]
struct InquiryReply {
    #[serde(default)]
    questions: Vec<InquiryQuestion>,
}

#[derive(Debug, Deserialize)]
struct AnswerReply {
    #[serde(default)]
    extracted_info: Map<String, Value>,
    #[serde(default)]
    summary: String,
}

/// Clamps the question list to 3..=5, padding with generic follow-ups and
/// renumbering ids so they stay 1-based and dense.
fn clamp_questions(mut questions: Vec<InquiryQuestion>) -> Vec<InquiryQuestion> {
    questions.truncate(MAX_QUESTIONS);
    while questions.len() < MIN_QUESTIONS {
        let (question, placeholder) = GENERIC_FOLLOW_UPS[questions.len() % GENERIC_FOLLOW_UPS.len()];
        questions.push(InquiryQuestion {
            id: 0,
            question: question.to_string(),
            placeholder: placeholder.to_string(),
            required: false,
        });
    }
    for (index, question) in questions.iter_mut().enumerate() {
        question.id = index as u32 + 1;
    }
    questions
}

fn inquiry_prompt(state: &PhaseState) -> String {
    format!(
        r#"You are the moderator of a multi-AI collaboration, writing follow-up questions for the user.

**Scene:** {scene}

**Original user input:**
{user_input}

**Already provided:**
{provided}

**Critical information still missing:**
{missing}

**Your job:**
Write 3-5 questions that collect the missing information.

**Question requirements:**
1. Clear, specific and easy to answer
2. Nothing broad or abstract
3. One topic per question
4. Ask about must-know information before nice-to-know
5. Give an example answer as the placeholder

Reply with JSON only:
{{
  "questions": [
    {{"id": 1, "question": "…?", "placeholder": "e.g. …", "required": true}},
    {{"id": 2, "question": "…?", "placeholder": "e.g. …", "required": true}}
  ]
}}"#,
        scene = state.scene,
        user_input = state.user_input,
        provided = pretty(&state.provided_info),
        missing = pretty(&state.missing_info),
    )
}

fn answers_prompt(state: &PhaseState, answers: &BTreeMap<u32, String>) -> String {
    let qa: Map<String, Value> = answers
        .iter()
        .map(|(id, answer)| (format!("question {id}"), Value::String(answer.clone())))
        .collect();
    format!(
        r#"You are the moderator of a multi-AI collaboration, reading the user's answers.

**Scene:** {scene}

**Questions and answers:**
{qa}

**Your job:**
Understand the answers and turn them into structured key/value facts.

Reply with JSON only:
{{
  "extracted_info": {{"key": "extracted fact"}},
  "summary": "one-line summary of what the user told us"
}}"#,
        scene = state.scene,
        qa = pretty(&qa),
    )
}

/// Phase 1, question generation.
pub async fn generate_inquiry(manager: &ClientManager, state: &PhaseState) -> PhaseDelta {
    let messages = vec![ChatMessage::user(inquiry_prompt(state))];
    let mut delta = PhaseDelta::default();
    delta.need_inquiry = Some(true);

    let (questions, tokens_used, cost, reasoning) = match manager
        .call_meta(&messages, &ChatOptions::temperature(0.5))
        .await
    {
        Ok(outcome) => {
            delta.added_cost = outcome.cost;
            match parse_reply::<InquiryReply>(&outcome.content) {
                Some(reply) => (
                    clamp_questions(reply.questions),
                    outcome.usage.total_tokens,
                    outcome.cost,
                    "targeted questions for the missing information".to_string(),
                ),
                None => {
                    warn!(task_id = %state.task_id, "inquiry reply was not valid JSON");
                    delta.error = Some("inquiry reply was not valid JSON".to_string());
                    (
                        clamp_questions(Vec::new()),
                        outcome.usage.total_tokens,
                        outcome.cost,
                        "reply unparseable, fell back to generic questions".to_string(),
                    )
                }
            }
        }
        Err(err) => {
            warn!(task_id = %state.task_id, "inquiry call failed: {err}");
            delta.error = Some(format!("inquiry generation failed: {err}"));
            (
                clamp_questions(Vec::new()),
                0,
                0.0,
                format!("upstream failed ({err}), fell back to generic questions"),
            )
        }
    };

    delta.audit.push(AuditNote {
        phase: PHASE_INQUIRY.to_string(),
        actor: META_ACTOR.to_string(),
        action: "generate inquiry questions".to_string(),
        input: format!("missing info: {}", pretty(&state.missing_info)),
        output: format!("generated {} questions", questions.len()),
        reasoning,
        tokens_used,
        cost,
    });
    delta.inquiry_questions = Some(questions.iter().map(|q| q.question.clone()).collect());
    delta.inquiry_details = Some(questions);
    delta
}

/// Phase 1, answer intake. An empty answer map is the user skipping the
/// questionnaire: record it and move on without touching the moderator.
pub async fn process_answers(
    manager: &ClientManager,
    state: &PhaseState,
    answers: &BTreeMap<u32, String>,
) -> PhaseDelta {
    let mut delta = PhaseDelta::default();
    delta.need_inquiry = Some(false);

    if answers.is_empty() {
        info!(task_id = %state.task_id, "user skipped the inquiry");
        delta.audit.push(AuditNote {
            phase: PHASE_INQUIRY.to_string(),
            actor: USER_ACTOR.to_string(),
            action: "skipped inquiry".to_string(),
            input: "no answers submitted".to_string(),
            output: "continuing with the information already on hand".to_string(),
            reasoning: "user chose to skip the follow-up questions".to_string(),
            tokens_used: 0,
            cost: 0.0,
        });
        return delta;
    }

    let messages = vec![ChatMessage::user(answers_prompt(state, answers))];
    match manager
        .call_meta(&messages, &ChatOptions::temperature(0.3))
        .await
    {
        Ok(outcome) => {
            delta.added_cost = outcome.cost;
            match parse_reply::<AnswerReply>(&outcome.content) {
                Some(reply) => {
                    let mut collected = state.collected_info.clone();
                    for (key, value) in reply.extracted_info {
                        collected.insert(key, value);
                    }
                    delta.audit.push(AuditNote {
                        phase: PHASE_INQUIRY.to_string(),
                        actor: META_ACTOR.to_string(),
                        action: "extract answers".to_string(),
                        input: format!("received {} answers", answers.len()),
                        output: pretty(&collected),
                        reasoning: reply.summary,
                        tokens_used: outcome.usage.total_tokens,
                        cost: outcome.cost,
                    });
                    delta.collected_info = Some(collected);
                    delta.info_sufficiency = Some(1.0);
                    delta.missing_info = Some(Vec::new());
                }
                None => {
                    warn!(task_id = %state.task_id, "answer extraction reply was not valid JSON");
                    delta.error = Some("answer extraction reply was not valid JSON".to_string());
                    delta.audit.push(AuditNote {
                        phase: PHASE_INQUIRY.to_string(),
                        actor: META_ACTOR.to_string(),
                        action: "extract answers".to_string(),
                        input: format!("received {} answers", answers.len()),
                        output: clip(&outcome.content, 200),
                        reasoning: "reply unparseable, keeping existing information".to_string(),
                        tokens_used: outcome.usage.total_tokens,
                        cost: outcome.cost,
                    });
                }
            }
        }
        Err(err) => {
            warn!(task_id = %state.task_id, "answer extraction call failed: {err}");
            delta.error = Some(format!("answer extraction failed: {err}"));
            delta.audit.push(AuditNote {
                phase: PHASE_INQUIRY.to_string(),
                actor: META_ACTOR.to_string(),
                action: "extract answers".to_string(),
                input: format!("received {} answers", answers.len()),
                output: "upstream call failed".to_string(),
                reasoning: err.to_string(),
                tokens_used: 0,
                cost: 0.0,
            });
        }
    }
    delta
}
