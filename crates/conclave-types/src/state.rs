use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::report::FinalReport;
use crate::HARD_ROUND_CAP;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    #[default]
    Debate,
    Review,
}

impl CollaborationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CollaborationMode::Debate => "debate",
            CollaborationMode::Review => "review",
        }
    }
}

/// One inquiry question shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InquiryQuestion {
    #[serde(default)]
    pub id: u32,
    pub question: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub required: bool,
}

/// An audit record as produced by a phase, before its step index is known.
/// The step is assigned when the note is appended to the trail, which keeps
/// step == length-before-append true by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditNote {
    pub phase: String,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step: usize,
    #[serde(flatten)]
    pub note: AuditNote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceCheck {
    #[serde(default)]
    pub has_significant_divergence: bool,
    #[serde(default)]
    pub divergence_points: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyCheck {
    #[serde(default)]
    pub has_novelty: bool,
    #[serde(default)]
    pub new_points: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCheck {
    #[serde(default)]
    pub needs_improvement: bool,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub key_issues: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

/// The moderator's verdict attached to a collaboration round: a divergence
/// check on the opening debate round, novelty checks on later debate rounds,
/// improvement checks in review mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundCheck {
    Divergence(DivergenceCheck),
    Novelty(NoveltyCheck),
    Improvement(ImprovementCheck),
}

impl RoundCheck {
    pub fn reason(&self) -> &str {
        match self {
            RoundCheck::Divergence(c) => &c.reason,
            RoundCheck::Novelty(c) => &c.reason,
            RoundCheck::Improvement(c) => &c.reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRound {
    pub round: u32,
    pub ai_a: String,
    pub ai_b: String,
    pub check: RoundCheck,
}

fn default_sufficiency() -> f64 {
    0.5
}

fn default_max_rounds() -> u32 {
    3
}

/// The single state object threaded through every phase. Serializes
/// exhaustively so it can travel as the task row's `processing_state` blob
/// between the foreground prelude and the background worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub task_id: String,
    pub user_id: String,
    pub scene: String,
    pub user_input: String,

    #[serde(default)]
    pub need_inquiry: bool,
    #[serde(default)]
    pub provided_info: Map<String, Value>,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(default = "default_sufficiency")]
    pub info_sufficiency: f64,

    #[serde(default)]
    pub inquiry_questions: Vec<String>,
    #[serde(default)]
    pub inquiry_details: Vec<InquiryQuestion>,
    #[serde(default)]
    pub collected_info: Map<String, Value>,

    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub collaboration_mode: CollaborationMode,
    #[serde(default)]
    pub ai_a_role: String,
    #[serde(default)]
    pub ai_b_role: String,

    #[serde(default)]
    pub ai_a_output: String,
    #[serde(default)]
    pub ai_b_output: String,
    #[serde(default)]
    pub debate_rounds: Vec<DebateRound>,

    #[serde(default)]
    pub current_round: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub should_stop: bool,
    #[serde(default)]
    pub stop_reason: Option<String>,

    #[serde(default)]
    pub final_output: Option<FinalReport>,

    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub last_progress: u8,
    #[serde(default)]
    pub error: Option<String>,
}

impl PhaseState {
    pub fn new(task_id: &str, user_id: &str, scene: &str, user_input: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            scene: scene.to_string(),
            user_input: user_input.to_string(),
            need_inquiry: false,
            provided_info: Map::new(),
            missing_info: Vec::new(),
            info_sufficiency: default_sufficiency(),
            inquiry_questions: Vec::new(),
            inquiry_details: Vec::new(),
            collected_info: Map::new(),
            task_type: String::new(),
            collaboration_mode: CollaborationMode::Debate,
            ai_a_role: String::new(),
            ai_b_role: String::new(),
            ai_a_output: String::new(),
            ai_b_output: String::new(),
            debate_rounds: Vec::new(),
            current_round: 0,
            max_rounds: default_max_rounds(),
            should_stop: false,
            stop_reason: None,
            final_output: None,
            audit_trail: Vec::new(),
            total_cost: 0.0,
            last_progress: 0,
            error: None,
        }
    }

    /// Applies a phase's delta. Invariants are enforced here rather than in
    /// each phase: audit steps equal the trail length before append, cost
    /// never decreases, `should_stop` latches, and round counters stay inside
    /// `max_rounds` and the hard cap.
    pub fn apply(&mut self, delta: PhaseDelta) {
        if let Some(v) = delta.need_inquiry {
            self.need_inquiry = v;
        }
        if let Some(v) = delta.provided_info {
            self.provided_info = v;
        }
        if let Some(v) = delta.missing_info {
            self.missing_info = v;
        }
        if let Some(v) = delta.info_sufficiency {
            self.info_sufficiency = v.clamp(0.0, 1.0);
        }
        if let Some(v) = delta.inquiry_questions {
            self.inquiry_questions = v;
        }
        if let Some(v) = delta.inquiry_details {
            self.inquiry_details = v;
        }
        if let Some(v) = delta.collected_info {
            self.collected_info = v;
        }
        if let Some(v) = delta.task_type {
            self.task_type = v;
        }
        if let Some(v) = delta.collaboration_mode {
            self.collaboration_mode = v;
        }
        if let Some(v) = delta.ai_a_role {
            self.ai_a_role = v;
        }
        if let Some(v) = delta.ai_b_role {
            self.ai_b_role = v;
        }
        if let Some(v) = delta.ai_a_output {
            self.ai_a_output = v;
        }
        if let Some(v) = delta.ai_b_output {
            self.ai_b_output = v;
        }
        if let Some(v) = delta.max_rounds {
            self.max_rounds = v.clamp(1, HARD_ROUND_CAP);
        }
        if let Some(v) = delta.current_round {
            self.current_round = v.min(self.max_rounds);
        }
        if let Some(v) = delta.should_stop {
            self.should_stop = self.should_stop || v;
        }
        if let Some(v) = delta.stop_reason {
            self.stop_reason = Some(v);
        }
        if let Some(v) = delta.final_output {
            self.final_output = Some(v);
        }
        if let Some(v) = delta.error {
            self.error = Some(v);
        }
        self.debate_rounds.extend(delta.rounds);
        for note in delta.audit {
            self.audit_trail.push(AuditEntry {
                step: self.audit_trail.len(),
                note,
            });
        }
        if delta.added_cost > 0.0 {
            self.total_cost += delta.added_cost;
        }
    }

    /// The whitelisted subset a client may round-trip while answering
    /// inquiry questions.
    pub fn intermediate_state(&self) -> IntermediateState {
        IntermediateState {
            provided_info: self.provided_info.clone(),
            missing_info: self.missing_info.clone(),
            audit_trail: self.audit_trail.clone(),
            total_cost: self.total_cost,
        }
    }
}

/// What a phase returns: `Some` fields overwrite, `audit` and `rounds`
/// append, `added_cost` accumulates. Missing fields leave state untouched.
#[derive(Debug, Default)]
pub struct PhaseDelta {
    pub need_inquiry: Option<bool>,
    pub provided_info: Option<Map<String, Value>>,
    pub missing_info: Option<Vec<String>>,
    pub info_sufficiency: Option<f64>,
    pub inquiry_questions: Option<Vec<String>>,
    pub inquiry_details: Option<Vec<InquiryQuestion>>,
    pub collected_info: Option<Map<String, Value>>,
    pub task_type: Option<String>,
    pub collaboration_mode: Option<CollaborationMode>,
    pub ai_a_role: Option<String>,
    pub ai_b_role: Option<String>,
    pub ai_a_output: Option<String>,
    pub ai_b_output: Option<String>,
    pub current_round: Option<u32>,
    pub max_rounds: Option<u32>,
    pub should_stop: Option<bool>,
    pub stop_reason: Option<String>,
    pub final_output: Option<FinalReport>,
    pub error: Option<String>,
    pub rounds: Vec<DebateRound>,
    pub audit: Vec<AuditNote>,
    pub added_cost: f64,
}

/// Client-echoed state accepted back by answer submission. Unknown fields are
/// rejected outright; identity fields (user, scene, input) are deliberately
/// absent and always rebuilt from the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntermediateState {
    #[serde(default)]
    pub provided_info: Map<String, Value>,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
    #[serde(default)]
    pub total_cost: f64,
}

impl IntermediateState {
    pub fn validate(&self, max_cost: f64) -> Result<(), String> {
        if !self.total_cost.is_finite() || self.total_cost < 0.0 {
            return Err("total_cost must be a non-negative number".to_string());
        }
        if self.total_cost > max_cost {
            return Err(format!("total_cost exceeds the ceiling of {max_cost}"));
        }
        Ok(())
    }
}
