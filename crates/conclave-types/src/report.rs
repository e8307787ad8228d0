use serde::{Deserialize, Serialize};

use crate::state::AuditEntry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    #[serde(default)]
    pub tldr: String,
    #[serde(default)]
    pub key_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertainAdvice {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HypotheticalAdvice {
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Divergence {
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub ai_a_view: String,
    #[serde(default)]
    pub ai_a_reason: String,
    #[serde(default)]
    pub ai_b_view: String,
    #[serde(default)]
    pub ai_b_reason: String,
    #[serde(default)]
    pub our_suggestion: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub satisfaction_check: String,
    #[serde(default)]
    pub missing_info_hint: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummaryLine {
    pub actor: String,
    pub action: String,
    pub reasoning: String,
}

/// The audit trail condensed for the report: one group per phase, in the
/// order phases first appeared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPhaseSummary {
    pub phase: String,
    pub entries: Vec<AuditSummaryLine>,
}

/// The structured document returned to the user when a task completes.
/// Every section defaults so a partially-filled model reply still parses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalReport {
    #[serde(default)]
    pub executive_summary: ExecutiveSummary,
    #[serde(default)]
    pub certain_advice: CertainAdvice,
    #[serde(default)]
    pub hypothetical_advice: Vec<HypotheticalAdvice>,
    #[serde(default)]
    pub divergences: Vec<Divergence>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub audit_summary: Vec<AuditPhaseSummary>,
}

impl FinalReport {
    /// Groups audit entries by phase, preserving first-appearance order, and
    /// keeps only a snippet of each reasoning string.
    pub fn summarize_audit(trail: &[AuditEntry]) -> Vec<AuditPhaseSummary> {
        let mut groups: Vec<AuditPhaseSummary> = Vec::new();
        for entry in trail {
            let line = AuditSummaryLine {
                actor: entry.note.actor.clone(),
                action: entry.note.action.clone(),
                reasoning: snippet(&entry.note.reasoning, 120),
            };
            match groups.iter_mut().find(|g| g.phase == entry.note.phase) {
                Some(group) => group.entries.push(line),
                None => groups.push(AuditPhaseSummary {
                    phase: entry.note.phase.clone(),
                    entries: vec![line],
                }),
            }
        }
        groups
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AuditNote;

    #[test]
    fn partial_report_json_parses_with_defaults() {
        let report: FinalReport = serde_json::from_value(serde_json::json!({
            "executive_summary": {"tldr": "go for it"}
        }))
        .expect("parse");
        assert_eq!(report.executive_summary.tldr, "go for it");
        assert!(report.divergences.is_empty());
        assert!(report.hooks.satisfaction_check.is_empty());
    }

    #[test]
    fn audit_summary_groups_by_phase_in_order() {
        let mk = |step: usize, phase: &str, action: &str| AuditEntry {
            step,
            note: AuditNote {
                phase: phase.to_string(),
                actor: "meta".to_string(),
                action: action.to_string(),
                input: String::new(),
                output: String::new(),
                reasoning: "because".to_string(),
                tokens_used: 0,
                cost: 0.0,
            },
        };
        let trail = vec![
            mk(0, "evaluation", "evaluated"),
            mk(1, "collaboration", "analysis"),
            mk(2, "collaboration", "divergence check"),
            mk(3, "integration", "report"),
        ];
        let summary = FinalReport::summarize_audit(&trail);
        let phases: Vec<&str> = summary.iter().map(|g| g.phase.as_str()).collect();
        assert_eq!(phases, vec!["evaluation", "collaboration", "integration"]);
        assert_eq!(summary[1].entries.len(), 2);
    }
}
