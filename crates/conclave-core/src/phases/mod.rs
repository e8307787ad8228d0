pub mod collaboration;
pub mod evaluate;
pub mod inquiry;
pub mod integration;
pub mod planning;

pub use collaboration::{debate_round, review_round};
pub use evaluate::evaluate;
pub use inquiry::{generate_inquiry, process_answers};
pub use integration::integrate;
pub use planning::planning;

pub(crate) const PHASE_EVALUATION: &str = "evaluation";
pub(crate) const PHASE_INQUIRY: &str = "inquiry";
pub(crate) const PHASE_PLANNING: &str = "planning";
pub(crate) const PHASE_COLLABORATION: &str = "collaboration";
pub(crate) const PHASE_INTEGRATION: &str = "integration";

pub(crate) const META_ACTOR: &str = "meta";
pub(crate) const USER_ACTOR: &str = "user";

/// Pulls the first `{...}` span out of a model reply. Models wrap JSON in
/// prose often enough that parsing the raw content first would be wrong.
pub(crate) fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }
    serde_json::from_str(trimmed).ok()
}

pub(crate) fn parse_reply<T: serde::de::DeserializeOwned>(content: &str) -> Option<T> {
    extract_json(content).and_then(|value| serde_json::from_value(value).ok())
}

pub(crate) fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

/// Char-safe clip for audit snippets and prompt embeds.
pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
