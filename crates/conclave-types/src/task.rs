use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Inquiring,
    ReadyForProcessing,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Inquiring => "inquiring",
            TaskStatus::ReadyForProcessing => "ready_for_processing",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub scene: String,
    pub user_input: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_seconds: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collected_info: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl Task {
    pub fn new(id: &str, user_id: &str, scene: &str, user_input: &str) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            scene: scene.to_string(),
            user_input: user_input.to_string(),
            status: TaskStatus::Inquiring,
            cost: 0.0,
            duration_seconds: 0,
            created_at: Utc::now(),
            completed_at: None,
            collected_info: Map::new(),
            processing_state: None,
            output: None,
        }
    }
}

/// One page of a user's task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub subscription_status: String,
    pub daily_quota: u32,
    #[serde(default)]
    pub daily_used: u32,
    #[serde(default)]
    pub total_tasks: u64,
    #[serde(default)]
    pub total_spent: f64,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(id: &str, daily_quota: u32) -> Self {
        Self {
            id: id.to_string(),
            email: String::new(),
            name: String::new(),
            tier: "free".to_string(),
            subscription_status: "active".to_string(),
            daily_quota,
            daily_used: 0,
            total_tasks: 0,
            total_spent: 0.0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_as_snake_case() {
        let json = serde_json::to_string(&TaskStatus::ReadyForProcessing).expect("serialize");
        assert_eq!(json, "\"ready_for_processing\"");
        let back: TaskStatus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, TaskStatus::ReadyForProcessing);
    }

    #[test]
    fn new_task_starts_inquiring_with_zero_cost() {
        let task = Task::new("t-1", "u-1", "topic-analysis", "hello");
        assert_eq!(task.status, TaskStatus::Inquiring);
        assert_eq!(task.cost, 0.0);
        assert!(task.completed_at.is_none());
    }
}
