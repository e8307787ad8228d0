use serde::{Deserialize, Serialize};

use crate::report::FinalReport;

/// A sequenced progress event for one task. Sequence ids are dense per task,
/// starting at 0 in-process (1 under a shared atomic counter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressItem {
    pub sequence_id: u64,
    pub phase: String,
    pub progress: u8,
    pub message: String,
    pub ts: f64,
    pub task_id: String,
}

/// The completed report, buffered so clients that join after the task
/// finished still receive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub task_id: String,
    pub output: FinalReport,
}
