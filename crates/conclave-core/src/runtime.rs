use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use conclave_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use conclave_providers::{ClientManager, Role};
use conclave_types::{
    AuditEntry, InquiryQuestion, IntermediateState, PhaseState, Task, TaskPage, TaskStatus,
    HARD_ROUND_CAP,
};

use crate::config::EngineConfig;
use crate::errors::RuntimeError;
use crate::fanout::ProgressHub;
use crate::locks::TaskLocks;
use crate::phases;
use crate::pipeline::{run_prelude, Node, PipelineGraph, PreludeOutcome};
use crate::progress::phase_progress;
use crate::quota::QuotaGate;
use crate::storage::Storage;
use crate::text::preview;

const AI_MESSAGE_PREVIEW_BYTES: usize = 500;
const ESTIMATED_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub lock_ttl: Duration,
    pub subscriber_wait: Duration,
    /// Collaboration stops once the accumulated cost crosses this line.
    pub max_task_cost: f64,
    pub intermediate_cost_ceiling: f64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(3600),
            subscriber_wait: Duration::from_secs(10),
            max_task_cost: 1.0,
            intermediate_cost_ceiling: 1000.0,
        }
    }
}

impl From<&EngineConfig> for RuntimeOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl,
            subscriber_wait: config.subscriber_wait,
            max_task_cost: config.max_task_cost,
            intermediate_cost_ceiling: config.intermediate_cost_ceiling,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CreateTaskResponse {
    Inquiry {
        task_id: String,
        status: TaskStatus,
        need_inquiry: bool,
        inquiry_questions: Vec<String>,
        inquiry_details: Vec<InquiryQuestion>,
        info_sufficiency: f64,
        intermediate_state: IntermediateState,
    },
    Processing {
        task_id: String,
        status: TaskStatus,
        need_inquiry: bool,
        estimated_time: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitAnswersResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub collected_info: serde_json::Map<String, serde_json::Value>,
    pub estimated_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartProcessingResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

/// Drives a task through its lifecycle: foreground prelude, durable pause,
/// locked background processing, completion fan-out. Process-wide; clones
/// share all state.
#[derive(Clone)]
pub struct TaskRuntime {
    store: Arc<Storage>,
    manager: Arc<ClientManager>,
    hub: ProgressHub,
    locks: Arc<dyn TaskLocks>,
    quota: QuotaGate,
    graph: PipelineGraph,
    active: Arc<RwLock<HashMap<String, AbortHandle>>>,
    options: RuntimeOptions,
}

impl TaskRuntime {
    pub fn new(
        store: Arc<Storage>,
        manager: Arc<ClientManager>,
        hub: ProgressHub,
        locks: Arc<dyn TaskLocks>,
        quota: QuotaGate,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            store,
            manager,
            hub,
            locks,
            quota,
            graph: PipelineGraph::new(),
            active: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self, user_id: &str, limit: usize, offset: usize) -> TaskPage {
        self.store.list_tasks(user_id, limit, offset).await
    }

    pub async fn active_task_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Quota first, row second, prelude third. Any failure after the quota
    /// increment pays it back and marks the row failed.
    pub async fn create_task(
        &self,
        user_id: &str,
        scene: &str,
        user_input: &str,
    ) -> Result<CreateTaskResponse, RuntimeError> {
        self.quota.reserve(user_id).await?;
        let task_id = Uuid::new_v4().to_string();
        info!(
            task_id,
            user_id,
            scene,
            input = %redact_text(user_input),
            "creating task"
        );

        match self.create_task_inner(&task_id, user_id, scene, user_input).await {
            Ok(response) => Ok(response),
            Err(err) => {
                error!(task_id, user_id, "task creation failed: {err}");
                if let Err(store_err) = self.store.fail_task(&task_id, &err.to_string()).await {
                    warn!(task_id, "could not mark task failed: {store_err:#}");
                }
                self.quota.rollback(user_id).await;
                Err(err)
            }
        }
    }

    async fn create_task_inner(
        &self,
        task_id: &str,
        user_id: &str,
        scene: &str,
        user_input: &str,
    ) -> Result<CreateTaskResponse, RuntimeError> {
        self.store
            .insert_task(Task::new(task_id, user_id, scene, user_input))
            .await?;

        let mut state = PhaseState::new(task_id, user_id, scene, user_input);
        match run_prelude(&self.graph, &self.manager, &mut state).await {
            PreludeOutcome::Inquiry => {
                self.store.update_cost(task_id, state.total_cost).await?;
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "task.inquiring",
                        component: "runtime",
                        task_id: Some(task_id),
                        user_id: Some(user_id),
                        phase: Some("inquiry"),
                        endpoint: None,
                        status: Some("paused"),
                        error_code: None,
                        detail: None,
                    },
                );
                Ok(CreateTaskResponse::Inquiry {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Inquiring,
                    need_inquiry: true,
                    inquiry_questions: state.inquiry_questions.clone(),
                    inquiry_details: state.inquiry_details.clone(),
                    info_sufficiency: state.info_sufficiency,
                    intermediate_state: state.intermediate_state(),
                })
            }
            PreludeOutcome::Processing => {
                let moved = self
                    .store
                    .cas_update(task_id, TaskStatus::Inquiring, TaskStatus::Processing, |t| {
                        t.cost = state.total_cost;
                    })
                    .await?;
                if moved.is_none() {
                    warn!(task_id, "task left inquiring status before hand-off");
                }
                self.start_background(task_id.to_string(), state).await;
                Ok(CreateTaskResponse::Processing {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Processing,
                    need_inquiry: false,
                    estimated_time: ESTIMATED_SECONDS,
                })
            }
        }
    }

    /// Validates the echoed state, rebuilds identity from the store, runs
    /// answer extraction and parks the task as ready_for_processing.
    pub async fn submit_answers(
        &self,
        task_id: &str,
        answers: BTreeMap<u32, String>,
        intermediate_state: IntermediateState,
    ) -> Result<SubmitAnswersResponse, RuntimeError> {
        intermediate_state
            .validate(self.options.intermediate_cost_ceiling)
            .map_err(RuntimeError::InvalidState)?;

        let task = self
            .store
            .get_task(task_id)
            .await
            .ok_or(RuntimeError::NotFound)?;

        // Identity comes from the row, never from the client.
        let mut state = PhaseState::new(&task.id, &task.user_id, &task.scene, &task.user_input);
        state.provided_info = intermediate_state.provided_info;
        state.missing_info = intermediate_state.missing_info;
        state.total_cost = intermediate_state.total_cost;
        state.audit_trail = renumber(intermediate_state.audit_trail);

        let delta = phases::process_answers(&self.manager, &state, &answers).await;
        state.apply(delta);

        let processing_state =
            serde_json::to_value(&state).context("serialize processing state")?;
        let collected_info = state.collected_info.clone();
        let cost = state.total_cost;
        let moved = self
            .store
            .cas_update(
                task_id,
                TaskStatus::Inquiring,
                TaskStatus::ReadyForProcessing,
                |t| {
                    t.collected_info = collected_info.clone();
                    t.processing_state = Some(processing_state.clone());
                    t.cost = cost;
                },
            )
            .await?;
        if moved.is_none() {
            let current = self.current_status(task_id).await;
            return Err(RuntimeError::WrongStatus { current });
        }

        info!(task_id, answers = answers.len(), "answers accepted");
        Ok(SubmitAnswersResponse {
            task_id: task_id.to_string(),
            status: TaskStatus::ReadyForProcessing,
            collected_info: state.collected_info,
            estimated_time: ESTIMATED_SECONDS,
        })
    }

    /// CAS ready_for_processing -> processing; exactly one caller wins and
    /// spawns the worker.
    pub async fn start_processing(
        &self,
        task_id: &str,
    ) -> Result<StartProcessingResponse, RuntimeError> {
        let moved = self
            .store
            .cas_update(
                task_id,
                TaskStatus::ReadyForProcessing,
                TaskStatus::Processing,
                |_| {},
            )
            .await?;
        let Some(task) = moved else {
            let current = self.current_status(task_id).await;
            return Err(RuntimeError::WrongStatus { current });
        };

        let state = match task.processing_state.clone() {
            Some(blob) => serde_json::from_value(blob).unwrap_or_else(|err| {
                warn!(task_id, "processing state blob unreadable, rebuilding: {err}");
                rebuild_state(&task)
            }),
            None => rebuild_state(&task),
        };

        info!(task_id, "starting background processing");
        self.start_background(task_id.to_string(), state).await;
        Ok(StartProcessingResponse {
            task_id: task_id.to_string(),
            status: TaskStatus::Processing,
            message: "background processing started".to_string(),
        })
    }

    async fn current_status(&self, task_id: &str) -> String {
        self.store
            .get_task(task_id)
            .await
            .map(|t| t.status.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Spawns the worker under the task lock, plus a watcher that releases
    /// the lock, deregisters the task, and logs how the worker ended. An
    /// abort is "cancelled", never an error.
    pub async fn start_background(&self, task_id: String, state: PhaseState) {
        if !self.locks.acquire(&task_id, self.options.lock_ttl).await {
            warn!(task_id, "task already locked by another worker");
            return;
        }

        let runtime = self.clone();
        let worker_id = task_id.clone();
        let worker =
            tokio::spawn(async move { runtime.process_task(&worker_id, state).await });
        self.active
            .write()
            .await
            .insert(task_id.clone(), worker.abort_handle());

        let runtime = self.clone();
        tokio::spawn(async move {
            match worker.await {
                Ok(Ok(())) => {
                    info!(task_id, "background task finished");
                }
                Ok(Err(err)) => {
                    error!(task_id, "background task failed: {err:#}");
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "task.failed",
                            component: "runtime",
                            task_id: Some(&task_id),
                            user_id: None,
                            phase: None,
                            endpoint: None,
                            status: Some("failed"),
                            error_code: None,
                            detail: Some(&format!("{err:#}")),
                        },
                    );
                }
                Err(join_err) if join_err.is_cancelled() => {
                    warn!(task_id, "background task cancelled");
                    emit_event(
                        Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "task.cancelled",
                            component: "runtime",
                            task_id: Some(&task_id),
                            user_id: None,
                            phase: None,
                            endpoint: None,
                            status: Some("cancelled"),
                            error_code: None,
                            detail: None,
                        },
                    );
                }
                Err(join_err) => {
                    error!(task_id, "background task panicked: {join_err}");
                }
            }
            runtime.locks.release(&task_id).await;
            runtime.active.write().await.remove(&task_id);
        });
    }

    /// Aborts a running worker. The watcher still releases the lock and logs
    /// the cancellation.
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.active.read().await.get(task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn process_task(&self, task_id: &str, mut state: PhaseState) -> anyhow::Result<()> {
        let result = self.run_phases(task_id, &mut state).await;
        if let Err(err) = &result {
            let detail = format!("{err:#}");
            if let Err(store_err) = self.store.fail_task(task_id, &detail).await {
                error!(task_id, "could not mark task failed: {store_err:#}");
            }
            self.hub.emit_error(task_id, &detail).await;
        }
        result
    }

    async fn run_phases(&self, task_id: &str, state: &mut PhaseState) -> anyhow::Result<()> {
        if self
            .hub
            .wait_for_subscriber(task_id, self.options.subscriber_wait)
            .await
        {
            info!(task_id, "subscriber connected");
        } else {
            info!(task_id, "no subscriber yet, events will be buffered");
        }

        self.emit_phase_progress(state, "planning", 0.0, "Working out the collaboration strategy...")
            .await;
        let delta = phases::planning(&self.manager, state).await;
        state.apply(delta);

        let kickoff = match state.collaboration_mode {
            conclave_types::CollaborationMode::Debate => "Debate mode starting...",
            conclave_types::CollaborationMode::Review => "Review mode starting...",
        };
        self.emit_phase_progress(state, "collaboration", 0.0, kickoff)
            .await;

        let mut node = self.graph.next(Node::Planning, state);
        let mut rounds_run = 0u32;
        while matches!(node, Node::DebateCollaborate | Node::ReviewCollaborate) {
            rounds_run += 1;
            if rounds_run > HARD_ROUND_CAP {
                warn!(task_id, "hard round cap reached, forcing collaboration stop");
                break;
            }
            if self.options.max_task_cost > 0.0 && state.total_cost >= self.options.max_task_cost {
                warn!(
                    task_id,
                    cost = state.total_cost,
                    "cost ceiling reached, stopping collaboration"
                );
                state.should_stop = true;
                state.stop_reason = Some("cost ceiling reached".to_string());
                break;
            }

            let delta = match node {
                Node::ReviewCollaborate => phases::review_round(&self.manager, state).await?,
                _ => phases::debate_round(&self.manager, state).await?,
            };
            state.apply(delta);

            if !state.ai_a_output.is_empty() {
                self.hub
                    .emit_ai_message(
                        task_id,
                        self.manager.endpoint_name(Role::A),
                        &preview(&state.ai_a_output, AI_MESSAGE_PREVIEW_BYTES),
                    )
                    .await;
            }
            if !state.ai_b_output.is_empty() {
                self.hub
                    .emit_ai_message(
                        task_id,
                        self.manager.endpoint_name(Role::B),
                        &preview(&state.ai_b_output, AI_MESSAGE_PREVIEW_BYTES),
                    )
                    .await;
            }

            let fraction = f64::from(state.current_round) / f64::from(HARD_ROUND_CAP);
            self.emit_phase_progress(
                state,
                "collaboration",
                fraction,
                &format!("Collaboration round {} complete", state.current_round),
            )
            .await;

            node = self.graph.next(node, state);
        }

        self.emit_phase_progress(state, "integration", 0.5, "Writing the combined report...")
            .await;
        let delta = phases::integrate(&self.manager, state).await;
        state.apply(delta);

        self.emit_phase_progress(state, "finalization", 1.0, "Analysis complete")
            .await;

        // The row is updated before the completion event so a client reacting
        // to `complete` always reads a completed task.
        let completed_at = Utc::now();
        let task = self
            .store
            .get_task(task_id)
            .await
            .ok_or_else(|| anyhow!("task row vanished during processing"))?;
        let duration = (completed_at - task.created_at).num_seconds().max(0);
        let output = state.final_output.clone().unwrap_or_default();
        let output_value = serde_json::to_value(&output).context("serialize final output")?;
        self.store
            .complete_task(task_id, output_value, state.total_cost, duration, completed_at)
            .await?;

        self.hub.emit_complete(task_id, output).await;

        if !state.audit_trail.is_empty() {
            if let Err(err) = self.store.insert_audit_rows(task_id, &state.audit_trail).await {
                // Degraded but accepted: the task stays completed.
                warn!(task_id, "audit insert failed after completion: {err:#}");
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "task.audit_insert_failed",
                        component: "runtime",
                        task_id: Some(task_id),
                        user_id: Some(&state.user_id),
                        phase: None,
                        endpoint: None,
                        status: Some("degraded"),
                        error_code: None,
                        detail: Some(&format!("{err:#}")),
                    },
                );
            }
        }
        if let Err(err) = self
            .store
            .record_task_spend(&state.user_id, state.total_cost)
            .await
        {
            warn!(task_id, "could not record user spend: {err:#}");
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.completed",
                component: "runtime",
                task_id: Some(task_id),
                user_id: Some(&state.user_id),
                phase: None,
                endpoint: None,
                status: Some("completed"),
                error_code: None,
                detail: None,
            },
        );
        Ok(())
    }

    async fn emit_phase_progress(
        &self,
        state: &mut PhaseState,
        phase: &str,
        fraction: f64,
        message: &str,
    ) {
        let computed = phase_progress(phase, fraction);
        let value = state.last_progress.max(computed);
        state.last_progress = value;
        self.hub
            .emit_progress(&state.task_id, phase, value, message)
            .await;
    }
}

fn renumber(trail: Vec<AuditEntry>) -> Vec<AuditEntry> {
    trail
        .into_iter()
        .enumerate()
        .map(|(step, entry)| AuditEntry {
            step,
            note: entry.note,
        })
        .collect()
}

fn rebuild_state(task: &Task) -> PhaseState {
    let mut state = PhaseState::new(&task.id, &task.user_id, &task.scene, &task.user_input);
    state.collected_info = task.collected_info.clone();
    state.total_cost = task.cost;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{MemoryProgressStore, ProgressHub, TaskEvent};
    use crate::locks::MemoryTaskLocks;
    use crate::test_support::*;
    use conclave_types::UserRecord;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Storage>,
        runtime: TaskRuntime,
    }

    async fn fixture(manager: Arc<ClientManager>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        store
            .upsert_user(UserRecord::new("u-1", 10))
            .await
            .expect("user");
        let hub = ProgressHub::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(300),
        );
        let runtime = TaskRuntime::new(
            store.clone(),
            manager,
            hub,
            Arc::new(MemoryTaskLocks::new()),
            QuotaGate::new(store.clone(), true),
            RuntimeOptions {
                subscriber_wait: Duration::from_millis(200),
                ..RuntimeOptions::default()
            },
        );
        Fixture {
            _dir: dir,
            store,
            runtime,
        }
    }

    async fn wait_for_status(store: &Storage, task_id: &str, status: TaskStatus) -> Task {
        for _ in 0..300 {
            if let Some(task) = store.get_task(task_id).await {
                if task.status == status {
                    return task;
                }
                assert_ne!(
                    task.status,
                    TaskStatus::Failed,
                    "task failed: {:?}",
                    task.output
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached {status:?}");
    }

    #[tokio::test]
    async fn sufficient_info_debate_converges_to_completed() {
        let manager = scripted_manager(
            vec![EVAL_SUFFICIENT, PLAN_DEBATE, DIVERGENCE_NONE, REPORT_JSON],
            vec!["depth analysis: do it"],
            vec!["practical analysis: do it"],
        );
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "tech blogger, 25-35 programmer audience, AI Agent video")
            .await
            .expect("create");
        let task_id = match response {
            CreateTaskResponse::Processing { task_id, need_inquiry, .. } => {
                assert!(!need_inquiry);
                task_id
            }
            other => panic!("expected processing, got {other:?}"),
        };

        let task = wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;
        let output = task.output.expect("output");
        assert_eq!(output["executive_summary"]["tldr"], "Make the video now.");
        assert_eq!(output["divergences"].as_array().map(Vec::len), Some(0));
        assert!(task.cost > 0.0);
        assert!(task.completed_at.is_some());

        // Progress is dense, monotonic, and ends at 100.
        let items = fx.runtime.hub().get_full_progress(&task_id).await;
        let ids: Vec<u64> = items.iter().map(|i| i.sequence_id).collect();
        assert_eq!(ids, (0..items.len() as u64).collect::<Vec<_>>());
        assert!(items.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert_eq!(items.last().map(|i| i.progress), Some(100));

        // Audit rows landed post-completion, steps intact.
        let rows = fx.store.audit_rows(&task_id).await.expect("audit");
        assert!(rows.len() >= 5);
        assert_eq!(rows[0]["step"], 0);
        assert!(rows.iter().any(|row| row["action"] == "divergence check"));
    }

    #[tokio::test]
    async fn insufficient_info_pauses_for_inquiry_then_completes() {
        let manager = scripted_manager(
            vec![
                EVAL_INSUFFICIENT,
                QUESTIONS_THREE,
                ANSWERS_EXTRACTED,
                PLAN_DEBATE,
                DIVERGENCE_NONE,
                REPORT_JSON,
            ],
            vec!["depth analysis"],
            vec!["practical analysis"],
        );
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "I want to do an AI Agent video")
            .await
            .expect("create");
        let (task_id, intermediate) = match response {
            CreateTaskResponse::Inquiry {
                task_id,
                inquiry_questions,
                info_sufficiency,
                intermediate_state,
                ..
            } => {
                assert!((3..=5).contains(&inquiry_questions.len()));
                assert!(info_sufficiency <= 0.5);
                (task_id, intermediate_state)
            }
            other => panic!("expected inquiry, got {other:?}"),
        };
        assert_eq!(
            fx.store.get_task(&task_id).await.map(|t| t.status),
            Some(TaskStatus::Inquiring)
        );

        let mut answers = BTreeMap::new();
        answers.insert(1, "junior developers".to_string());
        answers.insert(2, "subscriber growth".to_string());
        let submitted = fx
            .runtime
            .submit_answers(&task_id, answers, intermediate)
            .await
            .expect("submit");
        assert_eq!(submitted.status, TaskStatus::ReadyForProcessing);
        assert_eq!(
            submitted.collected_info["audience"],
            serde_json::json!("junior developers")
        );

        fx.runtime.start_processing(&task_id).await.expect("start");
        let task = wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;
        assert!(task.cost > 0.0);
    }

    #[tokio::test]
    async fn skipped_answers_use_existing_info_without_calling_meta() {
        // No ANSWERS_EXTRACTED in the script: an extraction call would fail
        // the scripted transport and show up as an error.
        let manager = scripted_manager(
            vec![
                EVAL_INSUFFICIENT,
                QUESTIONS_THREE,
                PLAN_DEBATE,
                DIVERGENCE_NONE,
                REPORT_JSON,
            ],
            vec!["depth analysis"],
            vec!["practical analysis"],
        );
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "I want to do an AI Agent video")
            .await
            .expect("create");
        let (task_id, intermediate) = match response {
            CreateTaskResponse::Inquiry {
                task_id,
                intermediate_state,
                ..
            } => (task_id, intermediate_state),
            other => panic!("expected inquiry, got {other:?}"),
        };

        let submitted = fx
            .runtime
            .submit_answers(&task_id, BTreeMap::new(), intermediate)
            .await
            .expect("submit");
        assert!(submitted.collected_info.is_empty());

        fx.runtime.start_processing(&task_id).await.expect("start");
        wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;

        let rows = fx.store.audit_rows(&task_id).await.expect("audit");
        assert!(rows
            .iter()
            .any(|row| row["action"] == "skipped inquiry" && row["actor"] == "user"));
    }

    #[tokio::test]
    async fn review_mode_loops_until_quality_acceptable() {
        let manager = scripted_manager(
            vec![
                EVAL_SUFFICIENT,
                PLAN_REVIEW,
                IMPROVEMENT_NEEDED,
                IMPROVEMENT_NOT_NEEDED,
                REPORT_JSON,
            ],
            vec!["draft v1", "draft v2"],
            vec!["review: intro too dense", "review: ship it"],
        );
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "content-creation", "write an 800-word article on AI Agents")
            .await
            .expect("create");
        let task_id = match response {
            CreateTaskResponse::Processing { task_id, .. } => task_id,
            other => panic!("expected processing, got {other:?}"),
        };
        wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;

        let rows = fx.store.audit_rows(&task_id).await.expect("audit");
        assert!(rows.iter().any(|row| row["action"] == "draft content"));
        assert!(rows
            .iter()
            .any(|row| row["action"] == "revise draft, round 2"));
    }

    #[tokio::test]
    async fn duplicate_start_processing_admits_one_worker() {
        let manager = scripted_manager(
            vec![
                EVAL_INSUFFICIENT,
                QUESTIONS_THREE,
                PLAN_DEBATE,
                DIVERGENCE_NONE,
                REPORT_JSON,
            ],
            vec!["a"],
            vec!["b"],
        );
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "short input")
            .await
            .expect("create");
        let (task_id, intermediate) = match response {
            CreateTaskResponse::Inquiry {
                task_id,
                intermediate_state,
                ..
            } => (task_id, intermediate_state),
            other => panic!("expected inquiry, got {other:?}"),
        };
        fx.runtime
            .submit_answers(&task_id, BTreeMap::new(), intermediate)
            .await
            .expect("submit");

        let first = fx.runtime.start_processing(&task_id).await;
        let second = fx.runtime.start_processing(&task_id).await;
        let outcomes = [first.is_ok(), second.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            [first, second].into_iter().find(|r| r.is_err()),
            Some(Err(RuntimeError::WrongStatus { .. }))
        ));

        wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;
        // Sequence stayed gap-free despite the duplicate attempt.
        let items = fx.runtime.hub().get_full_progress(&task_id).await;
        let ids: Vec<u64> = items.iter().map(|i| i.sequence_id).collect();
        assert_eq!(ids, (0..items.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn second_submit_answers_is_rejected() {
        let manager = scripted_manager(
            vec![EVAL_INSUFFICIENT, QUESTIONS_THREE],
            vec![],
            vec![],
        );
        let fx = fixture(manager).await;
        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "short input")
            .await
            .expect("create");
        let (task_id, intermediate) = match response {
            CreateTaskResponse::Inquiry {
                task_id,
                intermediate_state,
                ..
            } => (task_id, intermediate_state),
            other => panic!("expected inquiry, got {other:?}"),
        };
        fx.runtime
            .submit_answers(&task_id, BTreeMap::new(), intermediate.clone())
            .await
            .expect("first submit");
        let err = fx
            .runtime
            .submit_answers(&task_id, BTreeMap::new(), intermediate)
            .await
            .err()
            .expect("second submit rejected");
        assert!(matches!(err, RuntimeError::WrongStatus { current } if current == "ready_for_processing"));
    }

    #[tokio::test]
    async fn quota_exhaustion_rejects_before_any_side_effect() {
        let manager = scripted_manager(vec![], vec![], vec![]);
        let fx = fixture(manager).await;
        fx.store
            .upsert_user(UserRecord::new("u-0", 0))
            .await
            .expect("user");
        let err = fx
            .runtime
            .create_task("u-0", "topic-analysis", "hello")
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, RuntimeError::QuotaExceeded));
        assert_eq!(fx.runtime.list_tasks("u-0", 10, 0).await.total, 0);
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_quota_many() {
        // Every reply is an "insufficient" evaluation, so whatever order the
        // racing tasks pop the script in, each pauses at the inquiry.
        let script: Vec<&str> = std::iter::repeat(EVAL_INSUFFICIENT).take(16).collect();
        let manager = scripted_manager(script, vec![], vec![]);
        let fx = fixture(manager).await;
        fx.store
            .upsert_user(UserRecord::new("u-k", 3))
            .await
            .expect("user");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runtime = fx.runtime.clone();
            handles.push(tokio::spawn(async move {
                runtime
                    .create_task("u-k", "topic-analysis", "hello")
                    .await
                    .is_ok()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(
            fx.store.get_user("u-k").await.map(|u| u.daily_used),
            Some(3)
        );
    }

    #[tokio::test]
    async fn cancellation_releases_the_lock_and_emits_no_completion() {
        let meta = ScriptedTransport::new(vec![EVAL_SUFFICIENT, PLAN_DEBATE]);
        let slow_a = ScriptedTransport::slow(vec!["slow analysis"], Duration::from_secs(30));
        let slow_b = ScriptedTransport::slow(vec!["slow analysis"], Duration::from_secs(30));
        let manager = manager_from_transports(meta, slow_a, slow_b);
        let fx = fixture(manager).await;

        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "rich input")
            .await
            .expect("create");
        let task_id = match response {
            CreateTaskResponse::Processing { task_id, .. } => task_id,
            other => panic!("expected processing, got {other:?}"),
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.runtime.cancel(&task_id).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Not failed, no completion envelope, lock free again, registry empty.
        assert_eq!(
            fx.store.get_task(&task_id).await.map(|t| t.status),
            Some(TaskStatus::Processing)
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.runtime.hub().subscribe(&task_id, "probe", tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fx.runtime.active_task_count().await, 0);
    }

    #[tokio::test]
    async fn intermediate_state_over_ceiling_is_rejected() {
        let manager = scripted_manager(vec![], vec![], vec![]);
        let fx = fixture(manager).await;
        let mut intermediate = IntermediateState::default();
        intermediate.total_cost = 2000.0;
        let err = fx
            .runtime
            .submit_answers("missing", BTreeMap::new(), intermediate)
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, RuntimeError::InvalidState(_)));
    }

    #[tokio::test]
    async fn progress_events_reach_a_subscriber_in_order() {
        let manager = scripted_manager(
            vec![EVAL_SUFFICIENT, PLAN_DEBATE, DIVERGENCE_NONE, REPORT_JSON],
            vec!["analysis a"],
            vec!["analysis b"],
        );
        let fx = fixture(manager).await;
        let response = fx
            .runtime
            .create_task("u-1", "topic-analysis", "rich input")
            .await
            .expect("create");
        let task_id = match response {
            CreateTaskResponse::Processing { task_id, .. } => task_id,
            other => panic!("expected processing, got {other:?}"),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.runtime.hub().subscribe(&task_id, "client", tx).await;

        // Drain until the completion envelope arrives; it is dispatched right
        // after the row flips to completed.
        let mut last_seq = None;
        let mut saw_ai_message = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event before timeout")
                .expect("channel open");
            match event {
                TaskEvent::Progress(item) => {
                    if let Some(prev) = last_seq {
                        assert!(item.sequence_id > prev);
                    }
                    last_seq = Some(item.sequence_id);
                }
                TaskEvent::AiMessage { .. } => saw_ai_message = true,
                TaskEvent::Complete(envelope) => {
                    assert_eq!(envelope.task_id, task_id);
                    break;
                }
                TaskEvent::Error { .. } => panic!("unexpected error event"),
            }
        }
        assert!(saw_ai_message);
        wait_for_status(&fx.store, &task_id, TaskStatus::Completed).await;
    }
}
