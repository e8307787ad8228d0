use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use conclave_types::{AuditEntry, Task, TaskPage, TaskStatus, UserRecord};

/// The narrow persistence seam: task CRUD, append-only audit rows and the
/// atomic quota counters. Backed by JSON files under the state dir; a SQL
/// deployment hides behind the same surface.
pub struct Storage {
    base: PathBuf,
    tasks: RwLock<HashMap<String, Task>>,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let tasks = read_map::<Task>(&base.join("tasks.json")).await;
        let users = read_map::<UserRecord>(&base.join("users.json")).await;

        Ok(Self {
            base,
            tasks: RwLock::new(tasks),
            users: RwLock::new(users),
        })
    }

    async fn save_tasks(&self) -> anyhow::Result<()> {
        let snapshot = self.tasks.read().await.clone();
        write_map(&self.base.join("tasks.json"), &snapshot).await
    }

    async fn save_users(&self) -> anyhow::Result<()> {
        let snapshot = self.users.read().await.clone();
        write_map(&self.base.join("users.json"), &snapshot).await
    }

    pub async fn insert_task(&self, task: Task) -> anyhow::Result<()> {
        self.tasks.write().await.insert(task.id.clone(), task);
        self.save_tasks().await
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self, user_id: &str, limit: usize, offset: usize) -> TaskPage {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = tasks.len();
        let page: Vec<Task> = tasks.into_iter().skip(offset).take(limit).collect();
        TaskPage {
            has_more: total > offset + limit,
            tasks: page,
            total,
            limit,
            offset,
        }
    }

    /// Compare-and-swap status transition, with an optional payload applied
    /// inside the same critical section. Returns the updated row, or `None`
    /// when the task is missing or no longer in `from`.
    pub async fn cas_update(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> anyhow::Result<Option<Task>> {
        let updated = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(task) if task.status == from => {
                    task.status = to;
                    mutate(task);
                    Some(task.clone())
                }
                _ => None,
            }
        };
        if updated.is_some() {
            self.save_tasks().await?;
        }
        Ok(updated)
    }

    pub async fn update_cost(&self, task_id: &str, cost: f64) -> anyhow::Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(task_id) {
                task.cost = cost;
            }
        }
        self.save_tasks().await
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        output: Value,
        cost: f64,
        duration_seconds: i64,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .with_context(|| format!("task {task_id} missing at completion"))?;
            task.status = TaskStatus::Completed;
            task.output = Some(output);
            task.cost = cost;
            task.duration_seconds = duration_seconds;
            task.completed_at = Some(completed_at);
        }
        self.save_tasks().await
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> anyhow::Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.output = Some(json!({ "error": error }));
            }
        }
        self.save_tasks().await
    }

    /// Appends every audit row in one shot; rows carry the task id so the
    /// file is a flat append-only log.
    pub async fn insert_audit_rows(
        &self,
        task_id: &str,
        entries: &[AuditEntry],
    ) -> anyhow::Result<()> {
        let mut lines = String::new();
        for entry in entries {
            let mut row = serde_json::to_value(entry)?;
            if let Some(map) = row.as_object_mut() {
                map.insert("task_id".to_string(), json!(task_id));
            }
            lines.push_str(&row.to_string());
            lines.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base.join("audit_trails.jsonl"))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn audit_rows(&self, task_id: &str) -> anyhow::Result<Vec<Value>> {
        let path = self.base.join("audit_trails.jsonl");
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|row| row.get("task_id").and_then(|v| v.as_str()) == Some(task_id))
            .collect())
    }

    pub async fn upsert_user(&self, user: UserRecord) -> anyhow::Result<()> {
        self.users.write().await.insert(user.id.clone(), user);
        self.save_users().await
    }

    pub async fn get_user(&self, user_id: &str) -> Option<UserRecord> {
        self.users.read().await.get(user_id).cloned()
    }

    /// Atomic quota take: succeeds only while `daily_used < daily_quota`.
    /// Returns the new `daily_used`, or `None` when the quota is exhausted
    /// or the user is unknown.
    pub async fn increment_daily_used(&self, user_id: &str) -> anyhow::Result<Option<u32>> {
        let new_value = {
            let mut users = self.users.write().await;
            match users.get_mut(user_id) {
                Some(user) if user.daily_used < user.daily_quota => {
                    user.daily_used += 1;
                    Some(user.daily_used)
                }
                _ => None,
            }
        };
        if new_value.is_some() {
            self.save_users().await?;
        }
        Ok(new_value)
    }

    /// Compensating rollback after a failed create.
    pub async fn decrement_daily_used(&self, user_id: &str) -> anyhow::Result<()> {
        {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(user_id) {
                user.daily_used = user.daily_used.saturating_sub(1);
            }
        }
        self.save_users().await
    }

    pub async fn record_task_spend(&self, user_id: &str, cost: f64) -> anyhow::Result<()> {
        {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(user_id) {
                user.total_tasks += 1;
                user.total_spent += cost;
            }
        }
        self.save_users().await
    }
}

async fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn write_map<T: serde::Serialize>(
    path: &Path,
    map: &HashMap<String, T>,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(map)?;
    fs::write(path, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::AuditNote;
    use std::sync::Arc;

    async fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn cas_moves_status_exactly_once() {
        let (_dir, storage) = storage().await;
        storage
            .insert_task(Task::new("t-1", "u-1", "topic-analysis", "hi"))
            .await
            .expect("insert");

        let first = storage
            .cas_update("t-1", TaskStatus::Inquiring, TaskStatus::ReadyForProcessing, |_| {})
            .await
            .expect("cas");
        assert!(first.is_some());

        let second = storage
            .cas_update("t-1", TaskStatus::Inquiring, TaskStatus::ReadyForProcessing, |_| {})
            .await
            .expect("cas");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn concurrent_cas_admits_a_single_winner() {
        let (_dir, storage) = storage().await;
        let storage = Arc::new(storage);
        storage
            .insert_task(Task::new("t-1", "u-1", "topic-analysis", "hi"))
            .await
            .expect("insert");

        storage
            .cas_update("t-1", TaskStatus::Inquiring, TaskStatus::ReadyForProcessing, |_| {})
            .await
            .expect("cas");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .cas_update(
                        "t-1",
                        TaskStatus::ReadyForProcessing,
                        TaskStatus::Processing,
                        |_| {},
                    )
                    .await
                    .expect("cas")
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn quota_counters_stop_at_the_ceiling_and_roll_back() {
        let (_dir, storage) = storage().await;
        storage
            .upsert_user(UserRecord::new("u-1", 2))
            .await
            .expect("user");

        assert_eq!(storage.increment_daily_used("u-1").await.expect("inc"), Some(1));
        assert_eq!(storage.increment_daily_used("u-1").await.expect("inc"), Some(2));
        assert_eq!(storage.increment_daily_used("u-1").await.expect("inc"), None);

        storage.decrement_daily_used("u-1").await.expect("dec");
        assert_eq!(storage.increment_daily_used("u-1").await.expect("inc"), Some(2));
    }

    #[tokio::test]
    async fn concurrent_increments_admit_exactly_quota_many() {
        let (_dir, storage) = storage().await;
        let storage = Arc::new(storage);
        storage
            .upsert_user(UserRecord::new("u-1", 3))
            .await
            .expect("user");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.increment_daily_used("u-1").await.expect("inc").is_some()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn unknown_user_gets_no_quota() {
        let (_dir, storage) = storage().await;
        assert_eq!(storage.increment_daily_used("ghost").await.expect("inc"), None);
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let (_dir, storage) = storage().await;
        for i in 0..5 {
            let mut task = Task::new(&format!("t-{i}"), "u-1", "topic-analysis", "hi");
            task.created_at = Utc::now() + chrono::Duration::seconds(i);
            storage.insert_task(task).await.expect("insert");
        }
        storage
            .insert_task(Task::new("t-other", "u-2", "topic-analysis", "hi"))
            .await
            .expect("insert");

        let page = storage.list_tasks("u-1", 2, 0).await;
        assert_eq!(page.total, 5);
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.tasks[0].id, "t-4");
        assert!(page.has_more);

        let last = storage.list_tasks("u-1", 2, 4).await;
        assert_eq!(last.tasks.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn audit_rows_land_in_one_append() {
        let (_dir, storage) = storage().await;
        let entries: Vec<AuditEntry> = (0..3)
            .map(|step| AuditEntry {
                step,
                note: AuditNote {
                    phase: "evaluation".to_string(),
                    actor: "meta".to_string(),
                    action: "evaluated".to_string(),
                    input: String::new(),
                    output: String::new(),
                    reasoning: String::new(),
                    tokens_used: 5,
                    cost: 0.001,
                },
            })
            .collect();
        storage.insert_audit_rows("t-1", &entries).await.expect("insert");
        storage.insert_audit_rows("t-2", &entries[..1]).await.expect("insert");

        let rows = storage.audit_rows("t-1").await.expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["step"], 2);
    }

    #[tokio::test]
    async fn state_survives_a_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let storage = Storage::new(dir.path()).await.expect("storage");
            storage
                .insert_task(Task::new("t-1", "u-1", "topic-analysis", "hi"))
                .await
                .expect("insert");
            storage.upsert_user(UserRecord::new("u-1", 5)).await.expect("user");
        }
        let reopened = Storage::new(dir.path()).await.expect("storage");
        assert!(reopened.get_task("t-1").await.is_some());
        assert_eq!(reopened.get_user("u-1").await.map(|u| u.daily_quota), Some(5));
    }
}
