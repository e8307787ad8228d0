use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use conclave_types::{CompletionEnvelope, FinalReport, ProgressItem};

/// Per-task ring buffer size for replayable progress.
pub const RING_CAPACITY: usize = 1000;
/// At most this many tasks keep live ring buffers; beyond it the oldest 20%
/// are evicted.
pub const MAX_TRACKED_TASKS: usize = 10_000;

/// One client-observable event on a task's stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress(ProgressItem),
    AiMessage { actor: String, content: String },
    Error { error: String },
    Complete(CompletionEnvelope),
}

pub type EventSink = mpsc::UnboundedSender<TaskEvent>;

/// Counter, ring buffer and completion cache behind the hub. The in-memory
/// implementation serves a single node; the redis one (feature
/// `redis-backend`) shares the same state across workers.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Allocates the next dense sequence id for a task.
    async fn next_sequence(&self, task_id: &str) -> u64;
    async fn push_item(&self, item: ProgressItem);
    async fn items(&self, task_id: &str) -> Vec<ProgressItem>;
    async fn put_completion(&self, envelope: CompletionEnvelope);
    async fn completion(&self, task_id: &str) -> Option<CompletionEnvelope>;
    async fn evict(&self, task_id: &str);
}

#[derive(Default)]
struct MemoryInner {
    counters: HashMap<String, u64>,
    rings: HashMap<String, VecDeque<ProgressItem>>,
    /// Ring creation order, oldest first; drives global-cap eviction.
    order: VecDeque<String>,
    completions: HashMap<String, CompletionEnvelope>,
}

pub struct MemoryProgressStore {
    max_tasks: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::with_max_tasks(MAX_TRACKED_TASKS)
    }

    pub fn with_max_tasks(max_tasks: usize) -> Self {
        Self {
            max_tasks: max_tasks.max(1),
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn next_sequence(&self, task_id: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        let counter = inner.counters.entry(task_id.to_string()).or_insert(0);
        let sequence_id = *counter;
        *counter += 1;
        sequence_id
    }

    async fn push_item(&self, item: ProgressItem) {
        let mut inner = self.inner.lock().await;
        if !inner.rings.contains_key(&item.task_id) {
            if inner.rings.len() >= self.max_tasks {
                let evict_count = (self.max_tasks / 5).max(1);
                warn!(
                    evict_count,
                    "progress cache at capacity, evicting oldest task buffers"
                );
                for _ in 0..evict_count {
                    let Some(old) = inner.order.pop_front() else { break };
                    inner.rings.remove(&old);
                }
            }
            inner.order.push_back(item.task_id.clone());
        }
        let ring = inner
            .rings
            .entry(item.task_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(RING_CAPACITY));
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(item);
    }

    async fn items(&self, task_id: &str) -> Vec<ProgressItem> {
        self.inner
            .lock()
            .await
            .rings
            .get(task_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn put_completion(&self, envelope: CompletionEnvelope) {
        self.inner
            .lock()
            .await
            .completions
            .insert(envelope.task_id.clone(), envelope);
    }

    async fn completion(&self, task_id: &str) -> Option<CompletionEnvelope> {
        self.inner.lock().await.completions.get(task_id).cloned()
    }

    async fn evict(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.counters.remove(task_id);
        inner.rings.remove(task_id);
        inner.order.retain(|id| id != task_id);
        inner.completions.remove(task_id);
    }
}

#[derive(Default)]
struct SubscriberIndex {
    sinks: HashMap<String, EventSink>,
    by_task: HashMap<String, HashSet<String>>,
    by_subscriber: HashMap<String, HashSet<String>>,
}

impl SubscriberIndex {
    fn remove_subscriber(&mut self, subscriber_id: &str) {
        self.sinks.remove(subscriber_id);
        if let Some(task_ids) = self.by_subscriber.remove(subscriber_id) {
            for task_id in task_ids {
                if let Some(subscribers) = self.by_task.get_mut(&task_id) {
                    subscribers.remove(subscriber_id);
                    if subscribers.is_empty() {
                        self.by_task.remove(&task_id);
                    }
                }
            }
        }
    }
}

struct HubInner {
    store: Arc<dyn ProgressStore>,
    subscribers: Mutex<SubscriberIndex>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    /// Serializes the allocate/buffer/dispatch path per task so sequence ids
    /// reach subscribers in order even with concurrent emitters.
    emit_serial: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cleanup_delay: Duration,
}

/// Per-task sequenced event log plus pub/sub. Emission never fails: a dead
/// subscriber is dropped from the registry and everything else continues.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new(store: Arc<dyn ProgressStore>, cleanup_delay: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                subscribers: Mutex::new(SubscriberIndex::default()),
                gates: Mutex::new(HashMap::new()),
                emit_serial: Mutex::new(HashMap::new()),
                cleanup_delay,
            }),
        }
    }

    pub fn in_process() -> Self {
        Self::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(300),
        )
    }

    async fn emit_guard(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .emit_serial
            .lock()
            .await
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn emit_progress(&self, task_id: &str, phase: &str, progress: u8, message: &str) {
        let guard = self.emit_guard(task_id).await;
        let _serial = guard.lock().await;

        let sequence_id = self.inner.store.next_sequence(task_id).await;
        let item = ProgressItem {
            sequence_id,
            phase: phase.to_string(),
            progress,
            message: message.to_string(),
            ts: unix_now(),
            task_id: task_id.to_string(),
        };
        self.inner.store.push_item(item.clone()).await;
        debug!(task_id, sequence_id, phase, progress, "progress emitted");
        self.dispatch(task_id, TaskEvent::Progress(item)).await;
    }

    pub async fn emit_ai_message(&self, task_id: &str, actor: &str, content: &str) {
        self.dispatch(
            task_id,
            TaskEvent::AiMessage {
                actor: actor.to_string(),
                content: content.to_string(),
            },
        )
        .await;
    }

    pub async fn emit_error(&self, task_id: &str, error: &str) {
        self.dispatch(
            task_id,
            TaskEvent::Error {
                error: error.to_string(),
            },
        )
        .await;
    }

    /// Caches the envelope for late joiners, pushes it to current
    /// subscribers, and schedules eviction of the task's buffers.
    pub async fn emit_complete(&self, task_id: &str, output: FinalReport) {
        let envelope = CompletionEnvelope {
            task_id: task_id.to_string(),
            output,
        };
        self.inner.store.put_completion(envelope.clone()).await;
        self.dispatch(task_id, TaskEvent::Complete(envelope)).await;

        let hub = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(hub.inner.cleanup_delay).await;
            hub.cleanup(&task_id).await;
        });
    }

    async fn cleanup(&self, task_id: &str) {
        self.inner.store.evict(task_id).await;
        self.inner.gates.lock().await.remove(task_id);
        self.inner.emit_serial.lock().await.remove(task_id);
        debug!(task_id, "progress buffers evicted");
    }

    pub async fn get_full_progress(&self, task_id: &str) -> Vec<ProgressItem> {
        self.inner.store.items(task_id).await
    }

    pub async fn subscribe(&self, task_id: &str, subscriber_id: &str, sink: EventSink) {
        let replay = self.inner.store.completion(task_id).await;
        {
            let mut index = self.inner.subscribers.lock().await;
            index
                .sinks
                .insert(subscriber_id.to_string(), sink.clone());
            index
                .by_task
                .entry(task_id.to_string())
                .or_default()
                .insert(subscriber_id.to_string());
            index
                .by_subscriber
                .entry(subscriber_id.to_string())
                .or_default()
                .insert(task_id.to_string());
        }
        if let Some(envelope) = replay {
            debug!(task_id, subscriber_id, "replaying completion to late subscriber");
            let _ = sink.send(TaskEvent::Complete(envelope));
        }
        if let Some(gate) = self.inner.gates.lock().await.get(task_id) {
            gate.notify_waiters();
        }
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        self.inner
            .subscribers
            .lock()
            .await
            .remove_subscriber(subscriber_id);
    }

    pub async fn has_subscribers(&self, task_id: &str) -> bool {
        self.inner
            .subscribers
            .lock()
            .await
            .by_task
            .get(task_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Blocks until a client subscribes to the task or the timeout passes.
    /// Event-backed; there is no polling loop.
    pub async fn wait_for_subscriber(&self, task_id: &str, timeout: Duration) -> bool {
        if self.has_subscribers(task_id).await {
            return true;
        }
        let gate = self
            .inner
            .gates
            .lock()
            .await
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let notified = gate.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.has_subscribers(task_id).await {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    async fn dispatch(&self, task_id: &str, event: TaskEvent) {
        let mut index = self.inner.subscribers.lock().await;
        let Some(subscriber_ids) = index.by_task.get(task_id) else {
            debug!(task_id, "no active subscribers, event buffered only");
            return;
        };

        let mut failed: Vec<String> = Vec::new();
        for subscriber_id in subscriber_ids.iter() {
            match index.sinks.get(subscriber_id) {
                Some(sink) if sink.send(event.clone()).is_ok() => {}
                _ => failed.push(subscriber_id.clone()),
            }
        }
        for subscriber_id in failed {
            warn!(task_id, subscriber_id = %subscriber_id, "dropping unreachable subscriber");
            index.remove_subscriber(&subscriber_id);
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_delay(delay: Duration) -> ProgressHub {
        ProgressHub::new(Arc::new(MemoryProgressStore::new()), delay)
    }

    fn hub() -> ProgressHub {
        hub_with_delay(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn sequence_ids_are_dense_from_zero() {
        let hub = hub();
        for i in 0..5 {
            hub.emit_progress("t-1", "planning", 20 + i, "working").await;
        }
        let items = hub.get_full_progress("t-1").await;
        let ids: Vec<u64> = items.iter().map(|i| i.sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn ring_keeps_the_last_thousand() {
        let hub = hub();
        for i in 0..1500u64 {
            hub.emit_progress("t-1", "collaboration", 50, &format!("round {i}"))
                .await;
        }
        let items = hub.get_full_progress("t-1").await;
        assert_eq!(items.len(), RING_CAPACITY);
        assert_eq!(items.first().map(|i| i.sequence_id), Some(500));
        assert_eq!(items.last().map(|i| i.sequence_id), Some(1499));
    }

    #[tokio::test]
    async fn subscribers_see_events_in_sequence_order() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "client-1", tx).await;
        for _ in 0..10 {
            hub.emit_progress("t-1", "planning", 25, "working").await;
        }
        let mut last = None;
        for _ in 0..10 {
            match rx.recv().await.expect("event") {
                TaskEvent::Progress(item) => {
                    if let Some(prev) = last {
                        assert!(item.sequence_id > prev);
                    }
                    last = Some(item.sequence_id);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_dropped_without_failing_emission() {
        let hub = hub();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "client-1", tx).await;
        drop(rx);
        hub.emit_progress("t-1", "planning", 25, "working").await;
        assert!(!hub.has_subscribers("t-1").await);
        // Emission still buffered.
        assert_eq!(hub.get_full_progress("t-1").await.len(), 1);
    }

    #[tokio::test]
    async fn completion_replays_to_late_joiners_until_eviction() {
        let hub = hub_with_delay(Duration::from_millis(50));
        hub.emit_complete("t-1", FinalReport::default()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "late-client", tx).await;
        match rx.recv().await.expect("event") {
            TaskEvent::Complete(envelope) => assert_eq!(envelope.task_id, "t-1"),
            other => panic!("unexpected event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "too-late", tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_for_subscriber_wakes_on_join() {
        let hub = hub();
        let waiter = hub.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_subscriber("t-1", Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "client-1", tx).await;
        assert!(handle.await.expect("join"));
    }

    #[tokio::test]
    async fn wait_for_subscriber_times_out() {
        let hub = hub();
        assert!(
            !hub.wait_for_subscriber("t-1", Duration::from_millis(30))
                .await
        );
    }

    #[tokio::test]
    async fn global_cap_evicts_the_oldest_fifth() {
        let store = Arc::new(MemoryProgressStore::with_max_tasks(10));
        let hub = ProgressHub::new(store, Duration::from_secs(300));
        for i in 0..10 {
            hub.emit_progress(&format!("t-{i}"), "planning", 20, "working")
                .await;
        }
        // The 11th task pushes out the two oldest buffers.
        hub.emit_progress("t-10", "planning", 20, "working").await;
        assert!(hub.get_full_progress("t-0").await.is_empty());
        assert!(hub.get_full_progress("t-1").await.is_empty());
        assert!(!hub.get_full_progress("t-2").await.is_empty());
        assert!(!hub.get_full_progress("t-10").await.is_empty());
    }

    #[tokio::test]
    async fn events_only_go_to_the_tasks_subscribers() {
        let hub = hub();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "client-1", tx1).await;
        hub.subscribe("t-2", "client-2", tx2).await;
        hub.emit_ai_message("t-1", "Kimi", "analysis...").await;
        assert!(matches!(
            rx1.recv().await,
            Some(TaskEvent::AiMessage { .. })
        ));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_cleans_both_indexes() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.subscribe("t-1", "client-1", tx.clone()).await;
        hub.subscribe("t-2", "client-1", tx).await;
        hub.unsubscribe("client-1").await;
        assert!(!hub.has_subscribers("t-1").await);
        assert!(!hub.has_subscribers("t-2").await);
    }
}
