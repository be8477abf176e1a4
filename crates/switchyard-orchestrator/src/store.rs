use crate::task::{AgentTask, TaskStatus, TaskSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use switchyard_core::{SnapshotMap, Swapped, SwitchyardError, SwitchyardResult};

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    // Higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task records plus the priority queue the scheduler drains.
///
/// Every status change goes through [`transition`](Self::transition), a
/// compare-and-swap on the task snapshot, so no transition is ever applied
/// to a stale state.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: SnapshotMap<String, AgentTask>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
}

impl TaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new task. Ids must be unique.
    pub fn insert(&self, task: AgentTask) -> SwitchyardResult<Arc<AgentTask>> {
        let id = task.id.clone();
        self.tasks
            .insert_if_absent(id.clone(), task)
            .map_err(|_| SwitchyardError::Validation(format!("task '{id}' already exists")))
    }

    /// One task.
    pub fn get(&self, task_id: &str) -> Option<Arc<AgentTask>> {
        self.tasks.get(&task_id.to_string())
    }

    /// One task, or a not-found error.
    pub fn require(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        self.get(task_id)
            .ok_or_else(|| SwitchyardError::not_found("task", task_id))
    }

    /// Tasks, optionally of one status, oldest first.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Arc<AgentTask>> {
        let mut tasks = self
            .tasks
            .filter(|t| status.map_or(true, |s| t.status == s));
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Move a task to `to` if that is legal from its current status, applying
    /// `mutate` to the new snapshot.
    pub fn transition<F>(&self, task_id: &str, to: TaskStatus, mutate: F) -> SwitchyardResult<Swapped<AgentTask>>
    where
        F: FnOnce(&mut AgentTask),
    {
        self.update(task_id, |current| {
            if !current.status.can_transition_to(to) {
                return Err(SwitchyardError::InvalidTransition(format!(
                    "task {} cannot move from {} to {}",
                    task_id, current.status, to
                )));
            }
            let mut next = current.clone();
            next.status = to;
            mutate(&mut next);
            Ok(next)
        })
    }

    /// Derive a new snapshot from the current one; `f` may refuse with an error.
    pub fn update<F>(&self, task_id: &str, f: F) -> SwitchyardResult<Swapped<AgentTask>>
    where
        F: FnOnce(&AgentTask) -> SwitchyardResult<AgentTask>,
    {
        self.tasks
            .update(&task_id.to_string(), f)
            .unwrap_or_else(|| Err(SwitchyardError::not_found("task", task_id)))
    }

    /// Put a task id on the scheduler queue.
    pub fn enqueue(&self, task_id: &str, priority: u8) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(QueueEntry {
            priority,
            seq,
            task_id: task_id.to_string(),
        });
    }

    /// Take every queued id, highest priority first.
    pub fn drain_queue(&self) -> Vec<String> {
        let mut queue = self.queue.lock();
        let mut ids = Vec::with_capacity(queue.len());
        while let Some(entry) = queue.pop() {
            ids.push(entry.task_id);
        }
        ids
    }

    /// Ids waiting on the queue.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether adding `candidate` would close a dependency cycle over known tasks.
    pub fn has_cycle(&self, candidate: &AgentTask) -> bool {
        let mut graph: HashMap<String, Vec<String>> = self
            .tasks
            .values()
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();
        graph.insert(candidate.id.clone(), candidate.dependencies.clone());

        let mut marks = HashMap::new();
        graph.keys().any(|id| dfs_cycle(&graph, id, &mut marks))
    }

    /// Remove terminal tasks that finished before `cutoff`.
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Vec<Arc<AgentTask>> {
        self.tasks
            .retain(|_, t| {
                !(t.status.is_terminal() && t.completed_at.map_or(false, |at| at < cutoff))
            })
            .into_iter()
            .map(|(_, t)| t)
            .collect()
    }

    /// Counts per status.
    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for task in self.tasks.values() {
            summary.total += 1;
            *summary.by_status.entry(task.status).or_default() += 1;
        }
        summary
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search from `start` with an explicit stack; a dependency
/// that is still being visited closes a cycle.
fn dfs_cycle(graph: &HashMap<String, Vec<String>>, start: &str, marks: &mut HashMap<String, Mark>) -> bool {
    const NO_DEPS: &[String] = &[];
    if marks.contains_key(start) {
        return false;
    }
    marks.insert(start.to_string(), Mark::Visiting);
    let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

    while let Some((id, next)) = stack.last_mut() {
        let deps = graph.get(*id).map_or(NO_DEPS, Vec::as_slice);
        let Some(dep) = deps.get(*next) else {
            marks.insert((*id).to_string(), Mark::Done);
            stack.pop();
            continue;
        };
        *next += 1;
        match marks.get(dep.as_str()) {
            Some(Mark::Visiting) => return true,
            Some(Mark::Done) => {}
            None => {
                marks.insert(dep.clone(), Mark::Visiting);
                stack.push((dep.as_str(), 0));
            }
        }
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn task(id: &str) -> AgentTask {
        AgentTask::new(id, "analysis", Value::Null).with_id(id)
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = TaskStore::new();
        store.insert(task("a")).unwrap();
        assert!(store.insert(task("a")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let store = TaskStore::new();
        store.insert(task("a")).unwrap();
        let err = store.transition("a", TaskStatus::Paused, |_| {}).unwrap_err();
        assert!(matches!(err, SwitchyardError::InvalidTransition(_)));
        assert_eq!(store.get("a").unwrap().status, TaskStatus::Pending);

        let swapped = store.transition("a", TaskStatus::Running, |t| t.progress = 1).unwrap();
        assert_eq!(swapped.previous.status, TaskStatus::Pending);
        assert_eq!(swapped.current.progress, 1);
        assert!(store.transition("missing", TaskStatus::Running, |_| {}).is_err());
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let store = TaskStore::new();
        store.enqueue("low", 1);
        store.enqueue("high-1", 9);
        store.enqueue("mid", 5);
        store.enqueue("high-2", 9);
        assert_eq!(store.drain_queue(), ["high-1", "high-2", "mid", "low"]);
        assert_eq!(store.queue_len(), 0);
    }

    #[test]
    fn test_cycle_detection() {
        let store = TaskStore::new();
        store.insert(task("a").with_dependencies(["b"])).unwrap();
        store.insert(task("c")).unwrap();
        assert!(store.has_cycle(&task("b").with_dependencies(["a"])));
        assert!(!store.has_cycle(&task("b").with_dependencies(["c"])));
        // Unknown dependencies are not cycles.
        assert!(!store.has_cycle(&task("d").with_dependencies(["zzz"])));
    }

    #[test]
    fn test_cycle_detection_on_long_chain() {
        let store = TaskStore::new();
        let depth = 50_000;
        for i in 1..depth {
            store
                .insert(task(&format!("t{i}")).with_dependencies([format!("t{}", i - 1)]))
                .unwrap();
        }
        assert!(!store.has_cycle(&task("t0")));
        let last = format!("t{}", depth - 1);
        assert!(store.has_cycle(&task("t0").with_dependencies([last])));
    }

    #[test]
    fn test_purge_only_old_terminal_tasks() {
        let store = TaskStore::new();
        store.insert(task("old")).unwrap();
        store.insert(task("live")).unwrap();
        store
            .update("old", |t| {
                let mut next = t.clone();
                next.status = TaskStatus::Completed;
                next.completed_at = Some(Utc::now() - chrono::Duration::days(8));
                Ok(next)
            })
            .unwrap();

        let purged = store.purge_terminal(Utc::now() - chrono::Duration::days(7));
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, "old");
        assert!(store.get("live").is_some());
        assert_eq!(store.summary().count(TaskStatus::Pending), 1);
    }
}
