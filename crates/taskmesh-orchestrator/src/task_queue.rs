use crate::types::{Priority, Task, TaskOutcome, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use taskmesh_core::{Payload, TaskmeshError, TaskmeshResult};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the pending queue at a (possibly) lower priority.
    Requeued { priority: Priority, attempt: u32 },
    /// Retry budget exhausted, or the failure was not retryable.
    DeadLettered,
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<Uuid, Task>,
    /// One FIFO band per priority; `BTreeMap` iterates most urgent first.
    pending: BTreeMap<Priority, VecDeque<Uuid>>,
    /// Status channel per task, used by `await_result`.
    watchers: HashMap<Uuid, watch::Sender<TaskStatus>>,
    completed: usize,
    dead_lettered: usize,
    timed_out: usize,
    retried: usize,
}

impl StoreInner {
    fn task_mut(&mut self, id: Uuid) -> TaskmeshResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| TaskmeshError::not_found("task", id))
    }

    fn set_status(&mut self, id: Uuid, status: TaskStatus) -> TaskmeshResult<TaskStatus> {
        let task = self.task_mut(id)?;
        let previous = task.status;
        task.status = status;
        if let Some(tx) = self.watchers.get(&id) {
            tx.send_replace(status);
        }
        Ok(previous)
    }

    fn remove_pending(&mut self, id: Uuid) -> bool {
        for band in self.pending.values_mut() {
            if let Some(pos) = band.iter().position(|t| *t == id) {
                band.remove(pos);
                return true;
            }
        }
        false
    }

    fn enqueue_back(&mut self, id: Uuid, priority: Priority) {
        self.pending.entry(priority).or_default().push_back(id);
    }
}

/// Owns task records and the pending priority queue.
///
/// Within a priority band tasks leave in arrival order; across bands the
/// most urgent band always drains first.
pub struct TaskStore {
    inner: Mutex<StoreInner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Insert a new `Pending` task at the tail of its priority band.
    pub fn submit(&self, mut task: Task) -> Uuid {
        task.status = TaskStatus::Pending;
        let id = task.id;
        let priority = task.priority;
        let (tx, _rx) = watch::channel(TaskStatus::Pending);

        let mut inner = self.inner.lock();
        inner.tasks.insert(id, task);
        inner.watchers.insert(id, tx);
        inner.enqueue_back(id, priority);
        debug!(task_id = %id, priority = %priority, "Task queued");
        id
    }

    /// Pending task ids, most urgent first. Non-destructive.
    pub fn peek(&self) -> Vec<Uuid> {
        let inner = self.inner.lock();
        inner.pending.values().flatten().copied().collect()
    }

    /// Pending `(id, name)` pairs in queue order, for the scheduler's walk.
    pub fn pending_candidates(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.lock();
        inner
            .pending
            .values()
            .flatten()
            .filter_map(|id| inner.tasks.get(id).map(|t| (*id, t.name.clone())))
            .collect()
    }

    /// Drop a task from the pending queue. The record itself stays.
    pub fn remove(&self, id: Uuid) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        if !inner.tasks.contains_key(&id) {
            return Err(TaskmeshError::not_found("task", id));
        }
        if !inner.remove_pending(id) {
            return Err(TaskmeshError::NotFound(format!(
                "task {id} is not in the pending queue"
            )));
        }
        Ok(())
    }

    /// Snapshot of one task record.
    pub fn get(&self, id: Uuid) -> TaskmeshResult<Task> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| TaskmeshError::not_found("task", id))
    }

    /// Every task, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Take a pending task off the queue and bind it to `agent_id`.
    pub fn assign(&self, id: Uuid, agent_id: Uuid) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        let status = inner
            .tasks
            .get(&id)
            .map(|t| t.status)
            .ok_or_else(|| TaskmeshError::not_found("task", id))?;
        if status != TaskStatus::Pending {
            return Err(TaskmeshError::Engine(format!(
                "task {id} cannot be assigned from status {status}"
            )));
        }
        inner.remove_pending(id);
        inner.task_mut(id)?.assigned_agent = Some(agent_id);
        inner.set_status(id, TaskStatus::Assigned)?;
        Ok(())
    }

    /// Undo an assignment that could not go ahead; the task goes back to the
    /// front of its band so it keeps its place.
    pub fn release(&self, id: Uuid) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        task.assigned_agent = None;
        let priority = task.priority;
        inner.set_status(id, TaskStatus::Pending)?;
        inner.pending.entry(priority).or_default().push_front(id);
        Ok(())
    }

    /// `Assigned -> Running`. Returns a snapshot carrying payload and timeout.
    pub fn start(&self, id: Uuid) -> TaskmeshResult<Task> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Assigned {
            return Err(TaskmeshError::Engine(format!(
                "task {id} cannot start from status {}",
                task.status
            )));
        }
        task.started_at = Some(Utc::now());
        inner.set_status(id, TaskStatus::Running)?;
        Ok(inner.tasks[&id].clone())
    }

    /// `Running -> Completed` with the handler's value.
    pub fn complete(&self, id: Uuid, result: Payload) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(TaskmeshError::InvalidArgument(format!(
                "task {id} cannot complete from status {}",
                task.status
            )));
        }
        task.result = Some(result);
        task.error = None;
        task.completed_at = Some(Utc::now());
        inner.set_status(id, TaskStatus::Completed)?;
        inner.completed += 1;
        Ok(())
    }

    /// Record a failed attempt and decide between retry and dead-letter.
    ///
    /// `timed_out` marks the attempt as a timeout (`Running -> TimedOut`);
    /// `retryable = false` skips the retry budget entirely.
    pub fn fail(
        &self,
        id: Uuid,
        error: impl Into<String>,
        timed_out: bool,
        retryable: bool,
    ) -> TaskmeshResult<FailureDisposition> {
        let error = error.into();
        let mut inner = self.inner.lock();

        let failed_status = if timed_out {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        {
            let task = inner.task_mut(id)?;
            if task.status != TaskStatus::Running {
                return Err(TaskmeshError::InvalidArgument(format!(
                    "task {id} cannot fail from status {}",
                    task.status
                )));
            }
            task.attempt_errors.push(error.clone());
            task.completed_at = Some(Utc::now());
        }
        inner.set_status(id, failed_status)?;
        if timed_out {
            inner.timed_out += 1;
        }

        let task = inner.task_mut(id)?;
        if retryable && task.can_retry() {
            task.retry_count += 1;
            task.priority = task.priority.downgrade();
            task.assigned_agent = None;
            task.started_at = None;
            task.completed_at = None;
            let (priority, attempt) = (task.priority, task.retry_count);
            inner.set_status(id, TaskStatus::Pending)?;
            inner.enqueue_back(id, priority);
            inner.retried += 1;
            debug!(task_id = %id, priority = %priority, attempt, "Task requeued for retry");
            return Ok(FailureDisposition::Requeued { priority, attempt });
        }

        task.error = Some(error);
        inner.set_status(id, TaskStatus::DeadLetter)?;
        inner.dead_lettered += 1;
        warn!(task_id = %id, "Task moved to dead letter");
        Ok(FailureDisposition::DeadLettered)
    }

    /// Block until the task is terminal, or `timeout` elapses.
    ///
    /// Waits on the task's status channel; never polls.
    pub async fn await_result(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> TaskmeshResult<TaskOutcome> {
        let mut rx = {
            let inner = self.inner.lock();
            inner
                .watchers
                .get(&id)
                .map(watch::Sender::subscribe)
                .ok_or_else(|| TaskmeshError::not_found("task", id))?
        };

        let wait = rx.wait_for(|status| status.is_terminal());
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TaskmeshError::Timeout(format!("task {id} did not finish within {limit:?}"))
            })?,
            None => wait.await,
        };
        waited.map_err(|_| TaskmeshError::Engine(format!("status channel for task {id} closed")))?;

        Ok(TaskOutcome::from_task(&self.get(id)?))
    }

    /// Drop a terminal task and its status channel, returning the final
    /// record. Lifetime counters (completed, dead-lettered, ...) keep it.
    pub fn evict(&self, id: Uuid) -> TaskmeshResult<Task> {
        let mut inner = self.inner.lock();
        let status = inner
            .tasks
            .get(&id)
            .map(|t| t.status)
            .ok_or_else(|| TaskmeshError::not_found("task", id))?;
        if !status.is_terminal() {
            return Err(TaskmeshError::InvalidArgument(format!(
                "task {id} is still {status}"
            )));
        }
        inner.watchers.remove(&id);
        let task = inner
            .tasks
            .remove(&id)
            .ok_or_else(|| TaskmeshError::not_found("task", id))?;
        debug!(task_id = %id, "Task evicted");
        Ok(task)
    }

    /// Task records currently held, whatever their status.
    pub fn total_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.values().map(VecDeque::len).sum()
    }

    /// Tasks currently held by an agent (`Assigned` or `Running`).
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status.is_active())
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().completed
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.lock().dead_lettered
    }

    pub fn timed_out_count(&self) -> usize {
        self.inner.lock().timed_out
    }

    /// Failed attempts that were put back in the queue.
    pub fn retried_count(&self) -> usize {
        self.inner.lock().retried
    }

    /// No pending or in-flight work left.
    #[cfg(test)]
    fn is_done(&self) -> bool {
        self.inner
            .lock()
            .tasks
            .values()
            .all(|t| t.status.is_terminal())
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
