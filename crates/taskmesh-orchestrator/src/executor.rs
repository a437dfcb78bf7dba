use crate::engine::EngineShared;
use crate::events::EngineEvent;
use crate::scheduler::Assignment;
use crate::task_queue::FailureDisposition;
use crate::types::TaskStatus;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use taskmesh_core::Payload;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded pool of execution slots.
///
/// Scheduling passes claim a slot for every assignment they make, so at most
/// `max_workers` tasks are bound or running at once and the rest stay queued.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Dispatched executions that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Slots currently claimed by assignments.
    pub(crate) fn active(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    pub(crate) fn slots(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    /// Resolve once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

enum AttemptOutcome {
    Succeeded(Payload),
    Failed(String),
    TimedOut(String),
}

/// Hand an assignment to the pool. Must be called from inside a Tokio runtime.
pub(crate) fn dispatch(shared: &Arc<EngineShared>, assignment: Assignment) {
    shared.pool.begin();
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        execute(&shared, &assignment).await;

        // Work-stealing: the agent just went idle; offer this slot to the
        // next pass before it goes back to the pool.
        shared.schedule_with(Some(assignment.slot));
        shared.pool.finish();
    });
}

/// Put an assignment that never started back where it came from.
fn release(shared: &EngineShared, assignment: &Assignment) {
    if let Err(e) = shared.store.release(assignment.task_id) {
        warn!(task_id = %assignment.task_id, error = %e, "Could not release task");
    } else {
        publish_task(shared, assignment.task_id, TaskStatus::Assigned, TaskStatus::Pending, None);
    }
    mark_idle(shared, assignment.agent_id);
}

async fn execute(shared: &EngineShared, assignment: &Assignment) {
    let Assignment {
        task_id,
        agent_id,
        ref agent_name,
        ..
    } = *assignment;

    let task = match shared.store.start(task_id) {
        Ok(task) => task,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Could not start assigned task");
            release(shared, assignment);
            return;
        }
    };
    publish_task(shared, task_id, TaskStatus::Assigned, TaskStatus::Running, Some(agent_id));
    info!(task_id = %task_id, task = %task.name, agent = %agent_name, attempt = task.retry_count + 1, "Executing task");

    let started = Instant::now();
    let outcome = match shared.registry.handler(agent_id) {
        Ok(handler) => {
            let payload = task.payload.clone();
            let mut handle = tokio::spawn(async move { handler.execute(payload).await });
            let joined = if task.timeout_secs == 0 {
                Ok((&mut handle).await)
            } else {
                tokio::time::timeout(task.timeout(), &mut handle).await
            };
            match joined {
                Ok(Ok(Ok(value))) => AttemptOutcome::Succeeded(value),
                Ok(Ok(Err(e))) => AttemptOutcome::Failed(e.to_string()),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    AttemptOutcome::Failed(format!("handler panicked: {}", panic_message(join_err)))
                }
                Ok(Err(join_err)) => AttemptOutcome::Failed(format!("handler aborted: {join_err}")),
                Err(_) => {
                    handle.abort();
                    AttemptOutcome::TimedOut(format!(
                        "task timed out after {}s",
                        task.timeout_secs
                    ))
                }
            }
        }
        Err(e) => AttemptOutcome::Failed(e.to_string()),
    };
    let elapsed = started.elapsed();

    match outcome {
        AttemptOutcome::Succeeded(value) => {
            match shared.store.complete(task_id, value) {
                Ok(()) => {
                    if let Err(e) = shared.registry.record_success(agent_id, elapsed) {
                        warn!(agent_id = %agent_id, error = %e, "Could not record agent success");
                    }
                    info!(task_id = %task_id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                    publish_task(shared, task_id, TaskStatus::Running, TaskStatus::Completed, Some(agent_id));
                }
                Err(e) => error!(task_id = %task_id, error = %e, "Could not record task completion"),
            }
        }
        AttemptOutcome::Failed(message) => {
            warn!(task_id = %task_id, agent = %agent_name, error = %message, "Task attempt failed");
            settle_failure(shared, task_id, agent_id, message, false, true);
        }
        AttemptOutcome::TimedOut(message) => {
            warn!(task_id = %task_id, agent = %agent_name, timeout_secs = task.timeout_secs, "Task timed out");
            let retryable = shared.config.retry_on_timeout;
            settle_failure(shared, task_id, agent_id, message, true, retryable);
        }
    }

    mark_idle(shared, agent_id);
}

fn settle_failure(
    shared: &EngineShared,
    task_id: Uuid,
    agent_id: Uuid,
    message: String,
    timed_out: bool,
    retryable: bool,
) {
    if let Err(e) = shared.registry.record_failure(agent_id) {
        warn!(agent_id = %agent_id, error = %e, "Could not record agent failure");
    }
    let failed_status = if timed_out {
        TaskStatus::TimedOut
    } else {
        TaskStatus::Failed
    };

    match shared.store.fail(task_id, message, timed_out, retryable) {
        Ok(disposition) => {
            publish_task(shared, task_id, TaskStatus::Running, failed_status, Some(agent_id));
            match disposition {
                FailureDisposition::Requeued { priority, attempt } => {
                    info!(task_id = %task_id, priority = %priority, retry = attempt, "Task scheduled for retry");
                    publish_task(shared, task_id, failed_status, TaskStatus::Pending, None);
                }
                FailureDisposition::DeadLettered => {
                    warn!(task_id = %task_id, "Task dead-lettered");
                    publish_task(shared, task_id, failed_status, TaskStatus::DeadLetter, None);
                }
            }
        }
        Err(e) => error!(task_id = %task_id, error = %e, "Could not record task failure"),
    }
}

fn mark_idle(shared: &EngineShared, agent_id: Uuid) {
    match shared.registry.mark_idle(agent_id) {
        Ok(()) => shared.events.publish(EngineEvent::AgentStatusChanged {
            agent_id,
            busy: false,
            at: Utc::now(),
        }),
        Err(e) => error!(agent_id = %agent_id, error = %e, "Could not mark agent idle"),
    }
}

pub(crate) fn publish_task(
    shared: &EngineShared,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    agent_id: Option<Uuid>,
) {
    debug!(task_id = %task_id, %from, %to, "Task transition");
    shared.events.publish(EngineEvent::TaskStatusChanged {
        task_id,
        from,
        to,
        agent_id,
        at: Utc::now(),
    });
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
