use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{self, WorkerPool};
use crate::graph::{GraphExecutor, GraphWorkflow, WorkflowStatus};
use crate::handler::TaskHandler;
use crate::monitor::{EngineMetrics, EngineStatus};
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use crate::task_queue::TaskStore;
use crate::types::{Agent, AgentRole, Task, TaskOutcome, TaskSpec, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::TaskmeshResult;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// State shared between the facade, the worker pool and workflow loops.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: AgentRegistry,
    pub(crate) store: TaskStore,
    pub(crate) scheduler: Scheduler,
    pub(crate) pool: WorkerPool,
    pub(crate) events: EventBus,
    pub(crate) graphs: GraphExecutor,
    running: AtomicBool,
}

impl EngineShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a scheduling pass and hand every new assignment to the pool.
    /// Does nothing while the engine is stopped.
    pub(crate) fn schedule(self: &Arc<Self>) {
        self.schedule_with(None);
    }

    /// Like [`schedule`](Self::schedule), reusing `spare` for the first
    /// assignment so a finishing execution can pass its slot straight on.
    pub(crate) fn schedule_with(self: &Arc<Self>, spare: Option<OwnedSemaphorePermit>) {
        if !self.is_running() {
            return;
        }
        let assignments = self
            .scheduler
            .run_pass(&self.store, &self.registry, self.pool.slots(), spare);
        if assignments.is_empty() {
            return;
        }
        debug!(assigned = assignments.len(), "Scheduling pass complete");
        for assignment in assignments {
            executor::publish_task(
                self,
                assignment.task_id,
                TaskStatus::Pending,
                TaskStatus::Assigned,
                Some(assignment.agent_id),
            );
            self.events.publish(EngineEvent::AgentStatusChanged {
                agent_id: assignment.agent_id,
                busy: true,
                at: Utc::now(),
            });
            executor::dispatch(self, assignment);
        }
    }

    /// Fill in configured defaults, queue the task and trigger a pass.
    pub(crate) fn submit(self: &Arc<Self>, spec: TaskSpec) -> TaskmeshResult<Uuid> {
        let task = Task::new(
            spec.name,
            spec.payload,
            spec.priority.unwrap_or_default(),
            spec.timeout_secs.unwrap_or(self.config.default_timeout_secs),
            spec.max_retries.unwrap_or(self.config.default_max_retries),
        );
        let name = task.name.clone();
        let priority = task.priority;
        let id = self.store.submit(task);
        info!(task_id = %id, task = %name, priority = %priority, "Task submitted");
        self.events.publish(EngineEvent::TaskSubmitted {
            task_id: id,
            name,
            at: Utc::now(),
        });
        self.schedule();
        Ok(id)
    }
}

/// The task engine: agents, a priority task store, a bounded worker pool
/// and DAG workflows on top.
///
/// A new engine starts stopped. Tasks may be submitted before [`start`]
/// and are assigned on the first pass after it.
///
/// Every method that can trigger a scheduling pass spawns Tokio tasks, so
/// the engine must be used from inside a Tokio runtime.
///
/// [`start`]: Engine::start
pub struct Engine {
    shared: Arc<EngineShared>,
    observers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create a stopped engine from a validated configuration.
    pub fn new(config: EngineConfig) -> TaskmeshResult<Self> {
        config.validate()?;
        info!(
            max_workers = config.max_workers,
            default_timeout_secs = config.default_timeout_secs,
            default_max_retries = config.default_max_retries,
            "Creating engine"
        );
        let shared = EngineShared {
            registry: AgentRegistry::new(),
            store: TaskStore::new(),
            scheduler: Scheduler::new(),
            pool: WorkerPool::new(config.max_workers),
            events: EventBus::new(config.event_buffer),
            graphs: GraphExecutor::new(),
            running: AtomicBool::new(false),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // --- Agents ---

    /// Register an agent. An idle agent is immediately offered pending work.
    pub fn register_agent(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        role: AgentRole,
        specialties: impl IntoIterator<Item = String>,
    ) -> TaskmeshResult<Uuid> {
        let id = self
            .shared
            .registry
            .register(name, handler, role, specialties)?;
        self.shared.schedule();
        Ok(id)
    }

    /// Snapshot of one agent, including its counters.
    pub fn agent(&self, id: Uuid) -> TaskmeshResult<Agent> {
        self.shared.registry.get(id)
    }

    /// All agents, in registration order.
    pub fn agents(&self) -> Vec<Agent> {
        self.shared.registry.list()
    }

    // --- Tasks ---

    /// Queue a task. Unset fields of `spec` take the configured defaults.
    /// The task is assigned as soon as the engine runs and an agent is free.
    pub fn submit_task(&self, spec: TaskSpec) -> TaskmeshResult<Uuid> {
        self.shared.submit(spec)
    }

    /// Snapshot of one task record.
    pub fn get_task(&self, id: Uuid) -> TaskmeshResult<Task> {
        self.shared.store.get(id)
    }

    /// Snapshot of every task, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.shared.store.list()
    }

    /// Pending task ids in the order the scheduler would consider them.
    pub fn pending_task_ids(&self) -> Vec<Uuid> {
        self.shared.store.peek()
    }

    /// Drop a finished task (`Completed` or `DeadLetter`) and return its
    /// final outcome. Lifetime metrics still count it.
    pub fn evict_task(&self, id: Uuid) -> TaskmeshResult<TaskOutcome> {
        let task = self.shared.store.evict(id)?;
        Ok(TaskOutcome::from_task(&task))
    }

    /// Current outcome of a task. With `wait`, block until the task is
    /// terminal or `timeout` elapses (`Timeout` error).
    pub async fn get_task_result(
        &self,
        id: Uuid,
        wait: bool,
        timeout: Option<Duration>,
    ) -> TaskmeshResult<TaskOutcome> {
        if wait {
            self.shared.store.await_result(id, timeout).await
        } else {
            Ok(TaskOutcome::from_task(&self.shared.store.get(id)?))
        }
    }

    // --- Lifecycle ---

    /// Resume scheduling and run a pass straight away.
    pub fn start(&self) {
        if !self.shared.running.swap(true, Ordering::SeqCst) {
            info!(
                agents = self.shared.registry.count(),
                pending = self.shared.store.pending_count(),
                "Engine started"
            );
        }
        self.shared.schedule();
    }

    /// Stop making new assignments. Submissions are still queued.
    ///
    /// With `drain`, resolve only once every in-flight execution is done.
    pub async fn stop(&self, drain: bool) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!(
                drain,
                in_flight = self.shared.pool.in_flight(),
                active_slots = self.shared.pool.active(),
                "Engine stopping"
            );
        }
        if drain {
            self.shared.pool.wait_idle().await;
            info!("Engine drained");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // --- Observability ---

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics::collect(&self.shared.registry, &self.shared.store, &self.shared.graphs)
    }

    /// Agents, queue depth and metrics in one snapshot.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            agents: self.agents(),
            pending_task_count: self.shared.store.pending_count(),
            metrics: self.metrics(),
        }
    }

    /// Receive every engine event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Invoke `callback` for every state change. A panicking callback is
    /// logged and never reaches the scheduler.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let handle = self.shared.events.spawn_observer(Arc::new(callback));
        self.observers.lock().push(handle);
    }

    // --- Workflows ---

    /// Validate and start a workflow. Returns the workflow id.
    pub fn submit_workflow(&self, workflow: GraphWorkflow) -> TaskmeshResult<Uuid> {
        self.shared.graphs.launch(&self.shared, workflow)
    }

    /// Live node partition and per-node results of a workflow.
    pub fn workflow_status(&self, id: Uuid) -> TaskmeshResult<WorkflowStatus> {
        self.shared.graphs.status(id)
    }

    /// Stop submitting the workflow's remaining nodes. Running nodes finish.
    pub fn cancel_workflow(&self, id: Uuid) -> TaskmeshResult<()> {
        self.shared.graphs.cancel(id)
    }

    /// Drop a finished workflow together with its node tasks and return
    /// its final status.
    pub fn evict_workflow(&self, id: Uuid) -> TaskmeshResult<WorkflowStatus> {
        let status = self.shared.graphs.evict(id)?;
        for (node_id, node) in &status.node_results {
            let Some(task_id) = node.task_id else {
                continue;
            };
            if let Err(e) = self.shared.store.evict(task_id) {
                debug!(workflow_id = %id, node = %node_id, error = %e, "Node task kept");
            }
        }
        Ok(status)
    }

    /// Block until the workflow finishes, or `timeout` elapses.
    pub async fn wait_workflow(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> TaskmeshResult<WorkflowStatus> {
        self.shared.graphs.wait(id, timeout).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for handle in self.observers.lock().drain(..) {
            handle.abort();
        }
    }
}
