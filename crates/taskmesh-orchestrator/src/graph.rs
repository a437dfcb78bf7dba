//! DAG workflows layered on top of the task engine.
//!
//! A workflow never calls handlers itself: every node becomes an ordinary
//! task submission once all of its dependencies have completed.

use crate::engine::EngineShared;
use crate::events::EngineEvent;
use crate::types::{Priority, TaskSpec, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{Payload, TaskmeshError, TaskmeshResult};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Payload key naming the dependency whose result a node wants as input.
pub const USE_OUTPUT_FROM: &str = "use_output_from";
/// Payload key the forwarded dependency result is stored under.
pub const INPUT_KEY: &str = "input";

/// A workflow-scoped task descriptor plus its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub task_name: String,
    pub payload: Payload,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default = "pending_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Payload>,
    #[serde(default)]
    pub error: Option<String>,
}

fn pending_status() -> TaskStatus {
    TaskStatus::Pending
}

impl GraphNode {
    pub fn new(id: impl Into<String>, task_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            task_name: task_name.into(),
            payload,
            dependencies: BTreeSet::new(),
            priority: Priority::default(),
            task_id: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The dependency named by the payload's `use_output_from`, if any.
    pub fn output_source(&self) -> Option<&str> {
        self.payload.get(USE_OUTPUT_FROM).and_then(Payload::as_str)
    }

    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// A named set of nodes with dependency edges between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphWorkflow {
    pub id: Uuid,
    pub name: String,
    pub nodes: BTreeMap<String, GraphNode>,
}

impl GraphWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Add a node, rejecting duplicate ids.
    pub fn add_node(&mut self, node: GraphNode) -> TaskmeshResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(TaskmeshError::InvalidArgument(format!(
                "duplicate node id '{}' in workflow '{}'",
                node.id, self.name
            )));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Builder form of [`add_node`](Self::add_node).
    pub fn with_node(mut self, node: GraphNode) -> TaskmeshResult<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Structural checks run before a workflow is accepted.
    pub fn validate(&self) -> TaskmeshResult<()> {
        if self.nodes.is_empty() {
            return Err(TaskmeshError::InvalidArgument(format!(
                "workflow '{}' has no nodes",
                self.name
            )));
        }
        for (id, node) in &self.nodes {
            if node.id != *id {
                return Err(TaskmeshError::InvalidArgument(format!(
                    "node key '{id}' does not match node id '{}'",
                    node.id
                )));
            }
            for dep in &node.dependencies {
                if dep == id {
                    return Err(TaskmeshError::InvalidArgument(format!(
                        "node '{id}' depends on itself"
                    )));
                }
                if !self.nodes.contains_key(dep) {
                    return Err(TaskmeshError::InvalidArgument(format!(
                        "node '{id}' depends on unknown node '{dep}'"
                    )));
                }
            }
            if let Some(source) = node.output_source() {
                if !node.dependencies.contains(source) {
                    return Err(TaskmeshError::InvalidArgument(format!(
                        "node '{id}' uses output of '{source}' without depending on it"
                    )));
                }
            }
        }
        if let Some(node) = self.find_cycle() {
            return Err(TaskmeshError::InvalidArgument(format!(
                "workflow '{}' has a dependency cycle through node '{node}'",
                self.name
            )));
        }
        Ok(())
    }

    /// A node on a dependency cycle, if one exists.
    pub fn find_cycle(&self) -> Option<String> {
        let mut visited: HashMap<&str, u8> = HashMap::new();
        for id in self.nodes.keys() {
            if let Some(hit) = self.dfs_cycle(id, &mut visited) {
                return Some(hit.to_string());
            }
        }
        None
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> Option<&'a str> {
        match visited.get(id) {
            Some(1) => return Some(id), // back edge
            Some(2) => return None,     // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependencies {
                if let Some(hit) = self.dfs_cycle(dep, visited) {
                    return Some(hit);
                }
            }
        }
        visited.insert(id, 2);
        None
    }
}

/// Where a workflow run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    /// Every node completed.
    Completed,
    /// Finished with failed nodes, or nodes blocked behind them.
    PartiallyFailed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_finished(self) -> bool {
        !matches!(self, WorkflowState::Running)
    }
}

/// Per-node view returned in a [`WorkflowStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: TaskStatus,
    pub task_id: Option<Uuid>,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

/// Snapshot of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub name: String,
    pub state: WorkflowState,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub running_nodes: Vec<String>,
    /// Never submitted: waiting on dependencies, or left behind by a
    /// failure or cancellation once the run finished.
    pub blocked_nodes: Vec<String>,
    pub node_results: BTreeMap<String, NodeResult>,
}

struct RunState {
    workflow: GraphWorkflow,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    running: BTreeSet<String>,
    state: WorkflowState,
}

impl RunState {
    fn is_settled(&self) -> bool {
        self.completed.len() + self.failed.len() == self.workflow.nodes.len()
    }

    fn untouched(&self) -> impl Iterator<Item = &GraphNode> {
        self.workflow.nodes.values().filter(|n| {
            !self.completed.contains(&n.id)
                && !self.failed.contains(&n.id)
                && !self.running.contains(&n.id)
        })
    }

    fn snapshot(&self) -> WorkflowStatus {
        WorkflowStatus {
            workflow_id: self.workflow.id,
            name: self.workflow.name.clone(),
            state: self.state,
            completed_nodes: self.completed.iter().cloned().collect(),
            failed_nodes: self.failed.iter().cloned().collect(),
            running_nodes: self.running.iter().cloned().collect(),
            blocked_nodes: self.untouched().map(|n| n.id.clone()).collect(),
            node_results: self
                .workflow
                .nodes
                .iter()
                .map(|(id, n)| {
                    (
                        id.clone(),
                        NodeResult {
                            status: n.status,
                            task_id: n.task_id,
                            result: n.result.clone(),
                            error: n.error.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Outcome of one scan over a workflow.
struct StepReport {
    settled: bool,
    running: usize,
}

struct WorkflowRun {
    state: Mutex<RunState>,
    cancel: watch::Sender<bool>,
    finished: watch::Sender<Option<WorkflowState>>,
}

impl WorkflowRun {
    /// Refresh running nodes from the task store, then submit every node
    /// whose dependencies are all complete.
    fn step(&self, shared: &Arc<EngineShared>, allow_submit: bool) -> StepReport {
        let mut st = self.state.lock();
        let workflow_id = st.workflow.id;

        let running: Vec<String> = st.running.iter().cloned().collect();
        for node_id in running {
            let Some(task_id) = st.workflow.nodes.get(&node_id).and_then(|n| n.task_id) else {
                continue;
            };
            let task = match shared.store.get(task_id) {
                Ok(task) => task,
                Err(e) => {
                    warn!(workflow_id = %workflow_id, node = %node_id, error = %e, "Node task vanished");
                    continue;
                }
            };
            let changed = st
                .workflow
                .nodes
                .get(&node_id)
                .is_some_and(|n| n.status != task.status);
            if let Some(node) = st.workflow.nodes.get_mut(&node_id) {
                node.status = task.status;
                match task.status {
                    TaskStatus::Completed => node.result = task.result.clone(),
                    TaskStatus::DeadLetter => node.error = task.error.clone(),
                    _ => {}
                }
            }
            match task.status {
                TaskStatus::Completed => {
                    st.running.remove(&node_id);
                    st.completed.insert(node_id.clone());
                    info!(workflow_id = %workflow_id, node = %node_id, "Workflow node completed");
                }
                TaskStatus::DeadLetter => {
                    st.running.remove(&node_id);
                    st.failed.insert(node_id.clone());
                    warn!(workflow_id = %workflow_id, node = %node_id, "Workflow node failed");
                }
                _ => {}
            }
            if changed {
                publish_node(shared, workflow_id, &node_id, task.status);
            }
        }

        if allow_submit {
            let ready: Vec<String> = st
                .untouched()
                .filter(|n| n.is_ready(&st.completed))
                .map(|n| n.id.clone())
                .collect();
            for node_id in ready {
                let Some(node) = st.workflow.nodes.get(&node_id) else {
                    continue;
                };
                let payload = resolve_payload(node, &st.workflow.nodes);
                let spec = TaskSpec::new(node.task_name.clone(), payload).with_priority(node.priority);
                match shared.submit(spec) {
                    Ok(task_id) => {
                        if let Some(node) = st.workflow.nodes.get_mut(&node_id) {
                            node.task_id = Some(task_id);
                            node.status = TaskStatus::Pending;
                        }
                        st.running.insert(node_id.clone());
                        debug!(workflow_id = %workflow_id, node = %node_id, task_id = %task_id, "Workflow node submitted");
                    }
                    Err(e) => {
                        if let Some(node) = st.workflow.nodes.get_mut(&node_id) {
                            node.status = TaskStatus::DeadLetter;
                            node.error = Some(e.to_string());
                        }
                        st.failed.insert(node_id.clone());
                        warn!(workflow_id = %workflow_id, node = %node_id, error = %e, "Workflow node submission failed");
                        publish_node(shared, workflow_id, &node_id, TaskStatus::DeadLetter);
                    }
                }
            }
        }

        StepReport {
            settled: st.is_settled(),
            running: st.running.len(),
        }
    }

    fn finish(&self, shared: &EngineShared, cancelled: bool) -> WorkflowState {
        let mut st = self.state.lock();
        let state = if cancelled {
            WorkflowState::Cancelled
        } else if st.failed.is_empty() && st.is_settled() {
            WorkflowState::Completed
        } else {
            WorkflowState::PartiallyFailed
        };
        st.state = state;
        let blocked = st.untouched().count();
        info!(
            workflow_id = %st.workflow.id,
            workflow = %st.workflow.name,
            completed = st.completed.len(),
            failed = st.failed.len(),
            blocked,
            state = ?state,
            "Workflow finished"
        );
        shared.events.publish(EngineEvent::WorkflowFinished {
            workflow_id: st.workflow.id,
            completed: st.completed.len(),
            failed: st.failed.len(),
            at: Utc::now(),
        });
        state
    }
}

fn publish_node(shared: &EngineShared, workflow_id: Uuid, node_id: &str, status: TaskStatus) {
    shared.events.publish(EngineEvent::WorkflowNodeChanged {
        workflow_id,
        node_id: node_id.to_string(),
        status,
        at: Utc::now(),
    });
}

/// Copy of the node's payload with its `use_output_from` dependency's
/// result injected under [`INPUT_KEY`].
fn resolve_payload(node: &GraphNode, nodes: &BTreeMap<String, GraphNode>) -> Payload {
    let mut payload = node.payload.clone();
    let forwarded = node
        .output_source()
        .and_then(|dep| nodes.get(dep))
        .and_then(|dep| dep.result.clone());
    if let (Some(result), Payload::Object(map)) = (forwarded, &mut payload) {
        map.insert(INPUT_KEY.to_string(), result);
    }
    payload
}

/// Owns every submitted workflow and its control loop.
pub struct GraphExecutor {
    runs: Mutex<HashMap<Uuid, Arc<WorkflowRun>>>,
    submitted: AtomicU64,
    finished: AtomicU64,
}

impl GraphExecutor {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            submitted: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        }
    }

    /// Validate `workflow` and start its control loop.
    pub(crate) fn launch(
        &self,
        shared: &Arc<EngineShared>,
        mut workflow: GraphWorkflow,
    ) -> TaskmeshResult<Uuid> {
        workflow.validate()?;
        for node in workflow.nodes.values_mut() {
            node.task_id = None;
            node.status = TaskStatus::Pending;
            node.result = None;
            node.error = None;
        }

        let id = workflow.id;
        let name = workflow.name.clone();
        let node_count = workflow.nodes.len();
        let (cancel, _) = watch::channel(false);
        let (finished, _) = watch::channel(None);
        let run = Arc::new(WorkflowRun {
            state: Mutex::new(RunState {
                workflow,
                completed: BTreeSet::new(),
                failed: BTreeSet::new(),
                running: BTreeSet::new(),
                state: WorkflowState::Running,
            }),
            cancel,
            finished,
        });
        match self.runs.lock().entry(id) {
            Entry::Occupied(_) => {
                return Err(TaskmeshError::InvalidArgument(format!(
                    "workflow {id} was already submitted"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&run));
            }
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(workflow_id = %id, workflow = %name, nodes = node_count, "Workflow submitted");

        let shared = Arc::clone(shared);
        tokio::spawn(async move { drive(&shared, &run).await });
        Ok(id)
    }

    fn run(&self, id: Uuid) -> TaskmeshResult<Arc<WorkflowRun>> {
        self.runs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| TaskmeshError::not_found("workflow", id))
    }

    /// Current snapshot of a running or finished workflow.
    pub fn status(&self, id: Uuid) -> TaskmeshResult<WorkflowStatus> {
        Ok(self.run(id)?.state.lock().snapshot())
    }

    /// Stop submitting further nodes. Nodes already running finish normally.
    pub fn cancel(&self, id: Uuid) -> TaskmeshResult<()> {
        let run = self.run(id)?;
        run.cancel.send_replace(true);
        info!(workflow_id = %id, "Workflow cancellation requested");
        Ok(())
    }

    /// Block until the workflow's loop exits, then return its final status.
    pub async fn wait(&self, id: Uuid, timeout: Option<Duration>) -> TaskmeshResult<WorkflowStatus> {
        let run = self.run(id)?;
        let mut rx = run.finished.subscribe();
        let wait = rx.wait_for(Option::is_some);
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TaskmeshError::Timeout(format!("workflow {id} did not finish within {limit:?}"))
            })?,
            None => wait.await,
        };
        waited.map_err(|_| TaskmeshError::Engine(format!("workflow {id} loop went away")))?;
        let status = run.state.lock().snapshot();
        Ok(status)
    }

    /// Forget a finished workflow and return its final status.
    pub fn evict(&self, id: Uuid) -> TaskmeshResult<WorkflowStatus> {
        let mut runs = self.runs.lock();
        let run = runs
            .get(&id)
            .ok_or_else(|| TaskmeshError::not_found("workflow", id))?;
        if run.finished.borrow().is_none() {
            return Err(TaskmeshError::InvalidArgument(format!(
                "workflow {id} is still running"
            )));
        }
        let status = run.state.lock().snapshot();
        runs.remove(&id);
        debug!(workflow_id = %id, "Workflow evicted");
        Ok(status)
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn finished_count(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}

impl Default for GraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Control loop for one workflow. Wakes on task terminal events, on
/// cancellation, and on a fallback tick.
async fn drive(shared: &Arc<EngineShared>, run: &Arc<WorkflowRun>) {
    let mut events = shared.events.subscribe();
    let mut cancel_rx = run.cancel.subscribe();
    let mut tick = tokio::time::interval(shared.config.workflow_poll_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let cancelled = loop {
        let cancelled = *cancel_rx.borrow_and_update();
        let report = run.step(shared, !cancelled);
        if report.settled {
            break cancelled;
        }
        if report.running == 0 {
            // Nothing in flight and nothing submittable: the rest is either
            // blocked behind a failure or cut off by cancellation.
            break cancelled;
        }
        wait_for_progress(&mut events, &mut cancel_rx, &mut tick).await;
    };

    let state = run.finish(shared, cancelled);
    shared.graphs.finished.fetch_add(1, Ordering::Relaxed);
    run.finished.send_replace(Some(state));
}

async fn wait_for_progress(
    events: &mut broadcast::Receiver<EngineEvent>,
    cancel_rx: &mut watch::Receiver<bool>,
    tick: &mut tokio::time::Interval,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.is_task_terminal() => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    tick.tick().await;
                    return;
                }
            },
            _ = tick.tick() => return,
            _ = cancel_rx.changed() => return,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diamond() -> GraphWorkflow {
        GraphWorkflow::new("diamond")
            .with_node(GraphNode::new("a", "step", json!({"value": 1})))
            .and_then(|w| w.with_node(GraphNode::new("b", "step", json!({"use_output_from": "a"})).depends_on(["a"])))
            .and_then(|w| w.with_node(GraphNode::new("c", "step", json!({"use_output_from": "a"})).depends_on(["a"])))
            .and_then(|w| w.with_node(GraphNode::new("d", "step", json!({"use_output_from": "b"})).depends_on(["b", "c"])))
            .unwrap()
    }

    #[test]
    fn test_valid_diamond() {
        let wf = diamond();
        assert!(wf.validate().is_ok());
        assert!(wf.find_cycle().is_none());
        assert_eq!(wf.node("d").unwrap().output_source(), Some("b"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut wf = GraphWorkflow::new("dup");
        wf.add_node(GraphNode::new("a", "t", json!(null))).unwrap();
        assert!(wf.add_node(GraphNode::new("a", "t", json!(null))).is_err());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(GraphWorkflow::new("empty").validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = GraphWorkflow::new("bad")
            .with_node(GraphNode::new("a", "t", json!(null)).depends_on(["ghost"]))
            .unwrap();
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_output_source_must_be_dependency() {
        let wf = GraphWorkflow::new("bad")
            .with_node(GraphNode::new("a", "t", json!(null)))
            .and_then(|w| w.with_node(GraphNode::new("b", "t", json!({"use_output_from": "a"}))))
            .unwrap();
        assert!(matches!(wf.validate(), Err(TaskmeshError::InvalidArgument(_))));
    }

    #[test]
    fn test_cycle_detection() {
        let wf = GraphWorkflow::new("loop")
            .with_node(GraphNode::new("a", "t", json!(null)).depends_on(["c"]))
            .and_then(|w| w.with_node(GraphNode::new("b", "t", json!(null)).depends_on(["a"])))
            .and_then(|w| w.with_node(GraphNode::new("c", "t", json!(null)).depends_on(["b"])))
            .unwrap();
        assert!(wf.find_cycle().is_some());
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let wf = GraphWorkflow::new("self")
            .with_node(GraphNode::new("a", "t", json!(null)).depends_on(["a"]))
            .unwrap();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_is_ready() {
        let wf = diamond();
        let mut completed = BTreeSet::new();
        assert!(wf.node("a").unwrap().is_ready(&completed));
        assert!(!wf.node("b").unwrap().is_ready(&completed));
        completed.insert("a".to_string());
        completed.insert("b".to_string());
        assert!(!wf.node("d").unwrap().is_ready(&completed));
        completed.insert("c".to_string());
        assert!(wf.node("d").unwrap().is_ready(&completed));
    }

    #[test]
    fn test_resolve_payload_injects_result() {
        let mut wf = diamond();
        wf.nodes.get_mut("b").unwrap().result = Some(json!(7));
        let d = wf.node("d").unwrap().clone();
        let payload = resolve_payload(&d, &wf.nodes);
        assert_eq!(payload[INPUT_KEY], 7);
        assert_eq!(payload[USE_OUTPUT_FROM], "b");

        // Non-object payloads pass through untouched.
        let plain = GraphNode::new("x", "t", json!(3));
        assert_eq!(resolve_payload(&plain, &wf.nodes), json!(3));
    }

    #[test]
    fn test_workflow_deserializes_with_defaults() {
        let node: GraphNode = serde_json::from_value(json!({
            "id": "a",
            "task_name": "step",
            "payload": {"value": 1}
        }))
        .unwrap();
        assert_eq!(node.status, TaskStatus::Pending);
        assert_eq!(node.priority, Priority::Normal);
        assert!(node.dependencies.is_empty());
    }
}
