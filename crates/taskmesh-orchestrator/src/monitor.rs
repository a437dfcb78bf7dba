use crate::graph::GraphExecutor;
use crate::registry::AgentRegistry;
use crate::task_queue::TaskStore;
use crate::types::Agent;
use serde::{Deserialize, Serialize};

/// Aggregate counters across the registry, the task store and workflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub agents_registered: u64,
    pub busy_agents: usize,
    pub idle_agents: usize,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub in_flight_tasks: usize,
    pub completed_tasks: usize,
    pub dead_letter_tasks: usize,
    pub timed_out_tasks: usize,
    pub retried_attempts: usize,
    /// Mean handler time over every successful execution, in milliseconds.
    pub avg_execution_ms: f64,
    pub workflows_submitted: u64,
    pub workflows_finished: u64,
}

impl EngineMetrics {
    /// Read-only snapshot. Each component is locked on its own, so counters
    /// from different components may be a few transitions apart.
    pub fn collect(registry: &AgentRegistry, store: &TaskStore, graphs: &GraphExecutor) -> Self {
        let agents = registry.list();
        let busy = agents.iter().filter(|a| a.busy).count();
        Self {
            agents_registered: registry.registered_total(),
            busy_agents: busy,
            idle_agents: agents.len() - busy,
            total_tasks: store.total_count(),
            pending_tasks: store.pending_count(),
            in_flight_tasks: store.in_flight_count(),
            completed_tasks: store.completed_count(),
            dead_letter_tasks: store.dead_letter_count(),
            timed_out_tasks: store.timed_out_count(),
            retried_attempts: store.retried_count(),
            avg_execution_ms: weighted_mean(&agents),
            workflows_submitted: graphs.submitted_count(),
            workflows_finished: graphs.finished_count(),
        }
    }
}

fn weighted_mean(agents: &[Agent]) -> f64 {
    let (total_ms, count) = agents.iter().fold((0.0, 0u64), |(ms, n), a| {
        (ms + a.avg_execution_ms * a.tasks_completed as f64, n + a.tasks_completed)
    });
    if count == 0 {
        0.0
    } else {
        total_ms / count as f64
    }
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub agents: Vec<Agent>,
    pub pending_task_count: usize,
    pub metrics: EngineMetrics,
}

impl EngineStatus {
    /// Serialize the status as JSON (for dashboards and the CLI).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "running": self.running,
            "agents": self.agents,
            "pending_task_count": self.pending_task_count,
            "metrics": self.metrics,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::types::{AgentRole, Priority, Task};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_empty_metrics() {
        let metrics = EngineMetrics::collect(
            &AgentRegistry::new(),
            &TaskStore::new(),
            &GraphExecutor::new(),
        );
        assert_eq!(metrics, EngineMetrics::default());
    }

    #[test]
    fn test_collect_counts() {
        let registry = AgentRegistry::new();
        let store = TaskStore::new();
        let handler = handler_fn(|p| async move { Ok(p) });
        let a = registry
            .register("a", handler.clone(), AgentRole::Worker, Vec::new())
            .unwrap();
        registry
            .register("b", handler, AgentRole::Worker, Vec::new())
            .unwrap();

        let t1 = store.submit(Task::new("t1", json!(1), Priority::Normal, 10, 0));
        store.submit(Task::new("t2", json!(2), Priority::Normal, 10, 0));
        store.assign(t1, a).unwrap();
        registry.mark_busy(a, t1).unwrap();

        let metrics = EngineMetrics::collect(&registry, &store, &GraphExecutor::new());
        assert_eq!(metrics.agents_registered, 2);
        assert_eq!(metrics.busy_agents, 1);
        assert_eq!(metrics.idle_agents, 1);
        assert_eq!(metrics.total_tasks, 2);
        assert_eq!(metrics.pending_tasks, 1);
        assert_eq!(metrics.in_flight_tasks, 1);
    }

    #[test]
    fn test_avg_execution_is_weighted_by_completions() {
        let registry = AgentRegistry::new();
        let handler = handler_fn(|p| async move { Ok(p) });
        let a = registry
            .register("a", handler.clone(), AgentRole::Worker, Vec::new())
            .unwrap();
        let b = registry
            .register("b", handler, AgentRole::Worker, Vec::new())
            .unwrap();
        registry.record_success(a, Duration::from_millis(10)).unwrap();
        registry.record_success(a, Duration::from_millis(10)).unwrap();
        registry.record_success(a, Duration::from_millis(10)).unwrap();
        registry.record_success(b, Duration::from_millis(50)).unwrap();

        let metrics = EngineMetrics::collect(&registry, &TaskStore::new(), &GraphExecutor::new());
        assert!((metrics.avg_execution_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_to_json() {
        let status = EngineStatus {
            running: true,
            agents: Vec::new(),
            pending_task_count: 3,
            metrics: EngineMetrics::default(),
        };
        let json = status.to_json();
        assert_eq!(json["running"], true);
        assert_eq!(json["pending_task_count"], 3);
        assert_eq!(json["metrics"]["completed_tasks"], 0);
    }
}
