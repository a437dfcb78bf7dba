//! Workflow (DAG) execution tests through the engine facade.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{Payload, TaskmeshError};
use taskmesh_orchestrator::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

/// Returns `input + 1` (or `value + 1`), failing when the payload says so.
fn step_handler(delay_ms: u64) -> Arc<dyn TaskHandler> {
    handler_fn(move |p: Payload| async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if p["fail"] == json!(true) {
            return Err(TaskmeshError::handler("node asked to fail"));
        }
        let base = p
            .get("input")
            .or_else(|| p.get("value"))
            .and_then(Payload::as_i64)
            .unwrap_or(0);
        Ok(json!(base + 1))
    })
}

fn engine_with_workers(workers: usize, delay_ms: u64) -> Engine {
    let config = EngineConfig::default()
        .with_default_max_retries(0)
        .with_workflow_poll_interval_ms(50);
    let engine = Engine::new(config).unwrap();
    for i in 0..workers {
        engine
            .register_agent(format!("w{i}"), step_handler(delay_ms), AgentRole::Worker, Vec::new())
            .unwrap();
    }
    engine.start();
    engine
}

fn diamond(fail_b: bool) -> GraphWorkflow {
    let b_payload = if fail_b {
        json!({ "use_output_from": "a", "fail": true })
    } else {
        json!({ "use_output_from": "a" })
    };
    GraphWorkflow::new("diamond")
        .with_node(GraphNode::new("a", "step", json!({ "value": 1 })))
        .and_then(|w| w.with_node(GraphNode::new("b", "step", b_payload).depends_on(["a"])))
        .and_then(|w| {
            w.with_node(GraphNode::new("c", "step", json!({ "use_output_from": "a" })).depends_on(["a"]))
        })
        .and_then(|w| {
            w.with_node(
                GraphNode::new("d", "step", json!({ "use_output_from": "b" })).depends_on(["b", "c"]),
            )
        })
        .unwrap()
}

#[tokio::test]
async fn test_diamond_completes_in_dependency_order() {
    let engine = engine_with_workers(2, 10);
    let id = engine.submit_workflow(diamond(false)).unwrap();
    let status = engine.wait_workflow(id, WAIT).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.completed_nodes, vec!["a", "b", "c", "d"]);
    assert!(status.failed_nodes.is_empty());
    assert!(status.blocked_nodes.is_empty());

    // a=2, b=c=3 (input from a), d=4 (input from b).
    assert_eq!(status.node_results["a"].result, Some(json!(2)));
    assert_eq!(status.node_results["b"].result, Some(json!(3)));
    assert_eq!(status.node_results["c"].result, Some(json!(3)));
    assert_eq!(status.node_results["d"].result, Some(json!(4)));

    let task = |node: &str| {
        engine
            .get_task(status.node_results[node].task_id.unwrap())
            .unwrap()
    };
    let (b, c, d) = (task("b"), task("c"), task("d"));
    let d_started = d.started_at.unwrap();
    assert!(d_started >= b.completed_at.unwrap());
    assert!(d_started >= c.completed_at.unwrap());
    assert_eq!(d.payload["input"], 3);

    let metrics = engine.metrics();
    assert_eq!(metrics.workflows_submitted, 1);
    assert_eq!(metrics.workflows_finished, 1);
    assert_eq!(metrics.completed_tasks, 4);
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let engine = engine_with_workers(2, 0);
    let id = engine.submit_workflow(diamond(true)).unwrap();
    let status = engine.wait_workflow(id, WAIT).await.unwrap();

    assert_eq!(status.state, WorkflowState::PartiallyFailed);
    assert_eq!(status.completed_nodes, vec!["a", "c"]);
    assert_eq!(status.failed_nodes, vec!["b"]);
    assert_eq!(status.blocked_nodes, vec!["d"]);

    let d = &status.node_results["d"];
    assert_eq!(d.status, TaskStatus::Pending);
    assert!(d.task_id.is_none());
    assert!(d.result.is_none());

    let b = &status.node_results["b"];
    assert_eq!(b.status, TaskStatus::DeadLetter);
    assert!(b.error.as_deref().unwrap().contains("node asked to fail"));
}

#[tokio::test]
async fn test_cycle_rejected_at_submission() {
    let engine = engine_with_workers(1, 0);
    let workflow = GraphWorkflow::new("loop")
        .with_node(GraphNode::new("a", "step", json!({})).depends_on(["b"]))
        .and_then(|w| w.with_node(GraphNode::new("b", "step", json!({})).depends_on(["a"])))
        .unwrap();

    let err = engine.submit_workflow(workflow).unwrap_err();
    assert!(matches!(err, TaskmeshError::InvalidArgument(_)));
    assert_eq!(engine.metrics().workflows_submitted, 0);
    assert!(engine.list_tasks().is_empty());
}

#[tokio::test]
async fn test_cancel_stops_further_submissions() {
    let engine = engine_with_workers(1, 100);
    let workflow = GraphWorkflow::new("chain")
        .with_node(GraphNode::new("a", "step", json!({ "value": 1 })))
        .and_then(|w| w.with_node(GraphNode::new("b", "step", json!({})).depends_on(["a"])))
        .unwrap();
    let id = engine.submit_workflow(workflow).unwrap();

    for _ in 0..200 {
        if !engine.workflow_status(id).unwrap().running_nodes.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.cancel_workflow(id).unwrap();

    let status = engine.wait_workflow(id, WAIT).await.unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert_eq!(status.completed_nodes, vec!["a"]);
    assert_eq!(status.blocked_nodes, vec!["b"]);
    assert_eq!(engine.list_tasks().len(), 1);
}

#[tokio::test]
async fn test_wait_times_out_while_engine_stopped() {
    let engine = engine_with_workers(1, 0);
    engine.stop(true).await;

    let workflow = GraphWorkflow::new("single")
        .with_node(GraphNode::new("only", "step", json!({ "value": 41 })))
        .unwrap();
    let id = engine.submit_workflow(workflow).unwrap();

    let err = engine
        .wait_workflow(id, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskmeshError::Timeout(_)));
    assert_eq!(engine.workflow_status(id).unwrap().state, WorkflowState::Running);

    engine.start();
    let status = engine.wait_workflow(id, WAIT).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.node_results["only"].result, Some(json!(42)));
}

#[tokio::test]
async fn test_specialist_handles_matching_nodes() {
    let engine = Engine::new(EngineConfig::default().with_default_max_retries(0)).unwrap();
    let reporter = engine
        .register_agent(
            "reporter",
            step_handler(0),
            AgentRole::Specialist,
            vec!["report".to_string()],
        )
        .unwrap();
    engine
        .register_agent("generic", step_handler(0), AgentRole::Worker, Vec::new())
        .unwrap();
    engine.start();

    let workflow = GraphWorkflow::new("mixed")
        .with_node(GraphNode::new("load", "load-data", json!({ "value": 0 })))
        .and_then(|w| {
            w.with_node(
                GraphNode::new("summary", "build-report", json!({ "use_output_from": "load" }))
                    .depends_on(["load"])
                    .with_priority(Priority::High),
            )
        })
        .unwrap();
    let id = engine.submit_workflow(workflow).unwrap();
    let status = engine.wait_workflow(id, WAIT).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    let summary = engine
        .get_task(status.node_results["summary"].task_id.unwrap())
        .unwrap();
    assert_eq!(summary.assigned_agent, Some(reporter));
    assert_eq!(summary.priority, Priority::High);
    assert_eq!(summary.result, Some(json!(2)));
}

#[tokio::test]
async fn test_workflow_events_published() {
    let engine = engine_with_workers(1, 0);
    let mut events = engine.subscribe();

    let workflow = GraphWorkflow::new("single")
        .with_node(GraphNode::new("only", "step", json!({})))
        .unwrap();
    let id = engine.submit_workflow(workflow).unwrap();
    engine.wait_workflow(id, WAIT).await.unwrap();

    let mut node_completed = false;
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::WorkflowNodeChanged {
                workflow_id,
                node_id,
                status: TaskStatus::Completed,
                ..
            } if workflow_id == id => {
                assert_eq!(node_id, "only");
                node_completed = true;
            }
            EngineEvent::WorkflowFinished {
                workflow_id,
                completed,
                failed,
                ..
            } if workflow_id == id => {
                assert_eq!((completed, failed), (1, 0));
                finished = true;
            }
            _ => {}
        }
    }
    assert!(node_completed);
    assert!(finished);
}

#[tokio::test]
async fn test_workflow_ids_are_unique_per_submission() {
    let engine = engine_with_workers(1, 0);
    let workflow = GraphWorkflow::new("once")
        .with_node(GraphNode::new("only", "step", json!({})))
        .unwrap();
    engine.submit_workflow(workflow.clone()).unwrap();
    assert!(matches!(
        engine.submit_workflow(workflow),
        Err(TaskmeshError::InvalidArgument(_))
    ));
}

fn seeded_diamond(name: &str, seed: i64) -> GraphWorkflow {
    GraphWorkflow::new(name)
        .with_node(GraphNode::new("a", "step", json!({ "value": seed })))
        .and_then(|w| w.with_node(GraphNode::new("b", "step", json!({ "use_output_from": "a" })).depends_on(["a"])))
        .and_then(|w| w.with_node(GraphNode::new("c", "step", json!({ "use_output_from": "a" })).depends_on(["a"])))
        .and_then(|w| {
            w.with_node(
                GraphNode::new("d", "step", json!({ "use_output_from": "c" })).depends_on(["b", "c"]),
            )
        })
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workflows_keep_their_own_results() {
    let engine = engine_with_workers(2, 20);
    let first = engine.submit_workflow(seeded_diamond("tens", 10)).unwrap();
    let second = engine.submit_workflow(seeded_diamond("hundreds", 100)).unwrap();

    // Both loops are live at once.
    assert_eq!(engine.workflow_status(first).unwrap().state, WorkflowState::Running);
    assert_eq!(engine.workflow_status(second).unwrap().state, WorkflowState::Running);

    let (tens, hundreds) = tokio::join!(
        engine.wait_workflow(first, WAIT),
        engine.wait_workflow(second, WAIT)
    );
    let (tens, hundreds) = (tens.unwrap(), hundreds.unwrap());

    for (status, seed) in [(&tens, 10), (&hundreds, 100)] {
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(status.node_results["a"].result, Some(json!(seed + 1)));
        assert_eq!(status.node_results["b"].result, Some(json!(seed + 2)));
        assert_eq!(status.node_results["c"].result, Some(json!(seed + 2)));
        assert_eq!(status.node_results["d"].result, Some(json!(seed + 3)));
    }
    assert_ne!(
        tens.node_results["a"].task_id,
        hundreds.node_results["a"].task_id
    );

    let metrics = engine.metrics();
    assert_eq!(metrics.workflows_submitted, 2);
    assert_eq!(metrics.workflows_finished, 2);
    assert_eq!(metrics.completed_tasks, 8);
}

#[tokio::test]
async fn test_node_with_empty_task_name_runs() {
    let engine = engine_with_workers(1, 0);
    let workflow = GraphWorkflow::new("unnamed")
        .with_node(GraphNode::new("a", "", json!({ "value": 4 })))
        .unwrap();
    let id = engine.submit_workflow(workflow).unwrap();
    let status = engine.wait_workflow(id, WAIT).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.node_results["a"].result, Some(json!(5)));
    assert!(status.node_results["a"].task_id.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_submission_launches_once() {
    let engine = Arc::new(engine_with_workers(1, 0));
    let workflow = GraphWorkflow::new("race")
        .with_node(GraphNode::new("only", "step", json!({})))
        .unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let workflow = workflow.clone();
            tokio::spawn(async move { engine.submit_workflow(workflow).is_ok() })
        })
        .collect();
    let mut accepted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);

    engine.wait_workflow(workflow.id, WAIT).await.unwrap();
    let metrics = engine.metrics();
    assert_eq!(metrics.workflows_submitted, 1);
    assert_eq!(metrics.workflows_finished, 1);
    assert_eq!(metrics.completed_tasks, 1);
}

#[tokio::test]
async fn test_evict_finished_workflow() {
    let engine = engine_with_workers(1, 0);
    engine.stop(false).await;
    let id = engine.submit_workflow(diamond(false)).unwrap();
    assert!(matches!(
        engine.evict_workflow(id),
        Err(TaskmeshError::InvalidArgument(_))
    ));

    engine.start();
    engine.wait_workflow(id, WAIT).await.unwrap();
    let status = engine.evict_workflow(id).unwrap();
    assert_eq!(status.state, WorkflowState::Completed);

    assert!(engine.workflow_status(id).unwrap_err().is_not_found());
    for node in status.node_results.values() {
        let task_id = node.task_id.unwrap();
        assert!(engine.get_task(task_id).unwrap_err().is_not_found());
    }
    assert_eq!(engine.metrics().workflows_finished, 1);
    assert!(engine.list_tasks().is_empty());
}
