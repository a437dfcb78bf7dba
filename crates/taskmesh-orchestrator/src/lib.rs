//! Concurrent task orchestration engine for agent-based workers.
//!
//! Agents register with a handler and a role; tasks are submitted with a
//! priority and an opaque payload. A scheduler matches idle agents to pending
//! tasks under a single lock, a bounded worker pool runs the handlers with
//! timeouts and retries, and a graph executor drives DAG workflows on top
//! of ordinary task submissions.
//!
//! # Main types
//!
//! - [`Engine`]: Facade owning every component; the only entry point callers need.
//! - [`TaskStore`]: Task records plus the pending priority queue.
//! - [`AgentRegistry`]: Agents, their handlers, and their busy/idle state.
//! - [`Scheduler`]: Single-assignment matching of idle agents to pending tasks.
//! - [`GraphWorkflow`]: A DAG of [`GraphNode`]s submitted as one unit.
//! - [`EngineStatus`]: Read-only snapshot of agents, queue depth and metrics.

/// Engine tunables and TOML loading.
pub mod config;
/// Engine facade and shared state.
pub mod engine;
/// State-change events and observers.
pub mod events;
/// Worker pool and task execution.
pub mod executor;
/// DAG workflows.
pub mod graph;
/// Task handler trait and closure adapter.
pub mod handler;
/// Aggregate metrics and status snapshots.
pub mod monitor;
/// Agent registry.
pub mod registry;
/// Agent-to-task matching.
pub mod scheduler;
/// Task store and priority queue.
pub mod task_queue;
/// Shared types (Task, Agent, Priority, etc.).
pub mod types;

pub use config::EngineConfig;
pub use engine::Engine;
pub use events::{EngineEvent, EventBus, StateChangeCallback};
pub use executor::WorkerPool;
pub use graph::{GraphExecutor, GraphNode, GraphWorkflow, NodeResult, WorkflowState, WorkflowStatus};
pub use handler::{handler_fn, FnHandler, TaskHandler};
pub use monitor::{EngineMetrics, EngineStatus};
pub use registry::AgentRegistry;
pub use scheduler::{Assignment, Scheduler};
pub use task_queue::{FailureDisposition, TaskStore};
pub use types::{Agent, AgentRole, Priority, Task, TaskOutcome, TaskSpec, TaskStatus};
