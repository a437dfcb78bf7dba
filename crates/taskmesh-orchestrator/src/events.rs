use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// A state transition inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskSubmitted {
        task_id: Uuid,
        name: String,
        at: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        agent_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        busy: bool,
        at: DateTime<Utc>,
    },
    WorkflowNodeChanged {
        workflow_id: Uuid,
        node_id: String,
        status: TaskStatus,
        at: DateTime<Utc>,
    },
    WorkflowFinished {
        workflow_id: Uuid,
        completed: usize,
        failed: usize,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Whether this event moved a task into a terminal status.
    pub fn is_task_terminal(&self) -> bool {
        matches!(self, EngineEvent::TaskStatusChanged { to, .. } if to.is_terminal())
    }
}

/// Callback invoked for every [`EngineEvent`].
pub type StateChangeCallback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Fan-out of engine events to any number of subscribers.
///
/// Publishing never blocks; slow subscribers lag and lose the oldest events
/// rather than holding up the scheduler.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is the normal case when nobody is observing.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Run `callback` for every future event on a dedicated task.
    ///
    /// A panicking callback is logged and the observer keeps going.
    pub fn spawn_observer(&self, callback: StateChangeCallback) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let cb = Arc::clone(&callback);
                        if std::panic::catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                            warn!(?event, "State change observer panicked");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State change observer lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed; observer exiting");
                        break;
                    }
                }
            }
        })
    }
}
