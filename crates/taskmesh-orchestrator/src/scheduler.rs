use crate::registry::AgentRegistry;
use crate::task_queue::TaskStore;
use crate::types::Agent;
use parking_lot::Mutex;
use std::sync::Arc;
use taskmesh_core::TaskmeshResult;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};
use uuid::Uuid;

/// A task bound to an agent by a scheduling pass, ready for the worker pool.
///
/// Holds the worker slot claimed for it; dropping the assignment frees the slot.
#[derive(Debug)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub(crate) slot: OwnedSemaphorePermit,
}

/// Matching policy between idle agents and pending tasks.
///
/// Every pass runs under one scheduling lock, so two passes can never hand
/// the same task or the same agent out twice.
#[derive(Debug, Default)]
pub struct Scheduler {
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first candidate `agent` may take, walking in queue order.
    ///
    /// Workers take the head of the queue; Specialists take the first task
    /// whose name contains one of their specialties, or nothing at all.
    pub fn select(agent: &Agent, candidates: &[(Uuid, String)]) -> Option<usize> {
        candidates.iter().position(|(_, name)| agent.accepts(name))
    }

    /// Run one assignment pass over idle agents in registration order.
    ///
    /// Each match claims a worker slot and is committed immediately (task
    /// `Assigned`, agent busy); nothing is rolled back once the pass moves on.
    /// `spare` is a slot handed over by a finishing execution and is used
    /// before any slot from `slots`. The pass ends early when no slot is
    /// free, so a task is never bound while a higher-priority one waits.
    pub fn run_pass(
        &self,
        store: &TaskStore,
        registry: &AgentRegistry,
        slots: &Arc<Semaphore>,
        spare: Option<OwnedSemaphorePermit>,
    ) -> Vec<Assignment> {
        let _guard = self.pass_lock.lock();
        // Declared after the guard so an unused spare returns to the pool
        // before the next pass can look for free slots.
        let mut spare = spare;

        let mut candidates = store.pending_candidates();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut assignments = Vec::new();
        for agent in registry.list_available() {
            if candidates.is_empty() {
                break;
            }
            let Some(idx) = Self::select(&agent, &candidates) else {
                debug!(agent = %agent.name, role = %agent.role, "No matching task for agent");
                continue;
            };
            let slot = match spare.take() {
                Some(slot) => slot,
                None => match Arc::clone(slots).try_acquire_owned() {
                    Ok(slot) => slot,
                    Err(_) => {
                        debug!(assigned = assignments.len(), "No free worker slot; ending pass");
                        break;
                    }
                },
            };
            let (task_id, task_name) = candidates.remove(idx);

            match Self::bind(store, registry, task_id, &agent) {
                Ok(()) => {
                    debug!(task_id = %task_id, task = %task_name, agent = %agent.name, "Task assigned");
                    assignments.push(Assignment {
                        task_id,
                        agent_id: agent.id,
                        agent_name: agent.name.clone(),
                        slot,
                    });
                }
                Err(e) => {
                    error!(
                        task_id = %task_id,
                        agent_id = %agent.id,
                        error = %e,
                        "Scheduling invariant violated; skipping candidate"
                    );
                    debug_assert!(false, "scheduling invariant violated: {e}");
                }
            }
        }
        assignments
    }

    fn bind(
        store: &TaskStore,
        registry: &AgentRegistry,
        task_id: Uuid,
        agent: &Agent,
    ) -> TaskmeshResult<()> {
        store.assign(task_id, agent.id)?;
        if let Err(e) = registry.mark_busy(agent.id, task_id) {
            store.release(task_id)?;
            return Err(e);
        }
        Ok(())
    }
}
