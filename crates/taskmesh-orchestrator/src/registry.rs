use crate::handler::TaskHandler;
use crate::types::{Agent, AgentRole};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{TaskmeshError, TaskmeshResult};
use tracing::{debug, info};
use uuid::Uuid;

struct AgentEntry {
    agent: Agent,
    handler: Arc<dyn TaskHandler>,
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order; the scheduler walks agents in this order.
    entries: Vec<AgentEntry>,
    index: HashMap<Uuid, usize>,
}

impl RegistryInner {
    fn entry_mut(&mut self, id: Uuid) -> TaskmeshResult<&mut AgentEntry> {
        let idx = *self
            .index
            .get(&id)
            .ok_or_else(|| TaskmeshError::not_found("agent", id))?;
        Ok(&mut self.entries[idx])
    }

    fn entry(&self, id: Uuid) -> TaskmeshResult<&AgentEntry> {
        let idx = *self
            .index
            .get(&id)
            .ok_or_else(|| TaskmeshError::not_found("agent", id))?;
        Ok(&self.entries[idx])
    }
}

/// Owns every registered agent and its handler.
///
/// Pure bookkeeping: all reads return clones, and every mutation happens
/// under the registry's own lock. Agents are never removed.
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
    registered: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            registered: AtomicU64::new(0),
        }
    }

    /// Register a new agent and return its generated id.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        role: AgentRole,
        specialties: impl IntoIterator<Item = String>,
    ) -> TaskmeshResult<Uuid> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TaskmeshError::InvalidArgument(
                "agent name must not be empty".to_string(),
            ));
        }
        let agent = Agent::new(name, role, specialties);
        if role == AgentRole::Specialist && agent.specialties.is_empty() {
            return Err(TaskmeshError::InvalidArgument(format!(
                "specialist '{}' needs at least one specialty",
                agent.name
            )));
        }

        let id = agent.id;
        info!(agent_id = %id, agent = %agent.name, role = %role, "Registered agent");

        let mut inner = self.inner.lock();
        let idx = inner.entries.len();
        inner.entries.push(AgentEntry { agent, handler });
        inner.index.insert(id, idx);
        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Snapshot of one agent.
    pub fn get(&self, id: Uuid) -> TaskmeshResult<Agent> {
        Ok(self.inner.lock().entry(id)?.agent.clone())
    }

    pub fn handler(&self, id: Uuid) -> TaskmeshResult<Arc<dyn TaskHandler>> {
        Ok(Arc::clone(&self.inner.lock().entry(id)?.handler))
    }

    /// All agents, in registration order.
    pub fn list(&self) -> Vec<Agent> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.agent.clone())
            .collect()
    }

    /// Idle agents whose role the scheduler may use, in registration order.
    pub fn list_available(&self) -> Vec<Agent> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| !e.agent.busy && e.agent.role.is_schedulable())
            .map(|e| e.agent.clone())
            .collect()
    }

    /// Claim an idle agent for `task_id`. Fails if the agent is already busy.
    pub fn mark_busy(&self, id: Uuid, task_id: Uuid) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if entry.agent.busy {
            return Err(TaskmeshError::Engine(format!(
                "agent {id} is already running task {:?}",
                entry.agent.current_task
            )));
        }
        entry.agent.busy = true;
        entry.agent.current_task = Some(task_id);
        debug!(agent_id = %id, task_id = %task_id, "Agent busy");
        Ok(())
    }

    /// Release the agent after an execution and stamp `last_active_at`.
    pub fn mark_idle(&self, id: Uuid) -> TaskmeshResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        entry.agent.busy = false;
        entry.agent.current_task = None;
        entry.agent.last_active_at = Utc::now();
        debug!(agent_id = %id, "Agent idle");
        Ok(())
    }

    pub fn record_success(&self, id: Uuid, elapsed: Duration) -> TaskmeshResult<()> {
        self.inner.lock().entry_mut(id)?.agent.record_success(elapsed);
        Ok(())
    }

    pub fn record_failure(&self, id: Uuid) -> TaskmeshResult<()> {
        self.inner.lock().entry_mut(id)?.agent.record_failure();
        Ok(())
    }

    /// Agents currently registered.
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn busy_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.agent.busy)
            .count()
    }

    /// Total registrations over the registry's lifetime.
    pub fn registered_total(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
