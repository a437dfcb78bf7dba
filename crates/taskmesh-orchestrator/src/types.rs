use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use taskmesh_core::{Payload, TaskmeshError, TaskmeshResult};
use uuid::Uuid;

/// Urgency of a task. Lower numeric value means more urgent; the derived
/// `Ord` follows declaration order, so `Critical < Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Served before everything else.
    Critical = 1,
    High = 2,
    /// Default for new submissions.
    #[default]
    Normal = 3,
    Low = 4,
    /// Lowest band; retries never fall below it.
    Background = 5,
}

impl Priority {
    /// Every level, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric level (1 = most urgent).
    pub fn value(self) -> u8 {
        self as u8
    }

    /// One step less urgent, floored at [`Priority::Background`].
    pub fn downgrade(self) -> Self {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal => Priority::Low,
            Priority::Low | Priority::Background => Priority::Background,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = TaskmeshError;

    fn try_from(value: u8) -> TaskmeshResult<Self> {
        Priority::ALL
            .into_iter()
            .find(|p| p.value() == value)
            .ok_or_else(|| {
                TaskmeshError::InvalidArgument(format!(
                    "priority {value} is out of range (expected 1..=5)"
                ))
            })
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Role of an agent in the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Generalist; takes any pending task.
    Worker,
    /// Only takes tasks whose name matches one of its specialties.
    Specialist,
    /// Never auto-scheduled.
    Coordinator,
}

impl AgentRole {
    /// Whether the scheduler may hand tasks to agents of this role.
    pub fn is_schedulable(self) -> bool {
        !matches!(self, AgentRole::Coordinator)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Worker => write!(f, "worker"),
            AgentRole::Specialist => write!(f, "specialist"),
            AgentRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = TaskmeshError;

    fn from_str(s: &str) -> TaskmeshResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "worker" => Ok(AgentRole::Worker),
            "specialist" => Ok(AgentRole::Specialist),
            "coordinator" => Ok(AgentRole::Coordinator),
            other => Err(TaskmeshError::InvalidArgument(format!(
                "unknown agent role '{other}'"
            ))),
        }
    }
}

/// Snapshot of a registered agent. The registry hands out clones; mutating
/// one has no effect on the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    /// Lower-cased specialty keywords. Only consulted for Specialists.
    pub specialties: BTreeSet<String>,
    pub busy: bool,
    pub current_task: Option<Uuid>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Running mean over successful executions, in milliseconds.
    pub avg_execution_ms: f64,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        role: AgentRole,
        specialties: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            specialties: specialties
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            busy: false,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_execution_ms: 0.0,
            registered_at: now,
            last_active_at: now,
        }
    }

    /// Whether this agent may run a task with the given name.
    ///
    /// Specialists match when any specialty is a case-insensitive substring
    /// of the task name.
    pub fn accepts(&self, task_name: &str) -> bool {
        match self.role {
            AgentRole::Worker => true,
            AgentRole::Specialist => {
                let name = task_name.to_lowercase();
                self.specialties.iter().any(|s| name.contains(s.as_str()))
            }
            AgentRole::Coordinator => false,
        }
    }

    /// Fold a successful execution into the counters and running mean.
    pub fn record_success(&mut self, elapsed: Duration) {
        self.tasks_completed += 1;
        let n = self.tasks_completed as f64;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_execution_ms = (self.avg_execution_ms * (n - 1.0) + elapsed_ms) / n;
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }
}

/// Lifecycle of a task.
///
/// `Pending -> Assigned -> Running -> {Completed | Failed | TimedOut}`;
/// `Failed` goes back to `Pending` while retries remain, otherwise to
/// `DeadLetter`. `TimedOut` always ends in `DeadLetter` unless the engine is
/// configured to retry timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    TimedOut,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }

    /// Held by an agent.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// Everything a caller supplies when submitting a task. Unset fields fall
/// back to the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub payload: Payload,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: None,
            timeout_secs: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the priority from its numeric level (1 = critical .. 5 = background).
    pub fn with_priority_level(self, level: u8) -> TaskmeshResult<Self> {
        Ok(self.with_priority(Priority::try_from(level)?))
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// A task record owned by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub payload: Payload,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_agent: Option<Uuid>,
    pub result: Option<Payload>,
    pub error: Option<String>,
    /// One entry per failed attempt, oldest first.
    #[serde(default)]
    pub attempt_errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        payload: Payload,
        priority: Priority,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            attempt_errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_secs,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What a caller gets back when asking for a task's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Collapse into the handler's value, or the error that ended the task.
    pub fn into_result(self) -> TaskmeshResult<Payload> {
        match self.status {
            TaskStatus::Completed => Ok(self.result.unwrap_or(Payload::Null)),
            TaskStatus::DeadLetter => Err(TaskmeshError::Handler(
                self.error.unwrap_or_else(|| "task failed".to_string()),
            )),
            other => Err(TaskmeshError::Engine(format!(
                "task {} has not finished (status: {other})",
                self.task_id
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_downgrade_floors() {
        assert_eq!(Priority::Critical.downgrade(), Priority::High);
        assert_eq!(Priority::Low.downgrade(), Priority::Background);
        assert_eq!(Priority::Background.downgrade(), Priority::Background);
    }

    #[test]
    fn test_priority_try_from() {
        assert_eq!(Priority::try_from(2).unwrap(), Priority::High);
        assert!(matches!(
            Priority::try_from(0),
            Err(TaskmeshError::InvalidArgument(_))
        ));
        assert!(Priority::try_from(6).is_err());
    }

    #[test]
    fn test_task_spec_priority_level() {
        let spec = TaskSpec::new("t", serde_json::json!(null))
            .with_priority_level(5)
            .unwrap();
        assert_eq!(spec.priority, Some(Priority::Background));
        assert!(TaskSpec::new("t", serde_json::json!(null))
            .with_priority_level(9)
            .is_err());
    }

    #[test]
    fn test_agent_role_parse() {
        assert_eq!("Specialist".parse::<AgentRole>().unwrap(), AgentRole::Specialist);
        assert!("manager".parse::<AgentRole>().is_err());
        assert!(!AgentRole::Coordinator.is_schedulable());
    }

    #[test]
    fn test_specialist_matching_is_case_insensitive() {
        let agent = Agent::new("billing-bot", AgentRole::Specialist, vec!["Billing".to_string()]);
        assert!(agent.accepts("monthly-BILLING-report"));
        assert!(!agent.accepts("send-email"));
    }

    #[test]
    fn test_worker_accepts_anything_coordinator_nothing() {
        let worker = Agent::new("w", AgentRole::Worker, Vec::new());
        let coord = Agent::new("c", AgentRole::Coordinator, Vec::new());
        assert!(worker.accepts("send-email"));
        assert!(!coord.accepts("send-email"));
    }

    #[test]
    fn test_running_mean() {
        let mut agent = Agent::new("w", AgentRole::Worker, Vec::new());
        agent.record_success(Duration::from_millis(100));
        agent.record_success(Duration::from_millis(300));
        assert_eq!(agent.tasks_completed, 2);
        assert!((agent.avg_execution_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Running.is_active());
        assert_eq!(TaskStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("render", serde_json::json!(1), Priority::High, 30, 2);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert!(task.can_retry());
        assert_eq!(task.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_outcome_into_result() {
        let mut task = Task::new("t", Payload::Null, Priority::Normal, 1, 0);
        task.status = TaskStatus::DeadLetter;
        task.error = Some("boom".into());
        let err = TaskOutcome::from_task(&task).into_result().unwrap_err();
        assert!(err.to_string().contains("boom"));

        task.status = TaskStatus::Completed;
        task.result = Some(serde_json::json!(42));
        assert_eq!(TaskOutcome::from_task(&task).into_result().unwrap(), 42);
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::DeadLetter).unwrap();
        assert_eq!(json, "\"dead_letter\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::DeadLetter);
    }
}
