//! Protocol payload types.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use corral_id::{ExecutorId, FrameworkId, MasterId, OfferId, SlaveId, TaskId};
use corral_resources::Resources;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role frameworks fall into when they do not name one.
pub const DEFAULT_ROLE: &str = "*";

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

// =============================================================================
// Identity
// =============================================================================

/// Descriptive metadata a framework registers with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
    /// Fairness group; frameworks in the same role share its allocation.
    #[serde(default = "default_role")]
    pub role: String,
    /// How long the master keeps a disconnected framework before removing it.
    #[serde(default)]
    pub failover_timeout: Duration,
}

impl FrameworkInfo {
    pub fn new(name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            role: default_role(),
            failover_timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    #[must_use]
    pub fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout = timeout;
        self
    }
}

/// Identity of the leading master, returned on (re-)registration so a
/// framework can check who it is talking to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: MasterId,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MasterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub hostname: String,
    pub resources: Resources,
}

// =============================================================================
// Tasks and executors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub command: String,
    /// Held from the executor's first task until the slave reports its exit.
    pub resources: Resources,
}

/// A task as described by the framework in a launch request.
///
/// Exactly one of `executor` and `command` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub slave_id: SlaveId,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub data: Bytes,
}

impl TaskInfo {
    /// A task run directly by the slave's built-in command runner.
    pub fn command(
        task_id: TaskId,
        slave_id: SlaveId,
        resources: Resources,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: task_id.to_string(),
            task_id,
            slave_id,
            resources,
            executor: None,
            command: Some(command.into()),
            data: Bytes::new(),
        }
    }

    /// A task handed to a framework-provided executor.
    pub fn with_executor(
        task_id: TaskId,
        slave_id: SlaveId,
        resources: Resources,
        executor: ExecutorInfo,
    ) -> Self {
        Self {
            name: task_id.to_string(),
            task_id,
            slave_id,
            resources,
            executor: Some(executor),
            command: None,
            data: Bytes::new(),
        }
    }

    pub fn executor_id(&self) -> Option<&ExecutorId> {
        self.executor.as_ref().map(|e| &e.executor_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    /// Terminal states release the task's resources.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Position in the non-terminal progression; terminal states rank last.
    fn rank(&self) -> u8 {
        match self {
            TaskState::Staging => 0,
            TaskState::Starting => 1,
            TaskState::Running => 2,
            _ => 3,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<SlaveId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            slave_id: None,
            message: None,
            data: None,
        }
    }

    #[must_use]
    pub fn on_slave(mut self, slave_id: SlaveId) -> Self {
        self.slave_id = Some(slave_id);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A task status on its way from a slave (or the master) to a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    /// Identifies this update for acknowledgement.
    pub uuid: Uuid,
}

impl StatusUpdate {
    pub fn new(framework_id: FrameworkId, status: TaskStatus) -> Self {
        Self {
            framework_id,
            executor_id: None,
            status,
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn from_executor(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = Some(executor_id);
        self
    }
}

// =============================================================================
// Offers and requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub hostname: String,
    pub resources: Resources,
}

/// A framework's hint about resources it would like to be offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<SlaveId>,
    pub resources: Resources,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Staging, false)]
    #[case(TaskState::Starting, false)]
    #[case(TaskState::Running, false)]
    #[case(TaskState::Finished, true)]
    #[case(TaskState::Failed, true)]
    #[case(TaskState::Killed, true)]
    #[case(TaskState::Lost, true)]
    fn test_terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn test_state_only_moves_forward() {
        assert!(TaskState::Staging.can_advance_to(TaskState::Running));
        assert!(TaskState::Running.can_advance_to(TaskState::Finished));
        assert!(!TaskState::Running.can_advance_to(TaskState::Starting));
        assert!(!TaskState::Running.can_advance_to(TaskState::Running));
        assert!(!TaskState::Finished.can_advance_to(TaskState::Lost));
    }

    #[test]
    fn test_framework_info_defaults_role() {
        let info: FrameworkInfo =
            serde_json::from_str(r#"{"name":"web","user":"svc"}"#).unwrap();
        assert_eq!(info.role, DEFAULT_ROLE);
        assert_eq!(info.failover_timeout, Duration::ZERO);
    }

    #[test]
    fn test_task_state_json() {
        let json = serde_json::to_string(&TaskState::Lost).unwrap();
        assert_eq!(json, "\"LOST\"");
        assert_eq!(TaskState::Lost.to_string(), "TASK_LOST");
    }

    #[test]
    fn test_offer_serializes_resources_as_text() {
        let offer = Offer {
            id: OfferId::new(),
            framework_id: FrameworkId::new(),
            slave_id: SlaveId::new(),
            hostname: "host1".into(),
            resources: Resources::parse("cpus:2;mem:1024").unwrap(),
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["resources"], "cpus:2;mem:1024");
    }

    #[test]
    fn test_status_updates_get_distinct_uuids() {
        let fw = FrameworkId::new();
        let task = TaskId::parse("t1").unwrap();
        let a = StatusUpdate::new(fw, TaskStatus::new(task.clone(), TaskState::Running));
        let b = StatusUpdate::new(fw, TaskStatus::new(task, TaskState::Running));
        assert_ne!(a.uuid, b.uuid);
    }
}
