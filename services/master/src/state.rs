//! Master bookkeeping: frameworks, slaves, tasks and outstanding offers.
//!
//! These are plain data owned by the master actor. Nothing here talks to
//! another actor; the master decides when to tell the allocator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_id::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
use corral_protocol::{ExecutorInfo, FrameworkInfo, MasterInfo, Offer, SlaveInfo, TaskInfo, TaskState};
use corral_resources::Resources;
use serde::{Deserialize, Serialize};

use crate::actors::TimerHandle;
use crate::clock::Instant;
use crate::endpoints::{SchedulerEndpoint, SlaveEndpoint};

/// Tasks are named by their framework, so the framework is part of the key.
pub type TaskKey = (FrameworkId, TaskId);

// =============================================================================
// Frameworks
// =============================================================================

#[derive(Debug)]
pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    /// `None` while the scheduler is disconnected.
    pub endpoint: Option<Arc<dyn SchedulerEndpoint>>,
    pub registered_at: DateTime<Utc>,
    pub offers: HashSet<OfferId>,
    /// Bumped whenever the framework (de)activates so late failover results
    /// for an earlier disconnect can be told apart.
    pub generation: u64,
    /// Fallback removal timer used when the store could not schedule one.
    pub failover_timer: Option<TimerHandle>,
}

impl Framework {
    pub fn new(id: FrameworkId, info: FrameworkInfo, endpoint: Arc<dyn SchedulerEndpoint>) -> Self {
        Self {
            id,
            info,
            endpoint: Some(endpoint),
            registered_at: Utc::now(),
            offers: HashSet::new(),
            generation: 0,
            failover_timer: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Drop the scheduler endpoint and cancel any fallback timer.
    pub fn disconnect(&mut self) -> Option<Arc<dyn SchedulerEndpoint>> {
        self.generation += 1;
        self.cancel_failover_timer();
        self.endpoint.take()
    }

    /// Install a new endpoint, returning the one it replaces.
    pub fn reconnect(
        &mut self,
        endpoint: Arc<dyn SchedulerEndpoint>,
    ) -> Option<Arc<dyn SchedulerEndpoint>> {
        self.generation += 1;
        self.cancel_failover_timer();
        self.endpoint.replace(endpoint)
    }

    fn cancel_failover_timer(&mut self) {
        if let Some(timer) = self.failover_timer.take() {
            timer.cancel();
        }
    }
}

// =============================================================================
// Slaves
// =============================================================================

#[derive(Debug)]
pub struct Slave {
    pub id: SlaveId,
    pub info: SlaveInfo,
    pub endpoint: Arc<dyn SlaveEndpoint>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub tasks: HashSet<TaskKey>,
    pub offers: HashSet<OfferId>,
    pub executors: HashMap<FrameworkId, HashMap<ExecutorId, ExecutorInfo>>,
}

impl Slave {
    pub fn new(id: SlaveId, info: SlaveInfo, endpoint: Arc<dyn SlaveEndpoint>, now: Instant) -> Self {
        Self {
            id,
            info,
            endpoint,
            registered_at: Utc::now(),
            last_seen: now,
            tasks: HashSet::new(),
            offers: HashSet::new(),
            executors: HashMap::new(),
        }
    }

    pub fn executor(&self, framework_id: FrameworkId, executor_id: &ExecutorId) -> Option<&ExecutorInfo> {
        self.executors
            .get(&framework_id)
            .and_then(|executors| executors.get(executor_id))
    }

    pub fn add_executor(&mut self, framework_id: FrameworkId, executor: ExecutorInfo) {
        self.executors
            .entry(framework_id)
            .or_default()
            .insert(executor.executor_id.clone(), executor);
    }

    pub fn remove_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<ExecutorInfo> {
        let executors = self.executors.get_mut(&framework_id)?;
        let removed = executors.remove(executor_id);
        if executors.is_empty() {
            self.executors.remove(&framework_id);
        }
        removed
    }
}

// =============================================================================
// Tasks and Offers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    pub resources: Resources,
    pub state: TaskState,
}

impl Task {
    pub fn staging(framework_id: FrameworkId, info: &TaskInfo) -> Self {
        Self {
            task_id: info.task_id.clone(),
            framework_id,
            slave_id: info.slave_id,
            executor_id: info.executor_id().cloned(),
            resources: info.resources.clone(),
            state: TaskState::Staging,
        }
    }

    pub fn key(&self) -> TaskKey {
        (self.framework_id, self.task_id.clone())
    }
}

#[derive(Debug)]
pub struct OutstandingOffer {
    pub offer: Offer,
    pub issued_at: Instant,
    /// Expiry, when offers time out.
    pub timer: Option<TimerHandle>,
}

// =============================================================================
// Stats and Snapshots
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    pub frameworks_registered: u64,
    pub slaves_registered: u64,
    pub slaves_lost: u64,
    pub offers_issued: u64,
    pub offers_declined: u64,
    pub offers_rescinded: u64,
    pub offers_timed_out: u64,
    pub tasks_launched: u64,
    pub invalid_launches: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    pub tasks_killed: u64,
    pub tasks_lost: u64,
    pub status_updates: u64,
    pub framework_messages: u64,
    /// Task resources handed back to the allocator.
    pub reclamations: u64,
}

impl MasterStats {
    pub fn record_terminal(&mut self, state: TaskState) {
        match state {
            TaskState::Finished => self.tasks_finished += 1,
            TaskState::Failed => self.tasks_failed += 1,
            TaskState::Killed => self.tasks_killed += 1,
            TaskState::Lost => self.tasks_lost += 1,
            TaskState::Staging | TaskState::Starting | TaskState::Running => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkSummary {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub tasks: usize,
    pub offers: usize,
    pub used: Resources,
    pub offered: Resources,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlaveSummary {
    pub id: SlaveId,
    pub hostname: String,
    pub registered_at: DateTime<Utc>,
    pub total: Resources,
    /// Tasks plus executors.
    pub used: Resources,
    pub offered: Resources,
    pub tasks: usize,
}

/// Point-in-time view of the master for tests and operators.
#[derive(Debug, Clone, Serialize)]
pub struct MasterState {
    pub master: MasterInfo,
    pub leading: bool,
    pub frameworks: Vec<FrameworkSummary>,
    pub slaves: Vec<SlaveSummary>,
    pub offers: Vec<Offer>,
    pub tasks: Vec<Task>,
    pub stats: MasterStats,
}

impl MasterState {
    pub fn framework(&self, id: FrameworkId) -> Option<&FrameworkSummary> {
        self.frameworks.iter().find(|f| f.id == id)
    }

    pub fn slave(&self, id: SlaveId) -> Option<&SlaveSummary> {
        self.slaves.iter().find(|s| s.id == id)
    }

    pub fn task(&self, framework_id: FrameworkId, task_id: &TaskId) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.framework_id == framework_id && &t.task_id == task_id)
    }
}
