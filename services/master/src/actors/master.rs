//! Master actor - the authoritative view of frameworks, slaves, tasks and
//! outstanding offers.
//!
//! The master drives offers and tasks through their lifecycles:
//!
//! ```text
//! Offer: ISSUED -> { ACCEPTED | DECLINED | RESCINDED | TIMED_OUT }
//! Task:  STAGING -> STARTING -> RUNNING -> { FINISHED | FAILED | KILLED | LOST }
//! ```
//!
//! It never edits the allocator's ledger. Every resource movement is a
//! message: unused parts of offers go back through `resources_unused`,
//! finished tasks, exited executors and rescinded or expired offers through
//! `resources_recovered`. A task's resources are recovered at most once:
//! the task record is removed on its first terminal update and later
//! duplicates find nothing to recover.
//!
//! Endpoint failures are not handled inline. A failed call marks the party
//! unreachable and the master deals with it after the current message, so a
//! sweep over many tasks is never interrupted by a nested removal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
use corral_protocol::{
    ExecutorInfo, FrameworkInfo, MasterInfo, Offer, ResourceRequest, SlaveInfo, StatusUpdate,
    TaskInfo, TaskState, TaskStatus,
};
use corral_resources::Resources;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::allocator::AllocatorHandle;
use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use super::frameworks::{FrameworksError, FrameworksStoreHandle};
use crate::clock;
use crate::detector::MasterDetector;
use crate::endpoints::{EndpointError, SchedulerEndpoint, SlaveEndpoint};
use crate::launch::{validate_launch, LaunchError};
use crate::state::{
    Framework, FrameworkSummary, MasterState, MasterStats, OutstandingOffer, Slave, SlaveSummary,
    Task, TaskKey,
};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Outstanding offers are rescinded after this long. `None` keeps them
    /// until they are used or declined.
    pub offer_timeout: Option<Duration>,

    /// A slave not heard from for this long is considered lost.
    pub slave_ping_timeout: Duration,

    pub health_check_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            offer_timeout: None,
            slave_ping_timeout: Duration::from_secs(75),
            health_check_interval: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug)]
pub enum MasterMessage {
    // Framework lifecycle
    RegisterFramework {
        info: FrameworkInfo,
        endpoint: Arc<dyn SchedulerEndpoint>,
    },
    ReregisterFramework {
        framework_id: FrameworkId,
        info: FrameworkInfo,
        endpoint: Arc<dyn SchedulerEndpoint>,
        /// A new scheduler instance taking over the framework.
        failover: bool,
    },
    UnregisterFramework {
        framework_id: FrameworkId,
    },
    DeactivateFramework {
        framework_id: FrameworkId,
    },
    /// The store resolved the removal armed when the framework disconnected.
    FrameworkFailoverExpired {
        framework_id: FrameworkId,
        generation: u64,
        result: Result<bool, FrameworksError>,
    },
    /// Local fallback for the store's removal timer.
    FrameworkFailoverTimeout {
        framework_id: FrameworkId,
        generation: u64,
    },

    // Scheduler commands
    ResourceRequest {
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    },
    LaunchTasks {
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskInfo>,
    },
    DeclineOffer {
        framework_id: FrameworkId,
        offer_id: OfferId,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    StatusUpdateAcknowledgement {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        task_id: TaskId,
        uuid: Uuid,
    },
    FrameworkToExecutor {
        framework_id: FrameworkId,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    },

    // Slave lifecycle
    RegisterSlave {
        info: SlaveInfo,
        endpoint: Arc<dyn SlaveEndpoint>,
    },
    ReregisterSlave {
        slave_id: SlaveId,
        info: SlaveInfo,
        endpoint: Arc<dyn SlaveEndpoint>,
        executors: Vec<(FrameworkId, ExecutorInfo)>,
        tasks: Vec<Task>,
    },
    UnregisterSlave {
        slave_id: SlaveId,
    },
    SlaveHeartbeat {
        slave_id: SlaveId,
    },

    // Slave reports
    StatusUpdate {
        slave_id: SlaveId,
        update: StatusUpdate,
    },
    ExecutorToFramework {
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Bytes,
    },
    ExitedExecutor {
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },

    // Allocator and timers
    ResourcesOffered {
        framework_id: FrameworkId,
        offers: HashMap<SlaveId, Resources>,
    },
    OfferTimeout {
        offer_id: OfferId,
    },
    HealthCheck,

    GetState {
        reply_to: oneshot::Sender<MasterState>,
    },
}

// =============================================================================
// Actor State
// =============================================================================

pub struct MasterActor {
    info: MasterInfo,
    config: MasterConfig,
    detector: MasterDetector,
    allocator: AllocatorHandle,
    store: FrameworksStoreHandle,

    frameworks: HashMap<FrameworkId, Framework>,
    slaves: HashMap<SlaveId, Slave>,
    tasks: HashMap<TaskKey, Task>,
    offers: HashMap<OfferId, OutstandingOffer>,
    stats: MasterStats,

    /// Parties whose endpoint failed while handling the current message.
    unreachable_frameworks: Vec<FrameworkId>,
    unreachable_slaves: Vec<SlaveId>,
}

impl MasterActor {
    pub fn new(
        info: MasterInfo,
        config: MasterConfig,
        detector: MasterDetector,
        allocator: AllocatorHandle,
        store: FrameworksStoreHandle,
    ) -> Self {
        Self {
            info,
            config,
            detector,
            allocator,
            store,
            frameworks: HashMap::new(),
            slaves: HashMap::new(),
            tasks: HashMap::new(),
            offers: HashMap::new(),
            stats: MasterStats::default(),
            unreachable_frameworks: Vec::new(),
            unreachable_slaves: Vec::new(),
        }
    }

    fn is_leading(&self) -> bool {
        self.detector
            .leader_info()
            .is_some_and(|leader| leader.id == self.info.id)
    }

    // -------------------------------------------------------------------------
    // Endpoint helpers
    // -------------------------------------------------------------------------

    /// Call the framework's scheduler if it is connected.
    fn notify_framework(
        &mut self,
        framework_id: FrameworkId,
        call: impl FnOnce(&dyn SchedulerEndpoint) -> Result<(), EndpointError>,
    ) -> bool {
        let Some(endpoint) = self
            .frameworks
            .get(&framework_id)
            .and_then(|f| f.endpoint.clone())
        else {
            return false;
        };
        match call(endpoint.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(framework_id = %framework_id, error = %e, "Scheduler unreachable");
                self.unreachable_frameworks.push(framework_id);
                false
            }
        }
    }

    fn notify_slave(
        &mut self,
        slave_id: SlaveId,
        call: impl FnOnce(&dyn SlaveEndpoint) -> Result<(), EndpointError>,
    ) -> bool {
        let Some(endpoint) = self.slaves.get(&slave_id).map(|s| Arc::clone(&s.endpoint)) else {
            return false;
        };
        match call(endpoint.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                warn!(slave_id = %slave_id, error = %e, "Slave unreachable");
                self.unreachable_slaves.push(slave_id);
                false
            }
        }
    }

    /// Report a master-generated status to the framework.
    fn send_status(&mut self, framework_id: FrameworkId, status: TaskStatus) {
        let update = StatusUpdate::new(framework_id, status);
        if !self.notify_framework(framework_id, |s| s.status_update(update)) {
            debug!(framework_id = %framework_id, "Status update not delivered");
        }
    }

    /// Deal with every party that failed during the last message.
    fn handle_unreachable(&mut self, ctx: &ActorContext<MasterMessage>) {
        loop {
            if let Some(slave_id) = self.unreachable_slaves.pop() {
                self.remove_slave(slave_id, "slave unreachable");
            } else if let Some(framework_id) = self.unreachable_frameworks.pop() {
                self.deactivate_framework(framework_id, ctx);
            } else {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Offers
    // -------------------------------------------------------------------------

    fn remove_offer(&mut self, offer_id: OfferId) -> Option<OutstandingOffer> {
        let outstanding = self.offers.remove(&offer_id)?;
        if let Some(timer) = &outstanding.timer {
            timer.cancel();
        }
        if let Some(framework) = self.frameworks.get_mut(&outstanding.offer.framework_id) {
            framework.offers.remove(&offer_id);
        }
        if let Some(slave) = self.slaves.get_mut(&outstanding.offer.slave_id) {
            slave.offers.remove(&offer_id);
        }
        Some(outstanding)
    }

    /// Revoke an offer and return its resources to the allocator.
    fn rescind_offer(&mut self, offer_id: OfferId) {
        let Some(outstanding) = self.remove_offer(offer_id) else {
            return;
        };
        let Offer {
            framework_id,
            slave_id,
            resources,
            ..
        } = outstanding.offer;
        self.stats.offers_rescinded += 1;
        self.notify_framework(framework_id, |s| s.offer_rescinded(offer_id));
        self.allocator
            .resources_recovered(framework_id, slave_id, resources);
    }

    fn offer_resources(
        &mut self,
        framework_id: FrameworkId,
        bundles: HashMap<SlaveId, Resources>,
        ctx: &ActorContext<MasterMessage>,
    ) {
        let active = self
            .frameworks
            .get(&framework_id)
            .is_some_and(Framework::is_active);

        let mut offers = Vec::with_capacity(bundles.len());
        for (slave_id, resources) in bundles {
            let hostname = match self.slaves.get(&slave_id) {
                Some(slave) if active => slave.info.hostname.clone(),
                _ => {
                    debug!(
                        framework_id = %framework_id,
                        slave_id = %slave_id,
                        "Returning offer for inactive framework or removed slave"
                    );
                    self.allocator
                        .resources_recovered(framework_id, slave_id, resources);
                    continue;
                }
            };
            if resources.is_empty() {
                continue;
            }

            let offer = Offer {
                id: OfferId::new(),
                framework_id,
                slave_id,
                hostname,
                resources,
            };
            let timer = self
                .config
                .offer_timeout
                .map(|timeout| ctx.schedule(timeout, MasterMessage::OfferTimeout { offer_id: offer.id }));

            if let Some(slave) = self.slaves.get_mut(&slave_id) {
                slave.offers.insert(offer.id);
            }
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                framework.offers.insert(offer.id);
            }
            self.offers.insert(
                offer.id,
                OutstandingOffer {
                    offer: offer.clone(),
                    issued_at: clock::now(),
                    timer,
                },
            );
            offers.push(offer);
        }

        if offers.is_empty() {
            return;
        }
        offers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        self.stats.offers_issued += offers.len() as u64;
        debug!(framework_id = %framework_id, count = offers.len(), "Sending offers");
        self.notify_framework(framework_id, |s| s.resource_offers(offers));
    }

    fn decline_offer(&mut self, framework_id: FrameworkId, offer_id: OfferId) {
        let owned = self
            .offers
            .get(&offer_id)
            .is_some_and(|o| o.offer.framework_id == framework_id);
        if !owned {
            warn!(framework_id = %framework_id, offer_id = %offer_id, "Decline of unknown offer");
            return;
        }
        if let Some(outstanding) = self.remove_offer(offer_id) {
            self.stats.offers_declined += 1;
            self.allocator.resources_unused(
                framework_id,
                outstanding.offer.slave_id,
                outstanding.offer.resources,
            );
        }
    }

    fn offer_timed_out(&mut self, offer_id: OfferId) {
        let Some(outstanding) = self.remove_offer(offer_id) else {
            return;
        };
        let Offer {
            framework_id,
            slave_id,
            resources,
            ..
        } = outstanding.offer;
        info!(
            framework_id = %framework_id,
            offer_id = %offer_id,
            age_ms = clock::since(outstanding.issued_at).as_millis() as u64,
            "Offer timed out"
        );
        self.stats.offers_timed_out += 1;
        self.notify_framework(framework_id, |s| s.offer_rescinded(offer_id));
        self.allocator
            .resources_recovered(framework_id, slave_id, resources);
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    fn launch_tasks(&mut self, framework_id: FrameworkId, offer_id: OfferId, tasks: Vec<TaskInfo>) {
        if !self.frameworks.contains_key(&framework_id) {
            warn!("Launch from unknown framework");
            return;
        }

        let offer = match self.offers.get(&offer_id) {
            Some(o) if o.offer.framework_id == framework_id => o.offer.clone(),
            _ => {
                let error = LaunchError::UnknownOffer(offer_id);
                warn!(error = %error, "Rejecting launch");
                self.stats.invalid_launches += 1;
                self.report_lost(framework_id, &tasks, &error.to_string());
                return;
            }
        };

        if tasks.is_empty() {
            self.decline_offer(framework_id, offer_id);
            return;
        }

        let known: HashSet<TaskId> = self
            .tasks
            .keys()
            .filter(|(fw, _)| *fw == framework_id)
            .map(|(_, task_id)| task_id.clone())
            .collect();
        let running = self
            .slaves
            .get(&offer.slave_id)
            .and_then(|s| s.executors.get(&framework_id));
        let validated = validate_launch(&offer, &tasks, &known, running);

        self.remove_offer(offer_id);

        let plan = match validated {
            Ok(plan) => plan,
            Err(error) => {
                warn!(error = %error, "Rejecting launch");
                self.stats.invalid_launches += 1;
                self.allocator
                    .resources_unused(framework_id, offer.slave_id, offer.resources);
                self.report_lost(framework_id, &tasks, &error.to_string());
                return;
            }
        };

        self.allocator
            .resources_unused(framework_id, offer.slave_id, plan.remaining);

        let Some(slave) = self.slaves.get_mut(&offer.slave_id) else {
            self.allocator
                .resources_recovered(framework_id, offer.slave_id, plan.consumed);
            self.report_lost(framework_id, &tasks, "Slave removed");
            return;
        };
        for executor in plan.new_executors {
            slave.add_executor(framework_id, executor);
        }
        for info in &tasks {
            let task = Task::staging(framework_id, info);
            slave.tasks.insert(task.key());
            self.tasks.insert(task.key(), task);
        }

        let framework_info = match self.frameworks.get(&framework_id) {
            Some(framework) => framework.info.clone(),
            None => return,
        };
        for info in &tasks {
            if !self.notify_slave(offer.slave_id, |s| s.run_task(framework_id, &framework_info, info)) {
                // The slave is removed after this message; its tasks go LOST.
                break;
            }
            if let Some(task) = self.tasks.get_mut(&(framework_id, info.task_id.clone())) {
                task.state = TaskState::Starting;
            }
            self.stats.tasks_launched += 1;
            info!(task_id = %info.task_id, slave_id = %offer.slave_id, "Launched task");
        }
    }

    fn report_lost(&mut self, framework_id: FrameworkId, tasks: &[TaskInfo], reason: &str) {
        for task in tasks {
            self.send_status(
                framework_id,
                TaskStatus::new(task.task_id.clone(), TaskState::Lost).with_message(reason),
            );
        }
    }

    /// Forget a task that reached `state` and recover its resources.
    fn finish_task(&mut self, key: &TaskKey, state: TaskState) -> Option<Task> {
        let task = self.tasks.remove(key)?;
        if let Some(slave) = self.slaves.get_mut(&task.slave_id) {
            slave.tasks.remove(key);
        }
        self.allocator
            .resources_recovered(task.framework_id, task.slave_id, task.resources.clone());
        self.stats.reclamations += 1;
        self.stats.record_terminal(state);
        debug!(
            framework_id = %task.framework_id,
            task_id = %task.task_id,
            state = %state,
            "Task finished"
        );
        Some(task)
    }

    fn status_update(&mut self, slave_id: SlaveId, mut update: StatusUpdate) {
        self.stats.status_updates += 1;
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            warn!(slave_id = %slave_id, "Status update from unknown slave");
            return;
        };
        slave.last_seen = clock::now();
        update.status.slave_id.get_or_insert(slave_id);

        let key = (update.framework_id, update.status.task_id.clone());
        let state = update.status.state;
        match self.tasks.get(&key).map(|task| task.state) {
            Some(_) if state.is_terminal() => {
                self.finish_task(&key, state);
            }
            Some(current) if current.can_advance_to(state) => {
                if let Some(task) = self.tasks.get_mut(&key) {
                    task.state = state;
                }
            }
            Some(current) => {
                debug!(task_id = %key.1, from = %current, to = %state, "Ignoring stale state");
            }
            None => {
                debug!(task_id = %key.1, state = %state, "Update for unknown task; forwarding only");
            }
        }

        let framework_id = update.framework_id;
        if !self.notify_framework(framework_id, |s| s.status_update(update)) {
            debug!(framework_id = %framework_id, "Status update not forwarded");
        }
    }

    fn kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) {
        let slave_id = self
            .tasks
            .get(&(framework_id, task_id.clone()))
            .map(|task| task.slave_id);
        match slave_id {
            Some(slave_id) => {
                info!(framework_id = %framework_id, task_id = %task_id, "Killing task");
                self.notify_slave(slave_id, |s| s.kill_task(framework_id, &task_id));
            }
            None => {
                warn!(framework_id = %framework_id, task_id = %task_id, "Kill of unknown task");
                self.send_status(
                    framework_id,
                    TaskStatus::new(task_id, TaskState::Lost)
                        .with_message("Attempted to kill an unknown task"),
                );
            }
        }
    }

    fn exited_executor(
        &mut self,
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) {
        let Some(slave) = self.slaves.get_mut(&slave_id) else {
            warn!(slave_id = %slave_id, "Executor exit on unknown slave");
            return;
        };
        slave.last_seen = clock::now();
        let removed = slave.remove_executor(framework_id, &executor_id);
        let orphaned: Vec<TaskKey> = slave
            .tasks
            .iter()
            .filter(|key| {
                key.0 == framework_id
                    && self
                        .tasks
                        .get(*key)
                        .is_some_and(|t| t.executor_id.as_ref() == Some(&executor_id))
            })
            .cloned()
            .collect();

        match removed {
            Some(executor) => {
                info!(
                    framework_id = %framework_id,
                    executor_id = %executor_id,
                    status,
                    "Executor exited"
                );
                self.allocator
                    .resources_recovered(framework_id, slave_id, executor.resources);
            }
            None => debug!(executor_id = %executor_id, "Exit of unknown executor"),
        }

        let reason = format!("Executor {executor_id} exited with status {status}");
        for key in orphaned {
            if let Some(task) = self.finish_task(&key, TaskState::Lost) {
                self.send_status(
                    framework_id,
                    TaskStatus::new(task.task_id, TaskState::Lost).with_message(reason.as_str()),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Frameworks
    // -------------------------------------------------------------------------

    /// Write a framework to the store without waiting on it.
    ///
    /// Re-registrations first try to cancel a pending removal and only write
    /// when the store does not know the framework.
    fn persist_framework(&self, framework_id: FrameworkId, info: FrameworkInfo, resurrect: bool) {
        let store = self.store.clone();
        if resurrect {
            let resurrected = store.resurrect(framework_id);
            tokio::spawn(async move {
                match resurrected.await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => warn!(framework_id = %framework_id, error = %e, "Resurrect failed"),
                }
                if let Err(e) = store.add(framework_id, info).await {
                    warn!(framework_id = %framework_id, error = %e, "Failed to persist framework");
                }
            });
        } else {
            let added = store.add(framework_id, info);
            tokio::spawn(async move {
                if let Err(e) = added.await {
                    warn!(framework_id = %framework_id, error = %e, "Failed to persist framework");
                }
            });
        }
    }

    fn register_framework(&mut self, info: FrameworkInfo, endpoint: Arc<dyn SchedulerEndpoint>) {
        if !self.is_leading() {
            warn!(name = %info.name, "Dropping framework registration: not the leading master");
            return;
        }

        let framework_id = FrameworkId::new();
        info!(framework_id = %framework_id, name = %info.name, role = %info.role, "Registering framework");
        self.frameworks
            .insert(framework_id, Framework::new(framework_id, info.clone(), endpoint));
        self.stats.frameworks_registered += 1;

        let master = self.info.clone();
        self.notify_framework(framework_id, |s| s.registered(framework_id, &master));
        self.allocator.add_framework(framework_id, info.clone());
        self.persist_framework(framework_id, info, false);
    }

    fn reregister_framework(
        &mut self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        endpoint: Arc<dyn SchedulerEndpoint>,
        failover: bool,
    ) {
        if !self.is_leading() {
            warn!(framework_id = %framework_id, "Dropping framework re-registration: not the leading master");
            return;
        }

        let master = self.info.clone();
        let previous = match self.frameworks.get_mut(&framework_id) {
            Some(framework) => {
                info!(framework_id = %framework_id, failover, "Framework re-registered");
                let stale: Vec<OfferId> = framework.offers.iter().copied().collect();
                let previous = framework.reconnect(Arc::clone(&endpoint));
                for offer_id in stale {
                    self.rescind_offer(offer_id);
                }
                self.allocator.activate_framework(framework_id);
                previous
            }
            None => {
                info!(framework_id = %framework_id, "Re-registering framework unknown to this master");
                self.frameworks
                    .insert(framework_id, Framework::new(framework_id, info.clone(), Arc::clone(&endpoint)));
                self.stats.frameworks_registered += 1;
                self.allocator.add_framework(framework_id, info.clone());
                None
            }
        };

        if failover {
            if let Some(old) = previous.filter(|old| !Arc::ptr_eq(old, &endpoint)) {
                if let Err(e) = old.error("Framework failed over") {
                    debug!(framework_id = %framework_id, error = %e, "Old scheduler already gone");
                }
            }
            self.notify_framework(framework_id, |s| s.registered(framework_id, &master));
        } else {
            self.notify_framework(framework_id, |s| s.reregistered(framework_id, &master));
        }
        self.persist_framework(framework_id, info, true);
    }

    /// The scheduler went away. Keep the framework for its failover timeout.
    fn deactivate_framework(&mut self, framework_id: FrameworkId, ctx: &ActorContext<MasterMessage>) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        if !framework.is_active() {
            return;
        }
        framework.disconnect();
        let generation = framework.generation;
        let timeout = framework.info.failover_timeout;
        let offers: Vec<OfferId> = framework.offers.iter().copied().collect();

        info!(
            framework_id = %framework_id,
            failover_timeout_ms = timeout.as_millis() as u64,
            "Deactivating framework"
        );
        self.allocator.deactivate_framework(framework_id);
        for offer_id in offers {
            self.rescind_offer(offer_id);
        }

        let removal = self.store.remove(framework_id, timeout);
        let master = ctx.myself().clone();
        tokio::spawn(async move {
            let result = removal.await;
            let _ = master.send(MasterMessage::FrameworkFailoverExpired {
                framework_id,
                generation,
                result,
            });
        });
    }

    fn failover_expired(
        &mut self,
        framework_id: FrameworkId,
        generation: u64,
        result: Result<bool, FrameworksError>,
        ctx: &ActorContext<MasterMessage>,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        if framework.generation != generation || framework.is_active() {
            debug!(framework_id = %framework_id, "Ignoring stale failover result");
            return;
        }

        match result {
            Ok(true) => {
                info!(framework_id = %framework_id, "Framework failover timeout, removing framework");
                self.remove_framework(framework_id);
            }
            Ok(false) => {
                debug!(framework_id = %framework_id, "Framework removal cancelled");
            }
            // The store's timer fired; only the durable delete failed.
            Err(FrameworksError::Storage(e)) => {
                warn!(
                    framework_id = %framework_id,
                    error = %e,
                    "Framework failover timeout, removing framework despite storage failure"
                );
                self.remove_framework(framework_id);
                self.forget_framework(framework_id);
            }
            Err(e) => {
                warn!(
                    framework_id = %framework_id,
                    error = %e,
                    "Store could not schedule framework removal; using local timer"
                );
                let timer = ctx.schedule(
                    framework.info.failover_timeout,
                    MasterMessage::FrameworkFailoverTimeout {
                        framework_id,
                        generation,
                    },
                );
                framework.failover_timer = Some(timer);
            }
        }
    }

    fn failover_timeout(&mut self, framework_id: FrameworkId, generation: u64) {
        let current = self
            .frameworks
            .get(&framework_id)
            .is_some_and(|f| f.generation == generation && !f.is_active());
        if current {
            info!(framework_id = %framework_id, "Framework failover timeout, removing framework");
            self.remove_framework(framework_id);
            self.forget_framework(framework_id);
        }
    }

    fn unregister_framework(&mut self, framework_id: FrameworkId) {
        if !self.frameworks.contains_key(&framework_id) {
            warn!(framework_id = %framework_id, "Unregister of unknown framework");
            return;
        }
        info!(framework_id = %framework_id, "Unregistering framework");
        self.remove_framework(framework_id);
        self.forget_framework(framework_id);
    }

    /// Drop the framework from the store right away.
    fn forget_framework(&self, framework_id: FrameworkId) {
        let removal = self.store.remove(framework_id, Duration::ZERO);
        tokio::spawn(async move {
            if let Err(e) = removal.await {
                warn!(framework_id = %framework_id, error = %e, "Failed to remove framework from store");
            }
        });
    }

    /// Remove a framework and everything it owns. The allocator reclaims its
    /// offers and in-use resources in one step.
    fn remove_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.remove(&framework_id) else {
            return;
        };
        if let Some(timer) = &framework.failover_timer {
            timer.cancel();
        }
        for offer_id in framework.offers {
            self.remove_offer(offer_id);
        }

        let keys: Vec<TaskKey> = self
            .tasks
            .keys()
            .filter(|(fw, _)| *fw == framework_id)
            .cloned()
            .collect();
        let mut affected: HashSet<SlaveId> = HashSet::new();
        for key in keys {
            if let Some(task) = self.tasks.remove(&key) {
                affected.insert(task.slave_id);
                if let Some(slave) = self.slaves.get_mut(&task.slave_id) {
                    slave.tasks.remove(&key);
                }
            }
        }
        for (slave_id, slave) in &mut self.slaves {
            if slave.executors.remove(&framework_id).is_some() {
                affected.insert(*slave_id);
            }
        }
        for slave_id in affected {
            self.notify_slave(slave_id, |s| s.shutdown_framework(framework_id));
        }

        self.allocator.remove_framework(framework_id);
        info!(framework_id = %framework_id, name = %framework.info.name, "Removed framework");
    }

    // -------------------------------------------------------------------------
    // Slaves
    // -------------------------------------------------------------------------

    fn register_slave(&mut self, info: SlaveInfo, endpoint: Arc<dyn SlaveEndpoint>) {
        if !self.is_leading() {
            warn!(hostname = %info.hostname, "Dropping slave registration: not the leading master");
            return;
        }

        let slave_id = SlaveId::new();
        info!(
            slave_id = %slave_id,
            hostname = %info.hostname,
            resources = %info.resources,
            "Registering slave"
        );
        self.slaves
            .insert(slave_id, Slave::new(slave_id, info.clone(), endpoint, clock::now()));
        self.stats.slaves_registered += 1;
        self.allocator.add_slave(slave_id, info, HashMap::new());

        let master = self.info.clone();
        self.notify_slave(slave_id, |s| s.registered(slave_id, &master));
    }

    fn reregister_slave(
        &mut self,
        slave_id: SlaveId,
        info: SlaveInfo,
        endpoint: Arc<dyn SlaveEndpoint>,
        executors: Vec<(FrameworkId, ExecutorInfo)>,
        tasks: Vec<Task>,
    ) {
        if !self.is_leading() {
            warn!(slave_id = %slave_id, "Dropping slave re-registration: not the leading master");
            return;
        }

        let master = self.info.clone();
        if let Some(slave) = self.slaves.get_mut(&slave_id) {
            debug!(slave_id = %slave_id, "Known slave re-registered");
            slave.endpoint = endpoint;
            slave.last_seen = clock::now();
            self.notify_slave(slave_id, |s| s.reregistered(slave_id, &master));
            return;
        }

        info!(
            slave_id = %slave_id,
            hostname = %info.hostname,
            tasks = tasks.len(),
            executors = executors.len(),
            "Re-registering slave"
        );
        let mut slave = Slave::new(slave_id, info.clone(), endpoint, clock::now());
        let mut used: HashMap<FrameworkId, Resources> = HashMap::new();

        for (framework_id, executor) in executors {
            if let Err(e) = used
                .entry(framework_id)
                .or_default()
                .try_add_assign(&executor.resources)
            {
                warn!(executor_id = %executor.executor_id, error = %e, "Skipping executor");
                continue;
            }
            slave.add_executor(framework_id, executor);
        }
        for task in tasks {
            let key = task.key();
            if task.slave_id != slave_id || task.state.is_terminal() || self.tasks.contains_key(&key) {
                warn!(task_id = %task.task_id, "Skipping re-registered task");
                continue;
            }
            if let Err(e) = used
                .entry(task.framework_id)
                .or_default()
                .try_add_assign(&task.resources)
            {
                warn!(task_id = %task.task_id, error = %e, "Skipping re-registered task");
                continue;
            }
            slave.tasks.insert(key.clone());
            self.tasks.insert(key, task);
        }

        self.slaves.insert(slave_id, slave);
        self.allocator.add_slave(slave_id, info, used);
        self.notify_slave(slave_id, |s| s.reregistered(slave_id, &master));
    }

    /// Remove a slave: its tasks are lost and its offers rescinded.
    fn remove_slave(&mut self, slave_id: SlaveId, reason: &str) {
        let Some(slave) = self.slaves.remove(&slave_id) else {
            return;
        };
        warn!(slave_id = %slave_id, hostname = %slave.info.hostname, reason, "Removing slave");
        self.stats.slaves_lost += 1;

        for offer_id in slave.offers {
            if let Some(outstanding) = self.remove_offer(offer_id) {
                self.stats.offers_rescinded += 1;
                self.notify_framework(outstanding.offer.framework_id, |s| s.offer_rescinded(offer_id));
            }
        }

        let message = format!("Slave {} removed: {reason}", slave.info.hostname);
        for key in slave.tasks {
            if let Some(task) = self.tasks.remove(&key) {
                self.stats.record_terminal(TaskState::Lost);
                self.send_status(
                    task.framework_id,
                    TaskStatus::new(task.task_id, TaskState::Lost).with_message(message.as_str()),
                );
            }
        }

        self.allocator.remove_slave(slave_id);

        let frameworks: Vec<FrameworkId> = self.frameworks.keys().copied().collect();
        for framework_id in frameworks {
            self.notify_framework(framework_id, |s| s.slave_lost(slave_id));
        }
    }

    fn heartbeat(&mut self, slave_id: SlaveId) {
        match self.slaves.get_mut(&slave_id) {
            Some(slave) => slave.last_seen = clock::now(),
            None => warn!(slave_id = %slave_id, "Heartbeat from unknown slave"),
        }
    }

    fn health_check(&mut self) {
        let timeout = self.config.slave_ping_timeout;
        let stale: Vec<SlaveId> = self
            .slaves
            .values()
            .filter(|s| clock::since(s.last_seen) > timeout)
            .map(|s| s.id)
            .collect();

        for slave_id in stale {
            if let Some(slave) = self.slaves.get(&slave_id) {
                if let Err(e) = slave.endpoint.shutdown("Health check timed out") {
                    debug!(slave_id = %slave_id, error = %e, "Slave already gone");
                }
            }
            self.remove_slave(slave_id, "health check timed out");
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    fn snapshot(&self) -> MasterState {
        let sum = |bundles: Vec<&Resources>| Resources::try_sum(bundles).unwrap_or_default();

        let frameworks = self
            .frameworks
            .values()
            .map(|f| {
                let task_resources = self
                    .tasks
                    .values()
                    .filter(|t| t.framework_id == f.id)
                    .map(|t| &t.resources);
                let executor_resources = self
                    .slaves
                    .values()
                    .filter_map(|s| s.executors.get(&f.id))
                    .flat_map(|e| e.values().map(|e| &e.resources));
                FrameworkSummary {
                    id: f.id,
                    info: f.info.clone(),
                    active: f.is_active(),
                    registered_at: f.registered_at,
                    tasks: self.tasks.values().filter(|t| t.framework_id == f.id).count(),
                    offers: f.offers.len(),
                    used: sum(task_resources.chain(executor_resources).collect()),
                    offered: sum(
                        f.offers
                            .iter()
                            .filter_map(|id| self.offers.get(id))
                            .map(|o| &o.offer.resources)
                            .collect(),
                    ),
                }
            })
            .collect();

        let slaves = self
            .slaves
            .values()
            .map(|s| {
                let task_resources = s
                    .tasks
                    .iter()
                    .filter_map(|key| self.tasks.get(key))
                    .map(|t| &t.resources);
                let executor_resources = s
                    .executors
                    .values()
                    .flat_map(|e| e.values().map(|e| &e.resources));
                SlaveSummary {
                    id: s.id,
                    hostname: s.info.hostname.clone(),
                    registered_at: s.registered_at,
                    total: s.info.resources.clone(),
                    used: sum(task_resources.chain(executor_resources).collect()),
                    offered: sum(
                        s.offers
                            .iter()
                            .filter_map(|id| self.offers.get(id))
                            .map(|o| &o.offer.resources)
                            .collect(),
                    ),
                    tasks: s.tasks.len(),
                }
            })
            .collect();

        MasterState {
            master: self.info.clone(),
            leading: self.is_leading(),
            frameworks,
            slaves,
            offers: self.offers.values().map(|o| o.offer.clone()).collect(),
            tasks: self.tasks.values().cloned().collect(),
            stats: self.stats.clone(),
        }
    }
}

#[async_trait]
impl Actor for MasterActor {
    type Message = MasterMessage;

    fn name(&self) -> &str {
        "master"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<MasterMessage>) -> Result<(), ActorError> {
        info!(master = %self.info, "Master started");
        ctx.schedule(self.config.health_check_interval, MasterMessage::HealthCheck);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: MasterMessage,
        ctx: &mut ActorContext<MasterMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            MasterMessage::RegisterFramework { info, endpoint } => {
                self.register_framework(info, endpoint);
            }
            MasterMessage::ReregisterFramework {
                framework_id,
                info,
                endpoint,
                failover,
            } => {
                self.reregister_framework(framework_id, info, endpoint, failover);
            }
            MasterMessage::UnregisterFramework { framework_id } => {
                self.unregister_framework(framework_id);
            }
            MasterMessage::DeactivateFramework { framework_id } => {
                self.deactivate_framework(framework_id, ctx);
            }
            MasterMessage::FrameworkFailoverExpired {
                framework_id,
                generation,
                result,
            } => {
                self.failover_expired(framework_id, generation, result, ctx);
            }
            MasterMessage::FrameworkFailoverTimeout {
                framework_id,
                generation,
            } => {
                self.failover_timeout(framework_id, generation);
            }
            MasterMessage::ResourceRequest {
                framework_id,
                requests,
            } => {
                if self.frameworks.contains_key(&framework_id) {
                    self.allocator.resources_requested(framework_id, requests);
                }
            }
            MasterMessage::LaunchTasks {
                framework_id,
                offer_id,
                tasks,
            } => {
                self.launch_tasks(framework_id, offer_id, tasks);
            }
            MasterMessage::DeclineOffer {
                framework_id,
                offer_id,
            } => {
                self.decline_offer(framework_id, offer_id);
            }
            MasterMessage::KillTask {
                framework_id,
                task_id,
            } => {
                self.kill_task(framework_id, task_id);
            }
            MasterMessage::StatusUpdateAcknowledgement {
                framework_id,
                slave_id,
                task_id,
                uuid,
            } => {
                self.notify_slave(slave_id, |s| {
                    s.acknowledge_status_update(framework_id, &task_id, uuid)
                });
            }
            MasterMessage::FrameworkToExecutor {
                framework_id,
                slave_id,
                executor_id,
                data,
            } => {
                self.stats.framework_messages += 1;
                if !self.notify_slave(slave_id, |s| s.framework_message(framework_id, &executor_id, data)) {
                    warn!(slave_id = %slave_id, "Framework message for unknown slave dropped");
                }
            }
            MasterMessage::RegisterSlave { info, endpoint } => {
                self.register_slave(info, endpoint);
            }
            MasterMessage::ReregisterSlave {
                slave_id,
                info,
                endpoint,
                executors,
                tasks,
            } => {
                self.reregister_slave(slave_id, info, endpoint, executors, tasks);
            }
            MasterMessage::UnregisterSlave { slave_id } => {
                self.remove_slave(slave_id, "slave unregistered");
            }
            MasterMessage::SlaveHeartbeat { slave_id } => {
                self.heartbeat(slave_id);
            }
            MasterMessage::StatusUpdate { slave_id, update } => {
                self.status_update(slave_id, update);
            }
            MasterMessage::ExecutorToFramework {
                slave_id,
                framework_id,
                executor_id,
                data,
            } => {
                self.stats.framework_messages += 1;
                if !self.notify_framework(framework_id, |s| s.framework_message(slave_id, executor_id, data)) {
                    debug!(framework_id = %framework_id, "Executor message dropped");
                }
            }
            MasterMessage::ExitedExecutor {
                slave_id,
                framework_id,
                executor_id,
                status,
            } => {
                self.exited_executor(slave_id, framework_id, executor_id, status);
            }
            MasterMessage::ResourcesOffered {
                framework_id,
                offers,
            } => {
                self.offer_resources(framework_id, offers, ctx);
            }
            MasterMessage::OfferTimeout { offer_id } => {
                self.offer_timed_out(offer_id);
            }
            MasterMessage::HealthCheck => {
                self.health_check();
                ctx.schedule(self.config.health_check_interval, MasterMessage::HealthCheck);
            }
            MasterMessage::GetState { reply_to } => {
                let _ = reply_to.send(self.snapshot());
            }
        }

        self.handle_unreachable(ctx);
        Ok(true)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed client for the master, used by scheduler drivers and slaves.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    handle: ActorHandle<MasterMessage>,
}

impl MasterHandle {
    pub fn new(handle: ActorHandle<MasterMessage>) -> Self {
        Self { handle }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn register_framework(
        &self,
        info: FrameworkInfo,
        endpoint: Arc<dyn SchedulerEndpoint>,
    ) -> Result<(), ActorError> {
        self.handle
            .send(MasterMessage::RegisterFramework { info, endpoint })
    }

    pub fn reregister_framework(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        endpoint: Arc<dyn SchedulerEndpoint>,
        failover: bool,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::ReregisterFramework {
            framework_id,
            info,
            endpoint,
            failover,
        })
    }

    pub fn unregister_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.handle
            .send(MasterMessage::UnregisterFramework { framework_id })
    }

    pub fn deactivate_framework(&self, framework_id: FrameworkId) -> Result<(), ActorError> {
        self.handle
            .send(MasterMessage::DeactivateFramework { framework_id })
    }

    pub fn request_resources(
        &self,
        framework_id: FrameworkId,
        requests: Vec<ResourceRequest>,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::ResourceRequest {
            framework_id,
            requests,
        })
    }

    pub fn launch_tasks(
        &self,
        framework_id: FrameworkId,
        offer_id: OfferId,
        tasks: Vec<TaskInfo>,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::LaunchTasks {
            framework_id,
            offer_id,
            tasks,
        })
    }

    pub fn decline_offer(&self, framework_id: FrameworkId, offer_id: OfferId) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::DeclineOffer {
            framework_id,
            offer_id,
        })
    }

    pub fn kill_task(&self, framework_id: FrameworkId, task_id: TaskId) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::KillTask {
            framework_id,
            task_id,
        })
    }

    pub fn acknowledge_status_update(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        task_id: TaskId,
        uuid: Uuid,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::StatusUpdateAcknowledgement {
            framework_id,
            slave_id,
            task_id,
            uuid,
        })
    }

    pub fn framework_to_executor(
        &self,
        framework_id: FrameworkId,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::FrameworkToExecutor {
            framework_id,
            slave_id,
            executor_id,
            data,
        })
    }

    pub fn register_slave(
        &self,
        info: SlaveInfo,
        endpoint: Arc<dyn SlaveEndpoint>,
    ) -> Result<(), ActorError> {
        self.handle
            .send(MasterMessage::RegisterSlave { info, endpoint })
    }

    pub fn reregister_slave(
        &self,
        slave_id: SlaveId,
        info: SlaveInfo,
        endpoint: Arc<dyn SlaveEndpoint>,
        executors: Vec<(FrameworkId, ExecutorInfo)>,
        tasks: Vec<Task>,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::ReregisterSlave {
            slave_id,
            info,
            endpoint,
            executors,
            tasks,
        })
    }

    pub fn unregister_slave(&self, slave_id: SlaveId) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::UnregisterSlave { slave_id })
    }

    pub fn heartbeat(&self, slave_id: SlaveId) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::SlaveHeartbeat { slave_id })
    }

    pub fn status_update(&self, slave_id: SlaveId, update: StatusUpdate) -> Result<(), ActorError> {
        self.handle
            .send(MasterMessage::StatusUpdate { slave_id, update })
    }

    pub fn executor_to_framework(
        &self,
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Bytes,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::ExecutorToFramework {
            slave_id,
            framework_id,
            executor_id,
            data,
        })
    }

    pub fn exited_executor(
        &self,
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) -> Result<(), ActorError> {
        self.handle.send(MasterMessage::ExitedExecutor {
            slave_id,
            framework_id,
            executor_id,
            status,
        })
    }

    pub async fn state(&self) -> Result<MasterState, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle.send(MasterMessage::GetState { reply_to })?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }
}
