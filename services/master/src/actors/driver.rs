//! Scheduler driver - the framework side of the master protocol.
//!
//! The driver follows the leading master: on every new leader it
//! (re-)registers, retrying with exponential backoff until the master
//! answers, and reports `disconnected` while no master leads. Master events
//! are tagged with the master they came from; events from a master that is
//! no longer the leader are dropped.
//!
//! Status updates that came from a slave are acknowledged to the master
//! after the scheduler has seen them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::{ExecutorId, FrameworkId, MasterId, OfferId, SlaveId, TaskId};
use corral_protocol::{
    FrameworkInfo, MasterInfo, Offer, ResourceRequest, StatusUpdate, TaskInfo, TaskState,
    TaskStatus,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framework::{
    mailbox, Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Supervisor,
};
use crate::detector::{Leader, MasterDetector};
use crate::endpoints::{EndpointError, SchedulerEndpoint};

// =============================================================================
// Scheduler
// =============================================================================

/// Callbacks a framework implements. Every method has a no-op default.
pub trait Scheduler: Send + 'static {
    fn registered(&mut self, _driver: &SchedulerDriver, _framework_id: FrameworkId, _master: &MasterInfo) {}

    fn reregistered(&mut self, _driver: &SchedulerDriver, _master: &MasterInfo) {}

    /// No master leads; commands are not delivered until one does.
    fn disconnected(&mut self, _driver: &SchedulerDriver) {}

    fn resource_offers(&mut self, _driver: &SchedulerDriver, _offers: Vec<Offer>) {}

    fn offer_rescinded(&mut self, _driver: &SchedulerDriver, _offer_id: OfferId) {}

    fn status_update(&mut self, _driver: &SchedulerDriver, _status: &TaskStatus) {}

    fn framework_message(
        &mut self,
        _driver: &SchedulerDriver,
        _slave_id: SlaveId,
        _executor_id: ExecutorId,
        _data: Bytes,
    ) {
    }

    fn slave_lost(&mut self, _driver: &SchedulerDriver, _slave_id: SlaveId) {}

    /// The master refused the framework. The driver stops afterwards.
    fn error(&mut self, _driver: &SchedulerDriver, _message: &str) {}
}

// =============================================================================
// Messages
// =============================================================================

/// An event the master sent to this framework.
#[derive(Debug)]
pub enum MasterEvent {
    Registered {
        framework_id: FrameworkId,
        master: MasterInfo,
    },
    Reregistered {
        framework_id: FrameworkId,
        master: MasterInfo,
    },
    ResourceOffers(Vec<Offer>),
    OfferRescinded(OfferId),
    StatusUpdate(StatusUpdate),
    FrameworkMessage {
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    },
    SlaveLost(SlaveId),
    Error(String),
}

#[derive(Debug)]
pub enum DriverMessage {
    FromMaster {
        master_id: MasterId,
        event: MasterEvent,
    },
    LeaderChanged(Option<Leader>),
    RetryRegistration {
        generation: u64,
    },

    // Commands from the scheduler
    LaunchTasks {
        offer_id: OfferId,
        tasks: Vec<TaskInfo>,
    },
    DeclineOffer {
        offer_id: OfferId,
    },
    KillTask {
        task_id: TaskId,
    },
    SendFrameworkMessage {
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    },
    RequestResources {
        requests: Vec<ResourceRequest>,
    },
    Stop {
        failover: bool,
    },
}

// =============================================================================
// Endpoint
// =============================================================================

/// What the master holds for a framework: the driver's mailbox, tagged with
/// the master the registration went to.
#[derive(Debug)]
struct DriverEndpoint {
    handle: ActorHandle<DriverMessage>,
    master_id: MasterId,
}

impl DriverEndpoint {
    fn deliver(&self, event: MasterEvent) -> Result<(), EndpointError> {
        self.handle
            .send(DriverMessage::FromMaster {
                master_id: self.master_id,
                event,
            })
            .map_err(|_| EndpointError::Disconnected)
    }
}

impl SchedulerEndpoint for DriverEndpoint {
    fn registered(&self, framework_id: FrameworkId, master: &MasterInfo) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::Registered {
            framework_id,
            master: master.clone(),
        })
    }

    fn reregistered(&self, framework_id: FrameworkId, master: &MasterInfo) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::Reregistered {
            framework_id,
            master: master.clone(),
        })
    }

    fn resource_offers(&self, offers: Vec<Offer>) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::ResourceOffers(offers))
    }

    fn offer_rescinded(&self, offer_id: OfferId) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::OfferRescinded(offer_id))
    }

    fn status_update(&self, update: StatusUpdate) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::StatusUpdate(update))
    }

    fn framework_message(
        &self,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    ) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::FrameworkMessage {
            slave_id,
            executor_id,
            data,
        })
    }

    fn slave_lost(&self, slave_id: SlaveId) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::SlaveLost(slave_id))
    }

    fn error(&self, message: &str) -> Result<(), EndpointError> {
        self.deliver(MasterEvent::Error(message.to_string()))
    }
}

// =============================================================================
// Driver handle
// =============================================================================

/// Commands a scheduler issues. Cheap to clone; also passed to every
/// [`Scheduler`] callback.
#[derive(Debug, Clone)]
pub struct SchedulerDriver {
    handle: ActorHandle<DriverMessage>,
}

impl SchedulerDriver {
    fn new(handle: ActorHandle<DriverMessage>) -> Self {
        Self { handle }
    }

    pub fn launch_tasks(&self, offer_id: OfferId, tasks: Vec<TaskInfo>) -> Result<(), ActorError> {
        self.handle
            .send(DriverMessage::LaunchTasks { offer_id, tasks })
    }

    pub fn decline_offer(&self, offer_id: OfferId) -> Result<(), ActorError> {
        self.handle.send(DriverMessage::DeclineOffer { offer_id })
    }

    pub fn kill_task(&self, task_id: TaskId) -> Result<(), ActorError> {
        self.handle.send(DriverMessage::KillTask { task_id })
    }

    pub fn send_framework_message(
        &self,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    ) -> Result<(), ActorError> {
        self.handle.send(DriverMessage::SendFrameworkMessage {
            slave_id,
            executor_id,
            data,
        })
    }

    pub fn request_resources(&self, requests: Vec<ResourceRequest>) -> Result<(), ActorError> {
        self.handle
            .send(DriverMessage::RequestResources { requests })
    }

    /// Stop the driver. With `failover` the master keeps the framework for
    /// its failover timeout so another scheduler instance can take over.
    pub fn stop(&self, failover: bool) -> Result<(), ActorError> {
        self.handle.send(DriverMessage::Stop { failover })
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Completes once the driver has stopped.
    pub async fn stopped(&self) {
        self.handle.closed().await;
    }
}

// =============================================================================
// Driver actor
// =============================================================================

pub struct DriverActor<S: Scheduler> {
    scheduler: S,
    driver: SchedulerDriver,
    info: FrameworkInfo,
    framework_id: Option<FrameworkId>,
    /// Set when taking over an existing framework, until the first
    /// successful registration.
    failover: bool,
    detector: MasterDetector,
    leader: Option<Leader>,
    connected: bool,
    /// Bumped on every leader change; stale retries are ignored.
    generation: u64,
    attempts: u32,
    backoff: BackoffPolicy,
    watcher: Option<JoinHandle<()>>,
}

impl<S: Scheduler> DriverActor<S> {
    fn new(
        scheduler: S,
        info: FrameworkInfo,
        framework_id: Option<FrameworkId>,
        detector: MasterDetector,
        driver: SchedulerDriver,
    ) -> Self {
        Self {
            scheduler,
            driver,
            info,
            failover: framework_id.is_some(),
            framework_id,
            detector,
            leader: None,
            connected: false,
            generation: 0,
            attempts: 0,
            backoff: BackoffPolicy::default(),
            watcher: None,
        }
    }

    fn leader_changed(&mut self, leader: Option<Leader>, ctx: &ActorContext<DriverMessage>) {
        self.generation += 1;
        self.attempts = 0;
        self.connected = false;
        self.leader = leader;

        match &self.leader {
            None => {
                info!(framework = %self.info.name, "No leading master");
                self.scheduler.disconnected(&self.driver);
            }
            Some(leader) => {
                info!(framework = %self.info.name, master = %leader.info, "New master detected");
                self.register(ctx);
            }
        }
    }

    fn register(&mut self, ctx: &ActorContext<DriverMessage>) {
        let Some(leader) = &self.leader else {
            return;
        };
        let endpoint: Arc<dyn SchedulerEndpoint> = Arc::new(DriverEndpoint {
            handle: ctx.myself().clone(),
            master_id: leader.info.id,
        });

        let sent = match self.framework_id {
            None => leader.master.register_framework(self.info.clone(), endpoint),
            Some(framework_id) => leader.master.reregister_framework(
                framework_id,
                self.info.clone(),
                endpoint,
                self.failover,
            ),
        };
        if let Err(e) = sent {
            warn!(framework = %self.info.name, error = %e, "Master unreachable; will retry");
        }

        let delay = self.backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        ctx.schedule(
            delay,
            DriverMessage::RetryRegistration {
                generation: self.generation,
            },
        );
    }

    fn master(&self) -> Option<(&Leader, FrameworkId)> {
        match (&self.leader, self.framework_id) {
            (Some(leader), Some(framework_id)) if self.connected => Some((leader, framework_id)),
            _ => None,
        }
    }

    /// Handle an event from the current master. Returns `false` to stop.
    fn master_event(&mut self, event: MasterEvent) -> bool {
        match event {
            MasterEvent::Registered {
                framework_id,
                master,
            } => {
                if self.connected && self.framework_id != Some(framework_id) {
                    warn!(framework_id = %framework_id, "Duplicate registration; unregistering");
                    if let Some(leader) = &self.leader {
                        if let Err(e) = leader.master.unregister_framework(framework_id) {
                            debug!(error = %e, "Could not unregister duplicate framework");
                        }
                    }
                    return true;
                }
                info!(framework_id = %framework_id, master = %master, "Framework registered");
                self.framework_id = Some(framework_id);
                self.connected = true;
                self.failover = false;
                self.scheduler.registered(&self.driver, framework_id, &master);
            }
            MasterEvent::Reregistered {
                framework_id,
                master,
            } => {
                info!(framework_id = %framework_id, master = %master, "Framework re-registered");
                self.connected = true;
                self.failover = false;
                self.scheduler.reregistered(&self.driver, &master);
            }
            MasterEvent::ResourceOffers(offers) => {
                self.scheduler.resource_offers(&self.driver, offers);
            }
            MasterEvent::OfferRescinded(offer_id) => {
                self.scheduler.offer_rescinded(&self.driver, offer_id);
            }
            MasterEvent::StatusUpdate(update) => {
                self.scheduler.status_update(&self.driver, &update.status);
                self.acknowledge(update);
            }
            MasterEvent::FrameworkMessage {
                slave_id,
                executor_id,
                data,
            } => {
                self.scheduler
                    .framework_message(&self.driver, slave_id, executor_id, data);
            }
            MasterEvent::SlaveLost(slave_id) => {
                self.scheduler.slave_lost(&self.driver, slave_id);
            }
            MasterEvent::Error(message) => {
                warn!(framework = %self.info.name, error = %message, "Framework error from master");
                self.scheduler.error(&self.driver, &message);
                return false;
            }
        }
        true
    }

    /// Only updates generated by a slave are acknowledged.
    fn acknowledge(&self, update: StatusUpdate) {
        let Some(slave_id) = update.status.slave_id else {
            return;
        };
        let Some(leader) = &self.leader else {
            return;
        };
        if let Err(e) = leader.master.acknowledge_status_update(
            update.framework_id,
            slave_id,
            update.status.task_id,
            update.uuid,
        ) {
            debug!(error = %e, "Acknowledgement not sent");
        }
    }

    fn launch_tasks(&mut self, offer_id: OfferId, tasks: Vec<TaskInfo>) {
        let sent = match self.master() {
            Some((leader, framework_id)) => leader
                .master
                .launch_tasks(framework_id, offer_id, tasks.clone())
                .is_ok(),
            None => false,
        };
        if sent {
            return;
        }

        warn!(offer_id = %offer_id, "Launch while disconnected; tasks lost");
        for task in tasks {
            let status = TaskStatus::new(task.task_id, TaskState::Lost)
                .with_message("Master disconnected");
            self.scheduler.status_update(&self.driver, &status);
        }
    }

    /// Forward a command to the master, or drop it while disconnected.
    fn forward(
        &self,
        what: &str,
        send: impl FnOnce(&Leader, FrameworkId) -> Result<(), ActorError>,
    ) {
        match self.master() {
            Some((leader, framework_id)) => {
                if let Err(e) = send(leader, framework_id) {
                    warn!(command = what, error = %e, "Master unreachable");
                }
            }
            None => debug!(command = what, "Dropping command while disconnected"),
        }
    }
}

#[async_trait]
impl<S: Scheduler> Actor for DriverActor<S> {
    type Message = DriverMessage;

    fn name(&self) -> &str {
        "scheduler-driver"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<DriverMessage>) -> Result<(), ActorError> {
        let mut rx = self.detector.subscribe();
        let initial = rx.borrow_and_update().clone();

        let myself = ctx.myself().clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let leader = rx.borrow_and_update().clone();
                        if myself.send(DriverMessage::LeaderChanged(leader)).is_err() {
                            break;
                        }
                    }
                    _ = myself.closed() => break,
                }
            }
        }));

        self.leader_changed(initial, ctx);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: DriverMessage,
        ctx: &mut ActorContext<DriverMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            DriverMessage::FromMaster { master_id, event } => {
                let current = self.leader.as_ref().map(|leader| leader.info.id);
                if current != Some(master_id) {
                    debug!(master_id = %master_id, "Ignoring event from old master");
                    return Ok(true);
                }
                return Ok(self.master_event(event));
            }
            DriverMessage::LeaderChanged(leader) => {
                self.leader_changed(leader, ctx);
            }
            DriverMessage::RetryRegistration { generation } => {
                if generation == self.generation && !self.connected {
                    debug!(attempt = self.attempts, "Retrying registration");
                    self.register(ctx);
                }
            }
            DriverMessage::LaunchTasks { offer_id, tasks } => {
                self.launch_tasks(offer_id, tasks);
            }
            DriverMessage::DeclineOffer { offer_id } => {
                self.forward("decline_offer", |leader, framework_id| {
                    leader.master.decline_offer(framework_id, offer_id)
                });
            }
            DriverMessage::KillTask { task_id } => {
                self.forward("kill_task", |leader, framework_id| {
                    leader.master.kill_task(framework_id, task_id)
                });
            }
            DriverMessage::SendFrameworkMessage {
                slave_id,
                executor_id,
                data,
            } => {
                self.forward("framework_message", |leader, framework_id| {
                    leader
                        .master
                        .framework_to_executor(framework_id, slave_id, executor_id, data)
                });
            }
            DriverMessage::RequestResources { requests } => {
                self.forward("request_resources", |leader, framework_id| {
                    leader.master.request_resources(framework_id, requests)
                });
            }
            DriverMessage::Stop { failover } => {
                info!(framework = %self.info.name, failover, "Stopping driver");
                self.forward("stop", |leader, framework_id| {
                    if failover {
                        leader.master.deactivate_framework(framework_id)
                    } else {
                        leader.master.unregister_framework(framework_id)
                    }
                });
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<DriverMessage>) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Start a driver for `scheduler`. Pass `framework_id` to take over an
/// existing framework.
pub fn spawn_driver<S: Scheduler>(
    supervisor: &mut Supervisor,
    scheduler: S,
    info: FrameworkInfo,
    framework_id: Option<FrameworkId>,
    detector: MasterDetector,
) -> SchedulerDriver {
    let (handle, mailbox) = mailbox(&format!("driver-{}", info.name));
    let driver = SchedulerDriver::new(handle.clone());
    let actor = DriverActor::new(scheduler, info, framework_id, detector, driver.clone());
    supervisor.start(actor, handle, mailbox);
    driver
}
