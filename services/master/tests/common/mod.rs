//! Shared fixtures for master integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
use corral_master::actors::{MasterSupervisor, Scheduler, SchedulerDriver};
use corral_master::config::Config;
use corral_master::detector::MasterDetector;
use corral_master::endpoints::{EndpointError, SlaveEndpoint};
use corral_master::storage::{FrameworksStorage, MemoryStorage, StorageError};
use corral_master::{MasterHandle, MasterState};
use corral_protocol::{FrameworkInfo, MasterInfo, Offer, SlaveInfo, TaskInfo, TaskStatus};
use corral_resources::Resources;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn r(text: &str) -> Resources {
    Resources::parse(text).unwrap()
}

pub fn tid(text: &str) -> TaskId {
    TaskId::parse(text).unwrap()
}

pub fn eid(text: &str) -> ExecutorId {
    ExecutorId::parse(text).unwrap()
}

pub fn slave_info(hostname: &str, resources: &str) -> SlaveInfo {
    SlaveInfo {
        hostname: hostname.to_string(),
        resources: r(resources),
    }
}

/// Config with short intervals for tests running on wall-clock time.
pub fn test_config() -> Config {
    Config {
        allocation_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// One elected master plus a detector shared by everything in the test.
pub struct Cluster {
    pub supervisor: MasterSupervisor,
    pub master: MasterHandle,
    pub detector: MasterDetector,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    pub fn start() -> Self {
        Self::with(test_config(), Arc::new(MemoryStorage::new()), None)
    }

    pub fn with(
        config: Config,
        storage: Arc<dyn FrameworksStorage>,
        whitelist: Option<HashSet<String>>,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let detector = MasterDetector::new();
        let mut supervisor = MasterSupervisor::new(config, detector.clone(), rx);
        let master = supervisor.start(storage, whitelist);
        supervisor.elect();
        Self {
            supervisor,
            master,
            detector,
            shutdown,
        }
    }

    /// A second master sharing this cluster's detector, not yet elected.
    pub fn standby(&self) -> (MasterSupervisor, MasterHandle) {
        let mut supervisor = MasterSupervisor::new(
            test_config(),
            self.detector.clone(),
            self.shutdown.subscribe(),
        );
        let master = supervisor.start(Arc::new(MemoryStorage::new()), None);
        (supervisor, master)
    }

    pub fn framework(&mut self, name: &str) -> (SchedulerDriver, mpsc::UnboundedReceiver<Event>) {
        self.framework_with(FrameworkInfo::new(name, "tester"), None)
    }

    pub fn framework_with(
        &mut self,
        info: FrameworkInfo,
        framework_id: Option<FrameworkId>,
    ) -> (SchedulerDriver, mpsc::UnboundedReceiver<Event>) {
        let (scheduler, events) = RecordingScheduler::new();
        let driver = self.supervisor.spawn_driver(scheduler, info, framework_id);
        (driver, events)
    }

    pub async fn state(&self) -> MasterState {
        self.master.state().await.unwrap()
    }

    /// Poll the master until `check` holds.
    pub async fn wait_state(&self, check: impl Fn(&MasterState) -> bool) -> MasterState {
        let check = &check;
        wait_until(move || async move {
            let state = self.state().await;
            check(&state).then_some(state)
        })
        .await
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Retry `probe` every 20ms until it yields a value, panicking after [`WAIT`].
pub async fn wait_until<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

// =============================================================================
// Recording scheduler
// =============================================================================

#[derive(Debug, Clone)]
pub enum Event {
    Registered(FrameworkId, MasterInfo),
    Reregistered(MasterInfo),
    Disconnected,
    Offers(Vec<Offer>),
    Rescinded(OfferId),
    Status(TaskStatus),
    Message {
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    },
    SlaveLost(SlaveId),
    Error(String),
}

/// Scheduler that only reports what it sees; tests drive the driver.
pub struct RecordingScheduler {
    events: mpsc::UnboundedSender<Event>,
}

impl RecordingScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn record(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

impl Scheduler for RecordingScheduler {
    fn registered(&mut self, _driver: &SchedulerDriver, framework_id: FrameworkId, master: &MasterInfo) {
        self.record(Event::Registered(framework_id, master.clone()));
    }

    fn reregistered(&mut self, _driver: &SchedulerDriver, master: &MasterInfo) {
        self.record(Event::Reregistered(master.clone()));
    }

    fn disconnected(&mut self, _driver: &SchedulerDriver) {
        self.record(Event::Disconnected);
    }

    fn resource_offers(&mut self, _driver: &SchedulerDriver, offers: Vec<Offer>) {
        self.record(Event::Offers(offers));
    }

    fn offer_rescinded(&mut self, _driver: &SchedulerDriver, offer_id: OfferId) {
        self.record(Event::Rescinded(offer_id));
    }

    fn status_update(&mut self, _driver: &SchedulerDriver, status: &TaskStatus) {
        self.record(Event::Status(status.clone()));
    }

    fn framework_message(
        &mut self,
        _driver: &SchedulerDriver,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    ) {
        self.record(Event::Message {
            slave_id,
            executor_id,
            data,
        });
    }

    fn slave_lost(&mut self, _driver: &SchedulerDriver, slave_id: SlaveId) {
        self.record(Event::SlaveLost(slave_id));
    }

    fn error(&mut self, _driver: &SchedulerDriver, message: &str) {
        self.record(Event::Error(message.to_string()));
    }
}

/// Receive events until `pick` accepts one.
pub async fn expect_event<T>(
    events: &mut mpsc::UnboundedReceiver<Event>,
    mut pick: impl FnMut(&Event) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("scheduler stopped");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub async fn expect_registered(events: &mut mpsc::UnboundedReceiver<Event>) -> (FrameworkId, MasterInfo) {
    expect_event(events, |e| match e {
        Event::Registered(id, master) => Some((*id, master.clone())),
        _ => None,
    })
    .await
}

/// Next offer for a slave with `hostname`.
pub async fn expect_offer(events: &mut mpsc::UnboundedReceiver<Event>, hostname: &str) -> Offer {
    expect_event(events, |e| match e {
        Event::Offers(offers) => offers.iter().find(|o| o.hostname == hostname).cloned(),
        _ => None,
    })
    .await
}

pub async fn expect_status(
    events: &mut mpsc::UnboundedReceiver<Event>,
    task_id: &TaskId,
    state: corral_protocol::TaskState,
) -> TaskStatus {
    expect_event(events, |e| match e {
        Event::Status(status) if &status.task_id == task_id && status.state == state => {
            Some(status.clone())
        }
        _ => None,
    })
    .await
}

/// Task running the slave's built-in command runner.
pub fn command_task(offer: &Offer, id: &str, resources: &str) -> TaskInfo {
    TaskInfo::command(tid(id), offer.slave_id, r(resources), "sleep 60")
}

// =============================================================================
// Scripted slave
// =============================================================================

/// A command the master sent to a [`ScriptedSlave`].
#[derive(Debug, Clone)]
pub enum SlaveCall {
    Registered(SlaveId),
    Reregistered(SlaveId),
    RunTask(FrameworkId, TaskInfo),
    KillTask(FrameworkId, TaskId),
    FrameworkMessage(FrameworkId, ExecutorId, Bytes),
    Acknowledge(FrameworkId, TaskId, Uuid),
    ShutdownFramework(FrameworkId),
    Shutdown(String),
}

/// Slave endpoint driven by the test: it records every command and never
/// reacts on its own.
#[derive(Debug)]
pub struct ScriptedSlave {
    calls: mpsc::UnboundedSender<SlaveCall>,
}

impl ScriptedSlave {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SlaveCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls }), rx)
    }

    fn record(&self, call: SlaveCall) -> Result<(), EndpointError> {
        self.calls.send(call).map_err(|_| EndpointError::Disconnected)
    }
}

impl SlaveEndpoint for ScriptedSlave {
    fn registered(&self, slave_id: SlaveId, _master: &MasterInfo) -> Result<(), EndpointError> {
        self.record(SlaveCall::Registered(slave_id))
    }

    fn reregistered(&self, slave_id: SlaveId, _master: &MasterInfo) -> Result<(), EndpointError> {
        self.record(SlaveCall::Reregistered(slave_id))
    }

    fn run_task(
        &self,
        framework_id: FrameworkId,
        _framework: &FrameworkInfo,
        task: &TaskInfo,
    ) -> Result<(), EndpointError> {
        self.record(SlaveCall::RunTask(framework_id, task.clone()))
    }

    fn kill_task(&self, framework_id: FrameworkId, task_id: &TaskId) -> Result<(), EndpointError> {
        self.record(SlaveCall::KillTask(framework_id, task_id.clone()))
    }

    fn framework_message(
        &self,
        framework_id: FrameworkId,
        executor_id: &ExecutorId,
        data: Bytes,
    ) -> Result<(), EndpointError> {
        self.record(SlaveCall::FrameworkMessage(framework_id, executor_id.clone(), data))
    }

    fn acknowledge_status_update(
        &self,
        framework_id: FrameworkId,
        task_id: &TaskId,
        uuid: Uuid,
    ) -> Result<(), EndpointError> {
        self.record(SlaveCall::Acknowledge(framework_id, task_id.clone(), uuid))
    }

    fn shutdown_framework(&self, framework_id: FrameworkId) -> Result<(), EndpointError> {
        self.record(SlaveCall::ShutdownFramework(framework_id))
    }

    fn shutdown(&self, reason: &str) -> Result<(), EndpointError> {
        self.record(SlaveCall::Shutdown(reason.to_string()))
    }
}

/// Register a scripted slave and return its assigned ID.
pub async fn register_scripted(
    master: &MasterHandle,
    info: SlaveInfo,
) -> (SlaveId, mpsc::UnboundedReceiver<SlaveCall>) {
    let (slave, mut calls) = ScriptedSlave::new();
    master.register_slave(info, slave).unwrap();
    let slave_id = expect_call(&mut calls, |c| match c {
        SlaveCall::Registered(id) => Some(*id),
        _ => None,
    })
    .await;
    (slave_id, calls)
}

pub async fn expect_call<T>(
    calls: &mut mpsc::UnboundedReceiver<SlaveCall>,
    mut pick: impl FnMut(&SlaveCall) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let call = calls.recv().await.expect("master dropped slave endpoint");
            if let Some(value) = pick(&call) {
                return value;
            }
        }
    })
    .await
    .expect("slave call not received in time")
}

// =============================================================================
// Storage doubles
// =============================================================================

/// Storage whose `list` always fails; counts how often it is asked.
#[derive(Debug, Default)]
pub struct FailingListStorage {
    pub list_calls: AtomicUsize,
    pub adds: AtomicUsize,
}

impl FailingListStorage {
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameworksStorage for FailingListStorage {
    async fn list(&self) -> Result<HashMap<FrameworkId, FrameworkInfo>, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("list disabled".into()))
    }

    async fn persist_add(&self, _id: FrameworkId, _info: &FrameworkInfo) -> Result<(), StorageError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_remove(&self, _id: FrameworkId) -> Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory storage whose deletes always fail.
#[derive(Debug, Default)]
pub struct NoDeleteStorage {
    inner: MemoryStorage,
    pub removes: AtomicUsize,
}

impl NoDeleteStorage {
    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameworksStorage for NoDeleteStorage {
    async fn list(&self) -> Result<HashMap<FrameworkId, FrameworkInfo>, StorageError> {
        self.inner.list().await
    }

    async fn persist_add(&self, id: FrameworkId, info: &FrameworkInfo) -> Result<(), StorageError> {
        self.inner.persist_add(id, info).await
    }

    async fn persist_remove(&self, _id: FrameworkId) -> Result<(), StorageError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("delete disabled".into()))
    }
}
