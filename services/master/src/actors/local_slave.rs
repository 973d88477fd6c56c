//! In-process slave for development and tests.
//!
//! Tasks do not execute anything: a launched task is reported RUNNING right
//! away and stays that way until it is killed, finished through the handle,
//! or its executor exits. Framework messages sent to a known executor are
//! echoed back to the framework.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::{ExecutorId, FrameworkId, MasterId, SlaveId, TaskId};
use corral_protocol::{
    ExecutorInfo, FrameworkInfo, MasterInfo, SlaveInfo, StatusUpdate, TaskInfo, TaskState,
    TaskStatus,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::framework::{mailbox, Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::detector::{Leader, MasterDetector};
use crate::endpoints::{EndpointError, SlaveEndpoint};
use crate::state::Task;

// =============================================================================
// Messages
// =============================================================================

/// A command the master sent to this slave.
#[derive(Debug)]
pub enum SlaveCommand {
    Registered {
        slave_id: SlaveId,
        master: MasterInfo,
    },
    Reregistered {
        slave_id: SlaveId,
        master: MasterInfo,
    },
    RunTask {
        framework_id: FrameworkId,
        framework: FrameworkInfo,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    FrameworkMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Bytes,
    },
    Acknowledge {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: Uuid,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    Shutdown {
        reason: String,
    },
}

#[derive(Debug)]
pub enum LocalSlaveMessage {
    FromMaster {
        master_id: MasterId,
        command: SlaveCommand,
    },
    LeaderChanged(Option<Leader>),
    Heartbeat,

    /// Report a terminal state for a running task.
    FinishTask {
        framework_id: FrameworkId,
        task_id: TaskId,
        state: TaskState,
    },
    ExitExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },
    GetTasks {
        reply_to: oneshot::Sender<Vec<Task>>,
    },
    GetSlaveId {
        reply_to: oneshot::Sender<Option<SlaveId>>,
    },
}

// =============================================================================
// Endpoint
// =============================================================================

#[derive(Debug)]
struct LocalSlaveEndpoint {
    handle: ActorHandle<LocalSlaveMessage>,
    master_id: MasterId,
}

impl LocalSlaveEndpoint {
    fn deliver(&self, command: SlaveCommand) -> Result<(), EndpointError> {
        self.handle
            .send(LocalSlaveMessage::FromMaster {
                master_id: self.master_id,
                command,
            })
            .map_err(|_| EndpointError::Disconnected)
    }
}

impl SlaveEndpoint for LocalSlaveEndpoint {
    fn registered(&self, slave_id: SlaveId, master: &MasterInfo) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::Registered {
            slave_id,
            master: master.clone(),
        })
    }

    fn reregistered(&self, slave_id: SlaveId, master: &MasterInfo) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::Reregistered {
            slave_id,
            master: master.clone(),
        })
    }

    fn run_task(
        &self,
        framework_id: FrameworkId,
        framework: &FrameworkInfo,
        task: &TaskInfo,
    ) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::RunTask {
            framework_id,
            framework: framework.clone(),
            task: task.clone(),
        })
    }

    fn kill_task(&self, framework_id: FrameworkId, task_id: &TaskId) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::KillTask {
            framework_id,
            task_id: task_id.clone(),
        })
    }

    fn framework_message(
        &self,
        framework_id: FrameworkId,
        executor_id: &ExecutorId,
        data: Bytes,
    ) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::FrameworkMessage {
            framework_id,
            executor_id: executor_id.clone(),
            data,
        })
    }

    fn acknowledge_status_update(
        &self,
        framework_id: FrameworkId,
        task_id: &TaskId,
        uuid: Uuid,
    ) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::Acknowledge {
            framework_id,
            task_id: task_id.clone(),
            uuid,
        })
    }

    fn shutdown_framework(&self, framework_id: FrameworkId) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::ShutdownFramework { framework_id })
    }

    fn shutdown(&self, reason: &str) -> Result<(), EndpointError> {
        self.deliver(SlaveCommand::Shutdown {
            reason: reason.to_string(),
        })
    }
}

// =============================================================================
// Actor
// =============================================================================

pub struct LocalSlave {
    info: SlaveInfo,
    slave_id: Option<SlaveId>,
    detector: MasterDetector,
    leader: Option<Leader>,
    registered: bool,
    heartbeat_interval: Duration,

    tasks: HashMap<(FrameworkId, TaskId), Task>,
    executors: HashMap<FrameworkId, HashMap<ExecutorId, ExecutorInfo>>,
    watcher: Option<JoinHandle<()>>,
}

impl LocalSlave {
    pub fn new(info: SlaveInfo, detector: MasterDetector, heartbeat_interval: Duration) -> Self {
        Self {
            info,
            slave_id: None,
            detector,
            leader: None,
            registered: false,
            heartbeat_interval,
            tasks: HashMap::new(),
            executors: HashMap::new(),
            watcher: None,
        }
    }

    fn register(&self, ctx: &ActorContext<LocalSlaveMessage>) {
        let Some(leader) = &self.leader else {
            return;
        };
        let endpoint: Arc<dyn SlaveEndpoint> = Arc::new(LocalSlaveEndpoint {
            handle: ctx.myself().clone(),
            master_id: leader.info.id,
        });

        let sent = match self.slave_id {
            None => leader.master.register_slave(self.info.clone(), endpoint),
            Some(slave_id) => {
                let executors = self
                    .executors
                    .iter()
                    .flat_map(|(fw, executors)| executors.values().map(|e| (*fw, e.clone())))
                    .collect();
                let tasks = self.tasks.values().cloned().collect();
                leader
                    .master
                    .reregister_slave(slave_id, self.info.clone(), endpoint, executors, tasks)
            }
        };
        if let Err(e) = sent {
            warn!(hostname = %self.info.hostname, error = %e, "Master unreachable");
        }
    }

    fn report(&self, framework_id: FrameworkId, executor_id: Option<ExecutorId>, status: TaskStatus) {
        let (Some(leader), Some(slave_id)) = (&self.leader, self.slave_id) else {
            warn!(task_id = %status.task_id, "Status update dropped: not registered");
            return;
        };
        let mut update = StatusUpdate::new(framework_id, status.on_slave(slave_id));
        if let Some(executor_id) = executor_id {
            update = update.from_executor(executor_id);
        }
        if let Err(e) = leader.master.status_update(slave_id, update) {
            warn!(error = %e, "Status update not sent");
        }
    }

    fn run_task(&mut self, framework_id: FrameworkId, framework: FrameworkInfo, info: TaskInfo) {
        let Some(slave_id) = self.slave_id else {
            warn!(task_id = %info.task_id, "Task for unregistered slave");
            return;
        };
        if let Some(executor) = &info.executor {
            self.executors
                .entry(framework_id)
                .or_default()
                .entry(executor.executor_id.clone())
                .or_insert_with(|| executor.clone());
        }

        let mut task = Task::staging(framework_id, &info);
        task.slave_id = slave_id;
        task.state = TaskState::Running;
        let executor_id = task.executor_id.clone();
        info!(framework = %framework.name, task_id = %task.task_id, "Running task");
        self.tasks.insert(task.key(), task);

        self.report(
            framework_id,
            executor_id,
            TaskStatus::new(info.task_id, TaskState::Running),
        );
    }

    fn finish_task(&mut self, framework_id: FrameworkId, task_id: TaskId, state: TaskState) {
        match self.tasks.remove(&(framework_id, task_id.clone())) {
            Some(task) => self.report(framework_id, task.executor_id, TaskStatus::new(task_id, state)),
            None if state == TaskState::Killed => {
                self.report(
                    framework_id,
                    None,
                    TaskStatus::new(task_id, TaskState::Lost).with_message("Task not found"),
                );
            }
            None => warn!(task_id = %task_id, "Finish of unknown task"),
        }
    }

    fn shutdown_framework(&mut self, framework_id: FrameworkId) {
        info!(framework_id = %framework_id, "Shutting down framework");
        let keys: Vec<(FrameworkId, TaskId)> = self
            .tasks
            .keys()
            .filter(|(fw, _)| *fw == framework_id)
            .cloned()
            .collect();
        for (fw, task_id) in keys {
            self.finish_task(fw, task_id, TaskState::Killed);
        }

        let executors = self.executors.remove(&framework_id).unwrap_or_default();
        for executor_id in executors.into_keys() {
            self.executor_exited(framework_id, executor_id, 0);
        }
    }

    fn executor_exited(&mut self, framework_id: FrameworkId, executor_id: ExecutorId, status: i32) {
        if let Some(executors) = self.executors.get_mut(&framework_id) {
            executors.remove(&executor_id);
            if executors.is_empty() {
                self.executors.remove(&framework_id);
            }
        }
        self.tasks.retain(|(fw, _), task| {
            *fw != framework_id || task.executor_id.as_ref() != Some(&executor_id)
        });

        let (Some(leader), Some(slave_id)) = (&self.leader, self.slave_id) else {
            return;
        };
        if let Err(e) = leader
            .master
            .exited_executor(slave_id, framework_id, executor_id, status)
        {
            warn!(error = %e, "Executor exit not reported");
        }
    }

    /// Returns `false` when the master shut this slave down.
    fn master_command(&mut self, command: SlaveCommand) -> bool {
        match command {
            SlaveCommand::Registered { slave_id, master } => {
                if self.registered && self.slave_id != Some(slave_id) {
                    warn!(slave_id = %slave_id, "Duplicate registration; unregistering");
                    if let Some(leader) = &self.leader {
                        if let Err(e) = leader.master.unregister_slave(slave_id) {
                            debug!(error = %e, "Could not unregister duplicate slave");
                        }
                    }
                    return true;
                }
                info!(slave_id = %slave_id, master = %master, "Slave registered");
                self.slave_id = Some(slave_id);
                self.registered = true;
            }
            SlaveCommand::Reregistered { slave_id, master } => {
                info!(slave_id = %slave_id, master = %master, "Slave re-registered");
                self.registered = true;
            }
            SlaveCommand::RunTask {
                framework_id,
                framework,
                task,
            } => {
                self.run_task(framework_id, framework, task);
            }
            SlaveCommand::KillTask {
                framework_id,
                task_id,
            } => {
                self.finish_task(framework_id, task_id, TaskState::Killed);
            }
            SlaveCommand::FrameworkMessage {
                framework_id,
                executor_id,
                data,
            } => {
                let known = self
                    .executors
                    .get(&framework_id)
                    .is_some_and(|e| e.contains_key(&executor_id));
                match (known, &self.leader, self.slave_id) {
                    (true, Some(leader), Some(slave_id)) => {
                        if let Err(e) = leader
                            .master
                            .executor_to_framework(slave_id, framework_id, executor_id, data)
                        {
                            warn!(error = %e, "Framework message not echoed");
                        }
                    }
                    _ => warn!(executor_id = %executor_id, "Message for unknown executor dropped"),
                }
            }
            SlaveCommand::Acknowledge {
                framework_id,
                task_id,
                uuid,
            } => {
                debug!(framework_id = %framework_id, task_id = %task_id, uuid = %uuid, "Status update acknowledged");
            }
            SlaveCommand::ShutdownFramework { framework_id } => {
                self.shutdown_framework(framework_id);
            }
            SlaveCommand::Shutdown { reason } => {
                warn!(hostname = %self.info.hostname, reason = %reason, "Shut down by master");
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Actor for LocalSlave {
    type Message = LocalSlaveMessage;

    fn name(&self) -> &str {
        "local-slave"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<LocalSlaveMessage>) -> Result<(), ActorError> {
        let mut rx = self.detector.subscribe();
        self.leader = rx.borrow_and_update().clone();

        let myself = ctx.myself().clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let leader = rx.borrow_and_update().clone();
                        if myself.send(LocalSlaveMessage::LeaderChanged(leader)).is_err() {
                            break;
                        }
                    }
                    _ = myself.closed() => break,
                }
            }
        }));

        self.register(ctx);
        ctx.schedule(self.heartbeat_interval, LocalSlaveMessage::Heartbeat);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: LocalSlaveMessage,
        ctx: &mut ActorContext<LocalSlaveMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            LocalSlaveMessage::FromMaster { master_id, command } => {
                if self.leader.as_ref().map(|l| l.info.id) != Some(master_id) {
                    debug!(master_id = %master_id, "Ignoring command from old master");
                    return Ok(true);
                }
                return Ok(self.master_command(command));
            }
            LocalSlaveMessage::LeaderChanged(leader) => {
                self.registered = false;
                self.leader = leader;
                match &self.leader {
                    Some(leader) => info!(master = %leader.info, "New master detected"),
                    None => info!(hostname = %self.info.hostname, "Lost leading master"),
                }
                self.register(ctx);
            }
            LocalSlaveMessage::Heartbeat => {
                match (&self.leader, self.slave_id) {
                    (Some(leader), Some(slave_id)) if self.registered => {
                        if let Err(e) = leader.master.heartbeat(slave_id) {
                            debug!(error = %e, "Heartbeat not sent");
                        }
                    }
                    _ => self.register(ctx),
                }
                ctx.schedule(self.heartbeat_interval, LocalSlaveMessage::Heartbeat);
            }
            LocalSlaveMessage::FinishTask {
                framework_id,
                task_id,
                state,
            } => {
                self.finish_task(framework_id, task_id, state);
            }
            LocalSlaveMessage::ExitExecutor {
                framework_id,
                executor_id,
                status,
            } => {
                self.executor_exited(framework_id, executor_id, status);
            }
            LocalSlaveMessage::GetTasks { reply_to } => {
                let _ = reply_to.send(self.tasks.values().cloned().collect());
            }
            LocalSlaveMessage::GetSlaveId { reply_to } => {
                let _ = reply_to.send(self.slave_id);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<LocalSlaveMessage>) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug, Clone)]
pub struct LocalSlaveHandle {
    handle: ActorHandle<LocalSlaveMessage>,
}

impl LocalSlaveHandle {
    pub fn finish_task(
        &self,
        framework_id: FrameworkId,
        task_id: TaskId,
        state: TaskState,
    ) -> Result<(), ActorError> {
        self.handle.send(LocalSlaveMessage::FinishTask {
            framework_id,
            task_id,
            state,
        })
    }

    pub fn exit_executor(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    ) -> Result<(), ActorError> {
        self.handle.send(LocalSlaveMessage::ExitExecutor {
            framework_id,
            executor_id,
            status,
        })
    }

    pub async fn tasks(&self) -> Result<Vec<Task>, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle.send(LocalSlaveMessage::GetTasks { reply_to })?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn slave_id(&self) -> Result<Option<SlaveId>, ActorError> {
        let (reply_to, rx) = oneshot::channel();
        self.handle.send(LocalSlaveMessage::GetSlaveId { reply_to })?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_closed()
    }
}

pub fn spawn_local_slave(
    supervisor: &mut Supervisor,
    info: SlaveInfo,
    detector: MasterDetector,
    heartbeat_interval: Duration,
) -> LocalSlaveHandle {
    let (handle, mailbox) = mailbox(&format!("slave-{}", info.hostname));
    let actor = LocalSlave::new(info, detector, heartbeat_interval);
    LocalSlaveHandle {
        handle: supervisor.start(actor, handle, mailbox),
    }
}
