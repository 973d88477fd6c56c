//! Boundaries to the outside world: framework schedulers and slaves.
//!
//! The master only talks to remote parties through these traits. Calls must
//! not block; a transport implementation queues the message and returns. An
//! `Err` means the party is unreachable, and the master treats that as a
//! definitive loss (the framework is deactivated, the slave is removed).

use std::fmt::Debug;

use bytes::Bytes;
use corral_id::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId};
use corral_protocol::{FrameworkInfo, MasterInfo, Offer, StatusUpdate, TaskInfo};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint disconnected")]
    Disconnected,

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Events the master delivers to a framework's scheduler.
pub trait SchedulerEndpoint: Send + Sync + Debug + 'static {
    fn registered(&self, framework_id: FrameworkId, master: &MasterInfo)
        -> Result<(), EndpointError>;

    fn reregistered(
        &self,
        framework_id: FrameworkId,
        master: &MasterInfo,
    ) -> Result<(), EndpointError>;

    fn resource_offers(&self, offers: Vec<Offer>) -> Result<(), EndpointError>;

    fn offer_rescinded(&self, offer_id: OfferId) -> Result<(), EndpointError>;

    fn status_update(&self, update: StatusUpdate) -> Result<(), EndpointError>;

    fn framework_message(
        &self,
        slave_id: SlaveId,
        executor_id: ExecutorId,
        data: Bytes,
    ) -> Result<(), EndpointError>;

    fn slave_lost(&self, slave_id: SlaveId) -> Result<(), EndpointError>;

    fn error(&self, message: &str) -> Result<(), EndpointError>;
}

/// Commands the master sends to a slave.
pub trait SlaveEndpoint: Send + Sync + Debug + 'static {
    fn registered(&self, slave_id: SlaveId, master: &MasterInfo) -> Result<(), EndpointError>;

    fn reregistered(&self, slave_id: SlaveId, master: &MasterInfo) -> Result<(), EndpointError>;

    fn run_task(
        &self,
        framework_id: FrameworkId,
        framework: &FrameworkInfo,
        task: &TaskInfo,
    ) -> Result<(), EndpointError>;

    fn kill_task(&self, framework_id: FrameworkId, task_id: &TaskId) -> Result<(), EndpointError>;

    fn framework_message(
        &self,
        framework_id: FrameworkId,
        executor_id: &ExecutorId,
        data: Bytes,
    ) -> Result<(), EndpointError>;

    fn acknowledge_status_update(
        &self,
        framework_id: FrameworkId,
        task_id: &TaskId,
        uuid: Uuid,
    ) -> Result<(), EndpointError>;

    fn shutdown_framework(&self, framework_id: FrameworkId) -> Result<(), EndpointError>;

    /// The master no longer accepts this slave.
    fn shutdown(&self, reason: &str) -> Result<(), EndpointError>;
}
